//! Optimizers.
//!
//! Two flavours share the same hyperparameters (`OptimizerConfig`):
//!
//! - [`DiffOptimizer`]: functional, operates on tape handles. Every update is recorded on the
//!   tape, so the parameters it produces stay differentiable with respect to the parameters it
//!   started from. One is created per task with zero state and dropped with the task's tape.
//! - [`MetaOptimizer`]: stateful, updates a `ParamSet` in place. Its moment buffers and step
//!   counter are the persisted optimizer state.
//!
//! Neither owns a learning rate; the scheduler passes the current value at each step.
//! Adam follows the common library form: L2 weight decay folded into the gradient,
//! `denom = sqrt(v) / sqrt(1 - beta2^t) + eps`, `step = lr / (1 - beta1^t)`.

use confmeta_core::{MetaError, OptimizerConfig, Result};
use serde::{Deserialize, Serialize};

use crate::params::{ParamSet, ParamVars};
use crate::tape::{Tape, VarId};

// ── Functional optimizer ─────────────────────────────────────────────

/// Differentiable optimizer over tape handles.
#[derive(Debug)]
pub struct DiffOptimizer {
    config: OptimizerConfig,
    step: u64,
    /// Adam first moment, or SGD momentum buffer
    first: Option<Vec<VarId>>,
    second: Option<Vec<VarId>>,
}

impl DiffOptimizer {
    /// Fresh optimizer with zero internal state
    pub fn new(config: &OptimizerConfig) -> Self {
        DiffOptimizer { config: config.clone(), step: 0, first: None, second: None }
    }

    pub fn steps_taken(&self) -> u64 {
        self.step
    }

    /// One update. `grads` are handles in the same (name) order as `params.ids()`.
    pub fn step(
        &mut self,
        tape: &mut Tape,
        params: &ParamVars,
        grads: &[VarId],
        lr: f64,
    ) -> Result<ParamVars> {
        let ids = params.ids();
        if ids.len() != grads.len() {
            return Err(MetaError::autograd(format!(
                "{} parameters but {} gradients",
                ids.len(),
                grads.len()
            )));
        }
        self.step += 1;

        let mut effective = Vec::with_capacity(grads.len());
        let weight_decay = self.config.weight_decay();
        for (&p, &g) in ids.iter().zip(grads) {
            if weight_decay != 0.0 {
                let decay = tape.scale(p, weight_decay)?;
                effective.push(tape.add(g, decay)?);
            } else {
                effective.push(g);
            }
        }

        let updated = match self.config.clone() {
            OptimizerConfig::Adam { beta1, beta2, eps, .. } => {
                self.adam(tape, &ids, &effective, lr, beta1, beta2, eps)?
            }
            OptimizerConfig::Sgd { momentum, .. } => self.sgd(tape, &ids, &effective, lr, momentum)?,
        };
        params.with_ids(&updated)
    }

    #[allow(clippy::too_many_arguments)]
    fn adam(
        &mut self,
        tape: &mut Tape,
        ids: &[VarId],
        grads: &[VarId],
        lr: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
    ) -> Result<Vec<VarId>> {
        let bc1 = 1.0 - beta1.powi(self.step as i32);
        let bc2 = 1.0 - beta2.powi(self.step as i32);
        let step_size = lr / bc1;

        let mut new_m = Vec::with_capacity(ids.len());
        let mut new_v = Vec::with_capacity(ids.len());
        let mut out = Vec::with_capacity(ids.len());
        for (i, (&p, &g)) in ids.iter().zip(grads).enumerate() {
            let g_m = tape.scale(g, 1.0 - beta1)?;
            let g2 = tape.mul(g, g)?;
            let g_v = tape.scale(g2, 1.0 - beta2)?;
            let (m, v) = match (&self.first, &self.second) {
                (Some(ms), Some(vs)) => {
                    let m_prev = tape.scale(ms[i], beta1)?;
                    let v_prev = tape.scale(vs[i], beta2)?;
                    (tape.add(m_prev, g_m)?, tape.add(v_prev, g_v)?)
                }
                _ => (g_m, g_v),
            };

            let root = tape.sqrt(v)?;
            let denom = tape.scale(root, 1.0 / bc2.sqrt())?;
            let denom = tape.add_scalar(denom, eps)?;
            let ratio = tape.div(m, denom)?;
            let delta = tape.scale(ratio, step_size)?;
            out.push(tape.sub(p, delta)?);
            new_m.push(m);
            new_v.push(v);
        }
        self.first = Some(new_m);
        self.second = Some(new_v);
        Ok(out)
    }

    fn sgd(
        &mut self,
        tape: &mut Tape,
        ids: &[VarId],
        grads: &[VarId],
        lr: f64,
        momentum: f64,
    ) -> Result<Vec<VarId>> {
        let directions = if momentum != 0.0 {
            let bufs = match &self.first {
                Some(prev) => {
                    let mut bufs = Vec::with_capacity(ids.len());
                    for (&b, &g) in prev.iter().zip(grads) {
                        let b = tape.scale(b, momentum)?;
                        bufs.push(tape.add(b, g)?);
                    }
                    bufs
                }
                None => grads.to_vec(),
            };
            self.first = Some(bufs.clone());
            bufs
        } else {
            grads.to_vec()
        };

        let mut out = Vec::with_capacity(ids.len());
        for (&p, &d) in ids.iter().zip(&directions) {
            let delta = tape.scale(d, lr)?;
            out.push(tape.sub(p, delta)?);
        }
        Ok(out)
    }
}

// ── Stateful meta-optimizer ──────────────────────────────────────────

/// Persisted optimizer state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// `adam` or `sgd`
    pub algorithm: String,
    pub step: u64,
    /// Adam first moment, or SGD momentum buffer
    pub first_moment: ParamSet,
    /// Adam second moment; zeros for SGD
    pub second_moment: ParamSet,
}

/// Optimizer that owns its moment buffers and mutates parameters in place.
#[derive(Clone, Debug)]
pub struct MetaOptimizer {
    config: OptimizerConfig,
    state: OptimizerState,
}

/// Core Adam step on one flat parameter group.
#[inline]
#[allow(clippy::too_many_arguments)]
fn adam_step_buf(
    params: &mut [f64],
    grads: &[f64],
    m: &mut [f64],
    v: &mut [f64],
    step_size: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    bc2_sqrt: f64,
    weight_decay: f64,
) {
    debug_assert_eq!(params.len(), grads.len());
    for i in 0..params.len() {
        let g = grads[i] + weight_decay * params[i];
        m[i] = beta1 * m[i] + (1.0 - beta1) * g;
        v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
        let denom = v[i].sqrt() / bc2_sqrt + eps;
        params[i] -= step_size * m[i] / denom;
    }
}

#[inline]
fn sgd_step_buf(params: &mut [f64], grads: &[f64], buf: &mut [f64], lr: f64, momentum: f64, weight_decay: f64, first: bool) {
    for i in 0..params.len() {
        let g = grads[i] + weight_decay * params[i];
        let d = if momentum != 0.0 {
            buf[i] = if first { g } else { momentum * buf[i] + g };
            buf[i]
        } else {
            g
        };
        params[i] -= lr * d;
    }
}

impl MetaOptimizer {
    pub fn new(config: &OptimizerConfig, params: &ParamSet) -> Self {
        let state = OptimizerState {
            algorithm: config.name().to_string(),
            step: 0,
            first_moment: params.zeros_like(),
            second_moment: params.zeros_like(),
        };
        MetaOptimizer { config: config.clone(), state }
    }

    /// Rebuild from persisted state, checking it fits `params`.
    pub fn from_state(config: &OptimizerConfig, state: OptimizerState, params: &ParamSet) -> Result<Self> {
        if state.algorithm != config.name() {
            return Err(MetaError::autograd(format!(
                "optimizer state is for '{}', config asks for '{}'",
                state.algorithm,
                config.name()
            )));
        }
        params.check_same_layout(&state.first_moment)?;
        params.check_same_layout(&state.second_moment)?;
        Ok(MetaOptimizer { config: config.clone(), state })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    pub fn step_count(&self) -> u64 {
        self.state.step
    }

    /// Apply one update with learning rate `lr`.
    pub fn step(&mut self, params: &mut ParamSet, grads: &ParamSet, lr: f64) -> Result<()> {
        params.check_same_layout(grads)?;
        params.check_same_layout(&self.state.first_moment)?;
        self.state.step += 1;
        let t = self.state.step;

        for (name, p) in params.iter_mut() {
            let g = grads.get(name)?;
            let m = self.state.first_moment.get_mut(name)?;
            match self.config {
                OptimizerConfig::Adam { beta1, beta2, eps, weight_decay, .. } => {
                    let bc1 = 1.0 - beta1.powi(t as i32);
                    let bc2 = 1.0 - beta2.powi(t as i32);
                    let v = self.state.second_moment.get_mut(name)?;
                    adam_step_buf(
                        &mut p.data,
                        &g.data,
                        &mut m.data,
                        &mut v.data,
                        lr / bc1,
                        beta1,
                        beta2,
                        eps,
                        bc2.sqrt(),
                        weight_decay,
                    );
                }
                OptimizerConfig::Sgd { momentum, weight_decay, .. } => {
                    sgd_step_buf(&mut p.data, &g.data, &mut m.data, lr, momentum, weight_decay, t == 1);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::GradMode;
    use crate::tensor::Tensor;
    use approx::assert_relative_eq;

    fn adam() -> OptimizerConfig {
        OptimizerConfig::Adam { lr: 0.1, weight_decay: 0.01, beta1: 0.9, beta2: 0.999, eps: 1e-8 }
    }

    fn params() -> ParamSet {
        let mut p = ParamSet::new();
        p.insert("w", Tensor::vector(vec![1.0, -2.0, 0.5]));
        p
    }

    /// loss = 0.5 * sum(w^2), grad = w
    fn quadratic_grads(tape: &mut Tape, vars: &ParamVars) -> Vec<VarId> {
        let w = vars.get("w").unwrap();
        let sq = tape.mul(w, w).unwrap();
        let s = tape.sum(sq).unwrap();
        let loss = tape.scale(s, 0.5).unwrap();
        tape.grad(loss, &vars.ids(), GradMode::CreateGraph).unwrap()
    }

    #[test]
    fn test_diff_adam_matches_meta_adam() {
        let config = adam();
        let mut tape = Tape::new();
        let mut vars = params().register(&mut tape);
        let mut diff = DiffOptimizer::new(&config);
        for _ in 0..3 {
            let grads = quadratic_grads(&mut tape, &vars);
            vars = diff.step(&mut tape, &vars, &grads, 0.1).unwrap();
        }

        let mut p = params();
        let mut meta = MetaOptimizer::new(&config, &p);
        for _ in 0..3 {
            let g = p.clone();
            meta.step(&mut p, &g, 0.1).unwrap();
        }

        let fast = vars.values(&tape).unwrap();
        for (a, b) in fast.get("w").unwrap().data.iter().zip(&p.get("w").unwrap().data) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
        assert_eq!(diff.steps_taken(), 3);
        assert_eq!(meta.step_count(), 3);
    }

    #[test]
    fn test_first_adam_step_moves_by_lr() {
        let config = OptimizerConfig::Adam { lr: 0.1, weight_decay: 0.0, beta1: 0.9, beta2: 0.999, eps: 1e-8 };
        let mut p = params();
        let g = p.clone();
        let mut meta = MetaOptimizer::new(&config, &p);
        meta.step(&mut p, &g, 0.1).unwrap();
        let w = &p.get("w").unwrap().data;
        assert_relative_eq!(w[0], 0.9, epsilon = 1e-6);
        assert_relative_eq!(w[1], -1.9, epsilon = 1e-6);
    }

    #[test]
    fn test_sgd_update_is_differentiable() {
        // w1 = w0 - lr * w0 = (1 - lr) w0, so d(sum w1)/d w0 = 1 - lr
        let config = OptimizerConfig::Sgd { lr: 0.25, momentum: 0.0, weight_decay: 0.0 };
        let mut tape = Tape::new();
        let vars = params().register(&mut tape);
        let grads = quadratic_grads(&mut tape, &vars);
        let mut diff = DiffOptimizer::new(&config);
        let fast = diff.step(&mut tape, &vars, &grads, 0.25).unwrap();
        let s = tape.sum(fast.get("w").unwrap()).unwrap();
        let d = tape.grad(s, &vars.ids(), GradMode::Detached).unwrap()[0];
        assert_eq!(tape.value(d).unwrap().data, vec![0.75, 0.75, 0.75]);
    }

    #[test]
    fn test_sgd_momentum_matches_between_flavours() {
        let config = OptimizerConfig::Sgd { lr: 0.1, momentum: 0.9, weight_decay: 0.0 };
        let mut tape = Tape::new();
        let mut vars = params().register(&mut tape);
        let mut diff = DiffOptimizer::new(&config);
        let mut p = params();
        let mut meta = MetaOptimizer::new(&config, &p);
        for _ in 0..2 {
            let grads = quadratic_grads(&mut tape, &vars);
            vars = diff.step(&mut tape, &vars, &grads, 0.1).unwrap();
            let g = p.clone();
            meta.step(&mut p, &g, 0.1).unwrap();
        }
        let fast = vars.values(&tape).unwrap();
        for (a, b) in fast.get("w").unwrap().data.iter().zip(&p.get("w").unwrap().data) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_from_state_rejects_other_algorithm() {
        let p = params();
        let meta = MetaOptimizer::new(&adam(), &p);
        let sgd = OptimizerConfig::Sgd { lr: 0.1, momentum: 0.0, weight_decay: 0.0 };
        assert!(MetaOptimizer::from_state(&sgd, meta.state().clone(), &p).is_err());
        assert!(MetaOptimizer::from_state(&adam(), meta.state().clone(), &p).is_ok());
    }
}
