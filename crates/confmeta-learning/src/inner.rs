//! Inner loop: adapt a copy of the meta-parameters on a task's support set.

use confmeta_autograd::{DiffOptimizer, GradMode, ParamVars, Tape, VarId};
use confmeta_core::{MetaError, OptimizerConfig, Result};
use log::debug;

use crate::model::{AdaptableModel, LossContext};
use crate::task::Task;

/// Result of adapting on one task.
#[derive(Debug, Clone)]
pub struct Adaptation {
    /// Unreduced loss of the adapted parameters on the query split
    pub query_loss: VarId,
    /// Adapted parameters; handles on the task's tape
    pub adapted: ParamVars,
    /// Mean support loss before each inner step
    pub support_losses: Vec<f64>,
}

/// Runs `inner_steps` functional optimizer steps on the support split.
///
/// In second-order mode the inner gradients are recorded on the tape, so a backward pass from
/// the query loss reaches the meta-parameters through every step. First-order mode detaches
/// them.
#[derive(Debug)]
pub struct InnerLoopAdapter<'m, M: AdaptableModel> {
    model: &'m M,
    optimizer: OptimizerConfig,
    inner_steps: usize,
    first_order: bool,
}

impl<'m, M: AdaptableModel> InnerLoopAdapter<'m, M> {
    pub fn new(model: &'m M, optimizer: &OptimizerConfig, inner_steps: usize, first_order: bool) -> Self {
        InnerLoopAdapter { model, optimizer: optimizer.clone(), inner_steps, first_order }
    }

    pub fn inner_steps(&self) -> usize {
        self.inner_steps
    }

    /// Adapt `meta` on `task`'s support split and score the result on its query split.
    ///
    /// `meta` is never rebound; adapted parameters are new handles on `tape`.
    pub fn adapt_and_score(
        &self,
        tape: &mut Tape,
        meta: &ParamVars,
        task: &Task<M::Example>,
        lr: f64,
        ctx: &mut LossContext,
    ) -> Result<Adaptation> {
        let split = task.split()?;
        let mode = if self.first_order { GradMode::Detached } else { GradMode::CreateGraph };

        let mut fast = meta.clone();
        let mut optimizer = DiffOptimizer::new(&self.optimizer);
        let mut support_losses = Vec::with_capacity(self.inner_steps);
        for step in 0..self.inner_steps {
            let loss = self.model.loss(tape, &fast, split.support, ctx)?;
            let mean = tape.mean(loss.per_example)?;
            let value = tape.scalar(mean)?;
            if !value.is_finite() {
                return Err(MetaError::numerical(format!(
                    "support loss is {} at inner step {}",
                    value, step
                )));
            }
            support_losses.push(value);
            let grads = tape.grad(mean, &fast.ids(), mode)?;
            fast = optimizer.step(tape, &fast, &grads, lr)?;
        }
        debug!("Inner loop support losses: {:?}", support_losses);

        let query = self.model.loss(tape, &fast, split.query, ctx)?;
        Ok(Adaptation { query_loss: query.per_example, adapted: fast, support_losses })
    }
}
