//! Shared fixtures for the integration tests.
//!
//! `QuadraticModel` has closed-form inner and meta gradients: each example is a target vector
//! `t` and its loss is `0.5 * |w - t|^2`.

#![allow(dead_code)]

use confmeta_autograd::{ParamSet, ParamVars, Tape, Tensor};
use confmeta_core::{OptimizerConfig, Result, TrainRunConfig};
use confmeta_learning::{AdaptableModel, ConformationExample, LossContext, ModelLoss};
use rand_chacha::ChaCha8Rng;

pub struct QuadraticModel {
    pub init: Vec<f64>,
}

impl QuadraticModel {
    pub fn new(init: Vec<f64>) -> Self {
        QuadraticModel { init }
    }
}

impl AdaptableModel for QuadraticModel {
    type Example = Vec<f64>;

    fn name(&self) -> &str {
        "quadratic"
    }

    fn init_params(&self, _rng: &mut ChaCha8Rng) -> ParamSet {
        let mut params = ParamSet::new();
        params.insert("w", Tensor::vector(self.init.clone()));
        params
    }

    fn loss(
        &self,
        tape: &mut Tape,
        params: &ParamVars,
        examples: &[Vec<f64>],
        _ctx: &mut LossContext,
    ) -> Result<ModelLoss> {
        let n = examples.len();
        let d = self.init.len();
        let w = params.get("w")?;
        let wb = tape.broadcast_rows(w, n)?;
        let targets = tape.constant(Tensor::matrix(n, d, examples.concat())?);
        let diff = tape.sub(wb, targets)?;
        let sq = tape.mul(diff, diff)?;
        let ones = tape.constant(Tensor::filled(&[d, 1], 1.0));
        let rows = tape.matmul(sq, ones)?;
        let per_example = tape.scale(rows, 0.5)?;
        let zero = tape.constant(Tensor::scalar(0.0));
        Ok(ModelLoss { per_example, aux_global: zero, aux_local: zero })
    }
}

pub const BASE_CONFIG: &str = r#"
model:
  type: edge_score
  hidden_dim: 8
  num_atom_types: 10
train:
  seed: 11
  batch_size: 10
  val_freq: 2
  max_iters: 4
  max_grad_norm: 1000.0
  optimizer:
    type: sgd
    lr: 0.1
  scheduler:
    type: expmin
    factor: 0.5
  maml:
    num_examples_per_task: 5
    inner_steps: 2
dataset:
  train: data/train.json
  val: data/val.json
"#;

pub fn base_config() -> TrainRunConfig {
    TrainRunConfig::from_yaml_str(BASE_CONFIG).unwrap()
}

pub fn adam_config() -> TrainRunConfig {
    let mut config = base_config();
    config.train.optimizer =
        OptimizerConfig::Adam { lr: 0.01, weight_decay: 0.0, beta1: 0.9, beta2: 0.999, eps: 1e-8 };
    config
}

/// Scalar targets `start, start + 1, ...` as one-dimensional examples
pub fn scalar_targets(start: f64, count: usize) -> Vec<Vec<f64>> {
    (0..count).map(|i| vec![start + i as f64]).collect()
}

/// Three-atom bent molecule shifted along x
pub fn water(shift: f64) -> ConformationExample {
    ConformationExample {
        smiles: Some("O".to_string()),
        atom_type: vec![8, 1, 1],
        pos: vec![[shift, 0.0, 0.0], [shift + 0.96, 0.0, 0.0], [shift - 0.24, 0.93, 0.0]],
        bond_index: vec![[0, 1], [0, 2]],
        bond_type: vec![1, 1],
    }
}

/// Water conformations with small deterministic perturbations
pub fn water_set(count: usize) -> Vec<ConformationExample> {
    (0..count)
        .map(|i| {
            let mut ex = water(0.0);
            let jitter = 0.01 * (i % 7) as f64;
            ex.pos[1][0] += jitter;
            ex.pos[2][1] -= jitter;
            ex
        })
        .collect()
}
