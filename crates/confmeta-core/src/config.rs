//! Run configuration loaded from YAML
//!
//! A complete run config looks like:
//!
//! ```yaml
//! model:
//!   type: edge_score
//!   hidden_dim: 32
//! train:
//!   seed: 2021
//!   batch_size: 10
//!   val_freq: 100
//!   max_iters: 2000
//!   max_grad_norm: 100.0
//!   anneal_power: 2.0
//!   optimizer: { type: adam, lr: 0.001, weight_decay: 0.0, beta1: 0.95, beta2: 0.999 }
//!   scheduler: { type: plateau, factor: 0.6, patience: 10 }
//!   maml: { num_examples_per_task: 5, inner_steps: 2 }
//! dataset:
//!   train: data/train.json
//!   val: data/val.json
//! ```

use crate::errors::{MetaError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// TOP-LEVEL DOCUMENT
// ============================================================================

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRunConfig {
    #[serde(default)]
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub dataset: DatasetConfig,
}

/// Dataset locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub train: PathBuf,
    pub val: PathBuf,
}

/// Outer-loop training hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Examples per outer step; divided by `maml.num_examples_per_task` to get tasks per step
    pub batch_size: usize,
    #[serde(default = "default_val_freq")]
    pub val_freq: u64,
    pub max_iters: u64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default = "default_anneal_power")]
    pub anneal_power: f64,
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub maml: MamlConfig,
}

fn default_seed() -> u64 { 2021 }
fn default_val_freq() -> u64 { 1000 }
fn default_max_grad_norm() -> f64 { 30_000.0 }
fn default_anneal_power() -> f64 { 2.0 }

/// Bi-level optimization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MamlConfig {
    /// When false, the outer driver falls back to plain mini-batch training
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_examples_per_task")]
    pub num_examples_per_task: usize,
    #[serde(default = "default_inner_steps")]
    pub inner_steps: usize,
    /// Stop gradient flow through inner-loop gradients (FOMAML)
    #[serde(default)]
    pub first_order: bool,
    /// Inner learning rate; the scheduled outer learning rate is used when absent
    #[serde(default)]
    pub inner_lr: Option<f64>,
    /// Reshuffle task order at every pass over the training set
    #[serde(default)]
    pub shuffle_tasks: bool,
}

fn default_true() -> bool { true }
fn default_examples_per_task() -> usize { 5 }
fn default_inner_steps() -> usize { 2 }

impl Default for MamlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            num_examples_per_task: default_examples_per_task(),
            inner_steps: default_inner_steps(),
            first_order: false,
            inner_lr: None,
            shuffle_tasks: false,
        }
    }
}

// ============================================================================
// OPTIMIZER / SCHEDULER
// ============================================================================

/// Optimizer hyperparameters shared by the meta-optimizer and every inner-loop optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam {
        lr: f64,
        #[serde(default)]
        weight_decay: f64,
        #[serde(default = "default_beta1")]
        beta1: f64,
        #[serde(default = "default_beta2")]
        beta2: f64,
        #[serde(default = "default_eps")]
        eps: f64,
    },
    Sgd {
        lr: f64,
        #[serde(default)]
        momentum: f64,
        #[serde(default)]
        weight_decay: f64,
    },
}

fn default_beta1() -> f64 { 0.9 }
fn default_beta2() -> f64 { 0.999 }
fn default_eps() -> f64 { 1e-8 }

impl OptimizerConfig {
    /// Initial learning rate
    pub fn lr(&self) -> f64 {
        match self {
            OptimizerConfig::Adam { lr, .. } | OptimizerConfig::Sgd { lr, .. } => *lr,
        }
    }

    pub fn weight_decay(&self) -> f64 {
        match self {
            OptimizerConfig::Adam { weight_decay, .. }
            | OptimizerConfig::Sgd { weight_decay, .. } => *weight_decay,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OptimizerConfig::Adam { .. } => "adam",
            OptimizerConfig::Sgd { .. } => "sgd",
        }
    }
}

/// Learning-rate schedule, stepped once per validation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerConfig {
    /// Reduce on plateau of the validation loss
    Plateau {
        factor: f64,
        patience: u32,
        #[serde(default)]
        min_lr: f64,
        #[serde(default = "default_threshold")]
        threshold: f64,
        #[serde(default)]
        cooldown: u32,
    },
    /// Exponential decay floored at `min_lr`
    Expmin {
        factor: f64,
        #[serde(default)]
        min_lr: f64,
    },
    /// Exponential decay reaching `factor` after `milestone` steps, floored at `min_lr`
    ExpminMilestone {
        factor: f64,
        milestone: u32,
        #[serde(default)]
        min_lr: f64,
    },
}

fn default_threshold() -> f64 { 1e-4 }

impl SchedulerConfig {
    /// Plateau schedules consume the validation loss; the others step unconditionally.
    pub fn is_plateau(&self) -> bool {
        matches!(self, SchedulerConfig::Plateau { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchedulerConfig::Plateau { .. } => "plateau",
            SchedulerConfig::Expmin { .. } => "expmin",
            SchedulerConfig::ExpminMilestone { .. } => "expmin_milestone",
        }
    }
}

// ============================================================================
// MODEL
// ============================================================================

/// Denoiser hyperparameters handed to `get_model`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(rename = "type", default = "default_model_type")]
    pub kind: String,
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    #[serde(default = "default_num_atom_types")]
    pub num_atom_types: usize,
    #[serde(default = "default_num_bond_types")]
    pub num_bond_types: usize,
    /// Radius (Å) for non-bonded edges
    #[serde(default = "default_cutoff")]
    pub cutoff: f64,
    #[serde(default = "default_sigma_begin")]
    pub sigma_begin: f64,
    #[serde(default = "default_sigma_end")]
    pub sigma_end: f64,
    #[serde(default = "default_num_noise_levels")]
    pub num_noise_levels: usize,
    /// Standard deviation of the initial weights
    #[serde(default = "default_init_std")]
    pub init_std: f64,
}

fn default_model_type() -> String { "edge_score".to_string() }
fn default_hidden_dim() -> usize { 32 }
fn default_num_atom_types() -> usize { 100 }
fn default_num_bond_types() -> usize { 4 }
fn default_cutoff() -> f64 { 6.0 }
fn default_sigma_begin() -> f64 { 5.0 }
fn default_sigma_end() -> f64 { 0.01 }
fn default_num_noise_levels() -> usize { 50 }
fn default_init_std() -> f64 { 0.1 }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: default_model_type(),
            hidden_dim: default_hidden_dim(),
            num_atom_types: default_num_atom_types(),
            num_bond_types: default_num_bond_types(),
            cutoff: default_cutoff(),
            sigma_begin: default_sigma_begin(),
            sigma_end: default_sigma_end(),
            num_noise_levels: default_num_noise_levels(),
            init_std: default_init_std(),
        }
    }
}

// ============================================================================
// LOADING & VALIDATION
// ============================================================================

impl TrainRunConfig {
    /// Load and validate a YAML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            MetaError::config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&content)
            .map_err(|e| MetaError::config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    ///
    /// Missing or unknown `type` tags on the optimizer or scheduler surface here as
    /// configuration errors.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: TrainRunConfig =
            serde_yaml::from_str(content).map_err(|e| MetaError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject every value the drivers cannot work with
    pub fn validate(&self) -> Result<()> {
        let train = &self.train;
        let k = train.maml.num_examples_per_task;

        if k < 2 {
            return Err(MetaError::config(format!(
                "train.maml.num_examples_per_task must be >= 2 (got {}); the query split would be empty",
                k
            )));
        }
        if train.batch_size / k == 0 {
            return Err(MetaError::config(format!(
                "train.batch_size ({}) / num_examples_per_task ({}) rounds to zero tasks per outer step",
                train.batch_size, k
            )));
        }
        if train.val_freq == 0 {
            return Err(MetaError::config("train.val_freq must be greater than 0"));
        }
        if train.max_iters == 0 {
            return Err(MetaError::config("train.max_iters must be greater than 0"));
        }
        if !(train.max_grad_norm.is_finite() && train.max_grad_norm > 0.0) {
            return Err(MetaError::config(format!(
                "train.max_grad_norm must be a positive finite number (got {})",
                train.max_grad_norm
            )));
        }
        if !(train.optimizer.lr().is_finite() && train.optimizer.lr() > 0.0) {
            return Err(MetaError::config(format!(
                "train.optimizer.lr must be positive (got {})",
                train.optimizer.lr()
            )));
        }
        if let Some(inner_lr) = train.maml.inner_lr {
            if !(inner_lr.is_finite() && inner_lr > 0.0) {
                return Err(MetaError::config(format!(
                    "train.maml.inner_lr must be positive (got {})",
                    inner_lr
                )));
            }
        }
        match &train.scheduler {
            SchedulerConfig::Plateau { factor, .. } | SchedulerConfig::Expmin { factor, .. } => {
                check_factor(*factor)?
            }
            SchedulerConfig::ExpminMilestone { factor, milestone, .. } => {
                check_factor(*factor)?;
                if *milestone == 0 {
                    return Err(MetaError::config("train.scheduler.milestone must be greater than 0"));
                }
            }
        }
        if self.model.num_noise_levels == 0 {
            return Err(MetaError::config("model.num_noise_levels must be greater than 0"));
        }
        Ok(())
    }

    /// Number of tasks drawn per outer step: `floor(batch_size / num_examples_per_task)`
    pub fn batch_size_outer_loop(&self) -> usize {
        self.train.batch_size / self.train.maml.num_examples_per_task
    }
}

fn check_factor(factor: f64) -> Result<()> {
    if factor > 0.0 && factor <= 1.0 {
        Ok(())
    } else {
        Err(MetaError::config(format!(
            "train.scheduler.factor must lie in (0, 1] (got {})",
            factor
        )))
    }
}
