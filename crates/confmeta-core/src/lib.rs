//! # confmeta-core
//!
//! Core errors and run configuration shared by every confmeta crate.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  confmeta-core  │  ← errors, YAML config schema
//! └─────────────────┘
//!         ▲
//!         │
//! ┌───────┴───────────┐
//! │ confmeta-autograd │  ← tape, params, optimizers, schedulers
//! └───────────────────┘
//!         ▲
//!         │
//! ┌───────┴───────────┐
//! │ confmeta-learning │  ← tasks, inner/outer loop, checkpoints, CLI
//! └───────────────────┘
//! ```

pub mod config;
pub mod errors;

pub use config::{
    DatasetConfig, MamlConfig, ModelConfig, OptimizerConfig, SchedulerConfig, TrainConfig,
    TrainRunConfig,
};
pub use errors::{MetaError, Result};
