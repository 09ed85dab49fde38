//! # confmeta-learning
//!
//! MAML meta-training for molecular conformation denoisers.
//!
//! Each task is a handful of conformations of one molecule. The first `k - 1` are the support
//! split, the last one is the query. An inner loop adapts a differentiable copy of the
//! meta-parameters on the support split; the adapted query loss is back-propagated through
//! the inner steps into the meta-parameters, which the meta-optimizer updates once per
//! iteration.
//!
//! ## Architecture Overview
//!
//! ```text
//! CyclicTaskSource → InnerLoopAdapter → OuterLoopDriver → MetaOptimizer
//!       ↓                  ↓                  ↓
//!   Task (k ex.)    adapted ParamVars    clipped meta-grad
//!
//! TrainingSupervisor
//!   ├─ OuterLoopDriver      (owns ParamSet + MetaOptimizer)
//!   ├─ ValidationDriver     (owns LrScheduler, borrows ParamSet)
//!   └─ CheckpointManager    (<iteration>.ckpt, best.ckpt)
//! ```
//!
//! ## Module Structure
//!
//! - [`molecule`]: conformations and collated batches
//! - [`dataset`]: JSON datasets, cyclic task source, validation tasks
//! - [`task`]: positional support/query split
//! - [`model`]: `AdaptableModel` contract and the edge score model
//! - [`inner`]: inner-loop adaptation
//! - [`outer`]: one outer training step
//! - [`validation`]: validation loss and scheduler stepping
//! - [`checkpoint`]: atomic bincode checkpoints and schema checks
//! - [`rundir`]: run directory layout
//! - [`metrics`]: JSONL scalar stream
//! - [`supervisor`]: the training loop

pub mod checkpoint;
pub mod dataset;
pub mod inner;
pub mod metrics;
pub mod model;
pub mod molecule;
pub mod outer;
pub mod rundir;
pub mod supervisor;
pub mod task;
pub mod validation;

pub use checkpoint::{CheckpointManager, CheckpointRecord, CheckpointSelector, OptimizerLayout};
pub use dataset::{validation_tasks, ConformationDataset, CyclicTaskSource, TaskSource};
pub use inner::{Adaptation, InnerLoopAdapter};
pub use metrics::MetricsWriter;
pub use model::{get_model, AdaptableModel, EdgeScoreModel, LossContext, ModelLoss};
pub use molecule::{ConformationExample, MolBatch};
pub use outer::{OuterLoopDriver, StepReport};
pub use rundir::RunDirectory;
pub use supervisor::{RunOutcome, TrainingSupervisor};
pub use task::{Task, TaskSplit};
pub use validation::ValidationDriver;
