//! # confmeta-autograd
//!
//! Small higher-order autodiff engine for bi-level optimization.
//!
//! - [`tape::Tape`]: eager Wengert tape whose backward pass is itself recorded, so gradients
//!   can be differentiated again (second-order MAML).
//! - [`params`]: named parameter sets and their tape views.
//! - [`optim`]: functional (differentiable) and stateful optimizers.
//! - [`scheduler`]: plateau and exponential learning-rate schedules.
//! - [`clip`]: global-norm clipping.

pub mod clip;
pub mod optim;
pub mod params;
pub mod scheduler;
pub mod tape;
pub mod tensor;

pub use clip::clip_grad_norm;
pub use optim::{DiffOptimizer, MetaOptimizer, OptimizerState};
pub use params::{ParamSet, ParamVars};
pub use scheduler::{LrScheduler, SchedulerState};
pub use tape::{GradMode, Tape, VarId};
pub use tensor::Tensor;
