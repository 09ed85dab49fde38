//! Training supervisor: the iteration loop around the outer and validation drivers.
//!
//! ## Loop
//! ```text
//! for it in start_iter..=max_iters:
//!     interrupted?          → log, stop
//!     outer step            → [Train] log line, train/* metrics
//!     it % val_freq == 0 or it == max_iters:
//!         validate          → scheduler step, [Validate] log line, val/loss
//!         checkpoint        → <it>.ckpt, best.ckpt on improvement
//! ```

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use confmeta_autograd::{LrScheduler, MetaOptimizer, ParamSet};
use confmeta_core::{Result, TrainRunConfig};
use log::{info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::checkpoint::{CheckpointManager, CheckpointRecord};
use crate::dataset::TaskSource;
use crate::metrics::MetricsWriter;
use crate::model::AdaptableModel;
use crate::outer::OuterLoopDriver;
use crate::task::Task;
use crate::validation::ValidationDriver;

/// Name of the checkpoint kept for the lowest validation loss
pub const BEST_CHECKPOINT: &str = "best";

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reached `max_iters`
    Completed { last_iter: u64 },
    /// Stopped by the interrupt flag after `last_iter` (0 if no iteration ran)
    Interrupted { last_iter: u64 },
}

/// Drives `[start_iter, max_iters]`.
pub struct TrainingSupervisor<M: AdaptableModel, S: TaskSource<Example = M::Example>> {
    config: TrainRunConfig,
    outer: OuterLoopDriver<M>,
    validation: ValidationDriver<M>,
    train_source: S,
    val_tasks: Vec<Task<M::Example>>,
    checkpoints: CheckpointManager,
    metrics: Option<MetricsWriter>,
    start_iter: u64,
    best_val_loss: f64,
}

impl<M: AdaptableModel, S: TaskSource<Example = M::Example>> TrainingSupervisor<M, S> {
    /// New run with parameters from `model.init_params` seeded by `train.seed`.
    pub fn new(
        config: TrainRunConfig,
        model: Rc<M>,
        train_source: S,
        val_tasks: Vec<Task<M::Example>>,
        checkpoints: CheckpointManager,
    ) -> Result<Self> {
        config.validate()?;
        let params = model.init_params(&mut ChaCha8Rng::seed_from_u64(config.train.seed));
        info!(
            "🧠 Model '{}' with {} tensors / {} parameters",
            model.name(),
            params.len(),
            params.num_elements()
        );
        let scheduler = LrScheduler::new(&config.train.scheduler, config.train.optimizer.lr());
        let outer = OuterLoopDriver::new(Rc::clone(&model), params, &config)?;
        let validation = ValidationDriver::new(model, scheduler, &config);
        Ok(TrainingSupervisor {
            config,
            outer,
            validation,
            train_source,
            val_tasks,
            checkpoints,
            metrics: None,
            start_iter: 1,
            best_val_loss: f64::INFINITY,
        })
    }

    /// Continue from `record`: parameters, optimizer and scheduler are restored.
    ///
    /// Training restarts at `record.iteration + 1`, or at 1 when `reset_iter` is set.
    pub fn resume(
        config: TrainRunConfig,
        model: Rc<M>,
        record: CheckpointRecord,
        reset_iter: bool,
        train_source: S,
        val_tasks: Vec<Task<M::Example>>,
        checkpoints: CheckpointManager,
    ) -> Result<Self> {
        config.validate()?;
        let expected: ParamSet = model.init_params(&mut ChaCha8Rng::seed_from_u64(config.train.seed));
        record.validate_against(&expected, &config.train.optimizer)?;
        let (opt_state, sched_state) = record.unified_state()?;

        let optimizer =
            MetaOptimizer::from_state(&config.train.optimizer, opt_state.clone(), &record.params)?;
        let scheduler = LrScheduler::from_state(&config.train.scheduler, sched_state.clone());
        let start_iter = if reset_iter { 1 } else { record.iteration + 1 };
        info!(
            "📂 Resuming from iteration {} (val loss {:.6}, lr {:.6}); next iteration {}",
            record.iteration,
            record.val_loss,
            scheduler.lr(),
            start_iter
        );

        let outer = OuterLoopDriver::with_optimizer(Rc::clone(&model), record.params, optimizer, &config)?;
        let validation = ValidationDriver::new(model, scheduler, &config);
        Ok(TrainingSupervisor {
            config,
            outer,
            validation,
            train_source,
            val_tasks,
            checkpoints,
            metrics: None,
            start_iter,
            best_val_loss: record.val_loss,
        })
    }

    pub fn with_metrics(mut self, metrics: MetricsWriter) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.validation = self.validation.with_progress(show);
        self
    }

    pub fn start_iter(&self) -> u64 {
        self.start_iter
    }

    pub fn best_val_loss(&self) -> f64 {
        self.best_val_loss
    }

    pub fn outer(&self) -> &OuterLoopDriver<M> {
        &self.outer
    }

    pub fn validation(&self) -> &ValidationDriver<M> {
        &self.validation
    }

    /// Run until `max_iters` or until `interrupt` is set.
    ///
    /// The flag is only checked between iterations; an iteration in progress, including its
    /// checkpoint write, always completes.
    pub fn run(&mut self, interrupt: &AtomicBool) -> Result<RunOutcome> {
        let max_iters = self.config.train.max_iters;
        let val_freq = self.config.train.val_freq;
        let mode = if self.outer.is_maml() { "MAML" } else { "plain" };
        info!(
            "🚀 Training iterations {}..={} ({} mode, {} tasks/step)",
            self.start_iter,
            max_iters,
            mode,
            self.outer.tasks_per_step()
        );

        let mut last_iter = self.start_iter.saturating_sub(1);
        for it in self.start_iter..=max_iters {
            if interrupt.load(Ordering::SeqCst) {
                info!("Terminating...");
                return Ok(RunOutcome::Interrupted { last_iter });
            }

            let report = self.outer.step(&mut self.train_source, self.validation.lr())?;
            info!(
                "[Train] Iter {:05} | Loss {:.2} | Grad {:.2} | LR {:.6}",
                it, report.loss, report.grad_norm, report.lr
            );
            self.log_scalar("train/loss", report.loss, it);
            self.log_scalar("train/lr", report.lr, it);
            self.log_scalar("train/grad_norm", report.grad_norm, it);

            if it % val_freq == 0 || it == max_iters {
                self.validate_and_checkpoint(it)?;
            }
            last_iter = it;
        }

        info!("🏁 Training finished at iteration {} (best val loss {:.6})", last_iter, self.best_val_loss);
        Ok(RunOutcome::Completed { last_iter })
    }

    /// Validate, step the scheduler, write `<it>.ckpt` and refresh `best.ckpt` on improvement.
    pub fn validate_and_checkpoint(&mut self, it: u64) -> Result<f64> {
        let val_loss = self.validation.validate(self.outer.params(), &self.val_tasks)?;
        info!("[Validate] Iter {:05} | Loss {:.6}", it, val_loss);
        self.log_scalar("val/loss", val_loss, it);

        let record = CheckpointRecord::new(
            &self.config,
            self.outer.params().clone(),
            self.outer.optimizer().state().clone(),
            self.validation.scheduler().state().clone(),
            it,
            val_loss,
        )?;
        self.checkpoints.save(&record)?;
        if val_loss < self.best_val_loss {
            self.best_val_loss = val_loss;
            self.checkpoints.save_named(BEST_CHECKPOINT, &record)?;
        }
        Ok(val_loss)
    }

    fn log_scalar(&mut self, tag: &str, value: f64, step: u64) {
        if let Some(metrics) = self.metrics.as_mut() {
            if let Err(e) = metrics.add_scalar(tag, value, step) {
                warn!("Failed to write metric {}: {}", tag, e);
            }
        }
    }
}
