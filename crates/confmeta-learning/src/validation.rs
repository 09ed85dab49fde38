//! Validation: adapted query loss over held-out tasks, and the scheduler step it drives.

use std::rc::Rc;

use confmeta_autograd::{LrScheduler, ParamSet, Tape};
use confmeta_core::{MamlConfig, MetaError, OptimizerConfig, Result, TrainRunConfig};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::inner::InnerLoopAdapter;
use crate::model::{AdaptableModel, LossContext};
use crate::task::Task;

/// Owns the learning-rate scheduler. Never sees the optimizer and only borrows parameters.
pub struct ValidationDriver<M: AdaptableModel> {
    model: Rc<M>,
    scheduler: LrScheduler,
    optimizer: OptimizerConfig,
    maml: MamlConfig,
    anneal_power: f64,
    seed: u64,
    show_progress: bool,
}

impl<M: AdaptableModel> ValidationDriver<M> {
    pub fn new(model: Rc<M>, scheduler: LrScheduler, config: &TrainRunConfig) -> Self {
        ValidationDriver {
            model,
            scheduler,
            optimizer: config.train.optimizer.clone(),
            maml: config.train.maml.clone(),
            anneal_power: config.train.anneal_power,
            seed: config.train.seed,
            show_progress: false,
        }
    }

    /// Show an indicatif progress bar during validation passes.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn scheduler(&self) -> &LrScheduler {
        &self.scheduler
    }

    /// Current learning rate
    pub fn lr(&self) -> f64 {
        self.scheduler.lr()
    }

    /// Evaluate, then step the scheduler with the result.
    pub fn validate(&mut self, params: &ParamSet, tasks: &[Task<M::Example>]) -> Result<f64> {
        let loss = self.evaluate(params, tasks)?;
        let metric = if self.scheduler.config().is_plateau() { Some(loss) } else { None };
        self.scheduler.step(metric)?;
        Ok(loss)
    }

    /// Validation loss without touching the scheduler.
    ///
    /// Noise is drawn from a generator seeded afresh on every call, so identical parameters
    /// always give an identical loss.
    pub fn evaluate(&self, params: &ParamSet, tasks: &[Task<M::Example>]) -> Result<f64> {
        if tasks.is_empty() {
            return Err(MetaError::config("validation set yields no tasks"));
        }
        let mut ctx = LossContext {
            anneal_power: self.anneal_power,
            rng: ChaCha8Rng::seed_from_u64(self.seed),
        };
        let progress = self.progress_bar(tasks.len());

        let loss = if self.maml.enabled {
            self.adapted_loss(params, tasks, &mut ctx, &progress)?
        } else {
            self.plain_loss(params, tasks, &mut ctx, &progress)?
        };
        progress.finish_and_clear();

        if !loss.is_finite() {
            return Err(MetaError::numerical(format!("validation loss is {}", loss)));
        }
        Ok(loss)
    }

    /// Mean over tasks of the adapted mean query loss.
    fn adapted_loss(
        &self,
        params: &ParamSet,
        tasks: &[Task<M::Example>],
        ctx: &mut LossContext,
        progress: &ProgressBar,
    ) -> Result<f64> {
        let inner_lr = self.maml.inner_lr.unwrap_or(self.scheduler.lr());
        // Nothing is back-propagated past the inner loop, so its gradients can stay detached.
        let adapter = InnerLoopAdapter::new(self.model.as_ref(), &self.optimizer, self.maml.inner_steps, true);
        let mut total = 0.0;
        for task in tasks {
            let mut tape = Tape::new();
            let meta = params.register(&mut tape);
            let adaptation = adapter.adapt_and_score(&mut tape, &meta, task, inner_lr, ctx)?;
            let query = tape.mean(adaptation.query_loss)?;
            total += tape.scalar(query)?;
            progress.inc(1);
        }
        Ok(total / tasks.len() as f64)
    }

    /// Example-weighted mean loss without adaptation.
    fn plain_loss(
        &self,
        params: &ParamSet,
        tasks: &[Task<M::Example>],
        ctx: &mut LossContext,
        progress: &ProgressBar,
    ) -> Result<f64> {
        let mut sum_loss = 0.0;
        let mut sum_n = 0usize;
        for task in tasks {
            let mut tape = Tape::new();
            tape.set_grad_enabled(false);
            let vars = params.register_constant(&mut tape);
            let loss = self.model.loss(&mut tape, &vars, task.examples(), ctx)?;
            let values = tape.value(loss.per_example)?;
            sum_loss += values.sum();
            sum_n += values.numel();
            progress.inc(1);
        }
        if sum_n == 0 {
            return Err(MetaError::config("validation batches contain no examples"));
        }
        Ok(sum_loss / sum_n as f64)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar().template("Validation {bar:40.cyan/blue} {pos}/{len} ({eta})") {
            pb.set_style(style.progress_chars("##-"));
        }
        pb
    }
}
