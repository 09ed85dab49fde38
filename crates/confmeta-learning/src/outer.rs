//! Outer loop: one meta-optimizer step per training iteration.

use std::rc::Rc;

use confmeta_autograd::{clip_grad_norm, GradMode, MetaOptimizer, ParamSet, Tape};
use confmeta_core::{MamlConfig, MetaError, Result, TrainRunConfig};
use log::debug;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::dataset::TaskSource;
use crate::inner::InnerLoopAdapter;
use crate::model::{AdaptableModel, LossContext};

/// What one training step reports for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Mean query loss over the step's tasks (MAML) or mean batch loss (plain mode)
    pub loss: f64,
    /// Global gradient norm before clipping
    pub grad_norm: f64,
    /// Learning rate the meta-optimizer used
    pub lr: f64,
}

/// Owns the meta-parameters and the meta-optimizer.
pub struct OuterLoopDriver<M: AdaptableModel> {
    model: Rc<M>,
    params: ParamSet,
    optimizer: MetaOptimizer,
    maml: MamlConfig,
    tasks_per_step: usize,
    max_grad_norm: f64,
    ctx: LossContext,
}

impl<M: AdaptableModel> OuterLoopDriver<M> {
    /// Driver for `config`, starting from `params`.
    pub fn new(model: Rc<M>, params: ParamSet, config: &TrainRunConfig) -> Result<Self> {
        let optimizer = MetaOptimizer::new(&config.train.optimizer, &params);
        Self::with_optimizer(model, params, optimizer, config)
    }

    /// Driver resuming with a restored optimizer.
    pub fn with_optimizer(
        model: Rc<M>,
        params: ParamSet,
        optimizer: MetaOptimizer,
        config: &TrainRunConfig,
    ) -> Result<Self> {
        config.validate()?;
        let tasks_per_step = config.batch_size_outer_loop();
        if tasks_per_step == 0 {
            return Err(MetaError::config("batch_size_outer_loop rounds to zero"));
        }
        Ok(OuterLoopDriver {
            model,
            params,
            optimizer,
            maml: config.train.maml.clone(),
            tasks_per_step,
            max_grad_norm: config.train.max_grad_norm,
            ctx: LossContext {
                anneal_power: config.train.anneal_power,
                rng: ChaCha8Rng::seed_from_u64(config.train.seed),
            },
        })
    }

    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    pub fn optimizer(&self) -> &MetaOptimizer {
        &self.optimizer
    }

    pub fn tasks_per_step(&self) -> usize {
        self.tasks_per_step
    }

    pub fn is_maml(&self) -> bool {
        self.maml.enabled
    }

    /// Draw tasks from `source`, compute meta-gradients, clip and update once with `lr`.
    pub fn step<S>(&mut self, source: &mut S, lr: f64) -> Result<StepReport>
    where
        S: TaskSource<Example = M::Example> + ?Sized,
    {
        let (loss, mut grads) = if self.maml.enabled {
            self.meta_gradients(source, lr)?
        } else {
            self.batch_gradients(source)?
        };

        if !loss.is_finite() {
            return Err(MetaError::numerical(format!("training loss is {}", loss)));
        }
        let grad_norm = clip_grad_norm(&mut grads, self.max_grad_norm);
        if !grad_norm.is_finite() {
            return Err(MetaError::numerical(format!("gradient norm is {}", grad_norm)));
        }
        self.optimizer.step(&mut self.params, &grads, lr)?;

        Ok(StepReport { loss, grad_norm, lr })
    }

    /// Sum of per-task query-loss gradients and the mean task loss.
    fn meta_gradients<S>(&mut self, source: &mut S, lr: f64) -> Result<(f64, ParamSet)>
    where
        S: TaskSource<Example = M::Example> + ?Sized,
    {
        let inner_lr = self.maml.inner_lr.unwrap_or(lr);
        let adapter = InnerLoopAdapter::new(
            self.model.as_ref(),
            self.optimizer.config(),
            self.maml.inner_steps,
            self.maml.first_order,
        );

        let mut grads = self.params.zeros_like();
        let mut total = 0.0;
        for t in 0..self.tasks_per_step {
            let task = source.next_task()?;
            let mut tape = Tape::new();
            let meta = self.params.register(&mut tape);
            let adaptation = adapter.adapt_and_score(&mut tape, &meta, &task, inner_lr, &mut self.ctx)?;
            let query = tape.mean(adaptation.query_loss)?;
            let value = tape.scalar(query)?;
            debug!("Task {} query loss {:.6} (tape length {})", t, value, tape.len());

            let task_grads = tape.grad(query, &meta.ids(), GradMode::Detached)?;
            grads.accumulate(&meta.with_ids(&task_grads)?.values(&tape)?)?;
            total += value;
        }
        Ok((total / self.tasks_per_step as f64, grads))
    }

    /// Plain mini-batch training: the drawn tasks form one batch.
    fn batch_gradients<S>(&mut self, source: &mut S) -> Result<(f64, ParamSet)>
    where
        S: TaskSource<Example = M::Example> + ?Sized,
    {
        let mut examples = Vec::with_capacity(self.tasks_per_step * source.task_size());
        for _ in 0..self.tasks_per_step {
            examples.extend(source.next_task()?.into_examples());
        }
        let mut tape = Tape::new();
        let vars = self.params.register(&mut tape);
        let loss = self.model.loss(&mut tape, &vars, &examples, &mut self.ctx)?;
        let mean = tape.mean(loss.per_example)?;
        let value = tape.scalar(mean)?;
        let grads = tape.grad(mean, &vars.ids(), GradMode::Detached)?;
        Ok((value, vars.with_ids(&grads)?.values(&tape)?))
    }
}
