//! One outer step: task batching, meta-gradient accumulation, clipping and the update.

mod common;

use std::rc::Rc;

use approx::assert_relative_eq;
use common::{adam_config, base_config, scalar_targets, water_set, QuadraticModel};
use confmeta_core::{MetaError, Result, TrainRunConfig};
use confmeta_learning::{get_model, AdaptableModel, CyclicTaskSource, OuterLoopDriver, Task, TaskSource};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const INNER_LR: f64 = 0.3;
const OUTER_LR: f64 = 0.1;

/// Counts how many tasks the driver pulls.
struct CountingSource<S> {
    inner: S,
    drawn: usize,
}

impl<S: TaskSource> TaskSource for CountingSource<S> {
    type Example = S::Example;

    fn next_task(&mut self) -> Result<Task<S::Example>> {
        self.drawn += 1;
        self.inner.next_task()
    }

    fn task_size(&self) -> usize {
        self.inner.task_size()
    }
}

fn quadratic_driver(config: &TrainRunConfig) -> OuterLoopDriver<QuadraticModel> {
    let model = QuadraticModel::new(vec![0.0]);
    let params = model.init_params(&mut ChaCha8Rng::seed_from_u64(0));
    OuterLoopDriver::new(Rc::new(model), params, config).unwrap()
}

/// Two tasks per step: targets 1..=5 and 6..=10
fn two_tasks() -> CyclicTaskSource<Vec<f64>> {
    CyclicTaskSource::new(scalar_targets(1.0, 10), 5, None).unwrap()
}

fn sgd_maml_config() -> TrainRunConfig {
    let mut config = base_config();
    config.train.maml.inner_lr = Some(INNER_LR);
    config
}

fn w(driver: &OuterLoopDriver<QuadraticModel>) -> f64 {
    driver.params().get("w").unwrap().data[0]
}

/// `(adapted w, query target)` after two SGD inner steps from w0 = 0
fn adapted(mean_support: f64, query: f64) -> (f64, f64) {
    (mean_support * (1.0 - (1.0 - INNER_LR).powi(2)), query)
}

#[test]
fn test_tasks_per_step_is_batch_size_over_task_size() {
    let config = sgd_maml_config();
    let mut driver = quadratic_driver(&config);
    assert_eq!(driver.tasks_per_step(), 2);

    let mut source = CountingSource { inner: two_tasks(), drawn: 0 };
    driver.step(&mut source, OUTER_LR).unwrap();
    assert_eq!(source.drawn, 2);
    driver.step(&mut source, OUTER_LR).unwrap();
    assert_eq!(source.drawn, 4);
}

#[test]
fn test_second_order_meta_update_sums_task_gradients() {
    let config = sgd_maml_config();
    let mut driver = quadratic_driver(&config);
    let report = driver.step(&mut two_tasks(), OUTER_LR).unwrap();

    let decay = (1.0 - INNER_LR).powi(2);
    let (wa, qa) = adapted(2.5, 5.0);
    let (wb, qb) = adapted(7.5, 10.0);
    let meta_grad = decay * (wa - qa) + decay * (wb - qb);

    assert_relative_eq!(w(&driver), -OUTER_LR * meta_grad, epsilon = 1e-12);
    assert_relative_eq!(report.grad_norm, meta_grad.abs(), epsilon = 1e-12);
    let mean_query = (0.5 * (wa - qa).powi(2) + 0.5 * (wb - qb).powi(2)) / 2.0;
    assert_relative_eq!(report.loss, mean_query, epsilon = 1e-12);
    assert_eq!(report.lr, OUTER_LR);
    assert_eq!(driver.optimizer().step_count(), 1);
}

#[test]
fn test_first_order_meta_update() {
    let mut config = sgd_maml_config();
    config.train.maml.first_order = true;
    let mut driver = quadratic_driver(&config);
    driver.step(&mut two_tasks(), OUTER_LR).unwrap();

    let (wa, qa) = adapted(2.5, 5.0);
    let (wb, qb) = adapted(7.5, 10.0);
    assert_relative_eq!(w(&driver), -OUTER_LR * ((wa - qa) + (wb - qb)), epsilon = 1e-12);
}

#[test]
fn test_inner_lr_defaults_to_outer_lr() {
    let config = base_config();
    assert!(config.train.maml.inner_lr.is_none());
    let mut driver = quadratic_driver(&config);
    driver.step(&mut two_tasks(), OUTER_LR).unwrap();

    let decay = (1.0 - OUTER_LR).powi(2);
    let adapted = |m: f64| m * (1.0 - decay);
    let meta_grad = decay * (adapted(2.5) - 5.0) + decay * (adapted(7.5) - 10.0);
    assert_relative_eq!(w(&driver), -OUTER_LR * meta_grad, epsilon = 1e-12);
}

#[test]
fn test_gradient_is_clipped_before_the_update() {
    let mut config = sgd_maml_config();
    config.train.max_grad_norm = 1.0;
    let mut driver = quadratic_driver(&config);
    let report = driver.step(&mut two_tasks(), OUTER_LR).unwrap();

    // the meta-gradient is negative with norm well above 1
    assert!(report.grad_norm > 1.0);
    assert_relative_eq!(w(&driver), OUTER_LR, epsilon = 1e-12);
}

#[test]
fn test_plain_mode_uses_one_batch_of_all_drawn_examples() {
    let mut config = base_config();
    config.train.maml.enabled = false;
    let mut driver = quadratic_driver(&config);
    assert!(!driver.is_maml());
    let report = driver.step(&mut two_tasks(), OUTER_LR).unwrap();

    // d/dw mean 0.5 (w - t)^2 at w = 0 over t = 1..=10 is -5.5
    assert_relative_eq!(w(&driver), 0.55, epsilon = 1e-12);
    assert_relative_eq!(report.loss, 0.5 * 385.0 / 10.0, epsilon = 1e-12);
    assert_relative_eq!(report.grad_norm, 5.5, epsilon = 1e-12);
}

#[test]
fn test_non_finite_loss_aborts_without_updating() {
    let config = sgd_maml_config();
    let mut driver = quadratic_driver(&config);
    let mut targets = scalar_targets(1.0, 10);
    targets[7] = vec![f64::NAN];
    let mut source = CyclicTaskSource::new(targets, 5, None).unwrap();

    let err = driver.step(&mut source, OUTER_LR).unwrap_err();
    assert!(matches!(err, MetaError::Numerical(_)));
    assert_eq!(w(&driver), 0.0);
    assert_eq!(driver.optimizer().step_count(), 0);
}

#[test]
fn test_steps_are_deterministic_for_a_seed() {
    let config = adam_config();
    let model = Rc::new(get_model(&config.model).unwrap());
    let run = || {
        let params = model.init_params(&mut ChaCha8Rng::seed_from_u64(config.train.seed));
        let mut driver = OuterLoopDriver::new(Rc::clone(&model), params, &config).unwrap();
        let mut source = CyclicTaskSource::new(water_set(20), 5, None).unwrap();
        let reports: Vec<_> = (0..2).map(|_| driver.step(&mut source, 0.01).unwrap()).collect();
        (driver.params().clone(), reports)
    };

    let (params_a, reports_a) = run();
    let (params_b, reports_b) = run();
    assert_eq!(params_a, params_b);
    assert_eq!(reports_a, reports_b);
    assert!(reports_a.iter().all(|r| r.loss.is_finite() && r.grad_norm.is_finite()));
}
