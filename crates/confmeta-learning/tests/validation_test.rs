//! Validation driver: loss reduction and the scheduler step it feeds.

mod common;

use std::rc::Rc;

use approx::assert_relative_eq;
use common::{base_config, scalar_targets, QuadraticModel};
use confmeta_autograd::{LrScheduler, ParamSet};
use confmeta_core::{MetaError, SchedulerConfig, TrainRunConfig};
use confmeta_learning::{validation_tasks, AdaptableModel, Task, ValidationDriver};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn driver(config: &TrainRunConfig) -> (ValidationDriver<QuadraticModel>, ParamSet) {
    let model = QuadraticModel::new(vec![0.0]);
    let params = model.init_params(&mut ChaCha8Rng::seed_from_u64(0));
    let scheduler = LrScheduler::new(&config.train.scheduler, config.train.optimizer.lr());
    (ValidationDriver::new(Rc::new(model), scheduler, config), params)
}

/// Targets 1..=10 in two tasks of five
fn tasks() -> Vec<Task<Vec<f64>>> {
    validation_tasks(&scalar_targets(1.0, 10), 5).unwrap()
}

#[test]
fn test_plateau_scheduler_receives_the_validation_loss() {
    let mut config = base_config();
    config.train.scheduler =
        SchedulerConfig::Plateau { factor: 0.5, patience: 0, min_lr: 0.0, threshold: 1e-4, cooldown: 0 };
    let (mut validation, params) = driver(&config);

    let first = validation.validate(&params, &tasks()).unwrap();
    assert_relative_eq!(validation.lr(), 0.1, epsilon = 1e-15);
    // same parameters, same noise: no improvement, so patience 0 cuts the lr
    let second = validation.validate(&params, &tasks()).unwrap();
    assert_eq!(first, second);
    assert_relative_eq!(validation.lr(), 0.05, epsilon = 1e-15);
    assert_eq!(validation.scheduler().state().last_epoch, 2);
}

#[test]
fn test_exponential_scheduler_steps_every_validation() {
    let config = base_config();
    let (mut validation, params) = driver(&config);
    validation.validate(&params, &tasks()).unwrap();
    assert_relative_eq!(validation.lr(), 0.05, epsilon = 1e-15);
    validation.validate(&params, &tasks()).unwrap();
    assert_relative_eq!(validation.lr(), 0.025, epsilon = 1e-15);
}

#[test]
fn test_evaluate_does_not_step_the_scheduler() {
    let config = base_config();
    let (validation, params) = driver(&config);
    validation.evaluate(&params, &tasks()).unwrap();
    assert_eq!(validation.scheduler().state().last_epoch, 0);
    assert_relative_eq!(validation.lr(), 0.1, epsilon = 1e-15);
}

#[test]
fn test_plain_validation_is_example_weighted_mean() {
    let mut config = base_config();
    config.train.maml.enabled = false;
    let (validation, params) = driver(&config);

    // 0.5 * mean(t^2) over t = 1..=10
    let loss = validation.evaluate(&params, &tasks()).unwrap();
    assert_relative_eq!(loss, 19.25, epsilon = 1e-12);

    // uneven task sizes weight by example count, not by task
    let uneven = vec![Task::new(vec![vec![1.0]]), Task::new(vec![vec![2.0], vec![3.0], vec![4.0]])];
    let loss = validation.evaluate(&params, &uneven).unwrap();
    assert_relative_eq!(loss, 0.5 * 30.0 / 4.0, epsilon = 1e-12);
}

#[test]
fn test_empty_task_list_is_config_error() {
    let config = base_config();
    let (mut validation, params) = driver(&config);
    let err = validation.validate(&params, &[]).unwrap_err();
    assert!(matches!(err, MetaError::Config(_)));
    assert_eq!(validation.scheduler().state().last_epoch, 0);
}
