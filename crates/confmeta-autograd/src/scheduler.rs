//! Learning-rate schedulers.
//!
//! The scheduler owns the current learning rate. It is stepped once per validation cycle and
//! the outer driver reads `lr()` before every optimizer step.

use confmeta_core::{MetaError, Result, SchedulerConfig};
use log::info;
use serde::{Deserialize, Serialize};

/// Below this, a plateau reduction is not worth applying.
const MIN_LR_DELTA: f64 = 1e-8;

/// Persisted scheduler progress
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub lr: f64,
    pub initial_lr: f64,
    /// Number of `step` calls so far
    pub last_epoch: u64,
    /// Best metric seen (plateau only)
    pub best: f64,
    pub num_bad_epochs: u32,
    pub cooldown_counter: u32,
}

#[derive(Clone, Debug)]
pub struct LrScheduler {
    config: SchedulerConfig,
    state: SchedulerState,
}

impl LrScheduler {
    pub fn new(config: &SchedulerConfig, initial_lr: f64) -> Self {
        let state = SchedulerState {
            lr: initial_lr,
            initial_lr,
            last_epoch: 0,
            best: f64::INFINITY,
            num_bad_epochs: 0,
            cooldown_counter: 0,
        };
        LrScheduler { config: config.clone(), state }
    }

    pub fn from_state(config: &SchedulerConfig, state: SchedulerState) -> Self {
        LrScheduler { config: config.clone(), state }
    }

    pub fn lr(&self) -> f64 {
        self.state.lr
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Advance one epoch. `plateau` needs the validation metric; the exponential schedules
    /// ignore it.
    pub fn step(&mut self, metric: Option<f64>) -> Result<f64> {
        self.state.last_epoch += 1;
        match self.config {
            SchedulerConfig::Plateau { factor, patience, min_lr, threshold, cooldown } => {
                let metric = metric.ok_or_else(|| {
                    MetaError::config("plateau scheduler stepped without a validation loss")
                })?;
                self.step_plateau(metric, factor, patience, min_lr, threshold, cooldown);
            }
            SchedulerConfig::Expmin { factor, min_lr } => {
                self.state.lr = self.decayed(factor, min_lr);
            }
            SchedulerConfig::ExpminMilestone { factor, milestone, min_lr } => {
                let gamma = (factor.ln() / milestone as f64).exp();
                self.state.lr = self.decayed(gamma, min_lr);
            }
        }
        Ok(self.state.lr)
    }

    fn decayed(&self, gamma: f64, min_lr: f64) -> f64 {
        (self.state.initial_lr * gamma.powf(self.state.last_epoch as f64)).max(min_lr)
    }

    fn step_plateau(&mut self, metric: f64, factor: f64, patience: u32, min_lr: f64, threshold: f64, cooldown: u32) {
        let s = &mut self.state;
        if metric < s.best * (1.0 - threshold) {
            s.best = metric;
            s.num_bad_epochs = 0;
        } else {
            s.num_bad_epochs += 1;
        }

        if s.cooldown_counter > 0 {
            s.cooldown_counter -= 1;
            s.num_bad_epochs = 0;
        }

        if s.num_bad_epochs > patience {
            let new_lr = (s.lr * factor).max(min_lr);
            if s.lr - new_lr > MIN_LR_DELTA {
                info!("Reducing learning rate: {:.6} -> {:.6}", s.lr, new_lr);
                s.lr = new_lr;
            }
            s.cooldown_counter = cooldown;
            s.num_bad_epochs = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn plateau(patience: u32) -> SchedulerConfig {
        SchedulerConfig::Plateau { factor: 0.5, patience, min_lr: 0.0, threshold: 1e-4, cooldown: 0 }
    }

    #[test]
    fn test_plateau_reduces_after_patience() {
        let mut s = LrScheduler::new(&plateau(2), 1.0);
        s.step(Some(10.0)).unwrap();
        s.step(Some(10.0)).unwrap();
        s.step(Some(10.0)).unwrap();
        assert_eq!(s.lr(), 1.0);
        s.step(Some(10.0)).unwrap();
        assert_eq!(s.lr(), 0.5);
        s.step(Some(9.0)).unwrap();
        assert_eq!(s.lr(), 0.5);
        assert_eq!(s.state().best, 9.0);
    }

    #[test]
    fn test_plateau_requires_metric() {
        let mut s = LrScheduler::new(&plateau(2), 1.0);
        let err = s.step(None).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_plateau_respects_min_lr() {
        let config = SchedulerConfig::Plateau { factor: 0.1, patience: 0, min_lr: 0.05, threshold: 1e-4, cooldown: 0 };
        let mut s = LrScheduler::new(&config, 0.1);
        s.step(Some(1.0)).unwrap();
        s.step(Some(1.0)).unwrap();
        assert_eq!(s.lr(), 0.05);
        s.step(Some(1.0)).unwrap();
        assert_eq!(s.lr(), 0.05);
    }

    #[test]
    fn test_expmin_decays_to_floor() {
        let config = SchedulerConfig::Expmin { factor: 0.5, min_lr: 0.2 };
        let mut s = LrScheduler::new(&config, 1.0);
        assert_eq!(s.step(None).unwrap(), 0.5);
        assert_eq!(s.step(Some(3.0)).unwrap(), 0.25);
        assert_eq!(s.step(None).unwrap(), 0.2);
    }

    #[test]
    fn test_expmin_milestone_hits_factor_at_milestone() {
        let config = SchedulerConfig::ExpminMilestone { factor: 0.1, milestone: 4, min_lr: 0.0 };
        let mut s = LrScheduler::new(&config, 1.0);
        for _ in 0..4 {
            s.step(None).unwrap();
        }
        assert_relative_eq!(s.lr(), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_restore_from_state() {
        let mut s = LrScheduler::new(&plateau(0), 1.0);
        s.step(Some(5.0)).unwrap();
        s.step(Some(5.0)).unwrap();
        let restored = LrScheduler::from_state(s.config(), s.state().clone());
        assert_eq!(restored.state(), s.state());
        assert_eq!(restored.lr(), 0.5);
    }
}
