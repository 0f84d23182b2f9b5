// Configuration structs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::ConfigError;
use crate::training::scheduler::ScheduleBounds;

/// Largest seed that survives a round trip through TOML
pub const MAX_SEED: u64 = i64::MAX as u64;

/// Axis-aligned region the manipulated object must stay within
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskSpace {
    pub xlim: [f64; 2],
    pub ylim: [f64; 2],
}

impl TaskSpace {
    /// Inclusive containment test
    pub fn contains(&self, xy: [f64; 2]) -> bool {
        xy[0] >= self.xlim[0] && xy[0] <= self.xlim[1] && xy[1] >= self.ylim[0] && xy[1] <= self.ylim[1]
    }
}

impl Default for TaskSpace {
    fn default() -> Self {
        Self {
            xlim: [-6.0, 6.0],
            ylim: [-1.0, 6.0],
        }
    }
}

/// When an episode's running match maximum is cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMaxReset {
    /// Every batch run starts from a zero maximum
    #[default]
    EveryRun,
    /// The maximum carries across runs and is cleared only when the
    /// episode's goal is resampled
    OnGoalResample,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Episodes stepped in lock-step per epoch
    pub batch_size: usize,
    /// Timesteps per batch run (T)
    pub horizon: usize,
    /// Steps an action is held before the agent is queried again (K)
    pub action_period: usize,
    /// Total number of epochs
    pub epochs: usize,
    /// Every environment is rebuilt on epochs divisible by this
    pub env_reset_freq: usize,
    /// Checkpoint every N epochs (and always on the final epoch)
    pub checkpoint_interval: usize,
    /// Newest epoch directories to keep (0 keeps all)
    pub max_checkpoints: usize,

    pub visual_size: usize,
    pub touch_size: usize,
    pub proprio_size: usize,
    pub policy_size: usize,
    pub internal_size: usize,

    /// Saturation point of the cumulative match counter
    pub cum_match_stop: usize,
    /// Margin over the running max that registers a match event
    pub match_event_margin: f64,
    /// Windows starting at or before this step never register match events
    pub settle_steps: usize,
    pub match_max_reset: MatchMaxReset,

    pub base_match_sigma: f64,
    pub match_sigma: f64,
    pub base_internal_sigma: f64,
    pub internal_sigma: f64,
    pub base_lr: f64,
    pub lr: f64,
    pub explore_sigma: f64,

    pub task_space: TaskSpace,
    /// Stored as a TOML integer, so at most `i64::MAX`
    pub seed: u64,

    pub storage_dir: PathBuf,
    pub site_dir: PathBuf,

    /// Enables the optional diagnostics below
    pub plots: bool,
    pub plot_sims: bool,
    pub compute_trajectories: bool,
    /// Distinct demo episodes rendered when `plot_sims` is on
    pub demo_episodes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 24,
            horizon: 100,
            action_period: 5,
            epochs: 400,
            env_reset_freq: 2,
            checkpoint_interval: 20,
            max_checkpoints: 0,

            visual_size: 100,
            touch_size: 4,
            proprio_size: 5,
            policy_size: 10,
            internal_size: 100,

            cum_match_stop: 10,
            match_event_margin: 0.01,
            settle_steps: 10,
            match_max_reset: MatchMaxReset::EveryRun,

            base_match_sigma: 1.0,
            match_sigma: 4.0,
            base_internal_sigma: 0.5,
            internal_sigma: 2.5,
            base_lr: 0.005,
            lr: 0.05,
            explore_sigma: 0.3,

            task_space: TaskSpace::default(),
            seed: 1,

            storage_dir: PathBuf::from("storage"),
            site_dir: PathBuf::from("www"),

            plots: false,
            plot_sims: false,
            compute_trajectories: false,
            demo_episodes: 4,
        }
    }
}

impl Config {
    /// Interpolation extremes for the competence scheduler
    pub fn schedule_bounds(&self) -> ScheduleBounds {
        ScheduleBounds {
            base_match_sigma: self.base_match_sigma,
            target_match_sigma: self.match_sigma,
            base_internal_sigma: self.base_internal_sigma,
            target_internal_sigma: self.internal_sigma,
            base_lr: self.base_lr,
            target_lr: self.lr,
            explore_sigma: self.explore_sigma,
        }
    }

    /// Reject configurations the training loop cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("horizon", self.horizon),
            ("action_period", self.action_period),
            ("env_reset_freq", self.env_reset_freq),
            ("checkpoint_interval", self.checkpoint_interval),
            ("visual_size", self.visual_size),
            ("proprio_size", self.proprio_size),
            ("policy_size", self.policy_size),
            ("internal_size", self.internal_size),
            ("cum_match_stop", self.cum_match_stop),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        if self.action_period > self.horizon {
            return Err(ConfigError::Invalid(format!(
                "action_period ({}) exceeds horizon ({})",
                self.action_period, self.horizon
            )));
        }

        let sigmas = [
            ("base_match_sigma", self.base_match_sigma),
            ("match_sigma", self.match_sigma),
            ("base_internal_sigma", self.base_internal_sigma),
            ("internal_sigma", self.internal_sigma),
        ];
        for (name, value) in sigmas {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!("{} must be a positive number", name)));
            }
        }

        if !(self.explore_sigma.is_finite() && self.explore_sigma >= 0.0) {
            return Err(ConfigError::Invalid("explore_sigma must be non-negative".to_string()));
        }
        if !(self.base_lr.is_finite() && self.lr.is_finite()) {
            return Err(ConfigError::Invalid("learning rates must be finite".to_string()));
        }

        if self.seed > MAX_SEED {
            return Err(ConfigError::Invalid(format!("seed must not exceed {}", MAX_SEED)));
        }

        let ts = &self.task_space;
        if ts.xlim[0] > ts.xlim[1] || ts.ylim[0] > ts.ylim[1] {
            return Err(ConfigError::Invalid(
                "task_space limits must be ordered [min, max]".to_string(),
            ));
        }

        Ok(())
    }
}
