// Training module - batched episodes, curriculum scheduling and checkpoints

pub mod checkpoint;
pub mod diagnostics;
pub mod matching;
pub mod runner;
pub mod sampler;
pub mod scheduler;
pub mod trainer;
pub mod workspace;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::sim::SensorState;

pub use checkpoint::{CheckpointManager, ResumeState, TrainerSnapshot, SNAPSHOT_VERSION};
pub use matching::MatchTracker;
pub use runner::{spread_window, EpisodeBatchRunner, RunSummary};
pub use sampler::sample_goals;
pub use scheduler::{schedule, HyperParams, ScheduleBounds};
pub use trainer::{EpochReport, TrainOutcome, Trainer};
pub use workspace::BatchWorkspace;

/// RNG consumed by the training loop; its state is part of every snapshot
pub type TrainRng = rand_chacha::ChaCha20Rng;

/// Goal, policy and competences an episode holds until it is resampled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeGoal {
    pub goal: Array1<f64>,
    pub policy: Array1<f64>,
    pub competence: f64,
    pub rcompetence: f64,
}

/// One slot of the batch. `state == None` marks a terminated episode.
#[derive(Debug)]
pub struct Episode<E> {
    pub index: usize,
    pub context: u8,
    pub env: Option<E>,
    pub state: Option<SensorState>,
    pub goal: Option<EpisodeGoal>,
}

impl<E> Episode<E> {
    pub fn new(index: usize, context: u8) -> Self {
        Self {
            index,
            context,
            env: None,
            state: None,
            goal: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_none()
    }
}
