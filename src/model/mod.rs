// Representation/policy model boundary
//
// The learned model is pluggable: the training loop only talks to it
// through `RepresentationModel`.

pub mod prototype;

use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::training::scheduler::HyperParams;
use crate::training::TrainRng;

pub use prototype::PrototypeModel;

/// Input streams, in the order every batched model call uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modality {
    Visual,
    Touch,
    Proprio,
    Action,
    Goal,
}

impl Modality {
    pub const ALL: [Modality; 5] = [
        Modality::Visual,
        Modality::Touch,
        Modality::Proprio,
        Modality::Action,
        Modality::Goal,
    ];

    /// Modalities compared against the goal when computing match
    pub const SENSORIMOTOR: [Modality; 4] = [
        Modality::Visual,
        Modality::Touch,
        Modality::Proprio,
        Modality::Action,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Modality::Visual => "v",
            Modality::Touch => "ss",
            Modality::Proprio => "p",
            Modality::Action => "a",
            Modality::Goal => "g",
        }
    }
}

/// Output of one batched `spread` call; rows align with the input rows
#[derive(Debug, Clone)]
pub struct Spread {
    pub representations: [Array2<f64>; 5],
    /// 2D projections, one row per input row
    pub projections: [Array2<f64>; 5],
}

/// Policies and competences for the goals passed to `sample_with_noise`
#[derive(Debug, Clone)]
pub struct Sampled {
    pub policies: Array2<f64>,
    pub competences: Array1<f64>,
    pub rcompetences: Array1<f64>,
}

/// A full trajectory batch flattened to `[episodes * horizon, features]`
#[derive(Debug)]
pub struct UpdateBatch<'a> {
    pub inputs: [ArrayView2<'a, f64>; 5],
    pub match_value: ArrayView1<'a, f64>,
    pub match_flags: ArrayView1<'a, bool>,
    /// One entry per episode
    pub cum_match: ArrayView1<'a, usize>,
    pub competences: ArrayView1<'a, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    /// Rows that contributed to the update
    pub update_items: usize,
    /// Per-row update mask
    pub update_mask: Array1<bool>,
    /// Loss per sensorimotor modality
    pub loss: [f64; 4],
    pub mean_modulation: f64,
}

impl UpdateReport {
    pub fn mean_loss(&self) -> f64 {
        self.loss.iter().sum::<f64>() / self.loss.len() as f64
    }
}

pub trait RepresentationModel {
    /// Representations and projections for the five modality batches
    fn spread(&mut self, inputs: [ArrayView2<'_, f64>; 5]) -> Result<Spread>;

    fn update(&mut self, batch: &UpdateBatch<'_>) -> Result<UpdateReport>;

    /// Noisy policies for `goals`, drawing exploration noise from `rng`
    fn sample_with_noise(&mut self, goals: ArrayView2<'_, f64>, rng: &mut TrainRng) -> Result<Sampled>;

    /// Noise-free policies for `goals`
    fn policies(&self, goals: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    fn competence_grid(&self) -> Array1<f64>;

    /// One goal per row covering the model's goal space
    fn goal_grid(&self) -> Array2<f64>;

    fn set_hyper_params(&mut self, params: &HyperParams);

    /// Write model files for `epoch` into `dir`
    fn save(&self, epoch: usize, dir: &Path) -> Result<()>;

    fn snapshot(&self) -> Result<serde_json::Value>;

    fn restore(&mut self, state: serde_json::Value) -> Result<()>;
}
