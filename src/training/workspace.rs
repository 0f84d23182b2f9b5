// Batch workspace - preallocated per-epoch tensors
//
// Owned by the trainer and lent mutably to the batch runner for one epoch.
// Every tensor is indexed `[episode, time, feature]` (or `[episode, time]`).
// Re-zeroing contract: `clear` runs at every epoch boundary, so an epoch
// always starts from all-zero buffers and nothing leaks across epochs.

use anyhow::{Context, Result};
use ndarray::{s, Array2, Array3, ArrayView2};
use serde::Serialize;

use crate::config::Config;
use crate::model::Modality;
use crate::sim::SensorState;
use crate::training::EpisodeGoal;

/// Number of per-modality match components (the sensorimotor modalities)
pub const MATCH_COMPONENTS: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct BatchWorkspace {
    pub batch_size: usize,
    pub horizon: usize,
    /// Raw inputs in `Modality` order
    pub inputs: [Array3<f64>; 5],
    pub competence: Array2<f64>,
    pub rcompetence: Array2<f64>,
    pub representations: [Array3<f64>; 5],
    pub projections: [Array3<f64>; 5],
    pub match_value: Array2<f64>,
    pub match_value_per_mod: Array3<f64>,
    pub match_increment: Array2<f64>,
    pub match_increment_per_mod: Array3<f64>,
}

impl BatchWorkspace {
    pub fn new(config: &Config) -> Self {
        Self::with_batch_size(config, config.batch_size)
    }

    /// Workspace with the configured sizes but a different episode count
    pub fn with_batch_size(config: &Config, batch_size: usize) -> Self {
        let (b, t) = (batch_size, config.horizon);
        let widths = [
            config.visual_size,
            config.touch_size,
            config.proprio_size,
            config.policy_size,
            config.internal_size,
        ];

        Self {
            batch_size: b,
            horizon: t,
            inputs: std::array::from_fn(|i| Array3::zeros((b, t, widths[i]))),
            competence: Array2::zeros((b, t)),
            rcompetence: Array2::zeros((b, t)),
            representations: std::array::from_fn(|_| Array3::zeros((b, t, config.internal_size))),
            projections: std::array::from_fn(|_| Array3::zeros((b, t, 2))),
            match_value: Array2::zeros((b, t)),
            match_value_per_mod: Array3::zeros((b, t, MATCH_COMPONENTS)),
            match_increment: Array2::zeros((b, t)),
            match_increment_per_mod: Array3::zeros((b, t, MATCH_COMPONENTS)),
        }
    }

    /// Record one step of sensor readings for `episode` at time `t`
    pub fn write_sensors(&mut self, episode: usize, t: usize, state: &SensorState) {
        let sensors = [
            (Modality::Visual, &state.visual),
            (Modality::Touch, &state.touch),
            (Modality::Proprio, &state.joints),
        ];
        for (m, values) in sensors {
            let mut row = self.inputs[m.index()].slice_mut(s![episode, t, ..]);
            let n = row.len().min(values.len());
            row.slice_mut(s![..n]).assign(&values.slice(s![..n]));
        }
    }

    /// Hold an episode's policy, goal and competences over the whole horizon
    pub fn fill_goal(&mut self, episode: usize, goal: &EpisodeGoal) {
        self.inputs[Modality::Action.index()]
            .slice_mut(s![episode, .., ..])
            .assign(&goal.policy);
        self.inputs[Modality::Goal.index()]
            .slice_mut(s![episode, .., ..])
            .assign(&goal.goal);
        self.competence.row_mut(episode).fill(goal.competence);
        self.rcompetence.row_mut(episode).fill(goal.rcompetence);
    }

    /// Rows `[t0, t)` of every episode flattened episode-major to
    /// `[batch * (t - t0), features]`
    pub fn window(&self, m: Modality, t0: usize, t: usize) -> Result<Array2<f64>> {
        let data = &self.inputs[m.index()];
        let width = data.dim().2;
        data.slice(s![.., t0..t, ..])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((self.batch_size * (t - t0), width))
            .context("Failed to flatten input window")
    }

    /// Scatter flattened model output back into `[episode, t0..t, feature]`
    pub fn store_window(target: &mut Array3<f64>, t0: usize, t: usize, rows: ArrayView2<'_, f64>) -> Result<()> {
        let (b, _, width) = target.dim();
        let block = Array3::from_shape_vec((b, t - t0, width), rows.iter().copied().collect())
            .context("Model output does not match the window shape")?;
        target.slice_mut(s![.., t0..t, ..]).assign(&block);
        Ok(())
    }

    /// Whole-batch view flattened to `[batch * horizon, features]`
    pub fn flat_inputs(&self) -> Result<[Array2<f64>; 5]> {
        let rows = self.batch_size * self.horizon;
        let mut out: [Array2<f64>; 5] = Default::default();
        for m in Modality::ALL {
            let data = &self.inputs[m.index()];
            out[m.index()] = data
                .as_standard_layout()
                .into_owned()
                .into_shape_with_order((rows, data.dim().2))
                .context("Failed to flatten trajectory batch")?;
        }
        Ok(out)
    }

    /// Zero every buffer
    pub fn clear(&mut self) {
        for a in self
            .inputs
            .iter_mut()
            .chain(self.representations.iter_mut())
            .chain(self.projections.iter_mut())
        {
            a.fill(0.0);
        }
        self.competence.fill(0.0);
        self.rcompetence.fill(0.0);
        self.match_value.fill(0.0);
        self.match_value_per_mod.fill(0.0);
        self.match_increment.fill(0.0);
        self.match_increment_per_mod.fill(0.0);
    }
}
