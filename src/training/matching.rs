// Match signal and cumulative match-event accounting

use ndarray::{Array1, Array2, Array3, ArrayView3, Axis};

use super::workspace::MATCH_COMPONENTS;
use crate::config::{Config, MatchMaxReset};
use crate::model::Modality;

/// Match value and its per-modality decomposition for a block of rows.
///
/// Each sensorimotor projection is compared with the goal projection of the
/// same row through a Gaussian kernel of width `match_sigma`; the match
/// value is the mean over modalities.
pub fn compute_match(projections: &[Array2<f64>; 5], match_sigma: f64) -> (Array1<f64>, Array2<f64>) {
    let goal = &projections[Modality::Goal.index()];
    let rows = goal.nrows();
    let denom = 2.0 * match_sigma * match_sigma;

    let mut per_mod = Array2::zeros((rows, MATCH_COMPONENTS));
    for (k, m) in Modality::SENSORIMOTOR.iter().enumerate() {
        let p = &projections[m.index()];
        for r in 0..rows {
            let d2: f64 = p
                .row(r)
                .iter()
                .zip(goal.row(r).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            per_mod[[r, k]] = (-d2 / denom).exp();
        }
    }

    let value = per_mod
        .mean_axis(Axis(1))
        .unwrap_or_else(|| Array1::zeros(rows));
    (value, per_mod)
}

/// Non-negative part of the step-to-step change
pub fn positive_increment(current: ArrayView3<'_, f64>, previous: ArrayView3<'_, f64>) -> Array3<f64> {
    (&current - &previous).mapv(|v| v.max(0.0))
}

/// Per-episode cumulative match counters and running maxima
#[derive(Debug, Clone, PartialEq)]
pub struct MatchTracker {
    stop_threshold: usize,
    margin: f64,
    cum_match: Array1<usize>,
    max_match: Array1<f64>,
}

impl MatchTracker {
    pub fn new(batch_size: usize, stop_threshold: usize, margin: f64) -> Self {
        Self {
            stop_threshold,
            margin,
            cum_match: Array1::zeros(batch_size),
            max_match: Array1::zeros(batch_size),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.batch_size, config.cum_match_stop, config.match_event_margin)
    }

    /// Restore running maxima carried by a snapshot
    pub fn with_maxima(mut self, max_match: Array1<f64>) -> Self {
        if max_match.len() == self.max_match.len() {
            self.max_match = max_match;
        }
        self
    }

    /// Zero the counters for a new batch run and clear maxima per `policy`
    pub fn begin_run(&mut self, resampled: &[bool], policy: MatchMaxReset) {
        self.cum_match.fill(0);
        match policy {
            MatchMaxReset::EveryRun => self.max_match.fill(0.0),
            MatchMaxReset::OnGoalResample => {
                for (max, &fresh) in self.max_match.iter_mut().zip(resampled) {
                    if fresh {
                        *max = 0.0;
                    }
                }
            }
        }
    }

    pub fn reached_stop(&self, episode: usize) -> bool {
        self.cum_match[episode] >= self.stop_threshold
    }

    /// Register `value` for `episode`; returns whether it is a match event.
    /// The counter saturates at the stop threshold.
    pub fn observe(&mut self, episode: usize, value: f64) -> bool {
        if value - self.max_match[episode] > self.margin {
            self.cum_match[episode] = (self.cum_match[episode] + 1).min(self.stop_threshold);
            self.max_match[episode] = value;
            true
        } else {
            false
        }
    }

    pub fn cum_match(&self) -> &Array1<usize> {
        &self.cum_match
    }

    pub fn max_match(&self) -> &Array1<f64> {
        &self.max_match
    }

    pub fn stop_threshold(&self) -> usize {
        self.stop_threshold
    }
}
