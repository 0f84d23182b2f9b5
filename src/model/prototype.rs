// Prototype reference model
//
// One topological prototype map per modality. A row's projection is the
// grid position of its best-matching prototype and its representation is
// a Gaussian bump around that position. Goals map linearly to policies;
// the linear map learns from rows that registered a match event.

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::{Modality, RepresentationModel, Sampled, Spread, UpdateBatch, UpdateReport};
use crate::config::Config;
use crate::training::scheduler::HyperParams;
use crate::training::TrainRng;

/// Learning-rate multiplier for the competence grid
const COMPETENCE_RATE: f64 = 0.1;
/// Rows whose match exceeds this take part in prototype learning
const MODULATION_GATE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TopologicalMap {
    side: usize,
    weights: Array2<f64>,
}

impl TopologicalMap {
    fn new(units: usize, inputs: usize, rng: &mut ChaCha20Rng) -> Self {
        let side = (units as f64).sqrt().ceil() as usize;
        Self {
            side: side.max(1),
            weights: Array2::from_shape_fn((units, inputs), |_| rng.gen_range(0.0..0.1)),
        }
    }

    fn inputs(&self) -> usize {
        self.weights.ncols()
    }

    fn units(&self) -> usize {
        self.weights.nrows()
    }

    fn best_unit(&self, x: ArrayView1<'_, f64>) -> (usize, f64) {
        let mut best = (0, f64::INFINITY);
        for (unit, w) in self.weights.outer_iter().enumerate() {
            let d2: f64 = w.iter().zip(x.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
            if d2 < best.1 {
                best = (unit, d2);
            }
        }
        best
    }

    fn coords(&self, unit: usize) -> [f64; 2] {
        [(unit % self.side) as f64, (unit / self.side) as f64]
    }

    fn neighbourhood(&self, unit: usize, sigma: f64) -> Array1<f64> {
        let center = self.coords(unit);
        let denom = 2.0 * sigma * sigma;
        Array1::from_shape_fn(self.units(), |u| {
            let c = self.coords(u);
            let d2 = (c[0] - center[0]).powi(2) + (c[1] - center[1]).powi(2);
            (-d2 / denom).exp()
        })
    }

    /// One neighbourhood-weighted step towards `x`; returns the distance of
    /// the winner before the step
    fn learn(&mut self, x: ArrayView1<'_, f64>, rate: f64, sigma: f64) -> f64 {
        let (unit, d2) = self.best_unit(x);
        let h = self.neighbourhood(unit, sigma);
        for (u, mut w) in self.weights.outer_iter_mut().enumerate() {
            let step = rate * h[u];
            w.zip_mut_with(&x, |wi, &xi| *wi += step * (xi - *wi));
        }
        d2.sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrototypeModel {
    maps: [TopologicalMap; 5],
    /// `[policy_size, internal_size]`
    policy_map: Array2<f64>,
    competence: Array1<f64>,
    internal_sigma: f64,
    learning_rate: f64,
    explore_sigma: f64,
}

impl PrototypeModel {
    pub fn new(config: &Config) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(config.seed ^ 0x5eed_0f_a11);
        let units = config.internal_size;
        let dims = [
            config.visual_size,
            config.touch_size,
            config.proprio_size,
            config.policy_size,
            config.internal_size,
        ];
        let maps = std::array::from_fn(|i| TopologicalMap::new(units, dims[i], &mut rng));
        let policy_map =
            Array2::from_shape_fn((config.policy_size, units), |_| rng.gen_range(-0.05..0.05));

        Self {
            maps,
            policy_map,
            competence: Array1::zeros(units),
            internal_sigma: config.internal_sigma,
            learning_rate: config.lr,
            explore_sigma: config.explore_sigma,
        }
    }

    fn check_goals(&self, goals: &ArrayView2<'_, f64>) -> Result<()> {
        if goals.ncols() != self.policy_map.ncols() {
            bail!(
                "goal width {} does not match the {} internal units",
                goals.ncols(),
                self.policy_map.ncols()
            );
        }
        Ok(())
    }
}

fn argmax(row: ArrayView1<'_, f64>) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, &v) in row.iter().enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}

impl RepresentationModel for PrototypeModel {
    fn spread(&mut self, inputs: [ArrayView2<'_, f64>; 5]) -> Result<Spread> {
        let sigma = self.internal_sigma;
        let mut representations: [Array2<f64>; 5] = Default::default();
        let mut projections: [Array2<f64>; 5] = Default::default();

        for m in Modality::ALL {
            let map = &self.maps[m.index()];
            let input = &inputs[m.index()];
            if input.ncols() != map.inputs() {
                bail!(
                    "{} input has {} features, expected {}",
                    m.label(),
                    input.ncols(),
                    map.inputs()
                );
            }

            let mut reprs = Array2::zeros((input.nrows(), map.units()));
            let mut projs = Array2::zeros((input.nrows(), 2));
            for (r, x) in input.outer_iter().enumerate() {
                let (unit, _) = map.best_unit(x);
                reprs.row_mut(r).assign(&map.neighbourhood(unit, sigma));
                let [cx, cy] = map.coords(unit);
                projs[[r, 0]] = cx;
                projs[[r, 1]] = cy;
            }
            representations[m.index()] = reprs;
            projections[m.index()] = projs;
        }

        Ok(Spread {
            representations,
            projections,
        })
    }

    fn update(&mut self, batch: &UpdateBatch<'_>) -> Result<UpdateReport> {
        let rows = batch.match_value.len();
        let episodes = batch.cum_match.len();
        if episodes == 0 || rows % episodes != 0 {
            bail!("{} update rows cannot be split over {} episodes", rows, episodes);
        }
        let horizon = rows / episodes;

        let goal = batch.inputs[Modality::Goal.index()];
        let action = batch.inputs[Modality::Action.index()];
        let sigma = self.internal_sigma;

        let mut mask = Array1::from_elem(rows, false);
        let mut loss = [0.0; 4];
        let mut modulation_sum = 0.0;

        for r in 0..rows {
            let modulation = batch.match_value[r];
            let flagged = batch.match_flags[r];
            if !(flagged || modulation > MODULATION_GATE) {
                continue;
            }
            mask[r] = true;
            modulation_sum += modulation;

            let rate = self.learning_rate * modulation * (1.0 - 0.5 * batch.competences[r]);
            for (k, m) in Modality::SENSORIMOTOR.iter().enumerate() {
                loss[k] += self.maps[m.index()].learn(batch.inputs[m.index()].row(r), rate, sigma);
            }
            self.maps[Modality::Goal.index()].learn(goal.row(r), rate, sigma);

            if flagged {
                let g = goal.row(r);
                let error = &action.row(r) - &self.policy_map.dot(&g);
                for (i, mut w) in self.policy_map.outer_iter_mut().enumerate() {
                    let step = self.learning_rate * error[i];
                    w.zip_mut_with(&g, |wi, &gi| *wi += step * gi);
                }
            }
        }

        for e in 0..episodes {
            let start = e * horizon;
            let g = goal.row(start);
            if g.iter().all(|&v| v == 0.0) {
                continue;
            }
            let unit = argmax(g);
            let achieved = (start..start + horizon).any(|r| batch.match_flags[r]);
            let target = if achieved { 1.0 } else { 0.0 };
            self.competence[unit] += COMPETENCE_RATE * (target - self.competence[unit]);
        }

        let update_items = mask.iter().filter(|&&m| m).count();
        if update_items > 0 {
            for l in loss.iter_mut() {
                *l /= update_items as f64;
            }
        }
        let mean_modulation = if update_items > 0 {
            modulation_sum / update_items as f64
        } else {
            0.0
        };

        Ok(UpdateReport {
            update_items,
            update_mask: mask,
            loss,
            mean_modulation,
        })
    }

    fn sample_with_noise(&mut self, goals: ArrayView2<'_, f64>, rng: &mut TrainRng) -> Result<Sampled> {
        self.check_goals(&goals)?;
        let noise = Normal::new(0.0, self.explore_sigma).context("Invalid exploration sigma")?;

        let mut policies = goals.dot(&self.policy_map.t());
        policies.mapv_inplace(|p| p + noise.sample(rng));

        let goal_map = &self.maps[Modality::Goal.index()];
        let mut competences = Array1::zeros(goals.nrows());
        let mut rcompetences = Array1::zeros(goals.nrows());
        for (i, g) in goals.outer_iter().enumerate() {
            let unit = argmax(g);
            competences[i] = self.competence[unit];
            let h = goal_map.neighbourhood(unit, self.internal_sigma);
            rcompetences[i] = h.dot(&self.competence) / h.sum();
        }

        Ok(Sampled {
            policies,
            competences,
            rcompetences,
        })
    }

    fn policies(&self, goals: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.check_goals(&goals)?;
        Ok(goals.dot(&self.policy_map.t()))
    }

    fn competence_grid(&self) -> Array1<f64> {
        self.competence.clone()
    }

    fn goal_grid(&self) -> Array2<f64> {
        let map = &self.maps[Modality::Goal.index()];
        let units = map.units();
        let mut grid = Array2::zeros((units, units));
        for (u, mut row) in grid.axis_iter_mut(Axis(0)).enumerate() {
            row.assign(&map.neighbourhood(u, self.internal_sigma));
        }
        grid
    }

    fn set_hyper_params(&mut self, params: &HyperParams) {
        self.internal_sigma = params.internal_sigma;
        self.learning_rate = params.learning_rate;
        self.explore_sigma = params.explore_sigma;
    }

    fn save(&self, epoch: usize, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create model directory: {:?}", dir))?;
        let path = dir.join("model.json");
        let payload = serde_json::json!({ "epoch": epoch, "model": self });
        fs::write(&path, serde_json::to_string(&payload)?)
            .with_context(|| format!("Failed to write model: {:?}", path))?;
        tracing::info!(epoch, path = ?path, "Saved prototype model");
        Ok(())
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).context("Failed to serialize prototype model")
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        *self = serde_json::from_value(state).context("Failed to parse prototype model")?;
        Ok(())
    }
}
