// Training loop - per-epoch orchestration under a wall-clock budget

use anyhow::{bail, Context, Result};
use chrono::Utc;
use ndarray::{s, Array1, Array2};
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::checkpoint::{
    migrate_logs, CheckpointManager, EpisodeSnapshot, ResumeState, TrainerSnapshot, SNAPSHOT_VERSION,
};
use super::diagnostics;
use super::matching::MatchTracker;
use super::runner::{spread_window, EpisodeBatchRunner};
use super::sampler::sample_goals;
use super::scheduler::{schedule, HyperParams};
use super::workspace::BatchWorkspace;
use super::{Episode, TrainRng};
use crate::config::Config;
use crate::model::{Modality, RepresentationModel, UpdateBatch, UpdateReport};
use crate::sim::{context_for_episode, episode_seed, Agent, Environment, EnvironmentFactory, SCENE_CONTEXTS};

/// Columns of a log row: min, mean and max competence of the epoch's goals
pub const LOG_COLUMNS: usize = 3;

/// How a call to `Trainer::train` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    /// Every configured epoch has run
    Completed { epochs: usize },
    /// The wall-clock budget ran out before `epoch` could start
    BudgetExceeded { epoch: usize },
}

/// What happened during one epoch
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub competence: f64,
    pub hyper: HyperParams,
    /// Episodes whose environment was rebuilt
    pub reset: Vec<usize>,
    /// Episodes that received a new goal
    pub resampled: Vec<usize>,
    pub update: UpdateReport,
    pub cum_match: Array1<usize>,
    pub episode_len: Array1<usize>,
    pub log_row: [f64; LOG_COLUMNS],
    pub recompute_steps: Vec<usize>,
}

/// Curriculum trainer owning the model, every episode and the batch
/// workspace
pub struct Trainer<M, F: EnvironmentFactory, A> {
    config: Config,
    model: M,
    factory: F,
    agent: A,
    rng: TrainRng,
    seed: u64,
    epoch: usize,
    logs: Array2<f64>,
    episodes: Vec<Episode<F::Env>>,
    reset_goal: Vec<bool>,
    tracker: MatchTracker,
    workspace: BatchWorkspace,
    runner: EpisodeBatchRunner,
    checkpoints: CheckpointManager,
    started: Instant,
    epochs_this_run: usize,
}

impl<M, F, A> Trainer<M, F, A>
where
    M: RepresentationModel,
    F: EnvironmentFactory,
    A: Agent,
{
    /// Fresh trainer seeded from `config.seed`
    pub fn new(config: Config, model: M, factory: F, agent: A) -> Result<Self> {
        config.validate()?;
        let checkpoints = CheckpointManager::new(config.storage_dir.clone(), config.max_checkpoints)?;

        let b = config.batch_size;
        Ok(Self {
            rng: TrainRng::seed_from_u64(config.seed),
            seed: config.seed,
            epoch: 0,
            logs: Array2::zeros((config.epochs, LOG_COLUMNS)),
            episodes: (0..b).map(|e| Episode::new(e, context_for_episode(e))).collect(),
            reset_goal: vec![true; b],
            tracker: MatchTracker::from_config(&config),
            workspace: BatchWorkspace::new(&config),
            runner: EpisodeBatchRunner::new(&config),
            checkpoints,
            started: Instant::now(),
            epochs_this_run: 0,
            config,
            model,
            factory,
            agent,
        })
    }

    /// Resume from the newest checkpoint under `config.storage_dir`, or
    /// start fresh when there is none
    pub fn launch(config: Config, model: M, factory: F, agent: A) -> Result<Self> {
        config.validate()?;
        let checkpoints = CheckpointManager::new(config.storage_dir.clone(), config.max_checkpoints)?;

        match ResumeState::detect(&checkpoints, &config)? {
            ResumeState::Fresh => {
                tracing::info!(seed = config.seed, "No checkpoint found, starting fresh");
                Self::new(config, model, factory, agent)
            }
            ResumeState::Restore(snapshot) => Self::restore(config, model, factory, agent, *snapshot),
        }
    }

    /// Rebuild a trainer from a decoded snapshot. The wall-clock budget
    /// restarts from now.
    pub fn restore(config: Config, mut model: M, factory: F, agent: A, snapshot: TrainerSnapshot) -> Result<Self> {
        let TrainerSnapshot {
            seed,
            epoch,
            rng,
            logs,
            model: model_state,
            episodes,
            reset_goal,
            max_match,
            ..
        } = snapshot;

        if episodes.len() != config.batch_size {
            bail!(
                "snapshot holds {} episodes, expected {}",
                episodes.len(),
                config.batch_size
            );
        }
        if seed != config.seed {
            tracing::warn!(
                snapshot_seed = seed,
                config_seed = config.seed,
                "Resuming with the checkpoint's seed"
            );
        }

        model.restore(model_state).context("Failed to restore model state")?;

        let mut restored = Vec::with_capacity(episodes.len());
        for (index, saved) in episodes.into_iter().enumerate() {
            let env = match saved.env {
                Some(state) => {
                    let mut env = factory.create(episode_seed(seed, index, epoch))?;
                    env.load_state(state)
                        .with_context(|| format!("Failed to restore environment of episode {}", index))?;
                    Some(env)
                }
                None => None,
            };
            restored.push(Episode {
                index,
                context: saved.context,
                env,
                state: saved.state,
                goal: saved.goal,
            });
        }

        let checkpoints = CheckpointManager::new(config.storage_dir.clone(), config.max_checkpoints)?;
        let logs = migrate_logs(logs, config.epochs);

        tracing::info!(epoch, seed, "Resuming training");

        Ok(Self {
            rng,
            seed,
            epoch,
            logs,
            episodes: restored,
            reset_goal,
            tracker: MatchTracker::from_config(&config).with_maxima(max_match),
            workspace: BatchWorkspace::new(&config),
            runner: EpisodeBatchRunner::new(&config),
            checkpoints,
            started: Instant::now(),
            epochs_this_run: 0,
            config,
            model,
            factory,
            agent,
        })
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn logs(&self) -> &Array2<f64> {
        &self.logs
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn episodes(&self) -> &[Episode<F::Env>] {
        &self.episodes
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Run epochs until the configured total or until `budget` runs out.
    ///
    /// The budget is checked at epoch boundaries only, and the first epoch
    /// of every call runs regardless so each invocation makes progress.
    pub fn train(&mut self, budget: Option<Duration>) -> Result<TrainOutcome> {
        while self.epoch < self.config.epochs {
            if let Some(budget) = budget {
                if self.epochs_this_run > 0 && self.started.elapsed() >= budget {
                    tracing::info!(
                        epoch = self.epoch,
                        elapsed_secs = self.started.elapsed().as_secs_f64(),
                        "Time budget exhausted"
                    );
                    return Ok(TrainOutcome::BudgetExceeded { epoch: self.epoch });
                }
            }
            self.step_epoch()?;
        }
        Ok(TrainOutcome::Completed { epochs: self.epoch })
    }

    /// Run one epoch, then checkpoint if it is due, clear the workspace and
    /// advance the epoch counter
    pub fn step_epoch(&mut self) -> Result<EpochReport> {
        let epoch = self.epoch;
        let report = self.run_epoch()?;

        let due = self.checkpoint_due(epoch);
        if due {
            diagnostics::write_history(&self.workspace, &self.checkpoints.epoch_dir(epoch))?;
        }

        self.workspace.clear();
        self.epoch += 1;
        self.epochs_this_run += 1;

        if due {
            let dir = self.checkpoints.save(epoch, &self.snapshot()?)?;
            self.diagnose(epoch, &dir)?;
        }
        Ok(report)
    }

    /// Persist the current state after a budget abort. Any failure is
    /// returned for the caller to report.
    pub fn final_checkpoint(&mut self) -> Result<PathBuf> {
        let last = self.epoch.saturating_sub(1);
        let dir = self.checkpoints.save(last, &self.snapshot()?)?;
        self.diagnose(last, &dir)?;
        Ok(dir)
    }

    pub fn snapshot(&self) -> Result<TrainerSnapshot> {
        let episodes = self
            .episodes
            .iter()
            .map(|episode| {
                Ok(EpisodeSnapshot {
                    context: episode.context,
                    env: episode.env.as_ref().map(|env| env.save_state()).transpose()?,
                    state: episode.state.clone(),
                    goal: episode.goal.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TrainerSnapshot {
            version: SNAPSHOT_VERSION,
            created_at: Utc::now(),
            seed: self.seed,
            epoch: self.epoch,
            rng: self.rng.clone(),
            logs: self.logs.clone(),
            model: self.model.snapshot()?,
            episodes,
            reset_goal: self.reset_goal.clone(),
            max_match: self.tracker.max_match().clone(),
            config: self.config.clone(),
        })
    }

    fn checkpoint_due(&self, epoch: usize) -> bool {
        (epoch > 0 && epoch % self.config.checkpoint_interval == 0) || epoch + 1 == self.config.epochs
    }

    fn run_epoch(&mut self) -> Result<EpochReport> {
        let epoch = self.epoch;
        let competence = mean_competence(&self.model);
        let hyper = schedule(competence, &self.config.schedule_bounds());
        self.model.set_hyper_params(&hyper);

        let reset = self.prepare_episodes()?;
        spread_window(&mut self.workspace, &mut self.model, 0, 1)?;

        let resampled = sample_goals(
            &mut self.model,
            &self.workspace,
            &mut self.episodes,
            &self.reset_goal,
            &mut self.rng,
        )?;
        let mut fresh = vec![false; self.episodes.len()];
        for &e in &resampled {
            fresh[e] = true;
        }
        self.tracker.begin_run(&fresh, self.config.match_max_reset);

        for episode in &self.episodes {
            if let Some(goal) = &episode.goal {
                self.workspace.fill_goal(episode.index, goal);
            }
        }

        let summary = self.runner.run(
            &mut self.workspace,
            &mut self.episodes,
            &mut self.tracker,
            &self.agent,
            &mut self.model,
            &hyper,
        )?;
        self.reset_goal = (0..self.episodes.len()).map(|e| self.tracker.reached_stop(e)).collect();

        let update = self.update_model(&summary.matches)?;

        let rcompetence = &self.workspace.rcompetence;
        let log_row = [
            rcompetence.iter().copied().fold(f64::INFINITY, f64::min),
            rcompetence.mean().unwrap_or(0.0),
            rcompetence.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        ];
        if epoch < self.logs.nrows() {
            self.logs.row_mut(epoch).assign(&Array1::from_vec(log_row.to_vec()));
        }

        let per_context = self.updates_per_context(&update);
        let touch: f64 = self.workspace.inputs[Modality::Touch.index()].sum();
        tracing::info!(
            epoch,
            competence,
            internal_sigma = hyper.internal_sigma,
            lr = hyper.learning_rate,
            updates = update.update_items,
            updates.f = per_context[0],
            updates.m = per_context[1],
            updates.c = per_context[2],
            touch,
            comp.min = log_row[0],
            comp.mean = log_row[1],
            comp.max = log_row[2],
            loss = update.mean_loss(),
            "Epoch complete"
        );

        Ok(EpochReport {
            epoch,
            competence,
            hyper,
            reset,
            resampled,
            update,
            cum_match: self.tracker.cum_match().clone(),
            episode_len: summary.episode_len,
            log_row,
            recompute_steps: summary.recompute_steps,
        })
    }

    /// Rebuild environments on the periodic schedule or after termination,
    /// then write every episode's current sensors at t = 0
    fn prepare_episodes(&mut self) -> Result<Vec<usize>> {
        let epoch = self.epoch;
        let periodic = epoch % self.config.env_reset_freq == 0;
        let mut reset = Vec::new();

        for episode in self.episodes.iter_mut() {
            let e = episode.index;
            if periodic || episode.is_terminated() {
                if let Some(env) = episode.env.as_mut() {
                    env.close();
                }
                let seed = episode_seed(self.seed, e, epoch);
                let mut env = self
                    .factory
                    .create(seed)
                    .with_context(|| format!("Failed to create environment for episode {}", e))?;
                let state = env
                    .reset(episode.context, None)
                    .with_context(|| format!("Failed to reset episode {}", e))?;

                tracing::debug!(episode = e, context = episode.context, seed, "Reset episode");
                episode.env = Some(env);
                episode.state = Some(state);
                self.reset_goal[e] = true;
                reset.push(e);
            }

            if let Some(state) = &episode.state {
                self.workspace.write_sensors(e, 0, state);
            }
        }
        Ok(reset)
    }

    fn update_model(&mut self, matches: &Array2<bool>) -> Result<UpdateReport> {
        let inputs = self.workspace.flat_inputs()?;
        let match_flags: Array1<bool> = matches.iter().copied().collect();
        let match_value: Array1<f64> = self.workspace.match_value.iter().copied().collect();
        let competences: Array1<f64> = self.workspace.competence.iter().copied().collect();
        let cum_match = self.tracker.cum_match().clone();

        let batch = UpdateBatch {
            inputs: std::array::from_fn(|i| inputs[i].view()),
            match_value: match_value.view(),
            match_flags: match_flags.view(),
            cum_match: cum_match.view(),
            competences: competences.view(),
        };
        let update = self.model.update(&batch).context("Model update failed")?;

        if update.update_mask.len() != match_flags.len() {
            bail!(
                "model returned an update mask of {} rows for {} rows",
                update.update_mask.len(),
                match_flags.len()
            );
        }
        Ok(update)
    }

    /// Episodes with at least one updated row, grouped by scene context
    fn updates_per_context(&self, update: &UpdateReport) -> [usize; SCENE_CONTEXTS as usize] {
        let horizon = self.config.horizon;
        let mut counts = [0; SCENE_CONTEXTS as usize];
        for episode in &self.episodes {
            let start = episode.index * horizon;
            let rows = update.update_mask.slice(s![start..start + horizon]);
            if rows.iter().any(|&m| m) && (1..=SCENE_CONTEXTS).contains(&episode.context) {
                counts[(episode.context - 1) as usize] += 1;
            }
        }
        counts
    }

    /// Model save, logs and the optional diagnostics for a checkpoint
    fn diagnose(&mut self, epoch: usize, dir: &Path) -> Result<()> {
        let site = self.config.site_dir.clone();
        fs::create_dir_all(&site).with_context(|| format!("Failed to create site directory: {:?}", site))?;

        self.model.save(epoch, dir)?;
        diagnostics::write_logs(&self.logs, epoch, &[dir, site.as_path()])?;

        if self.config.plots {
            diagnostics::write_json(&site.join("comp_map.json"), &self.model.competence_grid())?;
        }

        let hyper = schedule(mean_competence(&self.model), &self.config.schedule_bounds());
        if self.config.plot_sims {
            let rendered = diagnostics::demo_episodes(
                &mut self.model,
                &self.factory,
                &self.agent,
                &self.config,
                &hyper,
                self.seed,
                epoch,
            )?;
            tracing::info!(epoch, rendered, "Rendered demo episodes");
        }
        if self.config.compute_trajectories {
            let trajectories =
                diagnostics::compute_trajectories(&self.model, &self.factory, &self.agent, &self.config, self.seed)?;
            diagnostics::write_json(&site.join("trajectories.json"), &trajectories)?;
        }
        Ok(())
    }
}

fn mean_competence<M: RepresentationModel + ?Sized>(model: &M) -> f64 {
    model.competence_grid().mean().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PrototypeModel;
    use crate::sim::{PlanarArmAgent, PlanarArmFactory};
    use tempfile::TempDir;

    fn small_config(root: &Path) -> Config {
        Config {
            batch_size: 3,
            horizon: 12,
            action_period: 4,
            epochs: 4,
            env_reset_freq: 2,
            checkpoint_interval: 2,
            visual_size: 16,
            touch_size: 2,
            proprio_size: 3,
            policy_size: 5,
            internal_size: 9,
            settle_steps: 2,
            storage_dir: root.join("storage"),
            site_dir: root.join("www"),
            ..Config::default()
        }
    }

    fn trainer(config: Config) -> Trainer<PrototypeModel, PlanarArmFactory, PlanarArmAgent> {
        let model = PrototypeModel::new(&config);
        let factory = PlanarArmFactory::new(&config).unwrap();
        let agent = PlanarArmAgent::new(&config);
        Trainer::new(config, model, factory, agent).unwrap()
    }

    #[test]
    fn test_first_epoch_resets_and_samples_everything() {
        let temp_dir = TempDir::new().unwrap();
        let mut trainer = trainer(small_config(temp_dir.path()));

        let report = trainer.step_epoch().unwrap();
        assert_eq!(report.reset, vec![0, 1, 2]);
        assert_eq!(report.resampled, vec![0, 1, 2]);
        assert_eq!(report.recompute_steps, vec![4, 8, 12]);
        assert_eq!(trainer.epoch(), 1);
        assert!(trainer.episodes().iter().all(|e| e.goal.is_some()));
    }

    #[test]
    fn test_checkpoints_land_on_interval_and_final_epoch() {
        let temp_dir = TempDir::new().unwrap();
        let mut trainer = trainer(small_config(temp_dir.path()));

        let outcome = trainer.train(None).unwrap();
        assert_eq!(outcome, TrainOutcome::Completed { epochs: 4 });
        assert_eq!(trainer.checkpoints().list_epochs().unwrap(), vec![3, 2]);

        let dir = trainer.checkpoints().epoch_dir(2);
        for file in ["trainer.json", "data.json", "log.json", "model.json"] {
            assert!(dir.join(file).is_file(), "missing {}", file);
        }
        assert!(temp_dir.path().join("www").join("log.json").is_file());
    }

    #[test]
    fn test_logs_hold_competence_bounds() {
        let temp_dir = TempDir::new().unwrap();
        let mut trainer = trainer(small_config(temp_dir.path()));
        let report = trainer.step_epoch().unwrap();

        let row = trainer.logs().row(0).to_vec();
        assert_eq!(row, report.log_row.to_vec());
        assert!(row[0] <= row[1] && row[1] <= row[2]);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            horizon: 0,
            ..small_config(temp_dir.path())
        };
        let model = PrototypeModel::new(&Config {
            horizon: 1,
            ..config.clone()
        });
        let factory = PlanarArmFactory::new(&config).unwrap();
        let agent = PlanarArmAgent::new(&config);
        assert!(Trainer::new(config, model, factory, agent).is_err());
    }
}
