// Integration tests for the curriculum trainer
//
// Scripted collaborators make the batch runner and training loop exactly
// predictable:
// 1. Representation recomputation schedule
// 2. Task-space termination and saturating match counters
// 3. Goal resampling without an environment reset
// 4. Time budget, final checkpoint and resume
// 5. Bit-identical continuation from a checkpoint

use anyhow::Result;
use kickstart::config::Config;
use kickstart::model::{
    Modality, PrototypeModel, RepresentationModel, Sampled, Spread, UpdateBatch, UpdateReport,
};
use kickstart::sim::{
    context_for_episode, Agent, Environment, EnvironmentFactory, PlanarArmAgent, PlanarArmFactory,
    RenderOptions, SensorState,
};
use kickstart::training::{
    BatchWorkspace, Episode, EpisodeBatchRunner, EpisodeGoal, HyperParams, MatchTracker, RunSummary,
    TrainOutcome, TrainRng, Trainer,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;

/// Contexts 1 and 3 report their step count as the first visual sensor;
/// context 3 also pushes the object one unit right per step.
struct ScriptEnv {
    context: u8,
    steps: usize,
}

impl ScriptEnv {
    fn sensors(&self) -> SensorState {
        let v0 = if self.context == 2 { 0.0 } else { self.steps as f64 };
        let x = if self.context == 3 { self.steps as f64 } else { 0.0 };
        SensorState {
            visual: Array1::from_vec(vec![v0, 1.0]),
            touch: Array1::zeros(1),
            joints: Array1::zeros(1),
            object_position: [x, 0.0],
        }
    }
}

impl Environment for ScriptEnv {
    fn reset(&mut self, context: u8, _render: Option<&RenderOptions>) -> Result<SensorState> {
        self.context = context;
        self.steps = 0;
        Ok(self.sensors())
    }

    fn step(&mut self, _action: ArrayView1<'_, f64>) -> Result<SensorState> {
        self.steps += 1;
        Ok(self.sensors())
    }

    fn save_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!([self.context, self.steps]))
    }

    fn load_state(&mut self, state: serde_json::Value) -> Result<()> {
        let (context, steps): (u8, usize) = serde_json::from_value(state)?;
        self.context = context;
        self.steps = steps;
        Ok(())
    }
}

struct ScriptFactory;

impl EnvironmentFactory for ScriptFactory {
    type Env = ScriptEnv;

    fn create(&self, _seed: u64) -> Result<ScriptEnv> {
        Ok(ScriptEnv { context: 0, steps: 0 })
    }
}

struct IdleAgent;

impl Agent for IdleAgent {
    fn act(&self, _policy: ArrayView1<'_, f64>, _state: &SensorState, _t: usize) -> Array1<f64> {
        Array1::zeros(1)
    }
}

#[derive(Debug, Default)]
struct Calls {
    spread_rows: Vec<usize>,
    sampled: Vec<usize>,
}

/// Sensorimotor projections approach the goal as the first visual sensor
/// grows, so match rises while an episode's step count rises.
struct ScriptModel {
    internal: usize,
    policy: usize,
    calls: Rc<RefCell<Calls>>,
}

impl ScriptModel {
    fn new(config: &Config) -> (Self, Rc<RefCell<Calls>>) {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let model = Self {
            internal: config.internal_size,
            policy: config.policy_size,
            calls: Rc::clone(&calls),
        };
        (model, calls)
    }
}

impl RepresentationModel for ScriptModel {
    fn spread(&mut self, inputs: [ArrayView2<'_, f64>; 5]) -> Result<Spread> {
        let visual = inputs[Modality::Visual.index()];
        let rows = visual.nrows();
        self.calls.borrow_mut().spread_rows.push(rows);

        let projections = std::array::from_fn(|i| {
            let mut p = Array2::zeros((rows, 2));
            if i < Modality::Action.index() {
                for r in 0..rows {
                    p[[r, 0]] = 10.0 / (1.0 + visual[[r, 0]]);
                }
            }
            p
        });
        Ok(Spread {
            representations: std::array::from_fn(|_| Array2::zeros((rows, self.internal))),
            projections,
        })
    }

    fn update(&mut self, batch: &UpdateBatch<'_>) -> Result<UpdateReport> {
        let rows = batch.match_value.len();
        Ok(UpdateReport {
            update_items: 0,
            update_mask: Array1::from_elem(rows, false),
            loss: [0.0; 4],
            mean_modulation: 0.0,
        })
    }

    fn sample_with_noise(&mut self, goals: ArrayView2<'_, f64>, _rng: &mut TrainRng) -> Result<Sampled> {
        let n = goals.nrows();
        self.calls.borrow_mut().sampled.push(n);
        Ok(Sampled {
            policies: Array2::zeros((n, self.policy)),
            competences: Array1::zeros(n),
            rcompetences: Array1::from_shape_fn(n, |i| 0.25 * (i + 1) as f64),
        })
    }

    fn policies(&self, goals: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        Ok(Array2::zeros((goals.nrows(), self.policy)))
    }

    fn competence_grid(&self) -> Array1<f64> {
        Array1::zeros(1)
    }

    fn goal_grid(&self) -> Array2<f64> {
        Array2::zeros((1, self.internal))
    }

    fn set_hyper_params(&mut self, _params: &HyperParams) {}

    fn save(&self, _epoch: usize, _dir: &Path) -> Result<()> {
        Ok(())
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn restore(&mut self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

fn script_config(root: &Path) -> Config {
    let mut config = Config {
        batch_size: 3,
        horizon: 20,
        action_period: 5,
        epochs: 5,
        env_reset_freq: 1000,
        checkpoint_interval: 100,
        visual_size: 2,
        touch_size: 1,
        proprio_size: 1,
        policy_size: 1,
        internal_size: 2,
        cum_match_stop: 100,
        match_event_margin: 0.001,
        settle_steps: 0,
        storage_dir: root.join("storage"),
        site_dir: root.join("www"),
        ..Config::default()
    };
    config.task_space.xlim = [-1.0, 6.5];
    config
}

fn hyper(config: &Config) -> HyperParams {
    kickstart::training::schedule(0.0, &config.schedule_bounds())
}

/// Reset every episode and fill a zero goal, the way an epoch starts
fn prepared_batch(config: &Config, ws: &mut BatchWorkspace) -> Result<Vec<Episode<ScriptEnv>>> {
    let mut episodes = Vec::new();
    for e in 0..config.batch_size {
        let context = context_for_episode(e);
        let mut env = ScriptFactory.create(0)?;
        let state = env.reset(context, None)?;
        ws.write_sensors(e, 0, &state);
        ws.fill_goal(
            e,
            &EpisodeGoal {
                goal: Array1::zeros(config.internal_size),
                policy: Array1::zeros(config.policy_size),
                competence: 0.0,
                rcompetence: 0.0,
            },
        );
        episodes.push(Episode {
            index: e,
            context,
            env: Some(env),
            state: Some(state),
            goal: None,
        });
    }
    Ok(episodes)
}

#[test]
fn test_recompute_happens_only_at_window_ends() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = script_config(temp_dir.path());
    let (mut model, calls) = ScriptModel::new(&config);
    let mut ws = BatchWorkspace::new(&config);
    let mut episodes = prepared_batch(&config, &mut ws)?;
    let mut tracker = MatchTracker::from_config(&config);

    let summary = EpisodeBatchRunner::new(&config).run(
        &mut ws,
        &mut episodes,
        &mut tracker,
        &IdleAgent,
        &mut model,
        &hyper(&config),
    )?;

    assert_eq!(summary.recompute_steps, vec![5, 10, 15, 20]);
    // One call per window, each covering 3 episodes x 5 steps
    assert_eq!(calls.borrow().spread_rows, vec![15, 15, 15, 15]);
    Ok(())
}

#[test]
fn test_leaving_task_space_freezes_episode() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = script_config(temp_dir.path());
    let (mut model, _) = ScriptModel::new(&config);
    let mut ws = BatchWorkspace::new(&config);
    let mut episodes = prepared_batch(&config, &mut ws)?;
    let mut tracker = MatchTracker::from_config(&config);

    let summary = EpisodeBatchRunner::new(&config).run(
        &mut ws,
        &mut episodes,
        &mut tracker,
        &IdleAgent,
        &mut model,
        &hyper(&config),
    )?;

    // Episode 2 runs context 3, whose object crosses x = 6.5 at step 7
    assert_eq!(summary.episode_len[2], 7);
    assert!(episodes[2].is_terminated());
    let visual = &ws.inputs[Modality::Visual.index()];
    for t in 0..7 {
        assert_eq!(visual[[2, t, 0]], t as f64);
    }
    for t in 7..20 {
        assert_eq!(visual[[2, t, 1]], 0.0, "write after termination at step {}", t);
        assert!(!summary.matches[[2, t]]);
    }

    // The others stay inside and run to the last stepped index
    assert_eq!(summary.episode_len[0], 19);
    assert_eq!(summary.episode_len[1], 19);
    Ok(())
}

#[test]
fn test_cumulative_match_saturates_and_stops_episode() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = Config {
        cum_match_stop: 3,
        ..script_config(temp_dir.path())
    };
    let (mut model, _) = ScriptModel::new(&config);
    let mut ws = BatchWorkspace::new(&config);
    let mut episodes = prepared_batch(&config, &mut ws)?;
    let mut tracker = MatchTracker::from_config(&config);

    let summary = EpisodeBatchRunner::new(&config).run(
        &mut ws,
        &mut episodes,
        &mut tracker,
        &IdleAgent,
        &mut model,
        &hyper(&config),
    )?;

    assert!(tracker.cum_match().iter().all(|&c| c <= 3));
    // Rising match: counting starts with the second window, the stop is
    // reached there and the episode does not step past it
    assert_eq!(tracker.cum_match()[0], 3);
    assert!(tracker.reached_stop(0));
    assert_eq!(summary.episode_len[0], 10);

    // Constant match registers once against the zero maximum
    assert_eq!(tracker.cum_match()[1], 1);
    assert_eq!(summary.episode_len[1], 19);
    Ok(())
}

fn first_event(summary: &RunSummary, episode: usize) -> Option<usize> {
    summary.matches.row(episode).iter().position(|&m| m)
}

#[test]
fn test_counting_starts_after_first_window_and_settle_period() -> Result<()> {
    let temp_dir = TempDir::new()?;
    for (settle_steps, expected) in [(0, 5), (5, 10)] {
        let config = Config {
            settle_steps,
            ..script_config(temp_dir.path())
        };
        let (mut model, _) = ScriptModel::new(&config);
        let mut ws = BatchWorkspace::new(&config);
        let mut episodes = prepared_batch(&config, &mut ws)?;
        let mut tracker = MatchTracker::from_config(&config);

        let summary = EpisodeBatchRunner::new(&config).run(
            &mut ws,
            &mut episodes,
            &mut tracker,
            &IdleAgent,
            &mut model,
            &hyper(&config),
        )?;

        // Episode 2 leaves the task space at step 7
        for e in 0..2 {
            assert_eq!(first_event(&summary, e), Some(expected), "settle {} episode {}", settle_steps, e);
        }
    }
    Ok(())
}

#[test]
fn test_stopped_episode_is_resampled_without_reset() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut config = Config {
        cum_match_stop: 3,
        ..script_config(temp_dir.path())
    };
    // Keep the context 3 object inside so no episode terminates
    config.task_space.xlim = [-1.0, 100.0];
    let (model, calls) = ScriptModel::new(&config);
    let mut trainer = Trainer::new(config, model, ScriptFactory, IdleAgent)?;

    let first = trainer.step_epoch()?;
    assert_eq!(first.reset, vec![0, 1, 2]);
    assert_eq!(first.resampled, vec![0, 1, 2]);
    assert_eq!(first.cum_match.to_vec(), vec![3, 1, 3]);

    let second = trainer.step_epoch()?;
    assert!(second.reset.is_empty());
    assert_eq!(second.resampled, vec![0, 2]);
    assert_eq!(calls.borrow().sampled, vec![3, 2]);
    Ok(())
}

#[test]
fn test_budget_abort_checkpoints_and_resumes() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = script_config(temp_dir.path());

    let (model, _) = ScriptModel::new(&config);
    let mut trainer = Trainer::new(config.clone(), model, ScriptFactory, IdleAgent)?;
    let outcome = trainer.train(Some(Duration::ZERO))?;
    assert_eq!(outcome, TrainOutcome::BudgetExceeded { epoch: 1 });

    let dir = trainer.final_checkpoint()?;
    assert!(dir.join("trainer.json").is_file());
    assert!(temp_dir.path().join("www").join("log.json").is_file());

    let (model, _) = ScriptModel::new(&config);
    let mut resumed = Trainer::launch(config, model, ScriptFactory, IdleAgent)?;
    assert_eq!(resumed.epoch(), 1);

    // A new invocation always gets its first epoch
    let outcome = resumed.train(Some(Duration::ZERO))?;
    assert_eq!(outcome, TrainOutcome::BudgetExceeded { epoch: 2 });
    Ok(())
}

#[test]
fn test_completed_run_reports_all_epochs() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = Config {
        epochs: 2,
        ..script_config(temp_dir.path())
    };
    let (model, _) = ScriptModel::new(&config);
    let mut trainer = Trainer::new(config, model, ScriptFactory, IdleAgent)?;

    assert_eq!(trainer.train(None)?, TrainOutcome::Completed { epochs: 2 });
    assert_eq!(trainer.train(Some(Duration::ZERO))?, TrainOutcome::Completed { epochs: 2 });
    assert_eq!(trainer.checkpoints().list_epochs()?, vec![1]);
    Ok(())
}

#[test]
fn test_resume_grows_log_array() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = Config {
        epochs: 100,
        ..script_config(temp_dir.path())
    };

    let (model, _) = ScriptModel::new(&config);
    let mut trainer = Trainer::new(config.clone(), model, ScriptFactory, IdleAgent)?;
    trainer.step_epoch()?;
    trainer.final_checkpoint()?;
    assert_eq!(trainer.logs().row(0).to_vec(), vec![0.25, 0.5, 0.75]);

    let grown = Config { epochs: 200, ..config };
    let (model, _) = ScriptModel::new(&grown);
    let resumed = Trainer::launch(grown, model, ScriptFactory, IdleAgent)?;

    assert_eq!(resumed.logs().dim(), (200, 3));
    assert_eq!(resumed.logs().row(0).to_vec(), vec![0.25, 0.5, 0.75]);
    assert!(resumed.logs().outer_iter().skip(1).all(|row| row.iter().all(|&v| v == 0.0)));
    Ok(())
}

fn planar_config(root: &Path) -> Config {
    Config {
        batch_size: 3,
        horizon: 12,
        action_period: 4,
        epochs: 4,
        env_reset_freq: 4,
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

fn planar_trainer(config: Config) -> Result<Trainer<PrototypeModel, PlanarArmFactory, PlanarArmAgent>> {
    let model = PrototypeModel::new(&config);
    let factory = PlanarArmFactory::new(&config)?;
    let agent = PlanarArmAgent::new(&config);
    Trainer::launch(config, model, factory, agent)
}

#[test]
fn test_resumed_training_is_bit_identical() -> Result<()> {
    let uninterrupted_dir = TempDir::new()?;
    let mut uninterrupted = planar_trainer(planar_config(uninterrupted_dir.path()))?;
    assert_eq!(uninterrupted.train(None)?, TrainOutcome::Completed { epochs: 4 });

    let resumed_dir = TempDir::new()?;
    {
        let mut first_session = planar_trainer(planar_config(resumed_dir.path()))?;
        for _ in 0..3 {
            first_session.step_epoch()?;
        }
        // Checkpoint after epoch 2 stores epoch 3 as the next one
    }
    let mut second_session = planar_trainer(planar_config(resumed_dir.path()))?;
    assert_eq!(second_session.epoch(), 3);
    assert_eq!(second_session.train(None)?, TrainOutcome::Completed { epochs: 4 });

    assert_eq!(uninterrupted.model(), second_session.model());
    assert_eq!(uninterrupted.logs(), second_session.logs());
    Ok(())
}
