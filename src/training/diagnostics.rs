// Checkpoint diagnostics - data dumps, logs, demo episodes and trajectories

use anyhow::{Context, Result};
use ndarray::{s, Array2, Array3, ArrayView1};
use rand::SeedableRng;
use serde::Serialize;
use std::fs;
use std::path::Path;

use super::matching::MatchTracker;
use super::runner::{spread_window, EpisodeBatchRunner};
use super::sampler::sample_goals;
use super::scheduler::HyperParams;
use super::workspace::BatchWorkspace;
use super::{Episode, TrainRng};
use crate::config::{Config, MatchMaxReset};
use crate::model::{Modality, RepresentationModel};
use crate::sim::{context_for_episode, episode_seed, Agent, Environment, EnvironmentFactory, RenderOptions, EMPTY_CONTEXT};

/// Keeps diagnostic seeds apart from the training seeds
const DIAGNOSTIC_SALT: u64 = 0xd1a9_0571_c5ee_d000;
/// Demo attempts allowed per requested episode
const DEMO_ATTEMPTS: usize = 5;

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    let json = serde_json::to_vec(value).with_context(|| format!("Failed to serialize {:?}", path))?;
    fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))
}

/// Representation and match histories of the epoch just run
pub fn write_history(ws: &BatchWorkspace, dir: &Path) -> Result<()> {
    write_json(&dir.join("data.json"), ws)
}

/// Log rows `0..=epoch` written as `log.json` into each of `dirs`
pub fn write_logs(logs: &Array2<f64>, epoch: usize, dirs: &[&Path]) -> Result<()> {
    let rows = (epoch + 1).min(logs.nrows());
    let head = logs.slice(s![..rows, ..]);
    for dir in dirs {
        write_json(&dir.join("log.json"), &head)?;
    }
    Ok(())
}

/// Render single-episode runs until `config.demo_episodes` runs with
/// distinct initial visual prototypes are collected.
///
/// Each demo keeps one environment for up to `env_reset_freq` consecutive
/// runs, mirroring the training schedule. Draws noise from its own RNG so
/// training is unaffected. Returns the number of rendered episodes.
pub fn demo_episodes<M, F, A>(
    model: &mut M,
    factory: &F,
    agent: &A,
    config: &Config,
    hyper: &HyperParams,
    seed: u64,
    epoch: usize,
) -> Result<usize>
where
    M: RepresentationModel + ?Sized,
    F: EnvironmentFactory,
    A: Agent + ?Sized,
{
    fs::create_dir_all(&config.site_dir)
        .with_context(|| format!("Failed to create site directory: {:?}", config.site_dir))?;
    let mut rng = TrainRng::seed_from_u64(episode_seed(seed ^ DIAGNOSTIC_SALT, 0, epoch));
    let runner = EpisodeBatchRunner::new(config);
    let mut ws = BatchWorkspace::with_batch_size(config, 1);
    let mut tracker = MatchTracker::new(1, config.cum_match_stop, config.match_event_margin);

    let mut seen = Vec::new();
    let mut attempt = 0;
    while seen.len() < config.demo_episodes && attempt < config.demo_episodes * DEMO_ATTEMPTS {
        attempt += 1;
        let k = seen.len();
        let context = context_for_episode(k);
        let render = RenderOptions {
            output: config.site_dir.join(format!("episode{}", k)),
        };

        let mut env = factory.create(episode_seed(seed ^ DIAGNOSTIC_SALT, attempt, epoch))?;
        let state = env.reset(context, Some(&render))?;
        let mut episodes = vec![Episode {
            index: 0,
            context,
            env: Some(env),
            state: Some(state),
            goal: None,
        }];

        let mut values = Vec::new();
        let mut flags = Vec::new();
        let mut prototype = None;
        for run in 0..config.env_reset_freq {
            let Some(state) = episodes[0].state.clone() else {
                break;
            };
            ws.clear();
            ws.write_sensors(0, 0, &state);
            spread_window(&mut ws, model, 0, 1)?;
            if prototype.is_none() {
                prototype = Some(winning_unit(ws.representations[Modality::Visual.index()].slice(s![0, 0, ..])));
            }

            // The goal set on the first run is chased until it is reached
            let resample = [run == 0 || tracker.reached_stop(0)];
            sample_goals(model, &ws, &mut episodes, &resample, &mut rng)?;
            if let Some(goal) = &episodes[0].goal {
                ws.fill_goal(0, goal);
            }
            tracker.begin_run(&resample, MatchMaxReset::EveryRun);
            let summary = runner.run(&mut ws, &mut episodes, &mut tracker, agent, model, hyper)?;

            values.extend(ws.match_value.row(0).iter().copied());
            flags.extend(summary.matches.row(0).iter().copied());
        }

        let Some(mut env) = episodes.pop().and_then(|episode| episode.env) else {
            continue;
        };
        match prototype {
            Some(unit) if !seen.contains(&unit) => {
                env.render_info(&values, &flags)?;
                seen.push(unit);
            }
            _ => tracing::debug!(attempt, "Demo episode repeats a seen prototype, skipping"),
        }
        env.close();
    }

    if seen.len() < config.demo_episodes {
        tracing::warn!(
            rendered = seen.len(),
            requested = config.demo_episodes,
            "Ran out of attempts collecting distinct demo episodes"
        );
    }
    Ok(seen.len())
}

/// Noise-free rollouts in the empty scene, one per goal of the model's goal
/// grid. Returns the last two joint angles per step as
/// `[goals, horizon, 2]`.
pub fn compute_trajectories<M, F, A>(model: &M, factory: &F, agent: &A, config: &Config, seed: u64) -> Result<Array3<f64>>
where
    M: RepresentationModel + ?Sized,
    F: EnvironmentFactory,
    A: Agent + ?Sized,
{
    let goals = model.goal_grid();
    let policies = model.policies(goals.view())?;
    let period = config.action_period.max(1);
    let mut trajectories = Array3::zeros((goals.nrows(), config.horizon, 2));

    for (g, policy) in policies.outer_iter().enumerate() {
        let mut env = factory.create(episode_seed(seed ^ DIAGNOSTIC_SALT, g, 0))?;
        let mut state = env.reset(EMPTY_CONTEXT, None)?;
        let mut action = None;

        for t in 0..config.horizon {
            let joints = &state.joints;
            let n = joints.len();
            if n >= 2 {
                trajectories[[g, t, 0]] = joints[n - 2];
                trajectories[[g, t, 1]] = joints[n - 1];
            }
            if t + 1 == config.horizon {
                break;
            }
            if t % period == 0 || action.is_none() {
                action = Some(agent.act(policy, &state, t));
            }
            if let Some(action) = &action {
                state = env.step(action.view())?;
            }
        }
        env.close();
    }

    tracing::debug!(goals = goals.nrows(), "Computed goal trajectories");
    Ok(trajectories)
}

fn winning_unit(row: ArrayView1<'_, f64>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}
