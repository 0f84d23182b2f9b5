// Episode batch runner - lock-step stepping, windowed representation
// recomputation and match-event accounting

use anyhow::{bail, Context, Result};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};

use super::matching::{compute_match, positive_increment, MatchTracker};
use super::scheduler::HyperParams;
use super::workspace::BatchWorkspace;
use super::Episode;
use crate::config::{Config, TaskSpace};
use crate::model::{Modality, RepresentationModel, Spread};
use crate::sim::{Agent, Environment};

/// Outcome of one batch run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Match-event flags, `[episode, time]`
    pub matches: Array2<bool>,
    /// Last step each episode took
    pub episode_len: Array1<usize>,
    /// Steps at which the representation model was called
    pub recompute_steps: Vec<usize>,
}

/// Advances a batch of episodes over one horizon.
///
/// The runner owns no buffers: everything it produces is written into the
/// caller's `BatchWorkspace` and `MatchTracker`.
#[derive(Debug, Clone)]
pub struct EpisodeBatchRunner {
    horizon: usize,
    action_period: usize,
    settle_steps: usize,
    task_space: TaskSpace,
}

impl EpisodeBatchRunner {
    pub fn new(config: &Config) -> Self {
        Self {
            horizon: config.horizon,
            action_period: config.action_period.max(1),
            settle_steps: config.settle_steps,
            task_space: config.task_space,
        }
    }

    /// Run every episode for `t = 1..=horizon`.
    ///
    /// Time index 0 of the workspace must already hold each episode's
    /// initial sensors and its goal/policy rows must be filled.
    pub fn run<E, A, M>(
        &self,
        ws: &mut BatchWorkspace,
        episodes: &mut [Episode<E>],
        tracker: &mut MatchTracker,
        agent: &A,
        model: &mut M,
        hyper: &HyperParams,
    ) -> Result<RunSummary>
    where
        E: Environment,
        A: Agent + ?Sized,
        M: RepresentationModel + ?Sized,
    {
        let b = episodes.len();
        if b != ws.batch_size {
            bail!("batch of {} episodes does not fit a workspace of {}", b, ws.batch_size);
        }
        let (horizon, period) = (self.horizon, self.action_period);

        let mut matches = Array2::from_elem((b, horizon), false);
        let mut episode_len = Array1::zeros(b);
        let mut written_until = vec![0usize; b];
        let mut held: Vec<Option<Array1<f64>>> = vec![None; b];
        let mut counted_until = 0;
        let mut recompute_steps = Vec::new();

        for t in 1..=horizon {
            if t < horizon {
                for (e, episode) in episodes.iter_mut().enumerate() {
                    if tracker.reached_stop(e) {
                        continue;
                    }
                    let Some(state) = episode.state.as_ref() else {
                        continue;
                    };
                    episode_len[e] = t;

                    if (t - 1) % period == 0 || held[e].is_none() {
                        let policy = ws.inputs[Modality::Action.index()].slice(s![e, 0, ..]);
                        held[e] = Some(agent.act(policy, state, t - 1));
                    }
                    let (Some(env), Some(action)) = (episode.env.as_mut(), held[e].as_ref()) else {
                        bail!("episode {} has no environment", episode.index);
                    };

                    let next = env
                        .step(action.view())
                        .with_context(|| format!("Failed to step episode {}", episode.index))?;
                    if self.task_space.contains(next.object_position) {
                        ws.write_sensors(e, t, &next);
                        written_until[e] = t;
                        episode.state = Some(next);
                    } else {
                        tracing::debug!(
                            episode = episode.index,
                            context = episode.context,
                            step = t,
                            x = next.object_position[0],
                            y = next.object_position[1],
                            "Object left the task space, terminating episode"
                        );
                        episode.state = None;
                    }
                }
            }

            if t % period != 0 && t != horizon {
                continue;
            }

            let t0 = t.saturating_sub(period);
            self.recompute(ws, model, hyper, t0, t)?;
            recompute_steps.push(t);

            // The first action window and windows starting within the settle
            // period never count
            if t > period {
                let increment = positive_increment(
                    ws.match_value_per_mod.slice(s![.., t0..t, ..]),
                    ws.match_value_per_mod.slice(s![.., t0 - 1..t - 1, ..]),
                );
                if let Some(mean) = increment.mean_axis(Axis(2)) {
                    ws.match_increment.slice_mut(s![.., t0..t]).assign(&mean);
                }
                ws.match_increment_per_mod.slice_mut(s![.., t0..t, ..]).assign(&increment);

                if t0 > self.settle_steps {
                    for i in t0.max(counted_until)..t {
                        for e in 0..b {
                            if i <= written_until[e] {
                                matches[[e, i]] = tracker.observe(e, ws.match_value[[e, i]]);
                            }
                        }
                    }
                }
            }
            counted_until = t;
        }

        Ok(RunSummary {
            matches,
            episode_len,
            recompute_steps,
        })
    }

    fn recompute<M>(&self, ws: &mut BatchWorkspace, model: &mut M, hyper: &HyperParams, t0: usize, t: usize) -> Result<()>
    where
        M: RepresentationModel + ?Sized,
    {
        let spread = spread_window(ws, model, t0, t)?;
        let (value, per_mod) = compute_match(&spread.projections, hyper.match_sigma);
        let block = Array2::from_shape_vec((ws.batch_size, t - t0), value.to_vec())
            .context("Match values do not match the window shape")?;
        ws.match_value.slice_mut(s![.., t0..t]).assign(&block);
        BatchWorkspace::store_window(&mut ws.match_value_per_mod, t0, t, per_mod.view())?;
        Ok(())
    }
}

/// One batched model call over the window `[t0, t)` of every episode.
/// Representations and projections are stored back into `ws`.
pub fn spread_window<M>(ws: &mut BatchWorkspace, model: &mut M, t0: usize, t: usize) -> Result<Spread>
where
    M: RepresentationModel + ?Sized,
{
    let windows = Modality::ALL
        .iter()
        .map(|&m| ws.window(m, t0, t))
        .collect::<Result<Vec<_>>>()?;
    let views: [ArrayView2<'_, f64>; 5] = std::array::from_fn(|i| windows[i].view());
    let spread = model
        .spread(views)
        .with_context(|| format!("Representation model failed on window {}..{}", t0, t))?;

    for m in Modality::ALL {
        let i = m.index();
        BatchWorkspace::store_window(&mut ws.representations[i], t0, t, spread.representations[i].view())?;
        BatchWorkspace::store_window(&mut ws.projections[i], t0, t, spread.projections[i].view())?;
    }
    Ok(spread)
}
