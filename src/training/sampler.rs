// Goal/policy sampler
//
// Goals are self-generated: an episode's goal is its own initial visual
// representation, so previously achieved states become the next targets.

use anyhow::{bail, Result};
use ndarray::{s, Array2};

use super::workspace::BatchWorkspace;
use super::{Episode, EpisodeGoal, TrainRng};
use crate::model::{Modality, RepresentationModel};

/// Draw a fresh goal, noisy policy and competences for every episode that
/// needs one: those flagged in `mask` and those that have never held a goal.
///
/// Returns the indices of the resampled episodes. Episodes left out keep
/// their previous goal for the coming run.
pub fn sample_goals<E, M>(
    model: &mut M,
    ws: &BatchWorkspace,
    episodes: &mut [Episode<E>],
    mask: &[bool],
    rng: &mut TrainRng,
) -> Result<Vec<usize>>
where
    M: RepresentationModel + ?Sized,
{
    let selected: Vec<usize> = episodes
        .iter()
        .enumerate()
        .filter(|(e, episode)| mask.get(*e).copied().unwrap_or(false) || episode.goal.is_none())
        .map(|(e, _)| e)
        .collect();
    if selected.is_empty() {
        return Ok(selected);
    }

    let initial = &ws.representations[Modality::Visual.index()];
    let mut goals = Array2::zeros((selected.len(), initial.dim().2));
    for (row, &e) in selected.iter().enumerate() {
        goals.row_mut(row).assign(&initial.slice(s![e, 0, ..]));
    }

    let sampled = model.sample_with_noise(goals.view(), rng)?;
    if sampled.policies.nrows() != selected.len()
        || sampled.competences.len() != selected.len()
        || sampled.rcompetences.len() != selected.len()
    {
        bail!(
            "model sampled {} policies for {} goals",
            sampled.policies.nrows(),
            selected.len()
        );
    }

    for (row, &e) in selected.iter().enumerate() {
        episodes[e].goal = Some(EpisodeGoal {
            goal: goals.row(row).to_owned(),
            policy: sampled.policies.row(row).to_owned(),
            competence: sampled.competences[row],
            rcompetence: sampled.rcompetences[row],
        });
    }

    Ok(selected)
}
