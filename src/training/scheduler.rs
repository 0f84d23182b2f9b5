// Competence-driven parameter schedule

use serde::{Deserialize, Serialize};

/// Interpolation extremes: `base_*` applies at full competence, `target_*`
/// with no competence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleBounds {
    pub base_match_sigma: f64,
    pub target_match_sigma: f64,
    pub base_internal_sigma: f64,
    pub target_internal_sigma: f64,
    pub base_lr: f64,
    pub target_lr: f64,
    /// Exploration noise is not modulated
    pub explore_sigma: f64,
}

/// Settings handed to the model and the match computation for one epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    pub match_sigma: f64,
    pub internal_sigma: f64,
    pub learning_rate: f64,
    pub explore_sigma: f64,
}

/// `base + (target - base) * prop`, evaluated so that `prop == 0` and
/// `prop == 1` return the extremes exactly
pub fn modulate(base: f64, target: f64, prop: f64) -> f64 {
    target * prop + base * (1.0 - prop)
}

/// Map a competence estimate to this epoch's hyperparameters.
///
/// Competence is clamped to `[0, 1]`; a non-finite estimate counts as no
/// competence.
pub fn schedule(competence: f64, bounds: &ScheduleBounds) -> HyperParams {
    let c = if competence.is_finite() {
        competence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let prop = 1.0 - c;

    HyperParams {
        match_sigma: modulate(bounds.base_match_sigma, bounds.target_match_sigma, prop),
        internal_sigma: modulate(bounds.base_internal_sigma, bounds.target_internal_sigma, prop),
        learning_rate: modulate(bounds.base_lr, bounds.target_lr, prop),
        explore_sigma: bounds.explore_sigma,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> ScheduleBounds {
        ScheduleBounds {
            base_match_sigma: 0.1,
            target_match_sigma: 0.3,
            base_internal_sigma: 0.7,
            target_internal_sigma: 2.9,
            base_lr: 0.001,
            target_lr: 0.07,
            explore_sigma: 0.2,
        }
    }

    #[test]
    fn test_full_competence_gives_base_extreme() {
        let p = schedule(1.0, &bounds());
        assert_eq!(p.match_sigma, 0.1);
        assert_eq!(p.internal_sigma, 0.7);
        assert_eq!(p.learning_rate, 0.001);
        assert_eq!(p.explore_sigma, 0.2);
    }

    #[test]
    fn test_no_competence_gives_target_extreme() {
        let p = schedule(0.0, &bounds());
        assert_eq!(p.match_sigma, 0.3);
        assert_eq!(p.internal_sigma, 2.9);
        assert_eq!(p.learning_rate, 0.07);
    }

    #[test]
    fn test_schedule_is_linear_and_monotonic() {
        let b = bounds();
        let mut previous = schedule(0.0, &b);
        for i in 1..=10 {
            let c = i as f64 / 10.0;
            let p = schedule(c, &b);
            assert!(p.learning_rate <= previous.learning_rate);
            assert!(p.internal_sigma <= previous.internal_sigma);
            let expected = b.base_lr + (b.target_lr - b.base_lr) * (1.0 - c);
            assert!((p.learning_rate - expected).abs() < 1e-12);
            previous = p;
        }

        let mid = schedule(0.5, &b);
        let expected = (b.base_match_sigma + b.target_match_sigma) / 2.0;
        assert!((mid.match_sigma - expected).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_range_competence_is_clamped() {
        let b = bounds();
        assert_eq!(schedule(1.7, &b), schedule(1.0, &b));
        assert_eq!(schedule(-0.3, &b), schedule(0.0, &b));
        assert_eq!(schedule(f64::NAN, &b), schedule(0.0, &b));
    }
}
