// ELO rating calculation for 1v1 matches.

use serde::{Deserialize, Serialize};

pub const DEFAULT_RATING: i32 = 1000;
pub const DEFAULT_K_FACTOR: f64 = 32.0;

/// Match outcome from the A side's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    AWins,
    BWins,
    Draw,
}

impl Outcome {
    /// Actual scores (S_a, S_b) for the expected-vs-actual update.
    pub fn scores(self) -> (f64, f64) {
        match self {
            Outcome::AWins => (1.0, 0.0),
            Outcome::BWins => (0.0, 1.0),
            Outcome::Draw => (0.5, 0.5),
        }
    }

    /// Derive the outcome from a raw game score pair.
    /// Negative scores are rejected; equality is a draw.
    pub fn from_score(score_a: i32, score_b: i32) -> Result<Self, InvalidScore> {
        if score_a < 0 || score_b < 0 {
            return Err(InvalidScore);
        }
        Ok(match score_a.cmp(&score_b) {
            std::cmp::Ordering::Greater => Outcome::AWins,
            std::cmp::Ordering::Less => Outcome::BWins,
            std::cmp::Ordering::Equal => Outcome::Draw,
        })
    }
}

/// A game score pair failed validation (negative component).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidScore;

/// Expected score for A against B: 1 / (1 + 10^((R_b − R_a)/400)).
pub fn expected_score(rating_a: i32, rating_b: i32) -> f64 {
    1.0 / (1.0 + 10.0_f64.powf((rating_b - rating_a) as f64 / 400.0))
}

/// New ratings for both sides after a match.
///
/// R' = round(R + K·(S − E)) with half-to-even rounding, clamped at 0 on the
/// low end and uncapped above.
pub fn rate_pair(rating_a: i32, rating_b: i32, outcome: Outcome, k: f64) -> (i32, i32) {
    let expected_a = expected_score(rating_a, rating_b);
    let expected_b = 1.0 - expected_a;
    let (score_a, score_b) = outcome.scores();
    (
        apply(rating_a, k, score_a, expected_a),
        apply(rating_b, k, score_b, expected_b),
    )
}

fn apply(rating: i32, k: f64, score: f64, expected: f64) -> i32 {
    let updated = (rating as f64 + k * (score - expected)).round_ties_even() as i32;
    updated.max(0)
}
