// Pairwise compatibility scoring and the time-decaying acceptance threshold.

use crate::config::MatchmakingConfig;

/// Weights of the three subscores; must sum to 1.
const WEIGHT_SKILL: f64 = 0.5;
const WEIGHT_PREFS: f64 = 0.3;
const WEIGHT_WAIT: f64 = 0.2;

/// Affinity penalty per unit of distance on a preference axis.
const PREF_AXIS_SCALE: f64 = 2.0;

/// The ticket fields the scorer looks at.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub rating: i32,
    pub preferences: &'a [f64],
    pub area: &'a str,
}

/// Rating-point tolerance for the skill subscore, relaxed as the pair waits.
pub fn skill_tolerance(waited_secs: f64, cfg: &MatchmakingConfig) -> f64 {
    cfg.base_skill_tolerance + cfg.skill_relax_rate * waited_secs
}

/// Compatibility score in [0, 10] for a candidate pair, where 10 is ideal.
///
/// Returns `None` when the two tickets are in different areas: such a pair
/// is incompatible outright and must never reach the engine's ranking.
pub fn compat_score(
    a: &Snapshot,
    b: &Snapshot,
    wait_a_secs: f64,
    wait_b_secs: f64,
    cfg: &MatchmakingConfig,
) -> Option<f64> {
    if a.area != b.area {
        return None;
    }

    // Skill proximity, with tolerance growing on the pair's shorter wait.
    let tolerance = skill_tolerance(wait_a_secs.min(wait_b_secs), cfg);
    let rating_gap = (a.rating - b.rating).abs() as f64;
    let s_skill = (10.0 - rating_gap / tolerance).max(0.0);

    let s_prefs = preference_affinity(a.preferences, b.preferences);

    // Wait balance: favor pairing two similarly-patient players.
    let s_wait = 10.0 - ((wait_a_secs - wait_b_secs).abs() / 2.0).min(10.0);

    Some(WEIGHT_SKILL * s_skill + WEIGHT_PREFS * s_prefs + WEIGHT_WAIT * s_wait)
}

/// Per-axis affinity averaged across axes, each clamped to [0, 10].
/// No axes means no disagreement.
fn preference_affinity(p: &[f64], q: &[f64]) -> f64 {
    let axes = p.len().min(q.len());
    if axes == 0 {
        return 10.0;
    }
    let total: f64 = p
        .iter()
        .zip(q.iter())
        .map(|(a, b)| (10.0 - PREF_AXIS_SCALE * (a - b).abs()).clamp(0.0, 10.0))
        .sum();
    total / axes as f64
}

/// Required minimum compatibility after `waited_secs` in the queue.
/// Monotonically non-increasing, bounded in [minimum, initial].
pub fn threshold(waited_secs: f64, cfg: &MatchmakingConfig) -> f64 {
    (cfg.initial_threshold - cfg.decay_rate_per_second * waited_secs).max(cfg.minimum_threshold)
}

/// A candidate that passed the threshold, with the fields the tie-break
/// ordering needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub ticket_id: i64,
    pub score: f64,
    /// min of the pair's two waits; longer-waiting pairs are preferred.
    pub pair_wait: f64,
    pub rating_gap: i32,
}

/// Order eligible candidates: higher score first, then the longer-waiting
/// pair, then the smaller rating gap, then the smaller ticket id.
pub fn rank(candidates: &mut [RankedCandidate]) {
    candidates.sort_by(|x, y| {
        y.score
            .total_cmp(&x.score)
            .then(y.pair_wait.total_cmp(&x.pair_wait))
            .then(x.rating_gap.cmp(&y.rating_gap))
            .then(x.ticket_id.cmp(&y.ticket_id))
    });
}

/// Wait estimate for the queue status endpoint: a square-root penalty on the
/// base ETA, growing as the best available compatibility drops.
pub fn eta_seconds(best_score: Option<f64>, base_seconds: f64) -> f64 {
    match best_score {
        None => base_seconds,
        Some(s) => {
            let penalty = (10.0 - s.clamp(1.0, 10.0)).sqrt();
            (base_seconds * penalty).max(base_seconds)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MatchmakingConfig {
        MatchmakingConfig::default()
    }

    fn snap<'a>(rating: i32, prefs: &'a [f64], area: &'a str) -> Snapshot<'a> {
        Snapshot {
            rating,
            preferences: prefs,
            area,
        }
    }

    #[test]
    fn test_identical_players_score_ten() {
        let prefs = [1.0, 2.0, 3.0];
        let s = compat_score(
            &snap(1000, &prefs, "NA"),
            &snap(1000, &prefs, "NA"),
            5.0,
            5.0,
            &cfg(),
        )
        .unwrap();
        assert!((s - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_cross_area_incompatible() {
        let s = compat_score(
            &snap(1000, &[], "NA"),
            &snap(1000, &[], "EU"),
            0.0,
            0.0,
            &cfg(),
        );
        assert!(s.is_none());
    }

    #[test]
    fn test_wide_rating_gap_at_enqueue() {
        // 400-point gap, tolerance 50: skill subscore bottoms out at 0
        let s = compat_score(
            &snap(1000, &[], "NA"),
            &snap(1400, &[], "NA"),
            0.0,
            0.0,
            &cfg(),
        )
        .unwrap();
        // prefs 10 * 0.3 + wait 10 * 0.2
        assert!((s - 5.0).abs() < 1e-9);
        assert!(s < cfg().initial_threshold);
    }

    #[test]
    fn test_rating_gap_relaxes_with_wait() {
        // After 60s the tolerance is 50 + 5*60 = 350; the same 400-point gap
        // scores ~8.86 on skill and the pair clears the decayed threshold.
        let c = cfg();
        let s = compat_score(
            &snap(1000, &[], "NA"),
            &snap(1400, &[], "NA"),
            60.0,
            60.0,
            &c,
        )
        .unwrap();
        let expected_skill = 10.0 - 400.0 / 350.0;
        let expected = 0.5 * expected_skill + 0.3 * 10.0 + 0.2 * 10.0;
        assert!((s - expected).abs() < 1e-9);
        assert!(s >= threshold(60.0, &c));
    }

    #[test]
    fn test_wait_imbalance_penalized() {
        let balanced = compat_score(
            &snap(1000, &[], "NA"),
            &snap(1000, &[], "NA"),
            10.0,
            10.0,
            &cfg(),
        )
        .unwrap();
        let lopsided = compat_score(
            &snap(1000, &[], "NA"),
            &snap(1000, &[], "NA"),
            30.0,
            2.0,
            &cfg(),
        )
        .unwrap();
        assert!(lopsided < balanced);
    }

    #[test]
    fn test_preference_affinity_bounds() {
        assert_eq!(preference_affinity(&[], &[]), 10.0);
        assert_eq!(preference_affinity(&[1.0], &[1.0]), 10.0);
        // Distance 5 on one axis: 10 - 2*5 = 0
        assert_eq!(preference_affinity(&[0.0], &[5.0]), 0.0);
        // Huge distance still clamps at 0
        assert_eq!(preference_affinity(&[0.0], &[100.0]), 0.0);
    }

    #[test]
    fn test_score_stays_in_range() {
        let s = compat_score(
            &snap(0, &[0.0, 9.0], "NA"),
            &snap(3000, &[9.0, 0.0], "NA"),
            0.0,
            59.0,
            &cfg(),
        )
        .unwrap();
        assert!((0.0..=10.0).contains(&s));
    }

    #[test]
    fn test_threshold_monotone_and_bounded() {
        let c = cfg();
        let mut prev = f64::INFINITY;
        for t in 0..200 {
            let v = threshold(t as f64, &c);
            assert!(v <= prev);
            assert!(v >= c.minimum_threshold);
            assert!(v <= c.initial_threshold);
            prev = v;
        }
        assert_eq!(threshold(0.0, &c), 8.0);
        // Reaches the floor at (8.0 - 3.0) / 0.05 = 100s
        assert_eq!(threshold(100.0, &c), 3.0);
        assert_eq!(threshold(1000.0, &c), 3.0);
    }

    #[test]
    fn test_threshold_decay_midpoint() {
        assert!((threshold(60.0, &cfg()) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_rank_ordering() {
        let mut cands = vec![
            RankedCandidate {
                ticket_id: 4,
                score: 7.0,
                pair_wait: 3.0,
                rating_gap: 10,
            },
            RankedCandidate {
                ticket_id: 3,
                score: 9.0,
                pair_wait: 1.0,
                rating_gap: 50,
            },
            RankedCandidate {
                ticket_id: 2,
                score: 7.0,
                pair_wait: 8.0,
                rating_gap: 90,
            },
            RankedCandidate {
                ticket_id: 1,
                score: 7.0,
                pair_wait: 3.0,
                rating_gap: 10,
            },
        ];
        rank(&mut cands);
        let ids: Vec<i64> = cands.iter().map(|c| c.ticket_id).collect();
        // Best score first; then longer pair wait; then the id tie-break
        // between two otherwise identical candidates.
        assert_eq!(ids, vec![3, 2, 1, 4]);
    }

    #[test]
    fn test_eta_penalty() {
        assert_eq!(eta_seconds(None, 20.0), 20.0);
        assert_eq!(eta_seconds(Some(10.0), 20.0), 20.0);
        // Worse best-score means a longer estimate
        assert!(eta_seconds(Some(3.0), 20.0) > eta_seconds(Some(8.0), 20.0));
    }
}
