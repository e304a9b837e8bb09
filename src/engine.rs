// Matchmaker engine: a per-ticket poll loop that searches for the best
// eligible opponent under the decaying threshold and binds atomically.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::compat::{self, RankedCandidate, Snapshot};
use crate::config::MatchmakingConfig;
use crate::db::{now_epoch, BindOutcome, Database, Ticket, TicketTransition};
use crate::metrics;

/// Consecutive transient store failures tolerated before the ticket is
/// expired with a store-error reason.
const MAX_STORE_ERRORS: u32 = 3;

pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_STORE_ERROR: &str = "store-error";

/// Progress snapshot emitted once per poll tick while still searching.
#[derive(Debug, Clone, Copy)]
pub struct SearchTick {
    pub threshold: f64,
    pub candidates: usize,
    pub waited: f64,
}

/// Spawn the poll loop for one waiting ticket.
///
/// Tick snapshots arrive on the returned channel; the terminal transition
/// is delivered through the store's ticket watch, so callers subscribe
/// there before spawning.
pub fn spawn_search(
    db: Arc<Database>,
    cfg: MatchmakingConfig,
    ticket: Ticket,
) -> mpsc::Receiver<SearchTick> {
    let (tick_tx, tick_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        metrics::ACTIVE_SEARCHES.inc();
        run_search(db, cfg, ticket, tick_tx).await;
        metrics::ACTIVE_SEARCHES.dec();
    });
    tick_rx
}

async fn run_search(
    db: Arc<Database>,
    cfg: MatchmakingConfig,
    ticket: Ticket,
    ticks: mpsc::Sender<SearchTick>,
) {
    let interval = Duration::from_secs_f64(cfg.poll_interval_secs);
    let mut store_errors: u32 = 0;

    loop {
        // Re-read our own row first: a concurrent worker may have bound us,
        // or a cancellation landed while we slept.
        let current = match db.read_ticket(ticket.id).await {
            Ok(Some(t)) => t,
            // Row gone: the bound match was already finished elsewhere.
            Ok(None) => return,
            Err(e) => {
                store_errors += 1;
                tracing::warn!(ticket_id = ticket.id, error = %e, "store error reading ticket");
                if expire_after_errors(&db, ticket.id, store_errors).await {
                    return;
                }
                sleep(interval).await;
                continue;
            }
        };

        if !current.is_waiting() {
            // The transition happened in another process; local watchers
            // still need to hear about it (duplicate publish is a no-op).
            if let Some(transition) = observed_transition(&current) {
                db.publish_transition(current.id, transition);
            }
            return;
        }

        let now = now_epoch();
        let waited = current.waited_secs(now);
        if waited >= cfg.timeout_secs {
            if let Err(e) = db.expire_ticket(current.id, REASON_TIMEOUT).await {
                tracing::error!(ticket_id = current.id, error = %e, "failed to expire ticket");
                db.publish_transition(current.id, TicketTransition::Expired);
            }
            return;
        }

        let tau = compat::threshold(waited, &cfg);

        let candidates = match db.list_waiting(&current.area, current.user_id, current.id).await {
            Ok(c) => {
                store_errors = 0;
                c
            }
            Err(e) => {
                store_errors += 1;
                tracing::warn!(ticket_id = current.id, error = %e, "store error listing candidates");
                if expire_after_errors(&db, current.id, store_errors).await {
                    return;
                }
                sleep(interval).await;
                continue;
            }
        };

        let scanned = candidates.len();
        let mut eligible = score_candidates(&current, &candidates, waited, now, tau, &cfg);
        compat::rank(&mut eligible);

        let _ = ticks.try_send(SearchTick {
            threshold: tau,
            candidates: scanned,
            waited,
        });

        for candidate in &eligible {
            match db.try_bind(current.id, candidate.ticket_id).await {
                Ok(BindOutcome::Bound { .. }) => return,
                // Lost the race for this opponent; try the next one.
                Ok(BindOutcome::Conflict) => continue,
                Err(e) => {
                    store_errors += 1;
                    tracing::warn!(ticket_id = current.id, error = %e, "store error during bind");
                    if expire_after_errors(&db, current.id, store_errors).await {
                        return;
                    }
                    break;
                }
            }
        }

        sleep(interval).await;
    }
}

/// Expire the ticket once the transient-error budget is exhausted.
/// Returns whether the loop should stop.
async fn expire_after_errors(db: &Database, ticket_id: i64, store_errors: u32) -> bool {
    if store_errors < MAX_STORE_ERRORS {
        return false;
    }
    tracing::error!(ticket_id, "giving up after repeated store errors");
    if let Err(e) = db.expire_ticket(ticket_id, REASON_STORE_ERROR).await {
        tracing::error!(ticket_id, error = %e, "failed to expire ticket after store errors");
        // The store is unreachable; at least release local watchers.
        db.publish_transition(ticket_id, TicketTransition::Expired);
    }
    true
}

/// Map a ticket row that left WAITING to the transition its watchers expect.
fn observed_transition(ticket: &Ticket) -> Option<TicketTransition> {
    match ticket.status.as_str() {
        crate::db::TICKET_MATCHED => ticket
            .bound_match_id
            .map(|match_id| TicketTransition::Matched { match_id }),
        crate::db::TICKET_CANCELLED => Some(TicketTransition::Cancelled),
        crate::db::TICKET_EXPIRED => Some(TicketTransition::Expired),
        _ => None,
    }
}

/// Score all candidates against the focal ticket and keep those at or above
/// the threshold. Cross-area tickets never appear here (the store query
/// filters by area), but the scorer rejects them anyway.
fn score_candidates(
    own: &Ticket,
    candidates: &[Ticket],
    own_wait: f64,
    now: f64,
    tau: f64,
    cfg: &MatchmakingConfig,
) -> Vec<RankedCandidate> {
    let own_prefs = own.preference_axes();
    let own_snap = Snapshot {
        rating: own.rating,
        preferences: &own_prefs,
        area: &own.area,
    };
    candidates
        .iter()
        .filter_map(|c| {
            let prefs = c.preference_axes();
            let snap = Snapshot {
                rating: c.rating,
                preferences: &prefs,
                area: &c.area,
            };
            let candidate_wait = c.waited_secs(now);
            let score = compat::compat_score(&own_snap, &snap, own_wait, candidate_wait, cfg)?;
            if score < tau {
                return None;
            }
            Some(RankedCandidate {
                ticket_id: c.id,
                score,
                pair_wait: own_wait.min(candidate_wait),
                rating_gap: (own.rating - c.rating).abs(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{TICKET_CANCELLED, TICKET_EXPIRED, TICKET_MATCHED, TICKET_WAITING};

    fn ticket(id: i64, user_id: i64, rating: i32, area: &str, created_at: f64) -> Ticket {
        Ticket {
            id,
            user_id,
            status: TICKET_WAITING.to_string(),
            area: area.to_string(),
            rating,
            preferences: "[]".to_string(),
            created_at,
            bound_match_id: None,
            close_reason: None,
        }
    }

    #[test]
    fn test_observed_transition_mapping() {
        let mut t = ticket(1, 1, 1000, "NA", 0.0);

        t.status = TICKET_MATCHED.to_string();
        t.bound_match_id = Some(9);
        assert_eq!(
            observed_transition(&t),
            Some(TicketTransition::Matched { match_id: 9 })
        );

        t.status = TICKET_CANCELLED.to_string();
        assert_eq!(observed_transition(&t), Some(TicketTransition::Cancelled));

        t.status = TICKET_EXPIRED.to_string();
        assert_eq!(observed_transition(&t), Some(TicketTransition::Expired));

        t.status = TICKET_WAITING.to_string();
        assert_eq!(observed_transition(&t), None);
    }

    #[test]
    fn test_score_candidates_filters_below_threshold() {
        let cfg = MatchmakingConfig::default();
        let now = 1000.0;
        let own = ticket(1, 10, 1000, "NA", now);
        let close = ticket(2, 20, 1010, "NA", now);
        let far = ticket(3, 30, 1900, "NA", now);

        let eligible = score_candidates(&own, &[close.clone(), far], 0.0, now, 8.0, &cfg);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].ticket_id, close.id);
    }

    #[test]
    fn test_score_candidates_ranks_best_first() {
        let cfg = MatchmakingConfig::default();
        let now = 1000.0;
        let own = ticket(1, 10, 1000, "NA", now - 5.0);
        let near = ticket(2, 20, 1005, "NA", now - 5.0);
        let nearer = ticket(3, 30, 1001, "NA", now - 5.0);

        let mut eligible = score_candidates(&own, &[near, nearer], 5.0, now, 3.0, &cfg);
        compat::rank(&mut eligible);
        assert_eq!(eligible[0].ticket_id, 3);
        assert_eq!(eligible[1].ticket_id, 2);
    }

    #[test]
    fn test_score_candidates_rejects_cross_area() {
        let cfg = MatchmakingConfig::default();
        let now = 1000.0;
        let own = ticket(1, 10, 1000, "NA", now);
        let other_area = ticket(2, 20, 1000, "EU", now);

        let eligible = score_candidates(&own, &[other_area], 0.0, now, 0.0, &cfg);
        assert!(eligible.is_empty());
    }
}
