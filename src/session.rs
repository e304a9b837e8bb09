// Session facade: the per-request matchmaking lifecycle. Wraps the store
// adapter and the engine for the HTTP layer.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration};

use crate::compat;
use crate::config::MatchmakingConfig;
use crate::db::{
    CancelMatchOutcome, CreateTicketOutcome, Database, FinishOutcome, MatchRow, RatingChange,
    StartOutcome, Ticket, TicketTransition,
};
use crate::elo::Outcome;
use crate::engine::{self, SearchTick};
use crate::error::{MatchmakingError, Result};

/// One event on a streaming match request; serialized verbatim onto the
/// SSE wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionEvent {
    Searching {
        threshold: f64,
        candidates: usize,
        waited: f64,
    },
    Matched {
        match_id: i64,
    },
    Expired,
    Cancelled,
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionEvent::Searching { .. })
    }
}

/// Terminal outcome of a blocking match request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched { match_id: i64 },
    Expired,
    Cancelled,
}

/// Queue depth and a coarse wait estimate for one area.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub depth: i64,
    pub estimated_wait_seconds: f64,
}

#[derive(Clone)]
pub struct MatchService {
    db: Arc<Database>,
    cfg: MatchmakingConfig,
}

impl MatchService {
    pub fn new(db: Arc<Database>, cfg: MatchmakingConfig) -> Self {
        Self { db, cfg }
    }

    /// Shared enqueue path: resolve the player, create the ticket,
    /// subscribe to its transitions, and start the engine poll loop.
    async fn enqueue(
        &self,
        user_id: i64,
    ) -> Result<(
        Ticket,
        broadcast::Receiver<TicketTransition>,
        mpsc::Receiver<SearchTick>,
    )> {
        let player = self
            .db
            .get_user(user_id)
            .await?
            .ok_or(MatchmakingError::NotFound("user"))?;
        let ticket = match self.db.create_ticket(&player).await? {
            CreateTicketOutcome::Created(t) => t,
            CreateTicketOutcome::AlreadyQueued => {
                return Err(MatchmakingError::Conflict("already queued"))
            }
        };
        // Subscribe before the engine can race us to a terminal transition.
        let transitions = self.db.watch_ticket(ticket.id);
        let ticks = engine::spawn_search(self.db.clone(), self.cfg.clone(), ticket.clone());
        Ok((ticket, transitions, ticks))
    }

    /// Blocking match request: enqueue and wait for the terminal transition.
    pub async fn match_blocking(&self, user_id: i64) -> Result<MatchOutcome> {
        let (ticket, mut transitions, _ticks) = self.enqueue(user_id).await?;

        // If the caller goes away mid-wait this future is dropped; the
        // guard then cancels the ticket so it doesn't sit in the queue
        // until expiry.
        let guard = CancelGuard::new(self.db.clone(), ticket.id);

        // The engine enforces expiry in the store; this outer limit only
        // catches a wedged loop, with slack for two extra polls.
        let limit = Duration::from_secs_f64(
            self.cfg.timeout_secs + 2.0 * self.cfg.poll_interval_secs + 1.0,
        );
        let outcome = match timeout(limit, transitions.recv()).await {
            Ok(Ok(TicketTransition::Matched { match_id })) => MatchOutcome::Matched { match_id },
            Ok(Ok(TicketTransition::Cancelled)) => MatchOutcome::Cancelled,
            Ok(Ok(TicketTransition::Expired)) => MatchOutcome::Expired,
            Ok(Err(_)) | Err(_) => {
                let _ = self
                    .db
                    .expire_ticket(ticket.id, engine::REASON_TIMEOUT)
                    .await;
                MatchOutcome::Expired
            }
        };
        guard.disarm();
        Ok(outcome)
    }

    /// Streaming match request: enqueue, then emit a `searching` event per
    /// poll tick and the terminal event last. Dropping the receiver
    /// (client disconnect) cancels the ticket.
    pub async fn match_stream(&self, user_id: i64) -> Result<mpsc::Receiver<SessionEvent>> {
        let (ticket, mut transitions, mut ticks) = self.enqueue(user_id).await?;
        let (events_tx, events_rx) = mpsc::channel(16);
        let db = self.db.clone();

        tokio::spawn(async move {
            let mut ticks_open = true;
            loop {
                tokio::select! {
                    transition = transitions.recv() => {
                        let event = match transition {
                            Ok(TicketTransition::Matched { match_id }) => {
                                SessionEvent::Matched { match_id }
                            }
                            Ok(TicketTransition::Cancelled) => SessionEvent::Cancelled,
                            Ok(TicketTransition::Expired) | Err(_) => SessionEvent::Expired,
                        };
                        let _ = events_tx.send(event).await;
                        return;
                    }
                    tick = ticks.recv(), if ticks_open => {
                        match tick {
                            Some(t) => {
                                let event = SessionEvent::Searching {
                                    threshold: t.threshold,
                                    candidates: t.candidates,
                                    waited: t.waited,
                                };
                                if events_tx.send(event).await.is_err() {
                                    // Client disconnected: treat as cancel.
                                    let _ = db.cancel_ticket(ticket.id).await;
                                    return;
                                }
                            }
                            // Engine loop ended; the terminal transition
                            // arrives on the other arm.
                            None => ticks_open = false,
                        }
                    }
                }
            }
        });

        Ok(events_rx)
    }

    /// Externally-driven match between two players, bypassing the queue.
    /// Both must be free of live tickets.
    pub async fn start_match(&self, user_a: i64, user_b: i64) -> Result<i64> {
        if user_a == user_b {
            return Err(MatchmakingError::Validation(
                "a match needs two distinct players".to_string(),
            ));
        }
        match self.db.create_direct_match(user_a, user_b).await? {
            StartOutcome::Started { match_id } => Ok(match_id),
            StartOutcome::PlayerBusy => Err(MatchmakingError::Conflict("player busy")),
            StartOutcome::UnknownUser => Err(MatchmakingError::NotFound("user")),
        }
    }

    /// Report a result and apply the rating update. Repeating a completed
    /// finish with the same score returns the same ratings.
    pub async fn finish_match(&self, match_id: i64, score: [i32; 2]) -> Result<RatingChange> {
        if Outcome::from_score(score[0], score[1]).is_err() {
            return Err(MatchmakingError::Validation(
                "scores must be non-negative integers".to_string(),
            ));
        }
        match self
            .db
            .finish_match(match_id, score[0], score[1], self.cfg.k_factor)
            .await?
        {
            FinishOutcome::Finished(change) => Ok(change),
            FinishOutcome::NotActive => Err(MatchmakingError::Conflict("match not active")),
            FinishOutcome::NotFound => Err(MatchmakingError::NotFound("match")),
            FinishOutcome::InvalidScore => Err(MatchmakingError::Validation(
                "invalid score".to_string(),
            )),
        }
    }

    pub async fn cancel_match(&self, match_id: i64) -> Result<()> {
        match self.db.cancel_match(match_id).await? {
            CancelMatchOutcome::Cancelled => Ok(()),
            CancelMatchOutcome::NotActive => Err(MatchmakingError::Conflict("match not active")),
            CancelMatchOutcome::NotFound => Err(MatchmakingError::NotFound("match")),
        }
    }

    pub async fn get_match(&self, match_id: i64) -> Result<MatchRow> {
        self.db
            .get_match(match_id)
            .await?
            .ok_or(MatchmakingError::NotFound("match"))
    }

    pub async fn queue_status(&self, area: &str) -> Result<QueueStatus> {
        let depth = self.db.count_waiting(area).await?;
        Ok(QueueStatus {
            depth,
            estimated_wait_seconds: compat::eta_seconds(None, self.cfg.base_eta_seconds),
        })
    }
}

/// Cancels a waiting ticket if dropped while still armed. Used by the
/// blocking path, whose future is dropped when the client disconnects.
struct CancelGuard {
    db: Arc<Database>,
    ticket_id: i64,
    armed: bool,
}

impl CancelGuard {
    fn new(db: Arc<Database>, ticket_id: i64) -> Self {
        Self {
            db,
            ticket_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            let db = self.db.clone();
            let ticket_id = self.ticket_id;
            tokio::spawn(async move {
                let _ = db.cancel_ticket(ticket_id).await;
            });
        }
    }
}
