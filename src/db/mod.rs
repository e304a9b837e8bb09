// Ticket store adapter using sqlx's Any driver (supports SQLite and PostgreSQL).
//
// This is the only module that touches persistent state. Every multi-row
// mutation runs in a single transaction and acquires row locks in ascending
// id order; on PostgreSQL the locks are explicit `FOR UPDATE`, on SQLite
// the transaction itself serializes writers.

pub mod watch;

use serde::{Deserialize, Serialize};
use sqlx::any::AnyPoolOptions;
use sqlx::{Any, AnyPool, Transaction};

use crate::elo::{self, Outcome};
use crate::metrics;
pub use watch::{TicketTransition, TicketWatch};

pub const TICKET_WAITING: &str = "waiting";
pub const TICKET_MATCHED: &str = "matched";
pub const TICKET_CANCELLED: &str = "cancelled";
pub const TICKET_EXPIRED: &str = "expired";

pub const MATCH_ACTIVE: &str = "active";
pub const MATCH_FINISHED: &str = "finished";
pub const MATCH_CANCELLED: &str = "cancelled";

/// Candidate scan bound per poll tick.
const CANDIDATE_LIMIT: i64 = 50;

/// Current Unix time in fractional seconds. All persisted timestamps use
/// this representation so wait arithmetic is a plain subtraction.
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Player {
    pub id: i64,
    pub name: String,
    pub rating: i32,
    pub area: String,
    /// JSON array of bounded numeric preference axes.
    pub preferences: String,
    pub created_at: f64,
}

impl Player {
    pub fn preference_axes(&self) -> Vec<f64> {
        serde_json::from_str(&self.preferences).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Ticket {
    pub id: i64,
    pub user_id: i64,
    pub status: String,
    pub area: String,
    /// Rating snapshot taken at enqueue.
    pub rating: i32,
    /// Preference snapshot taken at enqueue (JSON array).
    pub preferences: String,
    pub created_at: f64,
    pub bound_match_id: Option<i64>,
    pub close_reason: Option<String>,
}

impl Ticket {
    pub fn is_waiting(&self) -> bool {
        self.status == TICKET_WAITING
    }

    pub fn preference_axes(&self) -> Vec<f64> {
        serde_json::from_str(&self.preferences).unwrap_or_default()
    }

    /// Seconds this ticket has been in the queue as of `now`.
    pub fn waited_secs(&self, now: f64) -> f64 {
        (now - self.created_at).max(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MatchRow {
    pub id: i64,
    pub user_a: i64,
    pub user_b: i64,
    pub ticket_a: i64,
    pub ticket_b: i64,
    pub status: String,
    pub score_a: Option<i32>,
    pub score_b: Option<i32>,
    pub rating_before_a: Option<i32>,
    pub rating_before_b: Option<i32>,
    pub rating_after_a: Option<i32>,
    pub rating_after_b: Option<i32>,
    pub created_at: f64,
    pub finished_at: Option<f64>,
}

const TICKET_COLUMNS: &str =
    "id, user_id, status, area, rating, preferences, created_at, bound_match_id, close_reason";

const MATCH_COLUMNS: &str = "id, user_a, user_b, ticket_a, ticket_b, status, score_a, score_b, \
     rating_before_a, rating_before_b, rating_after_a, rating_after_b, created_at, finished_at";

// ── Operation outcomes ────────────────────────────────────────────────

#[derive(Debug)]
pub enum CreateTicketOutcome {
    Created(Ticket),
    /// The player already has a waiting or matched ticket.
    AlreadyQueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound { match_id: i64 },
    /// Lost the race: one of the tickets is no longer waiting.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTicketOutcome {
    Cancelled,
    /// Matched tickets are released through `cancel_match`.
    AlreadyMatched,
    AlreadyTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMatchOutcome {
    Cancelled,
    NotActive,
    NotFound,
}

/// Rating movement applied by a finished match, A side first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RatingChange {
    pub rating_before: [i32; 2],
    pub rating_after: [i32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Finished(RatingChange),
    NotActive,
    NotFound,
    InvalidScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { match_id: i64 },
    /// One of the players already has a waiting or matched ticket.
    PlayerBusy,
    UnknownUser,
}

// ── Database ──────────────────────────────────────────────────────────

pub struct Database {
    pool: AnyPool,
    is_postgres: bool,
    watch: TicketWatch,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_postgres =
            database_url.starts_with("postgres://") || database_url.starts_with("postgresql://");
        // For SQLite in-memory databases, limit to 1 connection so all
        // queries share the same in-memory database.
        let is_memory = database_url.contains(":memory:");
        let max_conn = if is_memory { 1 } else { 8 };
        let pool = AnyPoolOptions::new()
            .max_connections(max_conn)
            .connect(database_url)
            .await?;
        let db = Self {
            pool,
            is_postgres,
            watch: TicketWatch::new(),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn exec(&self, sql: &str) -> Result<(), sqlx::Error> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        if self.is_postgres {
            self.run_migrations_postgres().await?;
        } else {
            self.run_migrations_sqlite().await?;
        }
        // One live (waiting or matched) ticket per player; partial indexes
        // work on both backends.
        self.exec(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS mm_ticket_one_live_per_user
            ON mm_ticket (user_id) WHERE status IN ('waiting', 'matched')
        "#,
        )
        .await?;
        self.exec(
            r#"
            CREATE INDEX IF NOT EXISTS mm_ticket_area_status
            ON mm_ticket (area, status)
        "#,
        )
        .await
    }

    async fn run_migrations_postgres(&self) -> Result<(), sqlx::Error> {
        self.exec(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                rating INTEGER NOT NULL DEFAULT 1000,
                area TEXT NOT NULL DEFAULT 'global',
                preferences TEXT NOT NULL DEFAULT '[]',
                created_at DOUBLE PRECISION NOT NULL
            )
        "#,
        )
        .await?;

        self.exec(
            r#"
            CREATE TABLE IF NOT EXISTS mm_ticket (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES users(id),
                status TEXT NOT NULL DEFAULT 'waiting',
                area TEXT NOT NULL,
                rating INTEGER NOT NULL,
                preferences TEXT NOT NULL DEFAULT '[]',
                created_at DOUBLE PRECISION NOT NULL,
                bound_match_id BIGINT,
                close_reason TEXT
            )
        "#,
        )
        .await?;

        self.exec(
            r#"
            CREATE TABLE IF NOT EXISTS match_tx (
                id BIGSERIAL PRIMARY KEY,
                user_a BIGINT NOT NULL REFERENCES users(id),
                user_b BIGINT NOT NULL REFERENCES users(id),
                ticket_a BIGINT NOT NULL,
                ticket_b BIGINT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                score_a INTEGER,
                score_b INTEGER,
                rating_before_a INTEGER,
                rating_before_b INTEGER,
                rating_after_a INTEGER,
                rating_after_b INTEGER,
                created_at DOUBLE PRECISION NOT NULL,
                finished_at DOUBLE PRECISION
            )
        "#,
        )
        .await
    }

    async fn run_migrations_sqlite(&self) -> Result<(), sqlx::Error> {
        self.exec(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                rating INTEGER NOT NULL DEFAULT 1000,
                area TEXT NOT NULL DEFAULT 'global',
                preferences TEXT NOT NULL DEFAULT '[]',
                created_at REAL NOT NULL
            )
        "#,
        )
        .await?;

        self.exec(
            r#"
            CREATE TABLE IF NOT EXISTS mm_ticket (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                status TEXT NOT NULL DEFAULT 'waiting',
                area TEXT NOT NULL,
                rating INTEGER NOT NULL,
                preferences TEXT NOT NULL DEFAULT '[]',
                created_at REAL NOT NULL,
                bound_match_id INTEGER,
                close_reason TEXT
            )
        "#,
        )
        .await?;

        self.exec(
            r#"
            CREATE TABLE IF NOT EXISTS match_tx (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_a INTEGER NOT NULL REFERENCES users(id),
                user_b INTEGER NOT NULL REFERENCES users(id),
                ticket_a INTEGER NOT NULL,
                ticket_b INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                score_a INTEGER,
                score_b INTEGER,
                rating_before_a INTEGER,
                rating_before_b INTEGER,
                rating_after_a INTEGER,
                rating_after_b INTEGER,
                created_at REAL NOT NULL,
                finished_at REAL
            )
        "#,
        )
        .await
    }

    // ── Users ─────────────────────────────────────────────────────────

    /// Insert a player row. Account management proper lives outside the
    /// core; this exists for seeding and tests.
    pub async fn create_user(
        &self,
        name: &str,
        rating: i32,
        area: &str,
        preferences: &[f64],
    ) -> Result<Player, sqlx::Error> {
        let prefs_json = serde_json::to_string(preferences).unwrap_or_else(|_| "[]".to_string());
        sqlx::query_as::<_, Player>(
            "INSERT INTO users (name, rating, area, preferences, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, name, rating, area, preferences, created_at",
        )
        .bind(name)
        .bind(rating)
        .bind(area)
        .bind(prefs_json)
        .bind(now_epoch())
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<Player>, sqlx::Error> {
        sqlx::query_as::<_, Player>(
            "SELECT id, name, rating, area, preferences, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    // ── Tickets ───────────────────────────────────────────────────────

    /// Enqueue a player. The rating and preference snapshot is taken from
    /// the player row at this moment; the unique partial index rejects a
    /// second live ticket under concurrent enqueues.
    pub async fn create_ticket(&self, player: &Player) -> Result<CreateTicketOutcome, sqlx::Error> {
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM mm_ticket WHERE user_id = $1 AND status IN ('waiting', 'matched')",
        )
        .bind(player.id)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Ok(CreateTicketOutcome::AlreadyQueued);
        }

        let sql = format!(
            "INSERT INTO mm_ticket (user_id, status, area, rating, preferences, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {TICKET_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, Ticket>(&sql)
            .bind(player.id)
            .bind(TICKET_WAITING)
            .bind(&player.area)
            .bind(player.rating)
            .bind(&player.preferences)
            .bind(now_epoch())
            .fetch_one(&self.pool)
            .await;

        match inserted {
            Ok(ticket) => {
                metrics::TICKETS_CREATED_TOTAL.inc();
                Ok(CreateTicketOutcome::Created(ticket))
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Ok(CreateTicketOutcome::AlreadyQueued)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn read_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>, sqlx::Error> {
        let sql = format!("SELECT {TICKET_COLUMNS} FROM mm_ticket WHERE id = $1");
        sqlx::query_as::<_, Ticket>(&sql)
            .bind(ticket_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Waiting tickets in an area, excluding the focal player and ticket.
    /// The snapshot may be stale; `try_bind` re-verifies under locks.
    pub async fn list_waiting(
        &self,
        area: &str,
        exclude_player: i64,
        exclude_ticket: i64,
    ) -> Result<Vec<Ticket>, sqlx::Error> {
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM mm_ticket \
             WHERE status = $1 AND area = $2 AND user_id <> $3 AND id <> $4 \
             ORDER BY created_at ASC LIMIT {CANDIDATE_LIMIT}"
        );
        sqlx::query_as::<_, Ticket>(&sql)
            .bind(TICKET_WAITING)
            .bind(area)
            .bind(exclude_player)
            .bind(exclude_ticket)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn count_waiting(&self, area: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM mm_ticket WHERE status = $1 AND area = $2")
            .bind(TICKET_WAITING)
            .bind(area)
            .fetch_one(&self.pool)
            .await
    }

    /// Lock a ticket row for the duration of the transaction. On PostgreSQL
    /// this is an explicit `FOR UPDATE`; on SQLite the surrounding
    /// transaction serializes writers.
    async fn lock_ticket(
        &self,
        tx: &mut Transaction<'_, Any>,
        ticket_id: i64,
    ) -> Result<Option<Ticket>, sqlx::Error> {
        let sql = if self.is_postgres {
            format!("SELECT {TICKET_COLUMNS} FROM mm_ticket WHERE id = $1 FOR UPDATE")
        } else {
            format!("SELECT {TICKET_COLUMNS} FROM mm_ticket WHERE id = $1")
        };
        sqlx::query_as::<_, Ticket>(&sql)
            .bind(ticket_id)
            .fetch_optional(&mut **tx)
            .await
    }

    /// Atomically bind two waiting tickets into a new ACTIVE match.
    ///
    /// Locks both rows in ascending ticket-id order, re-verifies both are
    /// still WAITING, inserts the match, and flips both tickets to MATCHED.
    /// A ticket that moved on is a `Conflict`, not an error.
    pub async fn try_bind(
        &self,
        ticket_a_id: i64,
        ticket_b_id: i64,
    ) -> Result<BindOutcome, sqlx::Error> {
        let (lo, hi) = if ticket_a_id < ticket_b_id {
            (ticket_a_id, ticket_b_id)
        } else {
            (ticket_b_id, ticket_a_id)
        };

        let mut tx = self.pool.begin().await?;

        let first = self.lock_ticket(&mut tx, lo).await?;
        let second = self.lock_ticket(&mut tx, hi).await?;
        let (first, second) = match (first, second) {
            (Some(f), Some(s)) if f.is_waiting() && s.is_waiting() => (f, s),
            _ => {
                metrics::BIND_CONFLICTS_TOTAL.inc();
                return Ok(BindOutcome::Conflict);
            }
        };

        // The A side is conventionally the lower player id.
        let (side_a, side_b) = if first.user_id <= second.user_id {
            (&first, &second)
        } else {
            (&second, &first)
        };

        let now = now_epoch();
        let match_id: i64 = sqlx::query_scalar(
            "INSERT INTO match_tx (user_a, user_b, ticket_a, ticket_b, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(side_a.user_id)
        .bind(side_b.user_id)
        .bind(side_a.id)
        .bind(side_b.id)
        .bind(MATCH_ACTIVE)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for ticket_id in [lo, hi] {
            sqlx::query("UPDATE mm_ticket SET status = $1, bound_match_id = $2 WHERE id = $3")
                .bind(TICKET_MATCHED)
                .bind(match_id)
                .bind(ticket_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        metrics::MATCHES_FORMED_TOTAL.with_label_values(&["queue"]).inc();
        for t in [&first, &second] {
            metrics::MATCH_WAIT_SECONDS.observe(t.waited_secs(now));
            self.watch.publish(t.id, TicketTransition::Matched { match_id });
        }
        tracing::info!(
            match_id,
            ticket_a = side_a.id,
            ticket_b = side_b.id,
            "bound tickets into match"
        );

        Ok(BindOutcome::Bound { match_id })
    }

    /// WAITING → CANCELLED. Matched tickets must go through `cancel_match`.
    pub async fn cancel_ticket(&self, ticket_id: i64) -> Result<CancelTicketOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let ticket = match self.lock_ticket(&mut tx, ticket_id).await? {
            Some(t) => t,
            None => return Ok(CancelTicketOutcome::AlreadyTerminal),
        };
        match ticket.status.as_str() {
            TICKET_WAITING => {}
            TICKET_MATCHED => return Ok(CancelTicketOutcome::AlreadyMatched),
            _ => return Ok(CancelTicketOutcome::AlreadyTerminal),
        }

        sqlx::query("UPDATE mm_ticket SET status = $1 WHERE id = $2")
            .bind(TICKET_CANCELLED)
            .bind(ticket_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        metrics::TICKETS_CANCELLED_TOTAL.inc();
        self.watch.publish(ticket_id, TicketTransition::Cancelled);
        tracing::info!(ticket_id, "ticket cancelled");
        Ok(CancelTicketOutcome::Cancelled)
    }

    /// WAITING → EXPIRED with a recorded reason; no-op if already terminal.
    /// Returns whether the transition happened.
    pub async fn expire_ticket(&self, ticket_id: i64, reason: &str) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let ticket = match self.lock_ticket(&mut tx, ticket_id).await? {
            Some(t) if t.is_waiting() => t,
            _ => return Ok(false),
        };

        sqlx::query("UPDATE mm_ticket SET status = $1, close_reason = $2 WHERE id = $3")
            .bind(TICKET_EXPIRED)
            .bind(reason)
            .bind(ticket.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        metrics::TICKETS_EXPIRED_TOTAL.with_label_values(&[reason]).inc();
        self.watch.publish(ticket_id, TicketTransition::Expired);
        tracing::info!(ticket_id, reason, "ticket expired");
        Ok(true)
    }

    // ── Matches ───────────────────────────────────────────────────────

    async fn lock_match(
        &self,
        tx: &mut Transaction<'_, Any>,
        match_id: i64,
    ) -> Result<Option<MatchRow>, sqlx::Error> {
        let sql = if self.is_postgres {
            format!("SELECT {MATCH_COLUMNS} FROM match_tx WHERE id = $1 FOR UPDATE")
        } else {
            format!("SELECT {MATCH_COLUMNS} FROM match_tx WHERE id = $1")
        };
        sqlx::query_as::<_, MatchRow>(&sql)
            .bind(match_id)
            .fetch_optional(&mut **tx)
            .await
    }

    pub async fn get_match(&self, match_id: i64) -> Result<Option<MatchRow>, sqlx::Error> {
        let sql = format!("SELECT {MATCH_COLUMNS} FROM match_tx WHERE id = $1");
        sqlx::query_as::<_, MatchRow>(&sql)
            .bind(match_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Create a match directly from two players (invite flow), bypassing
    /// the queue: both tickets are born MATCHED, in one transaction. Both
    /// players must be free of live tickets.
    pub async fn create_direct_match(
        &self,
        user_a_id: i64,
        user_b_id: i64,
    ) -> Result<StartOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Fetch both in ascending id order; the A side is the lower id.
        let (lo_id, hi_id) = if user_a_id < user_b_id {
            (user_a_id, user_b_id)
        } else {
            (user_b_id, user_a_id)
        };
        let mut players = Vec::with_capacity(2);
        for id in [lo_id, hi_id] {
            let player = sqlx::query_as::<_, Player>(
                "SELECT id, name, rating, area, preferences, created_at FROM users WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
            match player {
                Some(p) => players.push(p),
                None => return Ok(StartOutcome::UnknownUser),
            }
        }

        let busy: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM mm_ticket WHERE user_id IN ($1, $2) AND status IN ('waiting', 'matched')",
        )
        .bind(lo_id)
        .bind(hi_id)
        .fetch_optional(&mut *tx)
        .await?;
        if busy.is_some() {
            return Ok(StartOutcome::PlayerBusy);
        }

        let now = now_epoch();
        let mut ticket_ids = Vec::with_capacity(2);
        for player in &players {
            let insert = sqlx::query_scalar::<_, i64>(
                "INSERT INTO mm_ticket (user_id, status, area, rating, preferences, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
            )
            .bind(player.id)
            .bind(TICKET_MATCHED)
            .bind(&player.area)
            .bind(player.rating)
            .bind(&player.preferences)
            .bind(now)
            .fetch_one(&mut *tx)
            .await;
            match insert {
                Ok(id) => ticket_ids.push(id),
                // Lost a race against a concurrent enqueue.
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    return Ok(StartOutcome::PlayerBusy)
                }
                Err(e) => return Err(e),
            }
        }

        let match_id: i64 = sqlx::query_scalar(
            "INSERT INTO match_tx (user_a, user_b, ticket_a, ticket_b, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(lo_id)
        .bind(hi_id)
        .bind(ticket_ids[0])
        .bind(ticket_ids[1])
        .bind(MATCH_ACTIVE)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for ticket_id in &ticket_ids {
            sqlx::query("UPDATE mm_ticket SET bound_match_id = $1 WHERE id = $2")
                .bind(match_id)
                .bind(*ticket_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        metrics::MATCHES_FORMED_TOTAL.with_label_values(&["direct"]).inc();
        tracing::info!(match_id, user_a = lo_id, user_b = hi_id, "direct match started");
        Ok(StartOutcome::Started { match_id })
    }

    /// ACTIVE → CANCELLED; both bound tickets become CANCELLED atomically.
    pub async fn cancel_match(&self, match_id: i64) -> Result<CancelMatchOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let row = match self.lock_match(&mut tx, match_id).await? {
            Some(m) => m,
            None => return Ok(CancelMatchOutcome::NotFound),
        };
        if row.status != MATCH_ACTIVE {
            return Ok(CancelMatchOutcome::NotActive);
        }

        sqlx::query("UPDATE match_tx SET status = $1, finished_at = $2 WHERE id = $3")
            .bind(MATCH_CANCELLED)
            .bind(now_epoch())
            .bind(match_id)
            .execute(&mut *tx)
            .await?;
        // Ascending ticket-id order, as everywhere.
        let (lo, hi) = if row.ticket_a < row.ticket_b {
            (row.ticket_a, row.ticket_b)
        } else {
            (row.ticket_b, row.ticket_a)
        };
        for ticket_id in [lo, hi] {
            sqlx::query("UPDATE mm_ticket SET status = $1 WHERE id = $2")
                .bind(TICKET_CANCELLED)
                .bind(ticket_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        metrics::MATCHES_CANCELLED_TOTAL.inc();
        tracing::info!(match_id, "match cancelled");
        Ok(CancelMatchOutcome::Cancelled)
    }

    /// ACTIVE → FINISHED: validates the score, applies the rating update to
    /// both player rows (locked in ascending player-id order), records the
    /// score and rating trail, and releases the fulfilled tickets. All in
    /// one transaction.
    ///
    /// Repeating a finish with the same score returns the recorded ratings
    /// without touching state.
    pub async fn finish_match(
        &self,
        match_id: i64,
        score_a: i32,
        score_b: i32,
        k_factor: f64,
    ) -> Result<FinishOutcome, sqlx::Error> {
        let outcome = match Outcome::from_score(score_a, score_b) {
            Ok(o) => o,
            Err(_) => return Ok(FinishOutcome::InvalidScore),
        };

        let mut tx = self.pool.begin().await?;
        let row = match self.lock_match(&mut tx, match_id).await? {
            Some(m) => m,
            None => return Ok(FinishOutcome::NotFound),
        };

        if row.status == MATCH_FINISHED {
            // Idempotent replay of the same result.
            if row.score_a == Some(score_a) && row.score_b == Some(score_b) {
                if let (Some(ba), Some(bb), Some(aa), Some(ab)) = (
                    row.rating_before_a,
                    row.rating_before_b,
                    row.rating_after_a,
                    row.rating_after_b,
                ) {
                    return Ok(FinishOutcome::Finished(RatingChange {
                        rating_before: [ba, bb],
                        rating_after: [aa, ab],
                    }));
                }
            }
            return Ok(FinishOutcome::NotActive);
        }
        if row.status != MATCH_ACTIVE {
            return Ok(FinishOutcome::NotActive);
        }

        // Lock player rows in ascending id order; user_a < user_b by
        // construction, but do not rely on it.
        let (lo, hi) = if row.user_a < row.user_b {
            (row.user_a, row.user_b)
        } else {
            (row.user_b, row.user_a)
        };
        let user_sql = if self.is_postgres {
            "SELECT rating FROM users WHERE id = $1 FOR UPDATE"
        } else {
            "SELECT rating FROM users WHERE id = $1"
        };
        let mut ratings = std::collections::HashMap::new();
        for id in [lo, hi] {
            let rating: i32 = sqlx::query_scalar(user_sql)
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            ratings.insert(id, rating);
        }
        let before_a = ratings[&row.user_a];
        let before_b = ratings[&row.user_b];

        let (after_a, after_b) = elo::rate_pair(before_a, before_b, outcome, k_factor);

        for (user_id, rating) in [(row.user_a, after_a), (row.user_b, after_b)] {
            sqlx::query("UPDATE users SET rating = $1 WHERE id = $2")
                .bind(rating)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "UPDATE match_tx SET status = $1, score_a = $2, score_b = $3, \
             rating_before_a = $4, rating_before_b = $5, \
             rating_after_a = $6, rating_after_b = $7, finished_at = $8 \
             WHERE id = $9",
        )
        .bind(MATCH_FINISHED)
        .bind(score_a)
        .bind(score_b)
        .bind(before_a)
        .bind(before_b)
        .bind(after_a)
        .bind(after_b)
        .bind(now_epoch())
        .bind(match_id)
        .execute(&mut *tx)
        .await?;

        // The intent the tickets represented is fulfilled; drop the rows so
        // both players can requeue.
        for ticket_id in [row.ticket_a.min(row.ticket_b), row.ticket_a.max(row.ticket_b)] {
            sqlx::query("DELETE FROM mm_ticket WHERE id = $1")
                .bind(ticket_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        metrics::MATCHES_FINISHED_TOTAL.inc();
        tracing::info!(
            match_id,
            score_a,
            score_b,
            rating_after_a = after_a,
            rating_after_b = after_b,
            "match finished"
        );
        Ok(FinishOutcome::Finished(RatingChange {
            rating_before: [before_a, before_b],
            rating_after: [after_a, after_b],
        }))
    }

    // ── Watch ─────────────────────────────────────────────────────────

    /// Subscribe to a ticket's terminal transition. Fed by the mutators
    /// above; a transition performed by another process reaches watchers
    /// via the engine's republish on observation.
    pub fn watch_ticket(&self, ticket_id: i64) -> tokio::sync::broadcast::Receiver<TicketTransition> {
        self.watch.subscribe(ticket_id)
    }

    /// Publish a transition that was observed in the store rather than
    /// performed by this process.
    pub fn publish_transition(&self, ticket_id: i64, transition: TicketTransition) {
        self.watch.publish(ticket_id, transition);
    }
}
