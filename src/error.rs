// Error taxonomy surfaced by the session facade.
//
// Expected races (a lost bind, an already-terminal cancel) are modeled as
// plain outcome enums on the store adapter, not as errors.

/// Result type alias for facade operations.
pub type Result<T> = std::result::Result<T, MatchmakingError>;

#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    /// Bad input from the caller; never retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A precondition no longer holds (already queued, match not active).
    #[error("conflict: {0}")]
    Conflict(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    /// The store failed outside the engine's retry budget.
    #[error("store error: {0}")]
    Operational(#[from] sqlx::Error),
}
