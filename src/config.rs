// Application configuration, loaded from environment variables.

use crate::elo::DEFAULT_K_FACTOR;

/// Tunable matchmaking parameters, passed into the engine and facade at
/// construction. Immutable after load.
#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    /// Maximum seconds a ticket may wait before it expires.
    pub timeout_secs: f64,
    /// Seconds between engine poll ticks.
    pub poll_interval_secs: f64,
    /// Compatibility threshold at enqueue time.
    pub initial_threshold: f64,
    /// Floor the threshold decays toward.
    pub minimum_threshold: f64,
    /// Threshold decay per second of waiting.
    pub decay_rate_per_second: f64,
    /// ELO K-factor applied when a match finishes.
    pub k_factor: f64,
    /// Rating-point tolerance for the skill subscore at t=0.
    pub base_skill_tolerance: f64,
    /// Tolerance growth in rating points per second waited.
    pub skill_relax_rate: f64,
    /// Baseline wait estimate reported by the queue status endpoint.
    pub base_eta_seconds: f64,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60.0,
            poll_interval_secs: 2.0,
            initial_threshold: 8.0,
            minimum_threshold: 3.0,
            decay_rate_per_second: 0.05,
            k_factor: DEFAULT_K_FACTOR,
            base_skill_tolerance: 50.0,
            skill_relax_rate: 5.0,
            base_eta_seconds: 20.0,
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite or PostgreSQL connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    pub matchmaking: MatchmakingConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// - `DATABASE_URL` - connection string (default: `sqlite:matchpoint.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `MATCHMAKING_TIMEOUT` - seconds before a ticket expires (default: 60)
    /// - `MATCHMAKING_POLL_INTERVAL` - seconds between poll ticks (default: 2)
    /// - `INITIAL_COMPAT_THRESHOLD` - starting acceptance threshold (default: 8.0)
    /// - `MINIMUM_COMPAT_THRESHOLD` - threshold floor (default: 3.0)
    /// - `DECAY_RATE_PER_SECOND` - threshold decay rate (default: 0.05)
    /// - `K_FACTOR` - ELO update magnitude (default: 32)
    /// - `BASE_SKILL_TOLERANCE` - skill tolerance at t=0 (default: 50)
    /// - `SKILL_RELAX_RATE` - tolerance growth per second (default: 5)
    /// - `BASE_ETA_SECONDS` - baseline queue wait estimate (default: 20)
    pub fn load() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:matchpoint.db?mode=rwc".to_string());

        let port = env_parsed("PORT", 3000);

        let defaults = MatchmakingConfig::default();
        let matchmaking = MatchmakingConfig {
            timeout_secs: env_parsed("MATCHMAKING_TIMEOUT", defaults.timeout_secs),
            poll_interval_secs: env_parsed(
                "MATCHMAKING_POLL_INTERVAL",
                defaults.poll_interval_secs,
            ),
            initial_threshold: env_parsed("INITIAL_COMPAT_THRESHOLD", defaults.initial_threshold),
            minimum_threshold: env_parsed("MINIMUM_COMPAT_THRESHOLD", defaults.minimum_threshold),
            decay_rate_per_second: env_parsed(
                "DECAY_RATE_PER_SECOND",
                defaults.decay_rate_per_second,
            ),
            k_factor: env_parsed("K_FACTOR", defaults.k_factor),
            base_skill_tolerance: env_parsed(
                "BASE_SKILL_TOLERANCE",
                defaults.base_skill_tolerance,
            ),
            skill_relax_rate: env_parsed("SKILL_RELAX_RATE", defaults.skill_relax_rate),
            base_eta_seconds: env_parsed("BASE_ETA_SECONDS", defaults.base_eta_seconds),
        };

        Config {
            database_url,
            port,
            matchmaking,
        }
    }
}

/// Parse an environment variable, falling back to a default on absence or
/// a malformed value.
fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matchmaking_defaults() {
        let cfg = MatchmakingConfig::default();
        assert_eq!(cfg.timeout_secs, 60.0);
        assert_eq!(cfg.poll_interval_secs, 2.0);
        assert_eq!(cfg.initial_threshold, 8.0);
        assert_eq!(cfg.minimum_threshold, 3.0);
        assert_eq!(cfg.decay_rate_per_second, 0.05);
        assert_eq!(cfg.k_factor, 32.0);
        assert_eq!(cfg.base_skill_tolerance, 50.0);
        assert_eq!(cfg.skill_relax_rate, 5.0);
    }

    #[test]
    fn test_env_parsed_fallback() {
        // Unset and malformed values both fall back
        assert_eq!(env_parsed("MATCHPOINT_NO_SUCH_VAR", 7u16), 7);
        std::env::set_var("MATCHPOINT_BAD_PORT_TEST", "not-a-number");
        assert_eq!(env_parsed("MATCHPOINT_BAD_PORT_TEST", 7u16), 7);
        std::env::remove_var("MATCHPOINT_BAD_PORT_TEST");
    }
}
