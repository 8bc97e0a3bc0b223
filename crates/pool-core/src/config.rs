//! Frozen runtime configuration.
//!
//! The proxy core never reads environment variables itself beyond process
//! start: `PoolConfig::from_env` builds one immutable snapshot which is then
//! passed by reference into every component that needs it. This replaces the
//! "dynamic option bag read from anywhere" pattern with a single
//! construction point.

use std::env;
use std::time::Duration;

/// Named scheduling policies a caller (or `SCHEDULING_MODE`) may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingMode {
    /// Keep using the active account until it is rate-limited for the model.
    #[default]
    Sticky,
    /// Prefer the account whose earliest applicable reset is soonest.
    RefreshPriority,
    /// Prefer the account with the highest remaining quota.
    DrainHighest,
    /// Rotate through eligible accounts in insertion order.
    RoundRobin,
}

impl SchedulingMode {
    /// Parse one of the four policy names (case-insensitive); unknown values fall back to the default.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "refresh-priority" | "refresh_priority" => Self::RefreshPriority,
            "drain-highest" | "drain_highest" => Self::DrainHighest,
            "round-robin" | "round_robin" => Self::RoundRobin,
            "sticky" => Self::Sticky,
            _ => Self::default(),
        }
    }
}

/// Immutable configuration snapshot, built once at process start.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How many consecutive empty (2xx, zero content blocks) responses to retry before giving up.
    pub max_empty_retries: u32,
    /// Maximum number of `(account, model)` plan attempts per caller-visible request.
    pub max_attempts: u32,
    /// Whether the Auto-Refresh Scheduler starts with the process.
    pub auto_refresh: bool,
    /// Interval between Auto-Refresh Scheduler runs.
    pub auto_refresh_interval: Duration,
    /// Whether a one-shot quota-reset trigger fires at process start.
    pub trigger_reset_on_start: bool,
    /// Default scheduling policy, overridable per request.
    pub scheduling_mode: SchedulingMode,
    /// Whether retrying with a configured fallback model is enabled when every attempt is 5xx.
    pub fallback_enabled: bool,
    /// Non-streaming upstream call deadline.
    pub request_timeout: Duration,
    /// Per-chunk idle timeout for streaming upstream calls.
    pub stream_idle_timeout: Duration,
    /// Token exchange deadline.
    pub token_exchange_timeout: Duration,
    /// Reset-trigger minimal request deadline.
    pub trigger_timeout: Duration,
    /// How long quota snapshot history is kept before the Ledger janitor prunes it.
    pub snapshot_retention: Duration,
    /// Interval between Ledger janitor runs.
    pub snapshot_janitor_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_empty_retries: 2,
            max_attempts: 4,
            auto_refresh: false,
            auto_refresh_interval: Duration::from_secs(5 * 60 * 60),
            trigger_reset_on_start: false,
            scheduling_mode: SchedulingMode::default(),
            fallback_enabled: true,
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(60),
            token_exchange_timeout: Duration::from_secs(30),
            trigger_timeout: Duration::from_secs(15),
            snapshot_retention: Duration::from_secs(24 * 60 * 60),
            snapshot_janitor_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl PoolConfig {
    /// Build a config snapshot from the process environment, falling back to
    /// defaults for anything unset or unparsable. `.env` is loaded first,
    /// best-effort, so a missing file is not an error.
    #[must_use]
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();

        if let Some(v) = env_u32("MAX_EMPTY_RETRIES") {
            cfg.max_empty_retries = v;
        }
        cfg.auto_refresh = env_bool("AUTO_REFRESH");
        cfg.trigger_reset_on_start = env_bool("TRIGGER_RESET");

        // CLI-scoped variable wins over the general one when both are set.
        let mode = env::var("CLI_SCHEDULING_MODE").or_else(|_| env::var("SCHEDULING_MODE")).ok();
        if let Some(mode) = mode {
            cfg.scheduling_mode = SchedulingMode::parse(&mode);
        }

        cfg
    }
}

fn env_bool(key: &str) -> bool {
    env::var(key).map(|v| v == "true").unwrap_or(false)
}

fn env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduling_mode_parses_known_names() {
        assert_eq!(SchedulingMode::parse("drain-highest"), SchedulingMode::DrainHighest);
        assert_eq!(SchedulingMode::parse("ROUND-ROBIN"), SchedulingMode::RoundRobin);
        assert_eq!(SchedulingMode::parse("bogus"), SchedulingMode::Sticky);
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.max_empty_retries, 2);
        assert_eq!(cfg.max_attempts, 4);
        assert!(!cfg.auto_refresh);
    }
}
