use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::feed::id::{AGGREGATED_PREFIX, NOTIFICATION_PREFIX};
use crate::followship::TierThresholds;

/// Tunables the engine components take. Built from `Config` by the binary;
/// tests construct it directly.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Probability of trimming a feed after a mutation (0.0 to 1.0).
    pub trim_chance: f64,
    /// maxLength given to lazily created flat feeds.
    pub default_max_length: Option<u32>,
    /// Upper bound on activities per aggregation bucket.
    pub max_aggregated_length: u32,
    /// Number of activities backfilled on follow.
    pub follow_limit: usize,
    /// Followers per fan-out page.
    pub fanout_page_size: usize,
    /// When true, unfollow keeps the copied activities unless told otherwise.
    pub keep_history: bool,
    pub tier_thresholds: TierThresholds,
    pub aggregated_prefix: String,
    pub notification_prefix: String,
    /// How long a claimed job stays locked before another worker may take it.
    pub lock_lifetime_secs: i64,
    /// Claims after which a failing job is given up on.
    pub max_job_attempts: u32,
    /// Idle sleep between empty queue polls.
    pub worker_poll_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            trim_chance: 0.01,
            default_max_length: Some(1000),
            max_aggregated_length: 15,
            follow_limit: 500,
            fanout_page_size: 100,
            keep_history: false,
            tier_thresholds: TierThresholds::default(),
            aggregated_prefix: AGGREGATED_PREFIX.to_string(),
            notification_prefix: NOTIFICATION_PREFIX.to_string(),
            lock_lifetime_secs: 300,
            max_job_attempts: 5,
            worker_poll_ms: 500,
        }
    }
}

/// Central configuration loaded from environment variables.
///
/// The .env file is loaded automatically at startup via dotenvy. Every
/// value has a default, so an empty environment gives a working SQLite
/// setup in the current directory.
pub struct Config {
    pub db_path: String,
    /// PostgreSQL connection URL (when set and starts with postgres://, uses Postgres backend)
    pub database_url: Option<String>,
    pub engine: EngineSettings,
}

/// Read and parse a variable, falling back to `default` when unset or empty.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value: {raw}")),
        _ => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        let defaults = EngineSettings::default();

        let trim_chance: f64 = env_or("FEEDMILL_TRIM_CHANCE", defaults.trim_chance)?;
        if !(0.0..=1.0).contains(&trim_chance) {
            anyhow::bail!("FEEDMILL_TRIM_CHANCE must be between 0 and 1, got {trim_chance}");
        }

        // 0 disables trimming for new feeds
        let max_length: u32 = env_or("FEEDMILL_MAX_LENGTH", 1000)?;

        let max_aggregated_length: u32 =
            env_or("FEEDMILL_MAX_AGGREGATED_LENGTH", defaults.max_aggregated_length)?;
        if max_aggregated_length == 0 {
            anyhow::bail!("FEEDMILL_MAX_AGGREGATED_LENGTH must be at least 1");
        }

        let fanout_page_size: usize =
            env_or("FEEDMILL_FANOUT_PAGE_SIZE", defaults.fanout_page_size)?;
        if fanout_page_size == 0 {
            anyhow::bail!("FEEDMILL_FANOUT_PAGE_SIZE must be at least 1");
        }

        let tier_thresholds = match env::var("FEEDMILL_TIER_THRESHOLDS") {
            Ok(raw) if !raw.trim().is_empty() => TierThresholds::parse(&raw)
                .with_context(|| "FEEDMILL_TIER_THRESHOLDS is invalid")?,
            _ => defaults.tier_thresholds,
        };

        let engine = EngineSettings {
            trim_chance,
            default_max_length: (max_length > 0).then_some(max_length),
            max_aggregated_length,
            follow_limit: env_or("FEEDMILL_FOLLOW_LIMIT", defaults.follow_limit)?,
            fanout_page_size,
            keep_history: env_or("FEEDMILL_KEEP_HISTORY", defaults.keep_history)?,
            tier_thresholds,
            aggregated_prefix: env::var("FEEDMILL_AGGREGATED_PREFIX")
                .unwrap_or(defaults.aggregated_prefix),
            notification_prefix: env::var("FEEDMILL_NOTIFICATION_PREFIX")
                .unwrap_or(defaults.notification_prefix),
            lock_lifetime_secs: env_or("FEEDMILL_LOCK_LIFETIME_SECS", defaults.lock_lifetime_secs)?,
            max_job_attempts: env_or("FEEDMILL_MAX_JOB_ATTEMPTS", defaults.max_job_attempts)?,
            worker_poll_ms: env_or("FEEDMILL_WORKER_POLL_MS", defaults.worker_poll_ms)?,
        };

        Ok(Self {
            db_path: env::var("FEEDMILL_DB_PATH").unwrap_or_else(|_| "./feedmill.db".to_string()),
            database_url: env::var("DATABASE_URL").ok(),
            engine,
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        self.engine.clone()
    }

    /// Human-readable backend description for `status`.
    pub fn backend_label(&self) -> String {
        match &self.database_url {
            Some(url) if crate::db::is_postgres_url(url) => "PostgreSQL".to_string(),
            _ => format!("SQLite ({})", self.db_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_defaults_when_unset() {
        let value: u32 = env_or("FEEDMILL_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        // Process-wide env; the name is unique to this test
        env::set_var("FEEDMILL_TEST_GARBAGE_NUMBER", "twelve");
        let result: Result<u32> = env_or("FEEDMILL_TEST_GARBAGE_NUMBER", 1);
        assert!(result.is_err());
        env::remove_var("FEEDMILL_TEST_GARBAGE_NUMBER");
    }

    #[test]
    fn test_default_settings_match_documented_values() {
        let s = EngineSettings::default();
        assert_eq!(s.trim_chance, 0.01);
        assert_eq!(s.max_aggregated_length, 15);
        assert_eq!(s.follow_limit, 500);
        assert_eq!(s.tier_thresholds, TierThresholds::default());
    }
}
