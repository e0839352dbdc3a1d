use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::maintenance::ThrottleSettings;

/// Crawl-state configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub maintenance: MaintenanceConfig,
}

/// Initial and repeat counts for every table's maintenance throttles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub carrydown_analyze: ThrottleSettings,
    pub hop_deps_analyze: ThrottleSettings,
    pub hop_deps_reindex: ThrottleSettings,
    pub prereq_analyze: ThrottleSettings,
    pub prereq_reindex: ThrottleSettings,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            carrydown_analyze: ThrottleSettings::new(1_000, 30_000),
            hop_deps_analyze: ThrottleSettings::new(1_000, 60_000),
            hop_deps_reindex: ThrottleSettings::new(1_000, 250_000),
            prereq_analyze: ThrottleSettings::new(25_000, 50_000),
            prereq_reindex: ThrottleSettings::new(125_000, 250_000),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("DATABASE_MAX_CONNECTIONS must be a valid number")?,
            maintenance: MaintenanceConfig::from_env()?,
        })
    }
}

impl MaintenanceConfig {
    /// Defaults overridden by `<PREFIX>_INITIAL` / `<PREFIX>_REPEAT` variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            carrydown_analyze: throttle_from_env("CARRYDOWN_ANALYZE", defaults.carrydown_analyze)?,
            hop_deps_analyze: throttle_from_env("HOPDEPS_ANALYZE", defaults.hop_deps_analyze)?,
            hop_deps_reindex: throttle_from_env("HOPDEPS_REINDEX", defaults.hop_deps_reindex)?,
            prereq_analyze: throttle_from_env("PREREQ_ANALYZE", defaults.prereq_analyze)?,
            prereq_reindex: throttle_from_env("PREREQ_REINDEX", defaults.prereq_reindex)?,
        })
    }
}

fn throttle_from_env(prefix: &str, default: ThrottleSettings) -> Result<ThrottleSettings> {
    let read = |suffix: &str, fallback: u64| -> Result<u64> {
        let key = format!("{}_{}", prefix, suffix);
        match env::var(&key) {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("{} must be a valid number", key)),
            Err(_) => Ok(fallback),
        }
    };

    Ok(ThrottleSettings::new(
        read("INITIAL", default.initial)?,
        read("REPEAT", default.repeat)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_table_churn_profiles() {
        let config = MaintenanceConfig::default();
        assert_eq!(config.carrydown_analyze.repeat, 30_000);
        assert!(config.hop_deps_reindex.repeat > config.hop_deps_analyze.repeat);
        assert_eq!(config.prereq_reindex.initial, config.prereq_reindex.repeat / 2);
    }

    #[test]
    fn throttle_override_rejects_garbage() {
        env::set_var("CRAWL_STATE_TEST_BAD_INITIAL", "lots");
        let result = throttle_from_env("CRAWL_STATE_TEST_BAD", ThrottleSettings::new(1, 2));
        assert!(result.is_err());
        env::remove_var("CRAWL_STATE_TEST_BAD_INITIAL");
    }

    #[test]
    fn throttle_override_reads_both_counts() {
        env::set_var("CRAWL_STATE_TEST_OK_INITIAL", "7");
        env::set_var("CRAWL_STATE_TEST_OK_REPEAT", "70");
        let settings =
            throttle_from_env("CRAWL_STATE_TEST_OK", ThrottleSettings::new(1, 2)).unwrap();
        assert_eq!(settings, ThrottleSettings::new(7, 70));
        env::remove_var("CRAWL_STATE_TEST_OK_INITIAL");
        env::remove_var("CRAWL_STATE_TEST_OK_REPEAT");
    }
}
