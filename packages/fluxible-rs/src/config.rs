use std::env;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::timing::DEFAULT_TIMING_CAPACITY;

/// Application-wide switches, shared by every context an app creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Emit development warnings (cascading executeAction, component callbacks).
    pub dev_warnings: bool,
    /// Record an [`ActionTiming`](crate::ActionTiming) for every action.
    pub action_timing: bool,
    /// Timing entries retained per context.
    pub timing_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev_warnings: cfg!(debug_assertions),
            action_timing: false,
            timing_capacity: DEFAULT_TIMING_CAPACITY,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// - `FLUXIBLE_DEV_WARNINGS` (bool, defaults to debug build)
    /// - `FLUXIBLE_ACTION_TIMING` (bool, defaults to false)
    /// - `FLUXIBLE_TIMING_CAPACITY` (integer, defaults to 1000)
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            dev_warnings: env_flag("FLUXIBLE_DEV_WARNINGS", defaults.dev_warnings)?,
            action_timing: env_flag("FLUXIBLE_ACTION_TIMING", defaults.action_timing)?,
            timing_capacity: match env::var("FLUXIBLE_TIMING_CAPACITY") {
                Ok(raw) => raw
                    .trim()
                    .parse()
                    .context("FLUXIBLE_TIMING_CAPACITY must be a non-negative integer")?,
                Err(_) => defaults.timing_capacity,
            },
        })
    }
}

fn env_flag(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => parse_flag(&raw).with_context(|| format!("{name} must be a boolean")),
        Err(_) => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("unrecognized flag value {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1").unwrap());
        assert!(parse_flag(" TRUE ").unwrap());
        assert!(parse_flag("on").unwrap());
        assert!(!parse_flag("no").unwrap());
        assert!(!parse_flag("0").unwrap());
        assert!(parse_flag("maybe").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.dev_warnings, cfg!(debug_assertions));
        assert!(!config.action_timing);
        assert_eq!(config.timing_capacity, DEFAULT_TIMING_CAPACITY);
    }

    #[test]
    fn test_unset_flag_uses_default() {
        assert!(env_flag("FLUXIBLE_TEST_FLAG_THAT_IS_NEVER_SET", true).unwrap());
    }
}
