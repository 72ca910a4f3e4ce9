// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Engine configuration.
//!
//! Defaults, a JSON form, and `PHPRT_*` environment overrides applied on
//! top of either.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const ENV_SCHEDULER_BUDGET: &str = "PHPRT_SCHEDULER_BUDGET";
pub const ENV_MAX_WAIT_SLICE_MS: &str = "PHPRT_MAX_WAIT_SLICE_MS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Ready records processed per scheduler tick before control goes back
    /// to the timer and network layers. Result propagation up a chain is
    /// not counted.
    pub scheduler_budget: usize,
    /// Longest single network poll while a synchronous wait is blocked.
    pub max_wait_slice_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler_budget: 1000,
            max_wait_slice_ms: 100,
        }
    }
}

impl RuntimeConfig {
    /// Effective scheduler budget; a configured 0 still lets one record
    /// through per tick.
    pub fn budget(&self) -> usize {
        self.scheduler_budget.max(1)
    }

    pub fn max_wait_slice(&self) -> Duration {
        Duration::from_millis(self.max_wait_slice_ms)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults with process environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Override fields from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(budget) = parse_var::<usize>(&lookup, ENV_SCHEDULER_BUDGET)? {
            self.scheduler_budget = budget;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_MAX_WAIT_SLICE_MS)? {
            self.max_wait_slice_ms = ms;
        }
        Ok(())
    }
}

/// Read and parse one numeric variable. Unset is `Ok(None)`.
pub fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
        })
}
