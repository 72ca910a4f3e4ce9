// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! RPC client configuration and request timeout normalization.

use std::time::Duration;

use phprt_core::config::parse_var;
use phprt_core::ConfigError;
use serde::Deserialize;

pub const ENV_DEFAULT_TIMEOUT_MS: &str = "PHPRT_RPC_DEFAULT_TIMEOUT_MS";
pub const ENV_MAX_TIMEOUT_MS: &str = "PHPRT_RPC_MAX_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpcConfig {
    /// Used for connections that do not carry their own timeout.
    pub default_timeout_ms: u64,
    /// Requested timeouts above this fall back to the connection default.
    pub max_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 300,
            max_timeout_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl RpcConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(ms) = parse_var(&lookup, ENV_DEFAULT_TIMEOUT_MS)? {
            self.default_timeout_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, ENV_MAX_TIMEOUT_MS)? {
            self.max_timeout_ms = ms;
        }
        Ok(())
    }

    /// Timeout for one request. `requested` is in seconds, as scripts pass
    /// it; non-positive, non-finite or too large values use `fallback`.
    pub fn normalize_timeout(&self, requested: f64, fallback: Duration) -> Duration {
        if !requested.is_finite() || requested <= 0.0 || requested > self.max_timeout().as_secs_f64() {
            return fallback;
        }
        Duration::from_secs_f64(requested)
    }
}
