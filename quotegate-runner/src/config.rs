//! Gateway configuration.
//!
//! Precedence, lowest first:
//! - built-in defaults
//! - TOML file
//! - environment (`QUOTEGATE_ROOT`, `QUOTEGATE_HOST`, `QUOTEGATE_PORT`)
//! - explicit overrides applied by the caller (CLI flags)

use quotegate_core::connection::{DEFAULT_HOST, DEFAULT_PORT};
use quotegate_core::pump::PumpSettings;
use quotegate_core::query::{MKTDATA_SERVICE, REFDATA_SERVICE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Cache root directory.
pub const ROOT_ENV: &str = "QUOTEGATE_ROOT";
pub const HOST_ENV: &str = "QUOTEGATE_HOST";
pub const PORT_ENV: &str = "QUOTEGATE_PORT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {name}: '{value}'")]
    Env { name: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything the gateway needs to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Cache root; `None` disables the cache and the trial store.
    pub cache_root: Option<PathBuf>,
    /// Days after which date-stamped cache entries are stale.
    pub staleness_days: u32,
    pub poll_interval_ms: u64,
    /// Consecutive empty polls tolerated before a reply is abandoned.
    pub timeout_budget: u32,
    /// Recorded empty fetches after which bar/tick queries are skipped.
    pub trial_limit: u32,
    pub refdata_service: String,
    pub mktdata_service: String,
    pub stream_poll_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cache_root: None,
            staleness_days: 10,
            poll_interval_ms: 500,
            timeout_budget: 10,
            trial_limit: 2,
            refdata_service: REFDATA_SERVICE.to_string(),
            mktdata_service: MKTDATA_SERVICE.to_string(),
            stream_poll_ms: 500,
        }
    }
}

impl GatewayConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults, then the optional file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ROOT_ENV).filter(|s| !s.trim().is_empty()) {
            self.cache_root = Some(PathBuf::from(root));
        }
        if let Some(host) = lookup(HOST_ENV).filter(|s| !s.trim().is_empty()) {
            self.host = host;
        }
        if let Some(port) = lookup(PORT_ENV) {
            self.port = port.trim().parse().map_err(|_| ConfigError::Env {
                name: PORT_ENV,
                value: port.clone(),
            })?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.staleness_days == 0 {
            return Err(ConfigError::Invalid("staleness_days must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 || self.stream_poll_ms == 0 {
            return Err(ConfigError::Invalid("poll intervals must be positive".into()));
        }
        Ok(())
    }

    pub fn pump_settings(&self) -> PumpSettings {
        PumpSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            timeout_budget: self.timeout_budget,
        }
    }

    pub fn stream_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms)
    }
}
