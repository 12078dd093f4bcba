//! Configuration management for Windowkeeper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{LimiterError, Result};

/// Main configuration for the Windowkeeper binary and embedders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Limiter defaults applied to every route
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Hit store selection
    #[serde(default)]
    pub store: StoreConfig,

    /// Named route-level overrides, merged over `limiter`
    #[serde(default)]
    pub routes: HashMap<String, LimiterOverrides>,
}

/// Sliding window limiter configuration.
///
/// Immutable once a [`RateLimiter`](crate::ratelimit::RateLimiter) has been
/// built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Length of the sliding window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Maximum hits admitted per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Whether requests that end in a failure outcome keep their hit
    #[serde(default = "default_true")]
    pub count_failed: bool,

    /// Whether requests that end in a success outcome keep their hit
    #[serde(default = "default_true")]
    pub count_successful: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            limit: default_limit(),
            count_failed: true,
            count_successful: true,
        }
    }
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_limit() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

impl LimiterConfig {
    /// Reject configurations that could never admit or never expire.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(LimiterError::Configuration(
                "window_ms must be a positive number of milliseconds".to_string(),
            ));
        }
        if self.limit == 0 {
            return Err(LimiterError::Configuration(
                "limit must be a positive number of hits".to_string(),
            ));
        }
        Ok(())
    }

    /// Merge route-level overrides over these defaults.
    pub fn with_overrides(&self, overrides: &LimiterOverrides) -> LimiterConfig {
        LimiterConfig {
            window_ms: overrides.window_ms.unwrap_or(self.window_ms),
            limit: overrides.limit.unwrap_or(self.limit),
            count_failed: overrides.count_failed.unwrap_or(self.count_failed),
            count_successful: overrides.count_successful.unwrap_or(self.count_successful),
        }
    }
}

/// Per-route overrides of [`LimiterConfig`]. Unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterOverrides {
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub count_failed: Option<bool>,
    #[serde(default)]
    pub count_successful: Option<bool>,
}

/// Which hit store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

/// Hit store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Connection URL for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace prefix for keys persisted remotely
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_key_prefix() -> String {
    "rl:".to_string()
}

impl AppConfig {
    /// Load configuration from an optional file, layered under
    /// `WINDOWKEEPER__*` environment variables.
    ///
    /// `WINDOWKEEPER__LIMITER__LIMIT=10` overrides `limiter.limit`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("WINDOWKEEPER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app: AppConfig = config.try_deserialize()?;
        app.limiter.validate()?;
        Ok(app)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let app: AppConfig = serde_yaml::from_str(yaml)?;
        app.limiter.validate()?;
        Ok(app)
    }

    /// Resolve the limiter configuration for a named route.
    ///
    /// Unknown routes get the defaults.
    pub fn limiter_for(&self, route: Option<&str>) -> LimiterConfig {
        match route.and_then(|name| self.routes.get(name)) {
            Some(overrides) => self.limiter.with_overrides(overrides),
            None => self.limiter.clone(),
        }
    }
}
