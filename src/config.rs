//! Configuration management for Ratewarden.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

/// Prefix for environment overrides, e.g. `RATEWARDEN__API__TOKEN`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for a Ratewarden client session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Remote API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Remote API configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL without the version segment
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API version, appended as `/v{version}`
    #[serde(default = "default_version")]
    pub version: u32,

    /// Bot token sent as `Authorization: Bot {token}`
    #[serde(default)]
    pub token: Option<String>,

    /// User agent for outbound requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Deadline for a whole logical request, waits included
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            version: default_version(),
            token: None,
            user_agent: default_user_agent(),
            request_timeout_ms: None,
        }
    }
}

fn default_base_url() -> String {
    "https://discord.com/api".to_string()
}

fn default_version() -> u32 {
    10
}

fn default_user_agent() -> String {
    format!("ratewarden/{}", env!("CARGO_PKG_VERSION"))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Attempts per logical request before giving up on 429s
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lockout applied for a global 429 without a retry hint, in milliseconds
    #[serde(default = "default_global_fallback")]
    pub global_fallback_retry_after_ms: u64,

    /// How often stale buckets are pruned, in seconds
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,

    /// How long after its reset a bucket is kept, in seconds
    #[serde(default = "default_prune_grace")]
    pub prune_grace_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            global_fallback_retry_after_ms: default_global_fallback(),
            prune_interval_secs: default_prune_interval(),
            prune_grace_secs: default_prune_grace(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_global_fallback() -> u64 {
    1000
}

fn default_prune_interval() -> u64 {
    60
}

fn default_prune_grace() -> u64 {
    300
}

impl RateLimitingConfig {
    pub fn global_fallback(&self) -> Duration {
        Duration::from_millis(self.global_fallback_retry_after_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn prune_grace(&self) -> Duration {
        Duration::from_secs(self.prune_grace_secs)
    }
}

impl WardenConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig =
            serde_yaml::from_str(yaml).map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, layered under
    /// `RATEWARDEN__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config: WardenConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WardenError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the client unusable.
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(WardenError::Config("api.base_url must not be empty".to_string()));
        }
        if self.rate_limiting.max_attempts == 0 {
            return Err(WardenError::Config(
                "rate_limiting.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.rate_limiting.prune_interval_secs == 0 {
            return Err(WardenError::Config(
                "rate_limiting.prune_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// `{base_url}/v{version}`
    pub fn api_root(&self) -> String {
        format!("{}/v{}", self.api.base_url.trim_end_matches('/'), self.api.version)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.api.request_timeout_ms.map(Duration::from_millis)
    }
}
