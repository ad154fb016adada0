//! Service configuration
//!
//! Loaded from an optional JSON file and overridden by `BROKER__*` environment
//! variables. Secret material (encryption key, binding secret) is read from the
//! environment only and never lives in the config file.

use crate::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "broker.config.json";
pub const ENV_PREFIX: &str = "BROKER";
pub const DEFAULT_MAX_WEBHOOK_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub storage: StorageConfig,
    pub oauth: OAuthConfig,
    pub operations: OperationsConfig,
    pub providers: Vec<ProviderOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Relaxes cookie attributes (no `Secure`, `SameSite=Lax`) for local HTTP
    pub dev_mode: bool,
    /// Where the OAuth callback redirects once a provider is connected
    pub success_redirect_url: Option<String>,
    pub max_webhook_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            dev_mode: false,
            success_redirect_url: None,
            max_webhook_body_bytes: DEFAULT_MAX_WEBHOOK_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub driver: String,
    pub dsn: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            dsn: ".broker/broker.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub state_ttl_minutes: i64,
    pub refresh_skew_seconds: i64,
    pub binding_issuer: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_minutes: 10,
            refresh_skew_seconds: 300,
            binding_issuer: "integration-broker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
    /// Identical runs within this window reuse the cached result (0 disables)
    pub debounce_seconds: u64,
    pub default_timeout_seconds: u64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            debounce_seconds: 30,
            default_timeout_seconds: 30,
        }
    }
}

/// Deployment-specific settings for a built-in provider
///
/// String values may use `$env:NAME` to pull from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOverride {
    pub name: String,
    pub active: Option<bool>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub webhook_secret: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub api_base_url: Option<String>,
    /// App installation page, e.g. `https://github.com/apps/<slug>/installations/new`
    pub install_url: Option<String>,
}

impl Config {
    /// Load configuration from `path` (or the default path) layered under
    /// `BROKER__*` environment overrides
    ///
    /// A missing file is not an error; defaults are used instead. Nested keys
    /// use a double underscore, e.g. `BROKER__HTTP__PORT=9000` or
    /// `BROKER__STORAGE__DSN=/var/lib/broker.db`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
        }
        Self::load_with_env(path, ENV_PREFIX)
    }

    fn load_with_env(path: &Path, env_prefix: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| {
                BrokerError::config(format!(
                    "Failed to load config from {}: {}",
                    path.display(),
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.http.port == 0 {
            return Err(BrokerError::config("http.port must be non-zero"));
        }
        if self.storage.driver != "sqlite" {
            return Err(BrokerError::config(format!(
                "Unknown storage driver: {}. Supported: sqlite",
                self.storage.driver
            )));
        }
        if !(1..=60).contains(&self.oauth.state_ttl_minutes) {
            return Err(BrokerError::config(
                "oauth.state_ttl_minutes must be between 1 and 60",
            ));
        }
        if self.oauth.refresh_skew_seconds < 0 {
            return Err(BrokerError::config(
                "oauth.refresh_skew_seconds must not be negative",
            ));
        }
        if self.operations.default_timeout_seconds == 0 {
            return Err(BrokerError::config(
                "operations.default_timeout_seconds must be non-zero",
            ));
        }
        if self.http.max_webhook_body_bytes == 0 {
            return Err(BrokerError::config(
                "http.max_webhook_body_bytes must be non-zero",
            ));
        }
        Ok(())
    }

    pub fn provider_override(&self, name: &str) -> Option<&ProviderOverride> {
        self.providers.iter().find(|p| p.name == name)
    }
}

/// Expand a `$env:NAME` reference; other values pass through unchanged
///
/// An unset variable expands to `None` so callers can treat the field as absent.
pub fn expand_env_value(value: &str) -> Option<String> {
    match value.strip_prefix("$env:") {
        Some(name) => std::env::var(name).ok().filter(|v| !v.is_empty()),
        None => Some(value.to_string()),
    }
}
