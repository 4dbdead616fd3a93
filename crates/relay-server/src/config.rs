use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Invalid(String),
}

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_MAX_TUNNELS: usize = 100;

/// Relay server settings. Loaded from a TOML file, then overridden by
/// `RELAY_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerSettings {
    /// Base domain under which tunnels are published, e.g. `tun.example.com`.
    pub domain: String,
    /// Shared-secret allow-list for tunnel registration.
    pub secret_keys: Vec<String>,
    pub port: u16,
    /// Seconds an in-flight request may wait for its tunnel reply.
    pub request_timeout: u64,
    /// Bytes; request bodies beyond this are answered 413 without forwarding.
    pub max_body_size: usize,
    /// Admission cap on simultaneous tunnels.
    pub max_tunnels: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            domain: String::new(),
            secret_keys: Vec::new(),
            port: 8080,
            request_timeout: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_tunnels: DEFAULT_MAX_TUNNELS,
        }
    }
}

impl ServerSettings {
    /// Load settings from a TOML file if present, falling back to defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = config_path.unwrap_or_else(|| Path::new("relay.toml"));
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `RELAY_*` environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        if let Ok(domain) = std::env::var("RELAY_DOMAIN") {
            self.domain = domain;
        }
        if let Ok(keys) = std::env::var("RELAY_SECRET_KEYS") {
            self.secret_keys = keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }
        if let Ok(Ok(port)) = std::env::var("RELAY_PORT").map(|p| p.parse()) {
            self.port = port;
        }
        if let Ok(Ok(secs)) = std::env::var("RELAY_REQUEST_TIMEOUT").map(|s| s.parse()) {
            self.request_timeout = secs;
        }
        if let Ok(Ok(bytes)) = std::env::var("RELAY_MAX_BODY_SIZE").map(|s| s.parse()) {
            self.max_body_size = bytes;
        }
        if let Ok(Ok(count)) = std::env::var("RELAY_MAX_TUNNELS").map(|s| s.parse()) {
            self.max_tunnels = count;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::Invalid("domain is required".to_string()));
        }
        if self.secret_keys.is_empty() {
            return Err(ConfigError::Invalid(
                "secret-keys must contain at least one key".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Public URL under which a subdomain is reachable.
    pub fn public_url(&self, subdomain: &str) -> String {
        format!("https://{subdomain}.{}", self.domain)
    }
}
