//! Client configuration: CLI overrides environment overrides properties
//! files overrides defaults.
//!
//! Properties files are searched in order: `./application.properties`,
//! `~/.relay/config.properties`, `/etc/relay/config.properties`. For each
//! key, the first file that defines it wins.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid port '{0}': expected a number between 1 and 65535")]
    InvalidPort(String),

    #[error("Invalid subdomain '{0}': use lowercase letters, digits and inner hyphens (max 63 chars)")]
    InvalidSubdomain(String),

    #[error("Missing required option: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Errors only (`-q`).
    Quiet,
    Normal,
    /// Debug output (`-v`).
    Verbose,
}

impl LogLevel {
    /// Both flags given: quiet wins.
    pub fn from_flags(quiet: bool, verbose: bool) -> Option<Self> {
        match (quiet, verbose) {
            (true, _) => Some(LogLevel::Quiet),
            (false, true) => Some(LogLevel::Verbose),
            (false, false) => None,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "quiet" | "error" => Some(LogLevel::Quiet),
            "info" | "normal" => Some(LogLevel::Normal),
            "verbose" | "debug" => Some(LogLevel::Verbose),
            _ => None,
        }
    }
}

/// Fully resolved and validated client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub port: u16,
    pub server: String,
    pub secret_key: String,
    pub subdomain: Option<String>,
    pub insecure: bool,
    pub log_level: LogLevel,
    pub reconnect: bool,
}

impl ClientConfig {
    /// Origin the tunnel replays traffic against.
    pub fn local_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// Upstream tunnel endpoint, secret and requested subdomain included.
    pub fn server_url(&self) -> String {
        let scheme = if self.insecure { "ws" } else { "wss" };
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("secret", &self.secret_key);
        if let Some(subdomain) = &self.subdomain {
            query.append_pair("subdomain", subdomain);
        }
        format!("{scheme}://{}/ws?{}", self.server, query.finish())
    }

    /// Upstream endpoint without credentials, for log lines.
    pub fn display_url(&self) -> String {
        let scheme = if self.insecure { "ws" } else { "wss" };
        format!("{scheme}://{}/ws", self.server)
    }
}

/// One source's worth of options. Sources merge with "self wins".
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub port: Option<String>,
    pub server: Option<String>,
    pub key: Option<String>,
    pub subdomain: Option<String>,
    pub insecure: Option<bool>,
    pub reconnect: Option<bool>,
    pub log_level: Option<LogLevel>,
}

impl Overrides {
    /// Layer `lower`-priority values underneath this source.
    pub fn or(mut self, lower: Overrides) -> Overrides {
        self.port = self.port.or(lower.port);
        self.server = self.server.or(lower.server);
        self.key = self.key.or(lower.key);
        self.subdomain = self.subdomain.or(lower.subdomain);
        self.insecure = self.insecure.or(lower.insecure);
        self.reconnect = self.reconnect.or(lower.reconnect);
        self.log_level = self.log_level.or(lower.log_level);
        self
    }

    pub fn from_env() -> Overrides {
        Overrides {
            port: std::env::var("RELAY_PORT").ok(),
            server: std::env::var("RELAY_SERVER").ok(),
            key: std::env::var("RELAY_KEY").ok(),
            subdomain: std::env::var("RELAY_SUBDOMAIN").ok(),
            insecure: std::env::var("RELAY_INSECURE").ok().map(|v| parse_bool(&v)),
            reconnect: std::env::var("RELAY_RECONNECT").ok().map(|v| parse_bool(&v)),
            log_level: std::env::var("RELAY_LOG_LEVEL")
                .ok()
                .and_then(|v| LogLevel::parse(&v)),
        }
    }

    pub fn from_files() -> Overrides {
        Self::from_files_at(&search_paths())
    }

    fn from_files_at(paths: &[PathBuf]) -> Overrides {
        let mut merged = Overrides::default();
        for path in paths {
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };
            merged = merged.or(Overrides::from_properties(&parse_properties(&content)));
        }
        merged
    }

    pub fn from_properties(properties: &HashMap<String, String>) -> Overrides {
        Overrides {
            port: properties.get("port").cloned(),
            server: properties.get("server").cloned(),
            key: properties.get("key").cloned(),
            subdomain: properties.get("subdomain").cloned(),
            insecure: properties.get("insecure").map(|v| parse_bool(v)),
            reconnect: properties.get("reconnect.enabled").map(|v| parse_bool(v)),
            log_level: properties.get("log-level").and_then(|v| LogLevel::parse(v)),
        }
    }

    /// Validate and produce the final configuration.
    pub fn resolve(self) -> Result<ClientConfig, ConfigError> {
        let port_raw = self.port.ok_or(ConfigError::Missing("<port>"))?;
        let port = match port_raw.trim().parse::<i64>() {
            Ok(port) if (1..=65535).contains(&port) => port as u16,
            _ => return Err(ConfigError::InvalidPort(port_raw)),
        };

        let server = self
            .server
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("--server"))?;
        let secret_key = self
            .key
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::Missing("--key"))?;

        let subdomain = self.subdomain.filter(|s| !s.is_empty());
        if let Some(subdomain) = &subdomain {
            if !is_valid_subdomain(subdomain) {
                return Err(ConfigError::InvalidSubdomain(subdomain.clone()));
            }
        }

        Ok(ClientConfig {
            port,
            server,
            secret_key,
            subdomain,
            insecure: self.insecure.unwrap_or(false),
            log_level: self.log_level.unwrap_or(LogLevel::Normal),
            reconnect: self.reconnect.unwrap_or(true),
        })
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("application.properties")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".relay").join("config.properties"));
    }
    paths.push(PathBuf::from("/etc/relay/config.properties"));
    paths
}

/// Minimal properties parser: `key=value` lines, `#`/`!` comments.
pub fn parse_properties(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

/// DNS-label shape: lowercase alphanumeric edges, inner hyphens, max 63.
pub fn is_valid_subdomain(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let only_allowed = label
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    only_allowed && !label.starts_with('-') && !label.ends_with('-')
}
