//! # Configuration Management
//!
//! Centralized configuration for servers, clients and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - TOML strings via `from_toml()`
//! - `FRAMELINK_*` environment variables via `from_env()`
//! - Direct instantiation with defaults
//!
//! Durations are written as milliseconds. Reconnect and restart attempt
//! counts use `0` for disabled, `-1` for unbounded and `N` for at most `N`
//! retries after the first attempt.

use crate::error::{ProtocolError, Result};
use crate::transport::proxy::ProxyConfig;
use crate::transport::tls::TlsVersion;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed frame length (16 MB), tag and packet id included.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 3982;

/// Delay between reconnect or restart attempts when none is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Main configuration structure holding every configurable setting
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `FRAMELINK_*` environment variables.
    ///
    /// Unparseable numeric values are reported rather than ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("FRAMELINK_SERVER_ADDRESS") {
            config.server.address = addr;
        }
        if let Some(port) = env_parse::<u16>("FRAMELINK_SERVER_PORT")? {
            config.server.port = port;
        }
        if let Some(attempts) = env_parse::<i32>("FRAMELINK_RESTART_ATTEMPTS")? {
            config.server.max_restart_attempts = attempts;
        }

        if let Ok(host) = std::env::var("FRAMELINK_CLIENT_HOST") {
            config.client.host = host;
        }
        if let Some(port) = env_parse::<u16>("FRAMELINK_CLIENT_PORT")? {
            config.client.port = port;
        }
        if let Some(ms) = env_parse::<u64>("FRAMELINK_CONNECT_TIMEOUT_MS")? {
            config.client.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_parse::<i32>("FRAMELINK_RECONNECT_ATTEMPTS")? {
            config.client.max_reconnect_attempts = attempts;
        }
        if let Some(ms) = env_parse::<u64>("FRAMELINK_RECONNECT_DELAY_MS")? {
            config.client.reconnect_delay = Duration::from_millis(ms);
        }

        if let Ok(level) = std::env::var("FRAMELINK_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common misconfigurations.
    ///
    /// Returns a list of problems. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {name}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn validate_attempts(errors: &mut Vec<String>, field: &str, attempts: i32) {
    if attempts < -1 {
        errors.push(format!(
            "{field} must be -1 (unbounded), 0 (disabled) or a positive count, got {attempts}"
        ));
    }
}

fn validate_delay(errors: &mut Vec<String>, field: &str, attempts: i32, delay: Duration) {
    if attempts != 0 && delay.is_zero() {
        errors.push(format!("{field} must be greater than 0 when retries are enabled"));
    } else if delay.as_secs() > 3600 {
        errors.push(format!("{field} too long (maximum: 1 hour)"));
    }
}

/// Server-side TLS material.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerTlsSettings {
    pub cert_path: String,
    pub key_path: String,

    /// Directory of PEM CA certificates trusted to sign client certificates
    #[serde(default)]
    pub client_ca_dir: Option<String>,

    /// Reject clients that present no certificate
    #[serde(default = "default_true")]
    pub require_client_auth: bool,

    #[serde(default)]
    pub version: TlsVersion,
}

/// Client-side TLS material.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientTlsSettings {
    /// Name the server certificate must be valid for
    pub server_name: String,

    /// Directory of PEM CA certificates trusted to sign the server certificate
    pub ca_dir: String,

    /// Directory holding `cert.pem` and `key.pem` for client authentication
    #[serde(default)]
    pub identity_dir: Option<String>,

    #[serde(default)]
    pub version: TlsVersion,
}

fn default_true() -> bool {
    true
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind (e.g. "0.0.0.0")
    pub address: String,

    /// Port to bind, `0` for an ephemeral port
    pub port: u16,

    /// Bind retries after the first failure (`0` off, `-1` unbounded)
    pub max_restart_attempts: i32,

    #[serde(with = "duration_serde")]
    pub restart_delay: Duration,

    /// Max silence on a connection before it is dropped, `0` to disable
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,

    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    pub nodelay: bool,

    #[serde(default)]
    pub tls: Option<ServerTlsSettings>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("0.0.0.0"),
            port: DEFAULT_PORT,
            max_restart_attempts: 0,
            restart_delay: DEFAULT_RETRY_DELAY,
            read_timeout: Duration::ZERO,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            nodelay: true,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        }

        validate_attempts(&mut errors, "max_restart_attempts", self.max_restart_attempts);
        validate_delay(
            &mut errors,
            "restart_delay",
            self.max_restart_attempts,
            self.restart_delay,
        );

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        if let Some(tls) = &self.tls {
            if tls.cert_path.is_empty() || tls.key_path.is_empty() {
                errors.push("TLS cert_path and key_path must both be set".to_string());
            }
            if tls.require_client_auth && tls.client_ca_dir.is_none() {
                errors.push(
                    "client_ca_dir must be specified when require_client_auth is true".to_string(),
                );
            }
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or address
    pub host: String,

    pub port: u16,

    /// Timeout for each TCP connect attempt
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Max silence on the connection before it is dropped, `0` to disable
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,

    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    pub nodelay: bool,

    /// Connect retries after the first failure (`0` off, `-1` unbounded)
    pub max_reconnect_attempts: i32,

    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,

    /// Refuse to connect without TLS
    #[serde(default)]
    pub require_tls: bool,

    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    #[serde(default)]
    pub tls: Option<ClientTlsSettings>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: DEFAULT_PORT,
            connect_timeout: timeout::CONNECT_TIMEOUT,
            read_timeout: Duration::ZERO,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            nodelay: true,
            max_reconnect_attempts: 0,
            reconnect_delay: DEFAULT_RETRY_DELAY,
            require_tls: false,
            proxy: None,
            tls: None,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push("Client host cannot be empty".to_string());
        }
        if self.port == 0 {
            errors.push("Client port cannot be 0".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }
        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        validate_attempts(
            &mut errors,
            "max_reconnect_attempts",
            self.max_reconnect_attempts,
        );
        validate_delay(
            &mut errors,
            "reconnect_delay",
            self.max_reconnect_attempts,
            self.reconnect_delay,
        );

        if self.require_tls && self.tls.is_none() {
            errors.push("tls must be configured when require_tls is true".to_string());
        }

        if let Some(proxy) = &self.proxy {
            if proxy.address.is_empty() {
                errors.push("Proxy address cannot be empty".to_string());
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub log_to_console: bool,

    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("framelink"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Duration as whole milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// tracing::Level as its lowercase name
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
