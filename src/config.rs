//! # Configuration Management
//!
//! Centralized configuration for the vote listener.
//!
//! This module provides structured configuration for the listener socket,
//! key material, rate limiting and logging. The engine itself never reads
//! files on its own; the host hands it a [`VotifierConfig`] built from one of
//! the sources below.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Security Considerations
//! - The default 5s read timeout bounds slowloris-style connections
//! - Frame ceiling keeps a hostile V2 length prefix from driving allocation
//! - Token secrets are stored in plain text; protect the file accordingly

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Default listener port used by server lists
pub const DEFAULT_PORT: u16 = 8192;

/// First two bytes of every V2 frame
pub const V2_MAGIC: [u8; 2] = [0x73, 0x3A];

/// Default RSA modulus size for the legacy protocol
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Default ceiling on a V2 frame body
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024;

/// Largest body a u16 length prefix can describe
pub const MAX_ENCODABLE_FRAME_SIZE: usize = u16::MAX as usize;

/// Identifier used when a V2 sender does not name a token
pub const DEFAULT_TOKEN_ID: &str = "default";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct VotifierConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Key material configuration
    #[serde(default)]
    pub keys: KeyConfig,

    /// Per-address flood protection
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl VotifierConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("VOTIFIER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(timeout) = std::env::var("VOTIFIER_CONNECTION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.server.connection_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(flag) = std::env::var("VOTIFIER_DISABLE_V1") {
            if let Ok(val) = flag.parse::<bool>() {
                config.server.disable_v1 = val;
            }
        }

        if let Ok(dir) = std::env::var("VOTIFIER_RSA_DIRECTORY") {
            config.keys.rsa_directory = PathBuf::from(dir);
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

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.keys.validate());
        errors.extend(self.rate_limit.validate());
        errors.extend(self.logging.validate());

        if self.server.disable_v1 && self.keys.tokens.is_empty() && !self.keys.generate_default_token
        {
            errors.push(
                "V1 is disabled and no V2 tokens are configured: no protocol can be served"
                    .to_string(),
            );
        }

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

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8192")
    pub address: String,

    /// Budget for the whole exchange, measured from accept
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Grace period for in-flight handlers on stop
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Maximum number of concurrent connection handlers
    pub max_connections: usize,

    /// Maximum V2 frame body in bytes
    pub max_frame_size: usize,

    /// Refuse the legacy RSA block protocol
    pub disable_v1: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{DEFAULT_PORT}"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            max_connections: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            disable_v1: false,
        }
    }
}

impl ServerConfig {
    /// Validate listener configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.validate_address();
        errors.extend(self.validate_limits());
        errors
    }

    /// Check that `address` is a literal socket address
    pub fn validate_address(&self) -> Vec<String> {
        if self.address.is_empty() {
            vec!["Server address cannot be empty".to_string()]
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            vec![format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8192')",
                self.address
            )]
        } else {
            Vec::new()
        }
    }

    /// Validate timeouts, connection cap and frame size
    pub fn validate_limits(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.shutdown_timeout.as_millis() < 100 {
            errors.push("Shutdown timeout too short (minimum: 100ms)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.max_frame_size < 256 {
            errors.push("Max frame size too small (minimum: 256 bytes)".to_string());
        } else if self.max_frame_size > MAX_ENCODABLE_FRAME_SIZE {
            errors.push(format!(
                "Max frame size {} exceeds the 16-bit length prefix ({MAX_ENCODABLE_FRAME_SIZE})",
                self.max_frame_size
            ));
        }

        errors
    }
}

/// Key material configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Directory holding `public.key` and `private.key`
    pub rsa_directory: PathBuf,

    /// Modulus size used when generating a fresh key pair
    pub key_bits: usize,

    /// Generate and persist a key pair when the directory is empty
    pub generate_missing: bool,

    /// Create a `default` token when none are configured
    pub generate_default_token: bool,

    /// V2 token identifier -> shared secret
    pub tokens: BTreeMap<String, String>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            rsa_directory: PathBuf::from("rsa"),
            key_bits: DEFAULT_KEY_BITS,
            generate_missing: true,
            generate_default_token: true,
            tokens: BTreeMap::new(),
        }
    }
}

impl KeyConfig {
    /// Validate key configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.key_bits < 1024 {
            errors.push(format!(
                "RSA key size too small: {} bits (minimum: 1024)",
                self.key_bits
            ));
        } else if self.key_bits > 8192 {
            errors.push(format!(
                "RSA key size too large: {} bits (maximum: 8192)",
                self.key_bits
            ));
        }

        if self.rsa_directory.as_os_str().is_empty() {
            errors.push("RSA directory cannot be empty".to_string());
        }

        for (id, secret) in &self.tokens {
            if id.is_empty() {
                errors.push("Token identifier cannot be empty".to_string());
            }
            if secret.is_empty() {
                errors.push(format!("Token '{id}' has an empty secret"));
            }
        }

        errors
    }
}

/// Per-source-address flood protection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Fixed counting window
    #[serde(with = "duration_serde")]
    pub window: Duration,

    /// Connections allowed per address per window (0 disables)
    pub max_connections_per_window: u32,

    /// Votes allowed per address per window (0 disables)
    pub max_votes_per_window: u32,

    /// Idle time after which an address entry is forgotten
    #[serde(with = "duration_serde")]
    pub quiet_period: Duration,

    /// Upper bound on tracked addresses
    pub max_tracked_addresses: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_connections_per_window: 30,
            max_votes_per_window: 30,
            quiet_period: Duration::from_secs(300),
            max_tracked_addresses: 10_000,
        }
    }
}

impl RateLimitConfig {
    /// A configuration that never refuses anything
    pub fn unlimited() -> Self {
        Self {
            max_connections_per_window: 0,
            max_votes_per_window: 0,
            ..Self::default()
        }
    }

    /// Validate rate-limit configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.window.as_millis() < 10 {
            errors.push("Rate-limit window too short (minimum: 10ms)".to_string());
        }

        if self.quiet_period < self.window {
            errors.push("Quiet period must be at least as long as the rate-limit window".to_string());
        }

        if self.max_tracked_addresses == 0 {
            errors.push("Max tracked addresses must be greater than 0".to_string());
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

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("votifier"),
            log_level: Level::INFO,
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

        errors
    }
}

/// Helper module for Duration serialization/deserialization
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

/// Helper module for tracing::Level serialization/deserialization
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
