//! Configuration system for Keel
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/com.keel.keel/config.toml
//! - Linux: ~/.config/keel/config.toml
//! - Windows: %APPDATA%/keel/keel/config/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::DEFAULT_PORT;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Driver settings (connection cache, retry policy, session identity)
    pub driver: DriverConfig,
    /// Network settings for the QUIC transport
    pub network: NetworkConfig,
    /// Reference store server settings
    pub store: StoreConfig,
}

/// Driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Port appended to host names given without one
    pub default_port: u16,
    /// Cached connections unused for this long are replaced
    pub idle_timeout_secs: u64,
    /// Overall deadline for one driver call, retries included
    pub retry_budget_secs: u64,
    /// First backoff delay after the immediate retry
    pub min_delay_secs: u64,
    /// Backoff delay cap
    pub max_delay_secs: u64,
    /// Log a "still trying" notice once this many retries have elapsed
    pub notice_after: u32,
    /// Credential file (default: ~/.keel/credentials)
    pub credential_file: Option<PathBuf>,
    /// User to log in as (default: $USER)
    pub user: Option<String>,
    /// Zone reported in the session environment
    pub zone: String,
    /// Resource new objects are created on
    pub default_resource: Option<String>,
    /// Chunk size for whole-file transfers
    pub transfer_chunk_bytes: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_PORT,
            idle_timeout_secs: 300,    // 5 minutes
            retry_budget_secs: 150,
            min_delay_secs: 1,
            max_delay_secs: 60,
            notice_after: 2,
            credential_file: None,
            user: None,
            zone: "keel".into(),
            default_resource: None,
            transfer_chunk_bytes: 1024 * 1024, // 1MB
        }
    }
}

impl DriverConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Effective credential file location
    ///
    /// `None` when no path is configured and no home directory is known.
    pub fn credential_path(&self) -> Option<PathBuf> {
        self.credential_file.clone().or_else(Self::default_credential_path)
    }

    /// Default credential file: `$HOME/.keel/credentials`
    pub fn default_credential_path() -> Option<PathBuf> {
        directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".keel").join("credentials"))
    }

    /// Effective login user
    pub fn user_name(&self) -> Option<String> {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .filter(|user| !user.is_empty())
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Keep-alive interval in seconds
    pub keepalive_secs: u64,
    /// Transport idle timeout in seconds
    pub idle_timeout_secs: u64,
    /// TLS server name presented when connecting
    pub server_name: String,
    /// Hex BLAKE3 fingerprint of the store certificate (skip verification if unset)
    pub cert_fingerprint: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            keepalive_secs: 25,
            idle_timeout_secs: 120,
            server_name: "localhost".into(),
            cert_fingerprint: None,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Reference store server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Listen port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Directory served as the collection store
    pub root: Option<PathBuf>,
    /// File holding the shared login secret
    pub secret_file: Option<PathBuf>,
    /// Maximum concurrent client connections
    pub max_connections: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            root: None,
            secret_file: None,
            max_connections: 64,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_or_default(&path),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load from `path`, falling back to defaults on any error
    pub fn load_or_default(path: &Path) -> Self {
        Self::load_from(path).unwrap_or_else(|e| {
            warn!("Failed to load config from {:?}: {}, using defaults", path, e);
            Self::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "keel", "keel")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
