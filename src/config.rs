//! Relay configuration with validation

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::info;

use crate::error::{ConfigurationError, RelayError, Result};

/// How the public listener runs accepted sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Scheduling {
    /// Each session runs to completion before the next accept
    Serial,
    /// One task per session, bounded by `max_connections`
    #[default]
    Parallel,
}

/// Relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub engines: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Public TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Path of the admin Unix socket
    #[serde(default = "default_admin_socket")]
    pub admin_socket: PathBuf,
    #[serde(default = "default_true")]
    pub enable_admin: bool,
    #[serde(default = "default_true")]
    pub enable_public: bool,
    #[serde(default)]
    pub scheduling: Scheduling,
    /// Upper bound on concurrent public sessions in parallel mode
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Scratch directory (system temp dir when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest upload accepted, in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Idle limit per wire read or write (0 = none)
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    /// Limit on one engine run (0 = none)
    #[serde(default = "default_conversion_timeout")]
    pub conversion_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Audio transcoder program
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    /// Office suite program
    #[serde(default = "default_office")]
    pub office: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
}

// Default value functions
fn default_port() -> u16 { 8080 }
fn default_bind_address() -> String { "0.0.0.0".to_string() }
fn default_admin_socket() -> PathBuf { PathBuf::from("/tmp/admin_socket") }
fn default_true() -> bool { true }
fn default_max_connections() -> usize { 50 }
fn default_max_file_size() -> u64 { 100 * 1024 * 1024 } // 100MB
fn default_io_timeout() -> u64 { 300 }
fn default_conversion_timeout() -> u64 { 120 }
fn default_ffmpeg() -> String { "ffmpeg".to_string() }
fn default_office() -> String { "libreoffice".to_string() }
fn default_jpeg_quality() -> u8 { crate::engine::raster::DEFAULT_JPEG_QUALITY }
fn default_audio_bitrate() -> String { crate::engine::audio::DEFAULT_AUDIO_BITRATE.to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            admin_socket: default_admin_socket(),
            enable_admin: default_true(),
            enable_public: default_true(),
            scheduling: Scheduling::default(),
            max_connections: default_max_connections(),
            scratch_dir: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            io_timeout_secs: default_io_timeout(),
            conversion_timeout_secs: default_conversion_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            office: default_office(),
            jpeg_quality: default_jpeg_quality(),
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

/// Per-session limits derived from [`LimitsConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_file_size: u64,
    pub io_timeout: Option<Duration>,
    pub conversion_timeout: Option<Duration>,
}

impl Default for SessionLimits {
    fn default() -> Self {
        LimitsConfig::default().session_limits()
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl LimitsConfig {
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_file_size: self.max_file_size,
            io_timeout: nonzero_secs(self.io_timeout_secs),
            conversion_timeout: nonzero_secs(self.conversion_timeout_secs),
        }
    }
}

impl ServerConfig {
    /// Address the public listener binds
    pub fn public_address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| {
                RelayError::from(ConfigurationError::ValidationFailed {
                    section: "server".to_string(),
                    reason: format!("Invalid bind address '{}': {}", self.bind_address, e),
                })
            })
    }
}

impl Config {
    /// Load configuration from file with validation
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|_| {
            RelayError::Configuration(ConfigurationError::FileNotFound {
                path: path.to_path_buf(),
            })
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            RelayError::Configuration(ConfigurationError::InvalidFormat {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        })?;

        config.validate()?;
        info!("Configuration loaded from: {}", path.display());
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        let content = toml::to_string_pretty(self).map_err(|e| {
            RelayError::Configuration(ConfigurationError::InvalidFormat {
                path: path.to_path_buf(),
                reason: format!("Serialization error: {}", e),
            })
        })?;

        fs::write(path, content).await?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.enable_public {
            if self.server.port == 0 {
                return Err(validation("server", "Port cannot be zero"));
            }
            self.server.public_address()?;
        }

        if self.server.max_connections == 0 {
            return Err(validation("server", "Max connections cannot be zero"));
        }

        if self.limits.max_file_size == 0 {
            return Err(validation("limits", "Max file size cannot be zero"));
        }

        if !(1..=100).contains(&self.engines.jpeg_quality) {
            return Err(validation("engines", "JPEG quality must be between 1 and 100"));
        }

        if self.engines.ffmpeg.trim().is_empty() || self.engines.office.trim().is_empty() {
            return Err(validation("engines", "Engine program cannot be empty"));
        }

        Ok(())
    }

    /// Scratch directory to use
    pub fn scratch_dir(&self) -> PathBuf {
        self.server
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

fn validation(section: &str, reason: &str) -> RelayError {
    RelayError::Configuration(ConfigurationError::ValidationFailed {
        section: section.to_string(),
        reason: reason.to_string(),
    })
}
