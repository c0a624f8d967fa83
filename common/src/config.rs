use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame::FrameGeometry;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Agreed frame dimensions. Both peers must be configured identically;
/// nothing on the wire carries them.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_channels")]
    pub channels: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Prefix frames with a sequence number and echo it in results.
    /// `false` speaks the legacy headerless protocol.
    #[serde(default = "default_sequenced")]
    pub sequenced: bool,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
    #[serde(default = "default_client_timeout_ms")]
    pub capture_timeout_ms: u64,
    #[serde(default = "default_client_timeout_ms")]
    pub result_timeout_ms: u64,
    /// 0 means unbounded.
    #[serde(default)]
    pub uplink_queue_capacity: usize,
    /// 0 means unbounded.
    #[serde(default)]
    pub retained_queue_capacity: usize,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            channels: default_channels(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            sequenced: default_sequenced(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: default_send_interval_ms(),
            capture_timeout_ms: default_client_timeout_ms(),
            result_timeout_ms: default_client_timeout_ms(),
            uplink_queue_capacity: 0,
            retained_queue_capacity: 0,
            output_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise fall back to the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame.channels != 3 {
            return Err(ConfigError::Invalid(format!(
                "frame.channels must be 3, got {}",
                self.frame.channels
            )));
        }
        if self.frame.width == 0 || self.frame.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame dimensions must be non-zero, got {}x{}",
                self.frame.width, self.frame.height
            )));
        }
        if self.protocol.max_message_bytes == 0 {
            return Err(ConfigError::Invalid(
                "protocol.max_message_bytes must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.frame.width, self.frame.height)
    }
}

impl ClientConfig {
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }
}

impl ServerConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    360
}
fn default_channels() -> u32 {
    3
}
fn default_sequenced() -> bool {
    true
}
fn default_max_message_bytes() -> u64 {
    16 * 1024 * 1024
}
fn default_send_interval_ms() -> u64 {
    10
}
fn default_client_timeout_ms() -> u64 {
    2000
}
fn default_bind_addr() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    54321
}
fn default_queue_timeout_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".into()
}
