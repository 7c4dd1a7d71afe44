//! Secure OTA Configuration Module
//! Handles loading and validating ota.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::protocol::HEADER_LEN;

pub const CONFIG_FILE: &str = "ota.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Shared secret is not valid hex: {0}")]
    SecretEncoding(#[from] hex::FromHexError),
    #[error("No shared secret configured")]
    MissingSecret,
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub device: DeviceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_rx_timeout")]
    pub rx_timeout_secs: u64,
    #[serde(default = "default_rx_buffer_len")]
    pub rx_buffer_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_slot_capacity")]
    pub slot_capacity: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub secret_hex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2000
}

fn default_rx_timeout() -> u64 {
    10
}

fn default_rx_buffer_len() -> usize {
    2048
}

fn default_slot_capacity() -> u64 {
    4 * 1024 * 1024
}

fn default_health_timeout() -> u64 {
    30
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            rx_timeout_secs: default_rx_timeout(),
            rx_buffer_len: default_rx_buffer_len(),
        }
    }
}

impl TransportConfig {
    pub fn rx_timeout(&self) -> Duration {
        Duration::from_secs(self.rx_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            slot_capacity: default_slot_capacity(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_health_timeout(),
        }
    }
}

impl AuthConfig {
    /// Decode the configured secret. Length is validated when provisioning.
    pub fn secret(&self) -> Result<Vec<u8>, ConfigError> {
        let encoded = self.secret_hex.as_deref().ok_or(ConfigError::MissingSecret)?;
        Ok(hex::decode(encoded.trim())?)
    }
}

impl Config {
    pub fn path(device_dir: &Path) -> PathBuf {
        device_dir.join(CONFIG_FILE)
    }

    pub fn load(device_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = Self::path(device_dir);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the device cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.rx_buffer_len < HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "transport.rx_buffer_len must be at least {} bytes, got {}",
                HEADER_LEN, self.transport.rx_buffer_len
            )));
        }
        if self.transport.rx_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "transport.rx_timeout_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn save(&self, device_dir: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(device_dir), content)?;
        Ok(())
    }

    pub fn default_for_device(name: &str, secret: &[u8]) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            device: DeviceConfig {
                name: name.to_string(),
                log_filter: default_log_filter(),
            },
            transport: TransportConfig::default(),
            storage: StorageConfig::default(),
            auth: AuthConfig {
                secret_hex: Some(hex::encode(secret)),
            },
            health: HealthConfig::default(),
        }
    }
}

/// Platform data directory used when no device directory is given
pub fn default_device_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("secure-ota"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_round_trip() {
        let dir = tempdir().unwrap();
        let config = Config::default_for_device("bench-unit", b"psk-bytes");
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.device.name, "bench-unit");
        assert_eq!(loaded.transport.port, 2000);
        assert_eq!(loaded.auth.secret().unwrap(), b"psk-bytes".to_vec());
    }

    #[test]
    fn test_missing_config() {
        let dir = tempdir().unwrap();
        assert!(matches!(Config::load(dir.path()), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sections_default_when_omitted() {
        let dir = tempdir().unwrap();
        std::fs::write(
            Config::path(dir.path()),
            r#"{ "version": "0.1.0", "device": { "name": "minimal" } }"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.transport.rx_timeout(), Duration::from_secs(10));
        assert_eq!(config.transport.rx_buffer_len, 2048);
        assert_eq!(config.device.log_filter, "info");
        assert!(config.health.command.is_none());
        assert!(matches!(config.auth.secret(), Err(ConfigError::MissingSecret)));
    }

    #[test]
    fn test_bad_secret_hex() {
        let auth = AuthConfig {
            secret_hex: Some("zz".to_string()),
        };
        assert!(matches!(auth.secret(), Err(ConfigError::SecretEncoding(_))));
    }

    #[test]
    fn test_rx_buffer_must_hold_header() {
        let dir = tempdir().unwrap();
        let mut config = Config::default_for_device("tiny-buffer", b"psk");
        config.transport.rx_buffer_len = HEADER_LEN - 1;
        config.save(dir.path()).unwrap();
        assert!(matches!(Config::load(dir.path()), Err(ConfigError::Invalid(_))));

        config.transport.rx_buffer_len = HEADER_LEN;
        config.save(dir.path()).unwrap();
        assert!(Config::load(dir.path()).is_ok());
    }

    #[test]
    fn test_legacy_nonce_len_ignored() {
        let dir = tempdir().unwrap();
        std::fs::write(
            Config::path(dir.path()),
            r#"{ "version": "0.1.0", "device": { "name": "old" },
                 "auth": { "secret_hex": "0a0b", "nonce_len": 0 } }"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.auth.secret().unwrap(), vec![0x0a, 0x0b]);
    }
}
