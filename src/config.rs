//! Device configuration loaded from TOML
//!
//! Credentials are referenced through environment variable names; TLS
//! material is given either inline (PEM text) or as a file path.

use crate::protocol::{validate_device_id, validate_identity};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main device configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    /// TLS material (optional)
    #[serde(default)]
    pub tls: Option<TlsSection>,
    #[serde(default)]
    pub management: ManagementSection,
}

/// Device identity section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier, also used as the MQTT client id (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Device type used to compose application event topics
    pub device_type: Option<String>,
    /// Pull configuration from the management service once managed
    #[serde(default)]
    pub initial_load: bool,
}

/// MQTT connection section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds (default: 60)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_keep_alive() -> u64 {
    60
}

/// Management protocol tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagementSection {
    /// Deadline for device-initiated requests such as LOADCONFIG
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout_secs: u64,
}

fn default_transaction_timeout() -> u64 {
    60
}

impl Default for ManagementSection {
    fn default() -> Self {
        Self {
            transaction_timeout_secs: default_transaction_timeout(),
        }
    }
}

impl ManagementSection {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }
}

/// TLS material, each item inline or by path but never both
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    pub ca: Option<String>,
    pub ca_path: Option<PathBuf>,
    pub cert: Option<String>,
    pub cert_path: Option<PathBuf>,
    pub key: Option<String>,
    pub key_path: Option<PathBuf>,
}

/// Loaded TLS material ready for the transport
#[derive(Debug, Clone, PartialEq)]
pub struct TlsMaterial {
    pub ca: Vec<u8>,
    /// Client certificate and private key for mutual TLS
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsSection {
    /// Load the configured material
    ///
    /// A CA alone gives server-authenticated TLS, CA plus certificate plus key
    /// gives mutual TLS, and no material at all yields `None`.
    pub fn resolve(&self) -> Result<Option<TlsMaterial>, ConfigError> {
        let ca = choose_inline_or_file("ca", self.ca.as_ref(), self.ca_path.as_ref())?;
        let cert = choose_inline_or_file("cert", self.cert.as_ref(), self.cert_path.as_ref())?;
        let key = choose_inline_or_file("key", self.key.as_ref(), self.key_path.as_ref())?;

        let client_auth = match (cert, key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingOption("key".to_string())),
            (None, Some(_)) => return Err(ConfigError::MissingOption("cert".to_string())),
        };

        match (ca, client_auth) {
            (Some(ca), client_auth) => Ok(Some(TlsMaterial { ca, client_auth })),
            (None, Some(_)) => Err(ConfigError::MissingOption("ca".to_string())),
            (None, None) => Ok(None),
        }
    }
}

fn choose_inline_or_file(
    name: &str,
    inline: Option<&String>,
    path: Option<&PathBuf>,
) -> Result<Option<Vec<u8>>, ConfigError> {
    match (inline, path) {
        (Some(_), Some(_)) => Err(ConfigError::ConflictingOption(name.to_string())),
        (Some(inline), None) => Ok(Some(inline.as_bytes().to_vec())),
        (None, Some(path)) => Ok(Some(std::fs::read(path)?)),
        (None, None) => Ok(None),
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid device type: {0}")]
    InvalidDeviceType(String),
    #[error("Missing option \"{0}\"")]
    MissingOption(String),
    #[error("Conflict option \"{0}\": specify just one of \"{0}\" or \"{0}_path\"")]
    ConflictingOption(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DeviceConfig {
    /// Load configuration from TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)
            .map_err(|e| ConfigError::InvalidDeviceId(format!("'{}': {e}", self.device.id)))?;

        if let Some(device_type) = &self.device.device_type {
            validate_identity(device_type)
                .map_err(|e| ConfigError::InvalidDeviceType(e.to_string()))?;
        }

        if self.management.transaction_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "management.transaction_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Resolve TLS material, if any is configured
    pub fn tls_material(&self) -> Result<Option<TlsMaterial>, ConfigError> {
        match &self.tls {
            Some(tls) => tls.resolve(),
            None => Ok(None),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "test-device"
device_type = "thermostat"
initial_load = true

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
