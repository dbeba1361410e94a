//! # Configuration
//!
//! Structured configuration for the client engine: which servers to talk
//! to, which transport to use, the optional HTTP proxy and the timing knobs
//! of the retry machinery.
//!
//! ## Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults plus `default_with_overrides()`

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::protocol::transact::DEFAULT_RETRIES;
use crate::transport::connection::ATTEMPTS_PER_SERVER;
use crate::transport::proxy::ProxySettings;

/// Default server port.
pub const DEFAULT_PORT: u16 = 8000;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct EngineConfig {
    /// Server list and transport selection.
    #[serde(default)]
    pub network: NetworkSettings,

    /// Optional HTTP CONNECT proxy; forces TCP when set.
    #[serde(default)]
    pub proxy: Option<ProxySettings>,

    /// Retry, scan and reconnect timing.
    #[serde(default)]
    pub timing: TimingSettings,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::Config(format!("failed to open config file: {e}")))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::Config(format!("failed to parse TOML: {e}")))
    }

    /// Apply overrides to the default configuration.
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Validate for common misconfigurations. Empty list means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.network.validate());
        errors.extend(self.timing.validate());
        if let Some(proxy) = &self.proxy {
            if proxy.host.is_empty() {
                errors.push("proxy host cannot be empty".to_string());
            }
            if proxy.port == 0 {
                errors.push("proxy port cannot be 0".to_string());
            }
            if !self.network.use_tcp {
                errors.push("UDP transport cannot cross an HTTP proxy".to_string());
            }
        }
        errors
    }

    /// Validate and return `Result`.
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Config(format!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server list and transport selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkSettings {
    /// Candidate server hostnames, tried in random order.
    pub servers: Vec<String>,

    /// Server port, shared by every candidate.
    pub port: u16,

    /// TCP when true, UDP otherwise.
    pub use_tcp: bool,

    /// Ask the server farm for an address before authenticating.
    pub server_select: bool,

    /// Log in invisible to contacts.
    pub hidden_login: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            port: DEFAULT_PORT,
            use_tcp: true,
            server_select: false,
            hidden_login: false,
        }
    }
}

impl NetworkSettings {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.servers.is_empty() {
            errors.push("at least one server must be configured".to_string());
        }
        if self.servers.iter().any(|s| s.is_empty()) {
            errors.push("server hostnames cannot be empty".to_string());
        }
        if self.port == 0 {
            errors.push("server port cannot be 0".to_string());
        }
        errors
    }
}

/// Retry, scan and reconnect timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingSettings {
    /// Period of the transaction scan and the keep-alive.
    #[serde(with = "duration_serde")]
    pub scan_interval: Duration,

    /// Resend budget per transaction.
    pub retries: u8,

    /// Connect attempts against one server before rotating.
    pub attempts_per_server: u32,

    /// Pause between connect attempts to the same server.
    #[serde(with = "duration_serde")]
    pub reconnect_interval: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(5),
            retries: DEFAULT_RETRIES,
            attempts_per_server: ATTEMPTS_PER_SERVER,
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

impl TimingSettings {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.scan_interval.as_millis() < 100 {
            errors.push("scan interval too short (minimum: 100ms)".to_string());
        } else if self.scan_interval.as_secs() > 60 {
            errors.push("scan interval too long (maximum: 60s)".to_string());
        }
        if self.retries == 0 {
            errors.push("retry budget must be greater than 0".to_string());
        }
        if self.attempts_per_server == 0 {
            errors.push("attempts per server must be greater than 0".to_string());
        }
        if self.reconnect_interval.as_millis() < 10 {
            errors.push("reconnect interval too short (minimum: 10ms)".to_string());
        }
        errors
    }
}

/// Helper module for Duration serialization as milliseconds.
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
