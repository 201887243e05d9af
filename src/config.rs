//! Client configuration
//!
//! Every blocking operation in the engine is bounded by one of the timeouts
//! below. The structs deserialize from JSON with `#[serde(default)]`, so a
//! config file only needs the fields it overrides.

use crate::error::{Result, TorError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Link protocol versions this client can speak
pub const SUPPORTED_LINK_VERSIONS: [u16; 2] = [3, 4];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    pub link: LinkConfig,
    pub circuit: CircuitConfig,
    pub stream: StreamConfig,
    pub hidden_service: HiddenServiceConfig,
}

impl TorConfig {
    /// Parse a JSON config, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TorConfig = serde_json::from_str(json)
            .map_err(|e| TorError::Config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the protocol cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.link.link_versions.is_empty() {
            return Err(TorError::Config("link_versions must not be empty".into()));
        }
        if let Some(v) = self
            .link
            .link_versions
            .iter()
            .find(|v| !SUPPORTED_LINK_VERSIONS.contains(v))
        {
            return Err(TorError::Config(format!("Unsupported link version {}", v)));
        }
        if self.circuit.hop_count == 0 {
            return Err(TorError::Config("hop_count must be at least 1".into()));
        }
        if self.hidden_service.replicas == 0 || self.hidden_service.spread == 0 {
            return Err(TorError::Config(
                "hidden service replicas and spread must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Link (transport connection) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Timeout for the VERSIONS / NETINFO exchange
    pub handshake_timeout_ms: u64,

    /// Link versions offered in VERSIONS, any order
    pub link_versions: Vec<u16>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            link_versions: SUPPORTED_LINK_VERSIONS.to_vec(),
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Circuit construction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// How long CREATE / EXTEND / rendezvous steps may take
    pub build_timeout_ms: u64,

    /// Default path length for general purpose circuits
    pub hop_count: usize,

    /// Attempts with fresh relays before giving up on a circuit
    pub max_build_attempts: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            build_timeout_ms: 30_000,
            hop_count: 3,
            max_build_attempts: 3,
        }
    }
}

impl CircuitConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }
}

/// Stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Wait for RELAY_CONNECTED
    pub connect_timeout_ms: u64,

    /// Wait for data in `read`
    pub read_timeout_ms: u64,

    /// Wait for a package window to reopen in `write`
    pub write_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            read_timeout_ms: 60_000,
            write_timeout_ms: 60_000,
        }
    }
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Hidden service (v2 rendezvous) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HiddenServiceConfig {
    /// Descriptor replicas published per time period
    pub replicas: u8,

    /// Responsible directories per replica
    pub spread: usize,

    /// Wait for RENDEZVOUS2 after the introduction was acknowledged
    pub rendezvous_timeout_ms: u64,
}

impl Default for HiddenServiceConfig {
    fn default() -> Self {
        Self {
            replicas: 2,
            spread: 3,
            rendezvous_timeout_ms: 60_000,
        }
    }
}

impl HiddenServiceConfig {
    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }
}
