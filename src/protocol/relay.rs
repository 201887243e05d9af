//! Tor relay types and selection logic
//!
//! Defines relay metadata as supplied by the directory collaborator, the
//! [`Directory`] seam circuits and hidden-service lookups read relays
//! through, and the random path selection used by the client.

use crate::crypto::keys::{self, HASH_LEN};
use crate::error::{Result, TorError};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A Tor relay from the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    /// Relay nickname
    pub nickname: String,

    /// Fingerprint (hex-encoded identity key hash)
    pub fingerprint: String,

    /// IPv4/IPv6 address
    pub address: IpAddr,

    /// OR (Onion Router) port
    pub or_port: u16,

    /// Directory port (optional)
    #[serde(default)]
    pub dir_port: Option<u16>,

    /// Relay flags
    #[serde(default)]
    pub flags: RelayFlags,

    /// Bandwidth (bytes/sec)
    #[serde(default)]
    pub bandwidth: u64,

    /// TAP onion key, PKCS#1 DER (base64 in JSON)
    #[serde(default, with = "base64_der")]
    pub onion_key: Option<Vec<u8>>,

    /// Identity signing key, PKCS#1 DER (base64 in JSON)
    #[serde(default, with = "base64_der")]
    pub signing_key: Option<Vec<u8>>,

    /// Hidden-service key, for introduction points only
    #[serde(default, with = "base64_der")]
    pub service_key: Option<Vec<u8>>,

    /// Exit ports this relay accepts; empty means unrestricted
    #[serde(default)]
    pub exit_ports: Vec<u16>,
}

impl Relay {
    /// Minimal relay record, as used for introduction and rendezvous points
    pub fn new(nickname: impl Into<String>, fingerprint: impl Into<String>, address: IpAddr, or_port: u16) -> Self {
        Self {
            nickname: nickname.into(),
            fingerprint: fingerprint.into(),
            address,
            or_port,
            dir_port: None,
            flags: RelayFlags::default(),
            bandwidth: 0,
            onion_key: None,
            signing_key: None,
            service_key: None,
            exit_ports: Vec::new(),
        }
    }

    /// Get the SocketAddr for connecting to this relay
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.or_port)
    }

    /// IPv4 address, required by the TAP EXTEND cell
    pub fn ipv4(&self) -> Result<Ipv4Addr> {
        match self.address {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => Err(TorError::InvalidRelay(format!(
                "{} has no IPv4 address",
                self.nickname
            ))),
        }
    }

    /// 20-byte identity digest decoded from the fingerprint
    pub fn identity(&self) -> Result<[u8; HASH_LEN]> {
        let bytes = hex::decode(&self.fingerprint).map_err(|e| {
            TorError::InvalidRelay(format!("Invalid fingerprint {}: {}", self.fingerprint, e))
        })?;

        <[u8; HASH_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
            TorError::InvalidRelay(format!(
                "Fingerprint must be {} bytes (SHA-1), got {}",
                HASH_LEN,
                bytes.len()
            ))
        })
    }

    /// Parsed TAP onion key
    pub fn onion_key(&self) -> Result<RsaPublicKey> {
        let der = self.onion_key.as_deref().ok_or_else(|| {
            TorError::InvalidRelay(format!("Relay {} has no onion key", self.nickname))
        })?;
        keys::public_key_from_der(der)
    }

    /// Parsed hidden-service key
    pub fn service_key(&self) -> Result<RsaPublicKey> {
        let der = self.service_key.as_deref().ok_or_else(|| {
            TorError::InvalidRelay(format!("Relay {} has no service key", self.nickname))
        })?;
        keys::public_key_from_der(der)
    }

    /// Whether the fingerprint names the same identity, ignoring hex case
    pub fn has_identity(&self, fingerprint: &str) -> bool {
        self.fingerprint.eq_ignore_ascii_case(fingerprint)
    }

    /// Check if this relay can be used as a guard
    pub fn is_guard(&self) -> bool {
        self.flags.guard && self.flags.stable && self.flags.fast
    }

    /// Check if this relay can be used as an exit
    pub fn is_exit(&self) -> bool {
        self.flags.exit && !self.flags.bad_exit
    }

    /// Check if this relay is suitable as a middle relay
    pub fn is_middle(&self) -> bool {
        self.flags.fast && self.flags.running
    }

    /// Check if this relay serves v2 hidden-service descriptors
    pub fn is_hs_dir(&self) -> bool {
        self.flags.hs_dir && self.flags.v2_dir
    }

    /// Check if this relay is currently running
    pub fn is_running(&self) -> bool {
        self.flags.running
    }

    /// Whether the exit policy lets traffic out to `port`
    pub fn allows_exit_to(&self, port: u16) -> bool {
        self.exit_ports.is_empty() || self.exit_ports.contains(&port)
    }
}

/// Relay flags from consensus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayFlags {
    /// Authority - directory authority
    pub authority: bool,

    /// BadExit - should not be used as exit
    pub bad_exit: bool,

    /// Exit - allows exit traffic
    pub exit: bool,

    /// Fast - fast relay
    pub fast: bool,

    /// Guard - suitable as entry guard
    pub guard: bool,

    /// HSDir - hidden service directory
    pub hs_dir: bool,

    /// Running - currently running
    pub running: bool,

    /// Stable - stable relay
    pub stable: bool,

    /// V2Dir - version 2 directory protocol
    pub v2_dir: bool,

    /// Valid - valid relay descriptor
    pub valid: bool,
}

impl RelayFlags {
    /// Parse flags from consensus string
    pub fn from_string(flags: &str) -> Self {
        let mut relay_flags = RelayFlags::default();

        for flag in flags.split_whitespace() {
            match flag {
                "Authority" => relay_flags.authority = true,
                "BadExit" => relay_flags.bad_exit = true,
                "Exit" => relay_flags.exit = true,
                "Fast" => relay_flags.fast = true,
                "Guard" => relay_flags.guard = true,
                "HSDir" => relay_flags.hs_dir = true,
                "Running" => relay_flags.running = true,
                "Stable" => relay_flags.stable = true,
                "V2Dir" => relay_flags.v2_dir = true,
                "Valid" => relay_flags.valid = true,
                _ => {} // Ignore unknown flags
            }
        }

        relay_flags
    }

    fn bits(&self) -> [bool; 10] {
        [
            self.authority,
            self.bad_exit,
            self.exit,
            self.fast,
            self.guard,
            self.hs_dir,
            self.running,
            self.stable,
            self.v2_dir,
            self.valid,
        ]
    }

    /// Whether every flag set in `required` is also set here
    pub fn contains(&self, required: &RelayFlags) -> bool {
        self.bits()
            .iter()
            .zip(required.bits().iter())
            .all(|(have, need)| *have || !*need)
    }
}

/// Source of relay descriptors
///
/// Circuits and hidden-service lookups only read relays through this seam;
/// downloading and validating the consensus is somebody else's job.
pub trait Directory: Send + Sync {
    /// Relays carrying at least `flags` whose exit policy admits every port
    fn relays_matching(&self, flags: &RelayFlags, ports: &[u16]) -> Vec<Relay>;

    /// Relay with the given hex fingerprint
    fn relay_by_identity(&self, fingerprint: &str) -> Option<Relay>;
}

/// In-memory directory, typically loaded from a JSON relay list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticDirectory {
    relays: Vec<Relay>,
}

impl StaticDirectory {
    pub fn new(relays: Vec<Relay>) -> Self {
        Self { relays }
    }

    /// Load a JSON array of relays
    pub fn from_json(json: &str) -> Result<Self> {
        let relays: Vec<Relay> = serde_json::from_str(json)
            .map_err(|e| TorError::Directory(format!("Invalid relay list: {}", e)))?;

        for relay in &relays {
            relay.identity()?;
        }

        log::info!("📋 Loaded {} relays", relays.len());
        Ok(Self { relays })
    }

    pub fn relays(&self) -> &[Relay] {
        &self.relays
    }

    /// Get total number of relays
    pub fn count(&self) -> usize {
        self.relays.len()
    }
}

impl Directory for StaticDirectory {
    fn relays_matching(&self, flags: &RelayFlags, ports: &[u16]) -> Vec<Relay> {
        self.relays
            .iter()
            .filter(|r| r.flags.contains(flags))
            .filter(|r| ports.iter().all(|&p| r.allows_exit_to(p)))
            .cloned()
            .collect()
    }

    fn relay_by_identity(&self, fingerprint: &str) -> Option<Relay> {
        self.relays.iter().find(|r| r.has_identity(fingerprint)).cloned()
    }
}

/// Random path selection over a directory snapshot
#[derive(Clone)]
pub struct RelaySelector {
    relays: Vec<Relay>,
}

impl RelaySelector {
    /// Snapshot every running relay with an onion key
    pub fn from_directory(directory: &dyn Directory) -> Self {
        let required = RelayFlags {
            running: true,
            ..Default::default()
        };
        let relays = directory
            .relays_matching(&required, &[])
            .into_iter()
            .filter(|r| r.onion_key.is_some() && r.address.is_ipv4())
            .collect();
        Self { relays }
    }

    /// Create a new relay selector
    pub fn new(relays: Vec<Relay>) -> Self {
        Self { relays }
    }

    fn pick<F>(&self, exclude: &[&str], filter: F) -> Option<&Relay>
    where
        F: Fn(&Relay) -> bool,
    {
        use rand::seq::SliceRandom;

        let candidates: Vec<&Relay> = self
            .relays
            .iter()
            .filter(|r| filter(r))
            .filter(|r| !exclude.iter().any(|fp| r.has_identity(fp)))
            .collect();

        // Bandwidth-weighted, with a floor so unmeasured relays still get picked
        candidates
            .choose_weighted(&mut rand::thread_rng(), |r| r.bandwidth.max(1))
            .ok()
            .copied()
    }

    /// Select a guard relay
    pub fn select_guard(&self, exclude: &[&str]) -> Option<&Relay> {
        self.pick(exclude, Relay::is_guard)
    }

    /// Select a middle relay
    pub fn select_middle(&self, exclude: &[&str]) -> Option<&Relay> {
        self.pick(exclude, Relay::is_middle)
    }

    /// Select an exit relay that admits `port`
    pub fn select_exit(&self, exclude: &[&str], port: Option<u16>) -> Option<&Relay> {
        self.pick(exclude, |r| {
            r.is_exit() && port.map_or(true, |p| r.allows_exit_to(p))
        })
    }

    /// Select any relay, for rendezvous points
    pub fn select_any(&self, exclude: &[&str]) -> Option<&Relay> {
        self.pick(exclude, Relay::is_running)
    }
}

/// Serde adapter keeping DER keys as base64 strings in JSON
mod base64_der {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|t| {
            general_purpose::STANDARD
                .decode(t.trim())
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
