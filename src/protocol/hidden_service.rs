//! Hidden service (v2) rendezvous
//!
//! Connecting to `xxxxxxxxxxxxxxxx.onion` takes two circuits besides the
//! ones used to fetch the descriptor:
//!
//! 1. A rendezvous circuit whose last hop receives our cookie
//!    (ESTABLISH_RENDEZVOUS).
//! 2. A descriptor fetch from the responsible HSDirs over BEGIN_DIR.
//! 3. An introduction circuit to one of the service's introduction points,
//!    carrying INTRODUCE1 with the rendezvous point, the cookie and `g^x`.
//!
//! The service then meets us at the rendezvous point and RENDEZVOUS2 adds
//! it to the rendezvous circuit as a virtual last hop.

use super::circuit::Circuit;
use super::descriptor::{encode_base32, HiddenServiceDescriptor, IntroductionPoint, OnionAddress};
use super::relay::{Directory, Relay, RelayFlags};
use crate::config::HiddenServiceConfig;
use crate::crypto::keys::{self, HASH_LEN};
use crate::crypto::{hybrid, DH_LEN};
use crate::error::{Result, TorError};
use rand::RngCore;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of the rendezvous cookie
pub const REND_COOKIE_LEN: usize = 20;

/// INTRODUCE1 handshake version carrying the rendezvous point's onion key
const INTRODUCE_VERSION: u8 = 2;

/// Builds circuits for the rendezvous protocol
pub trait CircuitProvider: Send + Sync {
    /// Build a ready circuit, ending at `last_hop` when given
    fn build_circuit(&self, last_hop: Option<&Relay>) -> Result<Arc<Circuit>>;
}

/// HSDirs responsible for `descriptor_id`
///
/// Relays flagged HSDir and V2Dir, ordered by fingerprint; the `spread`
/// relays at and after the descriptor id's position, wrapping around.
pub fn responsible_directories(
    directory: &dyn Directory,
    descriptor_id: &[u8; HASH_LEN],
    spread: usize,
) -> Vec<Relay> {
    let required = RelayFlags {
        hs_dir: true,
        v2_dir: true,
        ..Default::default()
    };

    let mut hs_dirs: Vec<(String, Relay)> = directory
        .relays_matching(&required, &[])
        .into_iter()
        .map(|r| (r.fingerprint.to_ascii_uppercase(), r))
        .collect();
    if hs_dirs.is_empty() {
        return Vec::new();
    }
    hs_dirs.sort_by(|a, b| a.0.cmp(&b.0));

    let target = hex::encode_upper(descriptor_id);
    let start = hs_dirs.partition_point(|(fp, _)| fp.as_str() < target.as_str());

    (0..spread.min(hs_dirs.len()))
        .map(|i| hs_dirs[(start + i) % hs_dirs.len()].1.clone())
        .collect()
}

/// Client side of the v2 rendezvous protocol for one onion address
pub struct HiddenService {
    address: OnionAddress,
    directory: Arc<dyn Directory>,
    provider: Arc<dyn CircuitProvider>,
    config: HiddenServiceConfig,
}

impl HiddenService {
    pub fn new(
        address: OnionAddress,
        directory: Arc<dyn Directory>,
        provider: Arc<dyn CircuitProvider>,
        config: HiddenServiceConfig,
    ) -> Self {
        Self {
            address,
            directory,
            provider,
            config,
        }
    }

    pub fn address(&self) -> &OnionAddress {
        &self.address
    }

    /// `(descriptor id, HSDir)` pairs to try at unix time `now`, by replica
    pub fn responsible_directories(&self, now: u64) -> Vec<([u8; HASH_LEN], Relay)> {
        let mut targets: Vec<([u8; HASH_LEN], Relay)> = Vec::new();
        for replica in 0..self.config.replicas {
            let id = self.address.descriptor_id(replica, now);
            for relay in responsible_directories(self.directory.as_ref(), &id, self.config.spread) {
                if !targets.iter().any(|(_, r)| r.fingerprint == relay.fingerprint) {
                    targets.push((id, relay));
                }
            }
        }
        targets
    }

    /// Join the service on `rendezvous`, a ready circuit we built
    ///
    /// On success the circuit is `RendezvousCompleted` and streams opened
    /// on it reach the service.
    pub fn connect(&self, rendezvous: &Arc<Circuit>) -> Result<()> {
        self.connect_at(rendezvous, unix_now())
    }

    /// [`HiddenService::connect`] with descriptor ids computed for `now`
    pub fn connect_at(&self, rendezvous: &Arc<Circuit>, now: u64) -> Result<()> {
        log::info!("🧅 Connecting to {}", self.address);

        let mut cookie = [0u8; REND_COOKIE_LEN];
        rand::thread_rng().fill_bytes(&mut cookie);
        rendezvous.establish_rendezvous(&cookie)?;

        let descriptor = self.fetch_descriptor(now)?;
        if descriptor.introduction_points.is_empty() {
            return Err(TorError::Directory(format!(
                "descriptor for {} lists no introduction points",
                self.address
            )));
        }

        let rendezvous_point = rendezvous.last_relay().ok_or_else(|| {
            TorError::InvalidState("rendezvous circuit has no relay hop".into())
        })?;
        let public = rendezvous.begin_rendezvous()?;

        let mut last_error = None;
        for intro in &descriptor.introduction_points {
            match self.introduce(intro, &rendezvous_point, &cookie, &public) {
                Ok(()) => {
                    rendezvous.wait_rendezvous_completed()?;
                    log::info!("✅ Connected to {}", self.address);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("⚠️ Introduction via {}:{} failed: {}", intro.address, intro.port, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TorError::CircuitBuildFailed(format!("no introduction point for {}", self.address))
        }))
    }

    /// Fetch and verify the descriptor from the responsible HSDirs
    ///
    /// A descriptor that fails verification aborts the lookup.
    pub fn fetch_descriptor(&self, now: u64) -> Result<HiddenServiceDescriptor> {
        let targets = self.responsible_directories(now);
        if targets.is_empty() {
            return Err(TorError::NoRelaysAvailable("no HSDir relays in directory".into()));
        }

        let mut last_error = None;
        for (id, hs_dir) in &targets {
            match self.fetch_from(hs_dir, id) {
                Ok(descriptor) => return Ok(descriptor),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::warn!("⚠️ Descriptor fetch from {} failed: {}", hs_dir.nickname, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TorError::Directory(format!("no descriptor for {}", self.address))))
    }

    fn fetch_from(&self, hs_dir: &Relay, id: &[u8; HASH_LEN]) -> Result<HiddenServiceDescriptor> {
        let path = format!("/tor/rendezvous2/{}", encode_base32(id));
        log::info!("📥 Fetching {} from {}", path, hs_dir.nickname);

        let circuit = self.provider.build_circuit(Some(hs_dir))?;
        let response = fetch_over_circuit(&circuit, &path);
        circuit.close();

        let body = http_body(&response?)?;
        let text = std::str::from_utf8(&body)
            .map_err(|_| TorError::Directory("descriptor is not UTF-8".into()))?;

        let descriptor = HiddenServiceDescriptor::parse(text)?;
        descriptor.verify(&self.address)?;
        if descriptor.descriptor_id != *id {
            return Err(TorError::SecurityViolation(format!(
                "{} served a descriptor for a different id",
                hs_dir.nickname
            )));
        }
        Ok(descriptor)
    }

    fn introduce(
        &self,
        intro: &IntroductionPoint,
        rendezvous_point: &Relay,
        cookie: &[u8; REND_COOKIE_LEN],
        public: &[u8; DH_LEN],
    ) -> Result<()> {
        let payload = introduce1_payload(&intro.service_key, rendezvous_point, cookie, public)?;
        let circuit = self.provider.build_circuit(Some(&intro.to_relay()?))?;
        let result = circuit.introduce(payload);
        circuit.close();
        result
    }
}

/// INTRODUCE1 payload
///
/// `SHA1(service key) | hybrid(VER | IP | PORT | ID | KLEN | KEY | RC | g^x)`
pub fn introduce1_payload(
    service_key: &rsa::RsaPublicKey,
    rendezvous_point: &Relay,
    cookie: &[u8; REND_COOKIE_LEN],
    public: &[u8; DH_LEN],
) -> Result<Vec<u8>> {
    let onion_key = rendezvous_point.onion_key.as_deref().ok_or_else(|| {
        TorError::InvalidRelay(format!(
            "rendezvous point {} has no onion key",
            rendezvous_point.nickname
        ))
    })?;
    let key_len = u16::try_from(onion_key.len())
        .map_err(|_| TorError::InvalidRelay("rendezvous onion key too long".into()))?;

    let mut handshake = Vec::with_capacity(1 + 4 + 2 + HASH_LEN + 2 + onion_key.len() + REND_COOKIE_LEN + DH_LEN);
    handshake.push(INTRODUCE_VERSION);
    handshake.extend_from_slice(&rendezvous_point.ipv4()?.octets());
    handshake.extend_from_slice(&rendezvous_point.or_port.to_be_bytes());
    handshake.extend_from_slice(&rendezvous_point.identity()?);
    handshake.extend_from_slice(&key_len.to_be_bytes());
    handshake.extend_from_slice(onion_key);
    handshake.extend_from_slice(cookie);
    handshake.extend_from_slice(public);

    let mut payload = keys::key_digest(service_key)?.to_vec();
    payload.extend_from_slice(&hybrid::encrypt(&handshake, service_key)?);
    Ok(payload)
}

/// GET `path` from the last hop's directory port over BEGIN_DIR
fn fetch_over_circuit(circuit: &Arc<Circuit>, path: &str) -> Result<Vec<u8>> {
    let stream = circuit.begin_dir_stream()?;
    let request = format!("GET {} HTTP/1.0\r\n\r\n", path);
    stream.send(request.as_bytes())?;
    let response = stream.read_all();
    stream.close()?;
    response
}

/// Body of a `200` HTTP response
fn http_body(response: &[u8]) -> Result<Vec<u8>> {
    let text = String::from_utf8_lossy(response);
    if !text.starts_with("HTTP/") {
        return Err(TorError::Directory("Invalid HTTP response".into()));
    }

    let status = text.lines().next().unwrap_or("");
    if status.split_whitespace().nth(1) != Some("200") {
        return Err(TorError::Directory(format!("HTTP error: {}", status.trim())));
    }

    if let Some(start) = response.windows(4).position(|w| w == b"\r\n\r\n") {
        Ok(response[start + 4..].to_vec())
    } else if let Some(start) = response.windows(2).position(|w| w == b"\n\n") {
        Ok(response[start + 2..].to_vec())
    } else {
        Err(TorError::Directory("HTTP response has no body".into()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
