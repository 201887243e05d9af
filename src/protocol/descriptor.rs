//! Version 2 hidden service descriptors
//!
//! Onion addresses, the time-based descriptor ids that place a descriptor on
//! the HSDir ring, and parsing/verification of the descriptor text an HSDir
//! serves:
//!
//! ```text
//! rendezvous-service-descriptor <descriptor-id>
//! version 2
//! permanent-key
//! -----BEGIN RSA PUBLIC KEY-----
//! secret-id-part <secret-id>
//! publication-time YYYY-MM-DD HH:MM:SS
//! protocol-versions 2,3
//! introduction-points
//! -----BEGIN MESSAGE-----
//! signature
//! -----BEGIN SIGNATURE-----
//! ```

use super::relay::Relay;
use crate::crypto::keys::{self, sha1, HASH_LEN};
use crate::error::{Result, TorError};
use data_encoding::BASE32_NOPAD;
use rsa::RsaPublicKey;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Length of a v2 permanent id (truncated key digest)
pub const PERMANENT_ID_LEN: usize = 10;

/// Seconds per descriptor time period
const TIME_PERIOD_SECS: u64 = 24 * 60 * 60;

/// A v2 `.onion` address: the base32 form of the service's permanent id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OnionAddress {
    permanent_id: [u8; PERMANENT_ID_LEN],
}

impl OnionAddress {
    /// Parse `xxxxxxxxxxxxxxxx` or `xxxxxxxxxxxxxxxx.onion` (16 base32 chars)
    pub fn parse(address: &str) -> Result<Self> {
        let label = address.trim().trim_end_matches(".onion");
        if label.len() != 16 {
            return Err(TorError::ParseError(format!(
                "Onion address must be 16 base32 characters, got {:?}",
                address
            )));
        }

        let bytes = decode_base32(label)?;
        let permanent_id = <[u8; PERMANENT_ID_LEN]>::try_from(bytes.as_slice())
            .map_err(|_| TorError::ParseError(format!("Invalid onion address {:?}", address)))?;
        Ok(Self { permanent_id })
    }

    /// Address belonging to a service's permanent key
    pub fn from_key(key: &RsaPublicKey) -> Result<Self> {
        let digest = keys::key_digest(key)?;
        let mut permanent_id = [0u8; PERMANENT_ID_LEN];
        permanent_id.copy_from_slice(&digest[..PERMANENT_ID_LEN]);
        Ok(Self { permanent_id })
    }

    pub fn permanent_id(&self) -> &[u8; PERMANENT_ID_LEN] {
        &self.permanent_id
    }

    /// Descriptor id for `replica` at unix time `now`
    pub fn descriptor_id(&self, replica: u8, now: u64) -> [u8; HASH_LEN] {
        descriptor_id(&self.permanent_id, replica, now)
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.onion", encode_base32(&self.permanent_id))
    }
}

impl std::str::FromStr for OnionAddress {
    type Err = TorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Descriptor time period, staggered by the first permanent id byte
pub fn time_period(permanent_id: &[u8; PERMANENT_ID_LEN], now: u64) -> u32 {
    let offset = permanent_id[0] as u64 * TIME_PERIOD_SECS / 256;
    ((now + offset) / TIME_PERIOD_SECS) as u32
}

/// `SHA1(permanent_id | SHA1(time_period | replica))`
pub fn descriptor_id(
    permanent_id: &[u8; PERMANENT_ID_LEN],
    replica: u8,
    now: u64,
) -> [u8; HASH_LEN] {
    let mut secret_input = time_period(permanent_id, now).to_be_bytes().to_vec();
    secret_input.push(replica);
    descriptor_id_from_secret(permanent_id, &sha1(&secret_input))
}

fn descriptor_id_from_secret(permanent_id: &[u8], secret_id_part: &[u8]) -> [u8; HASH_LEN] {
    let mut input = Vec::with_capacity(permanent_id.len() + secret_id_part.len());
    input.extend_from_slice(permanent_id);
    input.extend_from_slice(secret_id_part);
    sha1(&input)
}

/// Lowercase unpadded base32, as used in addresses and descriptor URLs
pub fn encode_base32(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes).to_ascii_lowercase()
}

fn decode_base32(text: &str) -> Result<Vec<u8>> {
    BASE32_NOPAD
        .decode(text.to_ascii_uppercase().as_bytes())
        .map_err(|e| TorError::ParseError(format!("Invalid base32 {:?}: {}", text, e)))
}

/// An introduction point listed in a descriptor
#[derive(Debug, Clone)]
pub struct IntroductionPoint {
    /// Relay identity digest
    pub identity: [u8; HASH_LEN],
    pub address: Ipv4Addr,
    pub port: u16,
    /// The relay's onion key, used to build the circuit to it
    pub onion_key: RsaPublicKey,
    /// The service's key at this introduction point, used for INTRODUCE1
    pub service_key: RsaPublicKey,
}

impl IntroductionPoint {
    fn parse(block: &str) -> Result<Self> {
        let lines: Vec<&str> = block.lines().collect();
        let mut identity = None;
        let mut address = None;
        let mut port = None;
        let mut onion_key = None;
        let mut service_key = None;

        let mut idx = 0;
        while idx < lines.len() {
            let (keyword, value) = split_keyword(lines[idx]);
            match keyword {
                "introduction-point" => {
                    let bytes = decode_base32(value)?;
                    identity = Some(<[u8; HASH_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
                        TorError::ParseError(format!("Bad introduction point id {:?}", value))
                    })?);
                }
                "ip-address" => {
                    address = Some(value.parse::<Ipv4Addr>().map_err(|_| {
                        TorError::ParseError(format!("Bad introduction point address {:?}", value))
                    })?);
                }
                "onion-port" => {
                    port = Some(value.parse::<u16>().map_err(|_| {
                        TorError::ParseError(format!("Bad introduction point port {:?}", value))
                    })?);
                }
                "onion-key" => {
                    let (key, end) = take_key(&lines, idx + 1)?;
                    onion_key = Some(key);
                    idx = end;
                }
                "service-key" => {
                    let (key, end) = take_key(&lines, idx + 1)?;
                    service_key = Some(key);
                    idx = end;
                }
                _ => {}
            }
            idx += 1;
        }

        Ok(Self {
            identity: identity.ok_or_else(|| missing("introduction-point"))?,
            address: address.ok_or_else(|| missing("ip-address"))?,
            port: port.ok_or_else(|| missing("onion-port"))?,
            onion_key: onion_key.ok_or_else(|| missing("onion-key"))?,
            service_key: service_key.ok_or_else(|| missing("service-key"))?,
        })
    }

    /// Relay record for building a circuit that ends here
    pub fn to_relay(&self) -> Result<Relay> {
        let fingerprint = hex::encode_upper(self.identity);
        let mut relay = Relay::new(
            format!("intro-{}", &fingerprint[..8]),
            fingerprint,
            IpAddr::V4(self.address),
            self.port,
        );
        relay.onion_key = Some(keys::public_key_to_der(&self.onion_key)?);
        relay.service_key = Some(keys::public_key_to_der(&self.service_key)?);
        Ok(relay)
    }
}

/// A parsed (not yet verified) v2 descriptor
#[derive(Debug, Clone)]
pub struct HiddenServiceDescriptor {
    pub descriptor_id: [u8; HASH_LEN],
    pub version: u32,
    pub permanent_key: RsaPublicKey,
    pub secret_id_part: [u8; HASH_LEN],
    pub publication_time: String,
    pub protocol_versions: Vec<u32>,
    pub introduction_points: Vec<IntroductionPoint>,
    signature: Vec<u8>,

    /// SHA-1 of the document through the `signature` line
    signed_digest: [u8; HASH_LEN],
}

impl HiddenServiceDescriptor {
    pub fn parse(text: &str) -> Result<Self> {
        let signed_digest = signed_digest(text)?;
        let lines: Vec<&str> = text.lines().collect();

        let mut descriptor_id = None;
        let mut version = None;
        let mut permanent_key = None;
        let mut secret_id_part = None;
        let mut publication_time = None;
        let mut protocol_versions = Vec::new();
        let mut introduction_points = Vec::new();
        let mut signature = None;

        let mut idx = 0;
        while idx < lines.len() {
            let (keyword, value) = split_keyword(lines[idx]);
            match keyword {
                "rendezvous-service-descriptor" => descriptor_id = Some(decode_digest(value)?),
                "version" => {
                    version = Some(value.parse::<u32>().map_err(|_| {
                        TorError::ParseError(format!("Bad descriptor version {:?}", value))
                    })?);
                }
                "permanent-key" => {
                    let (key, end) = take_key(&lines, idx + 1)?;
                    permanent_key = Some(key);
                    idx = end;
                }
                "secret-id-part" => secret_id_part = Some(decode_digest(value)?),
                "publication-time" => publication_time = Some(value.to_string()),
                "protocol-versions" => {
                    protocol_versions = value
                        .split(',')
                        .filter(|v| !v.is_empty())
                        .map(|v| {
                            v.trim().parse::<u32>().map_err(|_| {
                                TorError::ParseError(format!("Bad protocol version {:?}", v))
                            })
                        })
                        .collect::<Result<_>>()?;
                }
                "introduction-points" => {
                    let (block, end) = take_block(&lines, idx + 1, "MESSAGE")?;
                    introduction_points = parse_introduction_points(block.contents())?;
                    idx = end;
                }
                "signature" => {
                    let (block, end) = take_block(&lines, idx + 1, "SIGNATURE")?;
                    signature = Some(block.into_contents());
                    idx = end;
                }
                _ => {}
            }
            idx += 1;
        }

        let descriptor = Self {
            descriptor_id: descriptor_id.ok_or_else(|| missing("rendezvous-service-descriptor"))?,
            version: version.ok_or_else(|| missing("version"))?,
            permanent_key: permanent_key.ok_or_else(|| missing("permanent-key"))?,
            secret_id_part: secret_id_part.ok_or_else(|| missing("secret-id-part"))?,
            publication_time: publication_time.ok_or_else(|| missing("publication-time"))?,
            protocol_versions,
            introduction_points,
            signature: signature.ok_or_else(|| missing("signature"))?,
            signed_digest,
        };

        if descriptor.version != 2 {
            return Err(TorError::ParseError(format!(
                "Unsupported descriptor version {}",
                descriptor.version
            )));
        }

        log::debug!(
            "Parsed descriptor {} with {} introduction points",
            encode_base32(&descriptor.descriptor_id),
            descriptor.introduction_points.len()
        );
        Ok(descriptor)
    }

    /// Check the descriptor belongs to `address` and is signed by its key
    ///
    /// Every failure is a [`TorError::SecurityViolation`].
    pub fn verify(&self, address: &OnionAddress) -> Result<()> {
        if OnionAddress::from_key(&self.permanent_key)? != *address {
            return Err(TorError::SecurityViolation(format!(
                "descriptor permanent key does not belong to {}",
                address
            )));
        }

        if descriptor_id_from_secret(address.permanent_id(), &self.secret_id_part)
            != self.descriptor_id
        {
            return Err(TorError::SecurityViolation(format!(
                "descriptor id does not match secret-id-part for {}",
                address
            )));
        }

        keys::verify_signature(&self.permanent_key, &self.signed_digest, &self.signature)
            .map_err(|_| {
                TorError::SecurityViolation(format!("descriptor signature for {} is invalid", address))
            })?;

        log::info!("🔏 Descriptor for {} verified", address);
        Ok(())
    }
}

fn parse_introduction_points(decoded: &[u8]) -> Result<Vec<IntroductionPoint>> {
    let text = std::str::from_utf8(decoded)
        .map_err(|_| TorError::ParseError("introduction-points is not text".into()))?;

    let mut blocks: Vec<String> = Vec::new();
    for line in text.lines() {
        if line.starts_with("introduction-point ") || blocks.is_empty() {
            blocks.push(String::new());
        }
        if let Some(current) = blocks.last_mut() {
            current.push_str(line);
            current.push('\n');
        }
    }

    blocks
        .iter()
        .filter(|b| !b.trim().is_empty())
        .map(|b| IntroductionPoint::parse(b))
        .collect()
}

/// SHA-1 over the document up to and including `signature\n`
fn signed_digest(text: &str) -> Result<[u8; HASH_LEN]> {
    const MARKER: &str = "\nsignature\n";
    let end = text
        .find(MARKER)
        .map(|pos| pos + MARKER.len())
        .ok_or_else(|| missing("signature"))?;
    Ok(sha1(&text.as_bytes()[..end]))
}

fn split_keyword(line: &str) -> (&str, &str) {
    match line.find(' ') {
        Some(pos) => (&line[..pos], line[pos + 1..].trim()),
        None => (line.trim(), ""),
    }
}

fn decode_digest(value: &str) -> Result<[u8; HASH_LEN]> {
    let bytes = decode_base32(value)?;
    <[u8; HASH_LEN]>::try_from(bytes.as_slice())
        .map_err(|_| TorError::ParseError(format!("Expected a 20-byte id, got {:?}", value)))
}

/// PEM block starting at `lines[start]`; returns it and the END line index
fn take_block(lines: &[&str], start: usize, tag: &str) -> Result<(pem::Pem, usize)> {
    let end_marker = format!("-----END {}-----", tag);
    let end = lines[start.min(lines.len())..]
        .iter()
        .position(|l| l.trim() == end_marker)
        .map(|p| start + p)
        .ok_or_else(|| TorError::ParseError(format!("Unterminated {} block", tag)))?;

    let block = pem::parse(lines[start..=end].join("\n"))
        .map_err(|e| TorError::ParseError(format!("Invalid {} block: {}", tag, e)))?;
    if block.tag() != tag {
        return Err(TorError::ParseError(format!(
            "Expected {} block, found {}",
            tag,
            block.tag()
        )));
    }
    Ok((block, end))
}

fn take_key(lines: &[&str], start: usize) -> Result<(RsaPublicKey, usize)> {
    let (block, end) = take_block(lines, start, "RSA PUBLIC KEY")?;
    Ok((keys::public_key_from_der(block.contents())?, end))
}

fn missing(keyword: &str) -> TorError {
    TorError::ParseError(format!("Descriptor is missing {}", keyword))
}
