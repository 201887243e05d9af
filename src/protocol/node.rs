//! One hop of a circuit
//!
//! A node starts life with a fresh DH key pair and nothing else. Once the
//! peer answers with `g^y | KH` the node derives its keys, checks KH and
//! from then on carries the hop's cipher/digest state and its circuit-level
//! flow-control windows.

use super::crypto::{CryptoState, HopKeys};
use super::flow_control::FlowControl;
use super::relay::Relay;
use crate::crypto::{hybrid, DhKeyPair, DH_LEN, HASH_LEN};
use crate::error::{Result, TorError};
use rsa::RsaPublicKey;

/// Length of a CREATED / EXTENDED / RENDEZVOUS2 handshake reply
pub const HANDSHAKE_REPLY_LEN: usize = DH_LEN + HASH_LEN;

/// A circuit hop
pub struct CircuitNode {
    /// The relay at this hop; `None` for the hidden service's virtual hop
    relay: Option<Relay>,

    /// Our half of the key agreement, dropped once keys are derived
    dh: Option<DhKeyPair>,

    crypto: Option<CryptoState>,

    /// Circuit-level package/deliver windows for cells to and from this hop
    pub flow: FlowControl,
}

impl CircuitNode {
    /// New, un-keyed hop with a fresh DH key pair
    pub fn new(relay: Option<Relay>) -> Self {
        Self {
            relay,
            dh: Some(DhKeyPair::generate()),
            crypto: None,
            flow: FlowControl::circuit(),
        }
    }

    pub fn relay(&self) -> Option<&Relay> {
        self.relay.as_ref()
    }

    /// Display name for logs
    pub fn name(&self) -> &str {
        self.relay
            .as_ref()
            .map(|r| r.nickname.as_str())
            .unwrap_or("<rendezvous>")
    }

    /// Whether the handshake has completed
    pub fn is_open(&self) -> bool {
        self.crypto.is_some()
    }

    /// Our DH public value `g^x`
    pub fn public_key(&self) -> Result<[u8; DH_LEN]> {
        self.dh
            .as_ref()
            .map(DhKeyPair::public_bytes)
            .ok_or_else(|| TorError::InvalidState("hop key pair already consumed".into()))
    }

    /// Onion skin for CREATE / EXTEND: `g^x` hybrid-encrypted to the onion key
    pub fn onion_skin(&self, onion_key: &RsaPublicKey) -> Result<Vec<u8>> {
        hybrid::encrypt(&self.public_key()?, onion_key)
    }

    /// Finish the TAP handshake from a `g^y | KH` reply
    ///
    /// On a KH mismatch the node stays un-keyed and the error is a
    /// [`TorError::CryptoIntegrity`].
    pub fn complete_handshake(&mut self, reply: &[u8]) -> Result<()> {
        if reply.len() < HANDSHAKE_REPLY_LEN {
            return Err(TorError::ProtocolFraming(format!(
                "Handshake reply too short: {} < {}",
                reply.len(),
                HANDSHAKE_REPLY_LEN
            )));
        }

        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| TorError::InvalidState("handshake already completed".into()))?;

        let (peer_public, key_hash) = reply[..HANDSHAKE_REPLY_LEN].split_at(DH_LEN);
        let secret = zeroize::Zeroizing::new(dh.shared_secret(peer_public)?);
        let keys = HopKeys::derive(&secret);

        if !keys.confirms(key_hash) {
            log::warn!("⚠️ Key confirmation mismatch from {}", self.name());
            return Err(TorError::CryptoIntegrity(format!(
                "KH mismatch in handshake with {}",
                self.name()
            )));
        }

        self.crypto = Some(CryptoState::new(&keys));
        self.dh = None;
        log::debug!("🔑 Handshake with {} complete", self.name());
        Ok(())
    }

    /// Cipher/digest state, present once the handshake completed
    pub fn layer(&mut self) -> Option<&mut CryptoState> {
        self.crypto.as_mut()
    }
}

impl std::fmt::Debug for CircuitNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitNode")
            .field("relay", &self.name())
            .field("open", &self.is_open())
            .field("flow", &self.flow)
            .finish()
    }
}
