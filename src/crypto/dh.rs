//! Diffie-Hellman key agreement for the TAP handshake
//!
//! Uses the 1024-bit safe prime of RFC 2409 (second Oakley group) with
//! generator 2. Public values and shared secrets travel as 128-byte
//! big-endian strings.

use super::bigint::BigInteger;
use crate::error::{Result, TorError};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a public value or shared secret on the wire
pub const DH_LEN: usize = 128;

/// Private exponent size, matching what relays use
pub const DH_PRIVATE_BITS: usize = 320;

/// RFC 2409 group 2 prime
const DH_PRIME: [u8; DH_LEN] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF, 0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED,
    0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE, 0x9F, 0x24, 0x11,
    0x7C, 0x4B, 0x1F, 0xE6, 0x49, 0x28, 0x66, 0x51, 0xEC, 0xE6, 0x53, 0x81,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

const DH_GENERATOR: u64 = 2;

fn prime() -> BigInteger {
    BigInteger::from_bytes_be(&DH_PRIME)
}

/// One side of a DH exchange
///
/// The private exponent is zeroized on drop. Every circuit hop gets its own
/// key pair; nothing here is ever reused.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhKeyPair {
    private: BigInteger,
    public: BigInteger,
}

impl DhKeyPair {
    /// Draw a fresh private exponent from the OS-seeded CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; DH_PRIVATE_BITS / 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let pair = Self::from_private_bytes(&bytes);
        bytes.zeroize();
        pair
    }

    /// Build a key pair from a known private exponent
    pub fn from_private_bytes(private: &[u8]) -> Self {
        let private = BigInteger::from_bytes_be(private);
        let public = BigInteger::from_u64(DH_GENERATOR).mod_pow(&private, &prime());
        Self { private, public }
    }

    /// `g^x mod p` as 128 big-endian bytes
    pub fn public_bytes(&self) -> [u8; DH_LEN] {
        let mut out = [0u8; DH_LEN];
        out.copy_from_slice(&self.public.to_bytes_be(DH_LEN));
        out
    }

    /// `peer^x mod p` as 128 big-endian bytes
    ///
    /// Rejects degenerate peer values (0, 1, p-1 and anything >= p), which
    /// would force the secret into a tiny subgroup.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<Vec<u8>> {
        if peer_public.len() != DH_LEN {
            return Err(TorError::CryptoIntegrity(format!(
                "DH public value is {} bytes, expected {}",
                peer_public.len(),
                DH_LEN
            )));
        }

        let p = prime();
        let peer = BigInteger::from_bytes_be(peer_public);
        let (p_minus_one, _) = p.sub(&BigInteger::one());
        if peer <= BigInteger::one() || peer >= p_minus_one {
            return Err(TorError::CryptoIntegrity(
                "DH public value out of range".into(),
            ));
        }

        let mut secret = peer.mod_pow(&self.private, &p);
        let bytes = secret.to_bytes_be(DH_LEN);
        secret.zeroize();
        Ok(bytes)
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
