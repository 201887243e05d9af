//! Tor Protocol Cryptography
//!
//! Implements the per-hop relay crypto used once a TAP handshake completes:
//! - KDF-TOR key derivation from the DH shared secret
//! - AES-128-CTR for stream encryption (zero IV, one keystream per direction)
//! - SHA-1 running digests for relay cell integrity
//! - Onion layering across hops
//!
//! Security: All key material is zeroized on drop to prevent memory leakage.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::cell::{Cell, RelayCell};
use crate::crypto::HASH_LEN;

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// AES-128 key length
pub const KEY_LEN: usize = 16;

/// Bytes of KDF-TOR output (five SHA-1 blocks)
pub const KDF_TOR_LEN: usize = 5 * HASH_LEN;

/// KDF-TOR: `SHA1(K0 | 0) | SHA1(K0 | 1) | ... | SHA1(K0 | 4)`
pub fn kdf_tor(secret: &[u8]) -> Zeroizing<[u8; KDF_TOR_LEN]> {
    let mut out = Zeroizing::new([0u8; KDF_TOR_LEN]);
    for (counter, chunk) in out.chunks_mut(HASH_LEN).enumerate() {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        hasher.update([counter as u8]);
        chunk.copy_from_slice(&hasher.finalize());
    }
    out
}

/// Key material for one hop
///
/// KDF-TOR output is split as:
/// ```text
/// KH (20) | Df (20) | Db (20) | Kf (16) | Kb (16)
/// ```
/// KH is the key-confirmation hash carried in CREATED / EXTENDED /
/// RENDEZVOUS2. The last 8 bytes of the 100-byte output are unused.
///
/// SECURITY: Keys are automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    /// Key confirmation hash (KH)
    pub key_hash: [u8; HASH_LEN],

    /// Forward digest seed (Df)
    pub forward_digest: [u8; HASH_LEN],

    /// Backward digest seed (Db)
    pub backward_digest: [u8; HASH_LEN],

    /// Forward encryption key (Kf)
    pub forward_key: [u8; KEY_LEN],

    /// Backward encryption key (Kb)
    pub backward_key: [u8; KEY_LEN],
}

impl HopKeys {
    /// Derive hop keys from the DH shared secret
    pub fn derive(shared_secret: &[u8]) -> Self {
        let k = kdf_tor(shared_secret);

        let mut keys = Self {
            key_hash: [0; HASH_LEN],
            forward_digest: [0; HASH_LEN],
            backward_digest: [0; HASH_LEN],
            forward_key: [0; KEY_LEN],
            backward_key: [0; KEY_LEN],
        };
        keys.key_hash.copy_from_slice(&k[0..20]);
        keys.forward_digest.copy_from_slice(&k[20..40]);
        keys.backward_digest.copy_from_slice(&k[40..60]);
        keys.forward_key.copy_from_slice(&k[60..76]);
        keys.backward_key.copy_from_slice(&k[76..92]);

        log::debug!("🔑 Derived hop keys (KH first 4: {:02x?})", &keys.key_hash[..4]);
        keys
    }

    /// Constant-time check of a peer's key confirmation hash
    pub fn confirms(&self, key_hash: &[u8]) -> bool {
        key_hash.len() == HASH_LEN && bool::from(self.key_hash[..].ct_eq(key_hash))
    }

    /// The same keys seen from the relay's end of the hop
    pub fn reversed(&self) -> Self {
        Self {
            key_hash: self.key_hash,
            forward_digest: self.backward_digest,
            backward_digest: self.forward_digest,
            forward_key: self.backward_key,
            backward_key: self.forward_key,
        }
    }
}

/// Live cipher and digest state for one hop
///
/// "Forward" is away from the holder of the state, "backward" is toward it.
/// Keystreams run continuously across cells and are never re-keyed.
pub struct CryptoState {
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
    forward_digest: Sha1,
    backward_digest: Sha1,
}

impl CryptoState {
    pub fn new(keys: &HopKeys) -> Self {
        let iv = [0u8; 16];

        let mut forward_digest = Sha1::new();
        forward_digest.update(keys.forward_digest);
        let mut backward_digest = Sha1::new();
        backward_digest.update(keys.backward_digest);

        Self {
            forward_cipher: Aes128Ctr::new((&keys.forward_key).into(), (&iv).into()),
            backward_cipher: Aes128Ctr::new((&keys.backward_key).into(), (&iv).into()),
            forward_digest,
            backward_digest,
        }
    }

    /// Stamp the digest field of a plaintext relay payload
    ///
    /// Zeroes the digest field, feeds all 509 bytes into the running
    /// forward digest and writes its first 4 bytes back into the field.
    pub fn seal_forward(&mut self, payload: &mut [u8]) {
        payload[RelayCell::DIGEST_RANGE].fill(0);
        self.forward_digest.update(&payload[..Cell::PAYLOAD_SIZE]);
        let digest = self.forward_digest.clone().finalize();
        payload[RelayCell::DIGEST_RANGE].copy_from_slice(&digest[..4]);
    }

    /// Add this hop's forward encryption layer
    pub fn encrypt_forward(&mut self, payload: &mut [u8]) {
        self.forward_cipher.apply_keystream(payload);
    }

    /// Peel this hop's backward layer and check whether the cell is ours
    ///
    /// Decryption always happens so the keystream stays in step with the
    /// sender. The running digest is only committed when "recognized" is
    /// zero and the digest matches; otherwise the cell belongs further out
    /// and `false` is returned.
    pub fn decrypt_backward(&mut self, payload: &mut [u8]) -> bool {
        self.backward_cipher.apply_keystream(payload);

        if payload[RelayCell::RECOGNIZED_RANGE] != [0, 0] {
            return false;
        }

        let mut received = [0u8; 4];
        received.copy_from_slice(&payload[RelayCell::DIGEST_RANGE]);

        let mut candidate = self.backward_digest.clone();
        candidate.update(&payload[..RelayCell::DIGEST_RANGE.start]);
        candidate.update([0u8; 4]);
        candidate.update(&payload[RelayCell::DIGEST_RANGE.end..Cell::PAYLOAD_SIZE]);
        let computed = candidate.clone().finalize();

        if bool::from(computed[..4].ct_eq(&received)) {
            self.backward_digest = candidate;
            true
        } else {
            false
        }
    }
}

/// Seal at the target hop (last in `layers`) and layer outward to hop 1
pub fn encrypt_outbound<'a, I>(layers: I, payload: &mut [u8])
where
    I: DoubleEndedIterator<Item = &'a mut CryptoState>,
{
    let mut layers = layers.rev();
    if let Some(target) = layers.next() {
        target.seal_forward(payload);
        target.encrypt_forward(payload);
    }
    for layer in layers {
        layer.encrypt_forward(payload);
    }
}

/// Peel layers from hop 1 inward, stopping at the hop that recognizes the cell
///
/// Returns that hop's index, or `None` when no hop verified the digest.
pub fn decrypt_inbound<'a, I>(layers: I, payload: &mut [u8]) -> Option<usize>
where
    I: IntoIterator<Item = &'a mut CryptoState>,
{
    for (index, layer) in layers.into_iter().enumerate() {
        if layer.decrypt_backward(payload) {
            return Some(index);
        }
    }
    None
}
