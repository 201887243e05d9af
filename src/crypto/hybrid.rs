//! RSA-OAEP / AES-128-CTR hybrid encryption
//!
//! Onion skins and INTRODUCE1 handshakes are longer than one RSA-1024 OAEP
//! block can carry. Payloads that fit go out as a single OAEP block;
//! anything longer gets a random AES key stuffed into the RSA block together
//! with the head of the payload, and the tail is AES-CTR encrypted:
//!
//! ```text
//! C1 = RSA-OAEP-SHA1(K | data[..key_len - 58])
//! C2 = AES-128-CTR(K, iv = 0, data[key_len - 58..])
//! out = C1 | C2
//! ```

use crate::error::{Result, TorError};
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use zeroize::Zeroizing;

type Aes128Ctr = Ctr128BE<Aes128>;

/// Bytes OAEP with SHA-1 consumes out of each RSA block
pub const OAEP_OVERHEAD: usize = 42;

/// Symmetric key length
pub const SYMMETRIC_KEY_LEN: usize = 16;

/// Largest payload encrypted with plain RSA for a given key
pub fn plain_capacity(key: &RsaPublicKey) -> usize {
    key.size().saturating_sub(OAEP_OVERHEAD)
}

/// Encrypt `data` to `key`, switching to the hybrid layout when needed
pub fn encrypt(data: &[u8], key: &RsaPublicKey) -> Result<Vec<u8>> {
    if key.size() <= OAEP_OVERHEAD + SYMMETRIC_KEY_LEN {
        return Err(TorError::Crypto(format!(
            "RSA key of {} bytes is too short for hybrid encryption",
            key.size()
        )));
    }

    let mut rng = rand::thread_rng();
    let capacity = plain_capacity(key);

    if data.len() <= capacity {
        return key
            .encrypt(&mut rng, Oaep::new::<Sha1>(), data)
            .map_err(|e| TorError::Crypto(format!("RSA-OAEP encrypt failed: {}", e)));
    }

    let head_len = capacity - SYMMETRIC_KEY_LEN;
    let mut sym_key = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
    rng.fill_bytes(&mut *sym_key);

    let mut block = Zeroizing::new(Vec::with_capacity(capacity));
    block.extend_from_slice(&*sym_key);
    block.extend_from_slice(&data[..head_len]);

    let mut out = key
        .encrypt(&mut rng, Oaep::new::<Sha1>(), &block)
        .map_err(|e| TorError::Crypto(format!("RSA-OAEP encrypt failed: {}", e)))?;

    let mut tail = data[head_len..].to_vec();
    let iv = [0u8; 16];
    let mut cipher = Aes128Ctr::new((&*sym_key).into(), (&iv).into());
    cipher.apply_keystream(&mut tail);
    out.extend_from_slice(&tail);

    log::debug!(
        "Hybrid-encrypted {} bytes into {} (rsa head {}, aes tail {})",
        data.len(),
        out.len(),
        head_len,
        tail.len()
    );

    Ok(out)
}

/// Inverse of [`encrypt`], as run by a relay or hidden service
pub fn decrypt(data: &[u8], key: &RsaPrivateKey) -> Result<Vec<u8>> {
    let key_len = key.size();
    if data.len() < key_len {
        return Err(TorError::Crypto(format!(
            "Hybrid ciphertext too short: {} < {}",
            data.len(),
            key_len
        )));
    }

    let block = Zeroizing::new(
        key.decrypt(Oaep::new::<Sha1>(), &data[..key_len])
            .map_err(|e| TorError::CryptoIntegrity(format!("RSA-OAEP decrypt failed: {}", e)))?,
    );

    if data.len() == key_len {
        return Ok(block.to_vec());
    }

    if block.len() < SYMMETRIC_KEY_LEN {
        return Err(TorError::CryptoIntegrity(
            "Hybrid header too short for symmetric key".into(),
        ));
    }

    let mut out = block[SYMMETRIC_KEY_LEN..].to_vec();
    let mut tail = data[key_len..].to_vec();
    let mut cipher = Aes128Ctr::new_from_slices(&block[..SYMMETRIC_KEY_LEN], &[0u8; 16])
        .map_err(|_| TorError::Crypto("Invalid hybrid key length".into()))?;
    cipher.apply_keystream(&mut tail);
    out.extend_from_slice(&tail);
    Ok(out)
}
