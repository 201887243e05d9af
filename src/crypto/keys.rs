//! RSA key handling
//!
//! Tor identifies RSA keys by the SHA-1 digest of their PKCS#1 DER
//! encoding (not SubjectPublicKeyInfo). Signatures on hidden service
//! descriptors are PKCS#1 v1.5 with the hash OID omitted.

use crate::error::{Result, TorError};
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use sha1::{Digest, Sha1};

/// Length of a SHA-1 digest / RSA identity
pub const HASH_LEN: usize = 20;

/// SHA-1 of `data`
pub fn sha1(data: &[u8]) -> [u8; HASH_LEN] {
    Sha1::digest(data).into()
}

/// Decode a PKCS#1 `RSAPublicKey` DER blob
pub fn public_key_from_der(der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_der(der)
        .map_err(|e| TorError::Crypto(format!("Invalid RSA public key: {}", e)))
}

/// Encode as PKCS#1 `RSAPublicKey` DER
pub fn public_key_to_der(key: &RsaPublicKey) -> Result<Vec<u8>> {
    key.to_pkcs1_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| TorError::Crypto(format!("RSA key not encodable: {}", e)))
}

/// Decode a `-----BEGIN RSA PUBLIC KEY-----` block
pub fn public_key_from_pem(text: &str) -> Result<RsaPublicKey> {
    let block = pem::parse(text)
        .map_err(|e| TorError::ParseError(format!("Invalid PEM block: {}", e)))?;
    if block.tag() != "RSA PUBLIC KEY" {
        return Err(TorError::ParseError(format!(
            "Expected RSA PUBLIC KEY, found {}",
            block.tag()
        )));
    }
    public_key_from_der(block.contents())
}

/// SHA-1 of the key's DER encoding (the key's Tor identity)
pub fn key_digest(key: &RsaPublicKey) -> Result<[u8; HASH_LEN]> {
    Ok(sha1(&public_key_to_der(key)?))
}

/// Check a Tor-style (OID-less) PKCS#1 v1.5 signature over `hashed`
///
/// A bad signature is a [`TorError::SecurityViolation`].
pub fn verify_signature(key: &RsaPublicKey, hashed: &[u8], signature: &[u8]) -> Result<()> {
    key.verify(Pkcs1v15Sign::new_unprefixed(), hashed, signature)
        .map_err(|_| TorError::SecurityViolation("RSA signature does not verify".into()))
}

/// Modulus size in bits
pub fn key_bits(key: &RsaPublicKey) -> usize {
    key.n().bits()
}
