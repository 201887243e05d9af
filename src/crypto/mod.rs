//! Cryptographic building blocks for the TAP handshake
//!
//! - [`bigint`]: arbitrary-precision arithmetic backing Diffie-Hellman
//! - [`dh`]: 1024-bit DH key agreement (RFC 2409 group 2)
//! - [`hybrid`]: RSA-OAEP / AES-CTR hybrid encryption of onion skins
//! - [`keys`]: RSA key encodings, identities and signature checks

pub mod bigint;
pub mod dh;
pub mod hybrid;
pub mod keys;

pub use bigint::BigInteger;
pub use dh::{DhKeyPair, DH_LEN};
pub use keys::{key_digest, sha1, HASH_LEN};
