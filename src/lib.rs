//! # tor-circuit
//!
//! Client-side Tor circuit engine.
//!
//! Builds multi-hop circuits with the TAP handshake, layers AES-CTR relay
//! crypto over them, multiplexes streams with SENDME flow control and joins
//! v2 hidden services through a rendezvous point.
//!
//! ## Architecture
//!
//! ```text
//! TorClient
//!   ↓
//! Circuit ──── TorStream
//!   ↓
//! Link (cell dispatcher, one reader thread)
//!   ↓
//! Transport (TCP or TLS, supplied by the caller)
//!   ↓
//! Tor Network
//! ```
//!
//! Everything is blocking: waits are condition variables with timeouts,
//! and each link owns a single reader thread.

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod network;
pub mod protocol;

pub use client::TorClient;
pub use config::TorConfig;
pub use crypto::{BigInteger, DhKeyPair};
pub use error::{Result, TorError};
pub use network::{Connector, Link, NetworkStats, TcpConnector, Transport};
pub use protocol::{
    Circuit, CircuitProvider, CircuitState, Directory, HiddenService, OnionAddress, Relay,
    StaticDirectory, TorStream,
};
