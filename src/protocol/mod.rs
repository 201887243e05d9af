//! Tor protocol implementation
//!
//! This module implements the client side of the Tor circuit protocol:
//! - Cell framing (fixed and variable length)
//! - TAP handshakes and per-hop onion crypto
//! - Circuit state machine and flow control
//! - Stream management
//! - v2 hidden service descriptors and rendezvous

pub mod cell;
pub mod circuit;
pub mod crypto;
pub mod descriptor;
pub mod flow_control;
pub mod hidden_service;
pub mod node;
pub mod relay;
pub mod state;
pub mod stream;

pub use cell::{Cell, CellCommand, RelayCell, RelayCommand};
pub use circuit::{CellSink, Circuit, CircuitState};
pub use crypto::{kdf_tor, CryptoState, HopKeys};
pub use descriptor::{HiddenServiceDescriptor, IntroductionPoint, OnionAddress};
pub use flow_control::FlowControl;
pub use hidden_service::{CircuitProvider, HiddenService};
pub use node::CircuitNode;
pub use relay::{Directory, Relay, RelayFlags, RelaySelector, StaticDirectory};
pub use state::Watch;
pub use stream::{StreamState, TorStream};
