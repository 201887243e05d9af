//! Network layer
//!
//! Transports carry bytes to a relay's OR port; a [`Link`] runs the link
//! handshake over one and multiplexes circuits across it.

pub mod link;
pub mod transport;

pub use link::Link;
pub use transport::{Connector, TcpConnector, TcpTransport, Transport};

/// Link connection statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NetworkStats {
    /// Total connections attempted
    pub connections_attempted: u64,

    /// Successful connections (transport and link handshake)
    pub connections_successful: u64,

    /// Failed connections
    pub connections_failed: u64,
}

impl NetworkStats {
    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.connections_attempted == 0 {
            return 0.0;
        }
        (self.connections_successful as f64 / self.connections_attempted as f64) * 100.0
    }

    /// Get failure rate as percentage
    pub fn failure_rate(&self) -> f64 {
        if self.connections_attempted == 0 {
            return 0.0;
        }
        (self.connections_failed as f64 / self.connections_attempted as f64) * 100.0
    }
}
