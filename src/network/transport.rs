//! Byte-stream transports under a link
//!
//! A [`Transport`] is a connected, blocking, full-duplex byte stream to a
//! relay's OR port. Methods take `&self` so the link's receive thread can
//! read while circuit callers write. Wrapping the stream in TLS is the
//! transport's business; the link only ever sees cleartext cells.

use crate::error::{Result, TorError};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Connected byte stream to a relay
pub trait Transport: Send + Sync {
    /// Read some bytes; `Ok(0)` means the peer closed the stream
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write the whole buffer
    fn write_all(&self, buf: &[u8]) -> Result<()>;

    /// Bound blocking reads; `None` blocks until data or close
    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()>;

    /// Close both directions, unblocking any reader
    fn close(&self);
}

/// Opens transports to relays
pub trait Connector: Send + Sync {
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<Arc<dyn Transport>>;
}

/// Plain TCP transport
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Ok((&self.stream).read(buf)?)
    }

    fn write_all(&self, buf: &[u8]) -> Result<()> {
        (&self.stream).write_all(buf)?;
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }

    fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("Shutdown of {} failed: {}", self.peer, e);
        }
    }
}

/// Connector producing [`TcpTransport`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<Arc<dyn Transport>> {
        log::info!("📞 Connecting to {}", addr);
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| TorError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        Ok(Arc::new(TcpTransport::new(stream)?))
    }
}
