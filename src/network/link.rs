//! OR links
//!
//! A [`Link`] is one transport connection to a relay after the link
//! handshake (VERSIONS, then CERTS / AUTH_CHALLENGE skipped until NETINFO,
//! then our NETINFO). It owns the circuits multiplexed over it and runs a
//! receive thread that routes each incoming cell to its circuit by id.

use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, CellCommand};
use crate::protocol::circuit::{CellSink, Circuit};
use crate::protocol::relay::Relay;
use crate::protocol::state::lock;
use crate::network::transport::Transport;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// VERSIONS is always framed as link version 3 (2-byte circuit ids)
const VERSIONS_FRAMING: u16 = 3;

/// Attempts at drawing an unused random circuit id
const CIRCUIT_ID_ATTEMPTS: usize = 64;

/// Buffers transport reads and yields whole cells
#[derive(Debug)]
struct CellReader {
    buf: Vec<u8>,
    version: u16,
}

impl CellReader {
    fn new(version: u16) -> Self {
        Self {
            buf: Vec::with_capacity(8192),
            version,
        }
    }

    fn next_cell(&mut self, transport: &dyn Transport) -> Result<Cell> {
        loop {
            if let Some((code, used)) = Cell::unknown_command(&self.buf, self.version) {
                log::debug!("Skipping cell with unknown command {}", code);
                self.buf.drain(..used);
                continue;
            }
            if let Some((cell, used)) = Cell::decode(&self.buf, self.version)? {
                self.buf.drain(..used);
                return Ok(cell);
            }

            let mut chunk = [0u8; 4096];
            let n = transport.read(&mut chunk)?;
            if n == 0 {
                return Err(TorError::Transport("connection closed by relay".into()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// An open link to a relay
pub struct Link {
    transport: Arc<dyn Transport>,
    relay: Relay,
    version: u16,
    config: TorConfig,
    circuits: Mutex<HashMap<u32, Arc<Circuit>>>,

    /// Serializes whole-cell writes from different circuits
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Link {
    /// Run the link handshake over `transport` and start receiving
    pub fn connect(
        transport: Arc<dyn Transport>,
        relay: &Relay,
        config: &TorConfig,
    ) -> Result<Arc<Self>> {
        log::info!("🤝 Link handshake with {} ({})", relay.nickname, relay.socket_addr());

        let (version, reader) = match Self::handshake(transport.as_ref(), relay, config) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                log::warn!("❌ Link handshake with {} failed: {}", relay.nickname, e);
                transport.close();
                return Err(e);
            }
        };

        let link = Arc::new(Self {
            transport: transport.clone(),
            relay: relay.clone(),
            version,
            config: config.clone(),
            circuits: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&link);
        thread::Builder::new()
            .name(format!("tor-link-{}", relay.nickname))
            .spawn(move || Self::receive_loop(weak, transport, reader))
            .map_err(|e| TorError::Internal(format!("cannot spawn link thread: {}", e)))?;

        log::info!("✅ Link to {} open (version {})", relay.nickname, version);
        Ok(link)
    }

    fn handshake(
        transport: &dyn Transport,
        relay: &Relay,
        config: &TorConfig,
    ) -> Result<(u16, CellReader)> {
        let timeout = config.link.handshake_timeout();
        let deadline = Instant::now() + timeout;
        transport.set_read_timeout(Some(timeout))?;

        let versions = Cell::versions(&config.link.link_versions);
        transport.write_all(&versions.serialize(VERSIONS_FRAMING)?)?;

        let mut reader = CellReader::new(VERSIONS_FRAMING);
        let reply = reader.next_cell(transport)?;
        if reply.command != CellCommand::Versions {
            return Err(TorError::UnexpectedCell {
                expected: "VERSIONS".into(),
                got: format!("{:?}", reply.command),
            });
        }

        let offered = Cell::parse_versions(&reply.payload)?;
        let version = config
            .link
            .link_versions
            .iter()
            .copied()
            .filter(|v| offered.contains(v))
            .max()
            .ok_or_else(|| {
                TorError::ProtocolViolation(format!(
                    "no common link version (relay offers {:?})",
                    offered
                ))
            })?;
        log::debug!("Negotiated link version {} with {}", version, relay.nickname);
        reader.version = version;

        loop {
            if Instant::now() >= deadline {
                return Err(TorError::Timeout(format!(
                    "link handshake with {} after {:?}",
                    relay.nickname, timeout
                )));
            }

            let cell = reader.next_cell(transport)?;
            match cell.command {
                CellCommand::Certs
                | CellCommand::AuthChallenge
                | CellCommand::Padding
                | CellCommand::Vpadding => {
                    log::debug!("Skipping {:?} during handshake", cell.command);
                }
                CellCommand::Netinfo => {
                    if let Some(addr) = Cell::parse_netinfo_peer(&cell.payload) {
                        log::debug!("{} reports address {}", relay.nickname, addr);
                    }
                    break;
                }
                other => {
                    return Err(TorError::UnexpectedCell {
                        expected: "NETINFO".into(),
                        got: format!("{:?}", other),
                    })
                }
            }
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        transport.write_all(&Cell::netinfo(now, relay.address).serialize(version)?)?;
        transport.set_read_timeout(None)?;

        Ok((version, reader))
    }

    fn receive_loop(link: Weak<Link>, transport: Arc<dyn Transport>, mut reader: CellReader) {
        loop {
            match reader.next_cell(transport.as_ref()) {
                Ok(cell) => match link.upgrade() {
                    Some(link) => link.dispatch(cell),
                    None => break,
                },
                Err(e) => {
                    if let Some(link) = link.upgrade() {
                        link.shutdown(e);
                    }
                    break;
                }
            }
        }
        log::debug!("Link receive thread exiting");
    }

    /// Route a cell to the circuit it belongs to
    fn dispatch(&self, cell: Cell) {
        if cell.circuit_id == 0 {
            match cell.command {
                CellCommand::Padding | CellCommand::Vpadding => {}
                other => log::debug!("Ignoring {:?} on circuit 0", other),
            }
            return;
        }

        let circuit = lock(&self.circuits).get(&cell.circuit_id).cloned();
        match circuit {
            Some(circuit) => circuit.handle_cell(cell),
            None => log::debug!(
                "Dropping {:?} for unknown circuit {:#x}",
                cell.command,
                cell.circuit_id
            ),
        }
    }

    /// The transport failed: mark closed and fail every circuit
    fn shutdown(&self, error: TorError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!("🔌 Link to {} lost: {}", self.relay.nickname, error);
        self.transport.close();

        let circuits: Vec<_> = lock(&self.circuits).drain().map(|(_, c)| c).collect();
        for circuit in circuits {
            circuit.on_link_closed(&error);
        }
    }

    /// Open a new circuit on this link with a fresh random id
    pub fn create_circuit(self: &Arc<Self>) -> Result<Arc<Circuit>> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let mut circuits = lock(&self.circuits);
        let id = allocate_circuit_id(&circuits, self.version)?;

        let sink: Arc<dyn CellSink> = self.clone();
        let circuit = Arc::new(Circuit::new(id, Arc::downgrade(&sink), self.config.clone()));
        circuit.attach();
        circuits.insert(id, circuit.clone());

        log::debug!("Allocated circuit {:#x} on link to {}", id, self.relay.nickname);
        Ok(circuit)
    }

    /// Close every circuit, then the transport
    pub fn close(&self) {
        let circuits: Vec<_> = lock(&self.circuits).values().cloned().collect();
        for circuit in circuits {
            circuit.close();
        }

        if !self.closed.swap(true, Ordering::SeqCst) {
            log::info!("🔒 Closing link to {}", self.relay.nickname);
        }
        self.transport.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Negotiated link protocol version
    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn circuit_count(&self) -> usize {
        lock(&self.circuits).len()
    }

    fn closed_error(&self) -> TorError {
        TorError::Transport(format!("link to {} is closed", self.relay.nickname))
    }
}

impl CellSink for Link {
    fn send_cell(&self, cell: &Cell) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let bytes = cell.serialize(self.version)?;
        let _guard = lock(&self.write_lock);
        if let Err(e) = self.transport.write_all(&bytes) {
            // The receive thread notices and fails the circuits
            self.transport.close();
            return Err(e);
        }
        Ok(())
    }

    fn release_circuit(&self, circuit_id: u32) {
        lock(&self.circuits).remove(&circuit_id);
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.transport.close();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("relay", &self.relay.nickname)
            .field("version", &self.version)
            .field("circuits", &self.circuit_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Random circuit id with the high bit set, not already in use
///
/// Link version 4 and later use 4-byte ids; earlier versions 2-byte ids.
fn allocate_circuit_id(in_use: &HashMap<u32, Arc<Circuit>>, version: u16) -> Result<u32> {
    let mut rng = rand::thread_rng();
    for _ in 0..CIRCUIT_ID_ATTEMPTS {
        let id = if version >= 4 {
            rng.gen::<u32>() | 0x8000_0000
        } else {
            (rng.gen::<u16>() | 0x8000) as u32
        };
        if !in_use.contains_key(&id) {
            return Ok(id);
        }
    }
    Err(TorError::Internal("no free circuit id".into()))
}
