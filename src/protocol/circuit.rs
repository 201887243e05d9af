//! Circuit state machine
//!
//! A [`Circuit`] is an ordered list of keyed hops over one link. Callers
//! drive it from their own threads (create, extend, rendezvous, streams)
//! and block until the link's receive thread publishes the matching reply
//! through [`Circuit::handle_cell`].
//!
//! Lock order: `hops` before `status`. The hop lock is held across a link
//! write so cells leave in the order their keystream was consumed. Stream
//! locks are never held together with either.

use super::cell::{Cell, CellCommand, RelayCell, RelayCommand};
use super::crypto::{decrypt_inbound, encrypt_outbound};
use super::node::CircuitNode;
use super::relay::Relay;
use super::state::{lock, Watch};
use super::stream::{StreamShared, StreamTable, TorStream, END_REASON_DONE, END_REASON_MISC};
use crate::config::TorConfig;
use crate::crypto::DH_LEN;
use crate::error::{Result, TorError};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// DESTROY reason: PROTOCOL
const DESTROY_REASON_PROTOCOL: u8 = 1;

/// DESTROY reason: NONE
const DESTROY_REASON_NONE: u8 = 0;

/// Where a circuit sends its cells
///
/// Implemented by the link; circuits hold it weakly so a dropped link
/// does not stay alive through its own circuits.
pub trait CellSink: Send + Sync {
    fn send_cell(&self, cell: &Cell) -> Result<()>;

    /// Forget a destroyed circuit
    fn release_circuit(&self, circuit_id: u32);
}

/// Circuit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Not yet registered on a link
    None,
    /// Registered on a link, CREATE not sent
    Connecting,
    /// CREATE sent, waiting for CREATED
    Creating,
    /// EXTEND sent, waiting for EXTENDED
    Extending,
    Ready,
    Destroyed,
    /// ESTABLISH_RENDEZVOUS sent
    RendezvousEstablishing,
    RendezvousEstablished,
    /// INTRODUCE1 sent
    RendezvousIntroducing,
    RendezvousIntroduced,
    /// Waiting for RENDEZVOUS2
    RendezvousCompleting,
    /// Joined with the hidden service; streams may be opened
    RendezvousCompleted,
}

impl CircuitState {
    /// Whether streams may be opened in this state
    pub fn accepts_streams(self) -> bool {
        matches!(self, CircuitState::Ready | CircuitState::RendezvousCompleted)
    }
}

#[derive(Debug, Clone)]
struct Status {
    state: CircuitState,

    /// Why the last operation failed; cleared by the next transition
    failure: Option<TorError>,
}

impl Status {
    fn new(state: CircuitState) -> Self {
        Self {
            state,
            failure: None,
        }
    }
}

/// A hop whose handshake reply is outstanding
#[derive(Debug)]
struct Pending {
    node: CircuitNode,
    /// State while waiting, which also names the expected reply
    during: CircuitState,
    /// State to return to if the handshake fails
    resume: CircuitState,
    success: CircuitState,
}

#[derive(Debug, Default)]
struct Hops {
    nodes: Vec<CircuitNode>,
    pending: Option<Pending>,
}

/// A Tor circuit
pub struct Circuit {
    id: u32,
    link: Weak<dyn CellSink>,
    config: TorConfig,
    status: Watch<Status>,
    hops: Watch<Hops>,
    streams: Mutex<StreamTable>,
}

impl Circuit {
    pub fn new(id: u32, link: Weak<dyn CellSink>, config: TorConfig) -> Self {
        Self {
            id,
            link,
            config,
            status: Watch::new(Status::new(CircuitState::None)),
            hops: Watch::new(Hops::default()),
            streams: Mutex::new(StreamTable::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> CircuitState {
        self.status.with(|s| s.state)
    }

    /// Error left behind by the last failed operation, if any
    pub fn last_failure(&self) -> Option<TorError> {
        self.status.with(|s| s.failure.clone())
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == CircuitState::Destroyed
    }

    /// Number of keyed hops
    pub fn hop_count(&self) -> usize {
        self.hops.with(|h| h.nodes.len())
    }

    /// Relays of the keyed hops, guard first
    pub fn relays(&self) -> Vec<Relay> {
        self.hops
            .with(|h| h.nodes.iter().filter_map(|n| n.relay().cloned()).collect())
    }

    /// Relay at the far end of the circuit
    pub fn last_relay(&self) -> Option<Relay> {
        self.hops
            .with(|h| h.nodes.last().and_then(|n| n.relay().cloned()))
    }

    pub fn stream_count(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Mark the circuit as registered on its link
    pub(crate) fn attach(&self) {
        self.status.update(|s| {
            (s.state == CircuitState::None).then(|| Status::new(CircuitState::Connecting))
        });
    }

    fn link(&self) -> Result<Arc<dyn CellSink>> {
        self.link
            .upgrade()
            .ok_or_else(|| TorError::CircuitClosed(format!("circuit {} lost its link", self.id)))
    }

    // ===== Building =====

    /// Create the first hop with CREATE / CREATED
    pub fn create(&self, relay: &Relay) -> Result<()> {
        log::info!("🔨 Creating circuit {} to {}", self.id, relay.nickname);

        let onion_key = relay.onion_key()?;
        let node = CircuitNode::new(Some(relay.clone()));
        let skin = node.onion_skin(&onion_key)?;

        self.start_handshake(
            node,
            &[CircuitState::None, CircuitState::Connecting],
            CircuitState::Creating,
            CircuitState::Ready,
        )?;

        if let Err(e) = self
            .link()
            .and_then(|link| link.send_cell(&Cell::new(self.id, CellCommand::Create, skin)))
        {
            self.abort_handshake();
            return Err(e);
        }

        self.await_state(
            CircuitState::Ready,
            self.config.circuit.build_timeout(),
            "CREATED",
        )
    }

    /// Extend the circuit by one hop with RELAY_EARLY EXTEND / EXTENDED
    ///
    /// EXTEND payload: address (4) | port (2) | onion skin (186) | identity (20)
    pub fn extend(&self, relay: &Relay) -> Result<()> {
        log::info!("  📡 Extending circuit {} to {}", self.id, relay.nickname);

        let onion_key = relay.onion_key()?;
        let address = relay.ipv4()?;
        let identity = relay.identity()?;
        let node = CircuitNode::new(Some(relay.clone()));
        let skin = node.onion_skin(&onion_key)?;

        let mut payload = Vec::with_capacity(6 + skin.len() + identity.len());
        payload.extend_from_slice(&address.octets());
        payload.extend_from_slice(&relay.or_port.to_be_bytes());
        payload.extend_from_slice(&skin);
        payload.extend_from_slice(&identity);

        self.start_handshake(
            node,
            &[CircuitState::Ready],
            CircuitState::Extending,
            CircuitState::Ready,
        )?;

        if let Err(e) = self.send_relay(None, RelayCell::new(RelayCommand::Extend, 0, payload), true)
        {
            self.abort_handshake();
            return Err(e);
        }

        self.await_state(
            CircuitState::Ready,
            self.config.circuit.build_timeout(),
            "EXTENDED",
        )?;
        log::info!(
            "  ✅ Extended to {} (now {} hops)",
            relay.nickname,
            self.hop_count()
        );
        Ok(())
    }

    /// Register a pending hop and move to `during`
    fn start_handshake(
        &self,
        node: CircuitNode,
        allowed: &[CircuitState],
        during: CircuitState,
        success: CircuitState,
    ) -> Result<()> {
        self.hops.modify(|hops| {
            if hops.pending.is_some() {
                return Err(TorError::InvalidState(format!(
                    "circuit {} already has a handshake in progress",
                    self.id
                )));
            }

            let mut resume = None;
            self.status.update(|s| {
                if allowed.contains(&s.state) {
                    resume = Some(s.state);
                    Some(Status::new(during))
                } else {
                    None
                }
            });
            let resume = resume.ok_or_else(|| {
                TorError::InvalidState(format!(
                    "circuit {} cannot start {:?} from {:?}",
                    self.id,
                    during,
                    self.state()
                ))
            })?;

            hops.pending = Some(Pending {
                node,
                during,
                resume,
                success,
            });
            Ok(())
        })
    }

    /// Drop the pending hop after its request could not be sent
    fn abort_handshake(&self) {
        self.hops.modify(|hops| {
            if let Some(pending) = hops.pending.take() {
                self.publish(Status::new(pending.resume));
            }
        });
    }

    /// Key the pending hop from a CREATED / EXTENDED / RENDEZVOUS2 reply
    ///
    /// A reply that fails key confirmation drops the pending hop and leaves
    /// the error for the waiter; the circuit itself survives.
    fn complete_handshake(&self, reply: &[u8], expected: CircuitState) -> Result<()> {
        self.hops.modify(|hops| {
            let pending = match hops.pending.take() {
                Some(p) if p.during == expected => p,
                other => {
                    hops.pending = other;
                    return Err(TorError::ProtocolViolation(format!(
                        "unsolicited handshake reply on circuit {} (expected {:?})",
                        self.id, expected
                    )));
                }
            };

            let Pending {
                mut node,
                resume,
                success,
                ..
            } = pending;

            match node.complete_handshake(reply) {
                Ok(()) => {
                    log::debug!("🔑 Circuit {} keyed hop {} ({})", self.id, hops.nodes.len() + 1, node.name());
                    hops.nodes.push(node);
                    self.publish(Status::new(success));
                }
                Err(e) => {
                    log::warn!("⚠️ Handshake on circuit {} failed: {}", self.id, e);
                    self.publish(Status {
                        state: resume,
                        failure: Some(e),
                    });
                }
            }
            Ok(())
        })
    }

    // ===== Rendezvous =====

    /// Ask the last hop to act as rendezvous point for `cookie`
    pub fn establish_rendezvous(&self, cookie: &[u8; 20]) -> Result<()> {
        log::info!("🤝 Establishing rendezvous on circuit {}", self.id);
        self.transition(&[CircuitState::Ready], CircuitState::RendezvousEstablishing)?;
        self.send_relay(
            None,
            RelayCell::new(RelayCommand::EstablishRendezvous, 0, cookie.to_vec()),
            false,
        )?;
        self.await_state(
            CircuitState::RendezvousEstablished,
            self.config.hidden_service.rendezvous_timeout(),
            "RENDEZVOUS_ESTABLISHED",
        )
    }

    /// Start the handshake with the hidden service's virtual hop
    ///
    /// Returns our `g^x` for the INTRODUCE1 payload. The hop is keyed when
    /// RENDEZVOUS2 arrives, see [`Circuit::wait_rendezvous_completed`].
    pub fn begin_rendezvous(&self) -> Result<[u8; DH_LEN]> {
        let node = CircuitNode::new(None);
        let public = node.public_key()?;
        self.start_handshake(
            node,
            &[CircuitState::RendezvousEstablished],
            CircuitState::RendezvousCompleting,
            CircuitState::RendezvousCompleted,
        )?;
        Ok(public)
    }

    /// Send INTRODUCE1 to the introduction point at the last hop
    pub fn introduce(&self, payload: Vec<u8>) -> Result<()> {
        log::info!("📨 Sending INTRODUCE1 on circuit {}", self.id);
        self.transition(&[CircuitState::Ready], CircuitState::RendezvousIntroducing)?;
        self.send_relay(
            None,
            RelayCell::new(RelayCommand::Introduce1, 0, payload),
            false,
        )?;
        self.await_state(
            CircuitState::RendezvousIntroduced,
            self.config.hidden_service.rendezvous_timeout(),
            "INTRODUCE_ACK",
        )
    }

    /// Block until RENDEZVOUS2 keyed the service's hop
    pub fn wait_rendezvous_completed(&self) -> Result<()> {
        self.await_state(
            CircuitState::RendezvousCompleted,
            self.config.hidden_service.rendezvous_timeout(),
            "RENDEZVOUS2",
        )?;
        log::info!("✅ Rendezvous complete on circuit {}", self.id);
        Ok(())
    }

    fn transition(&self, from: &[CircuitState], to: CircuitState) -> Result<()> {
        if self
            .status
            .update(|s| from.contains(&s.state).then(|| Status::new(to)))
        {
            Ok(())
        } else {
            Err(TorError::InvalidState(format!(
                "circuit {} cannot move to {:?} from {:?}",
                self.id,
                to,
                self.state()
            )))
        }
    }

    /// Publish a status unless the circuit is already destroyed
    fn publish(&self, next: Status) -> bool {
        self.status
            .update(|s| (s.state != CircuitState::Destroyed).then(|| next))
    }

    /// Block until `target`, a recorded failure or destruction
    ///
    /// Timing out closes the circuit.
    fn await_state(&self, target: CircuitState, timeout: Duration, what: &str) -> Result<()> {
        let result = self.status.wait_for(timeout, what, |s| {
            if let Some(failure) = &s.failure {
                return Some(Err(failure.clone()));
            }
            if s.state == target {
                Some(Ok(()))
            } else if s.state == CircuitState::Destroyed {
                Some(Err(TorError::CircuitClosed(format!("circuit {}", self.id))))
            } else {
                None
            }
        });

        if let Err(TorError::Timeout(msg)) = &result {
            log::warn!("⏱️ Circuit {} timed out waiting for {}", self.id, msg);
            self.close();
        }
        result
    }

    // ===== Streams =====

    /// Open a stream to `host:port` through the exit (or the hidden service)
    pub fn begin_stream(self: &Arc<Self>, host: &str, port: u16) -> Result<TorStream> {
        let target = format!("{}:{}", host, port);
        let mut payload = target.clone().into_bytes();
        payload.push(0);
        self.open_stream(RelayCommand::Begin, payload, &target)
    }

    /// Open a directory stream to the last hop
    pub fn begin_dir_stream(self: &Arc<Self>) -> Result<TorStream> {
        self.open_stream(RelayCommand::BeginDir, Vec::new(), "directory")
    }

    fn open_stream(
        self: &Arc<Self>,
        command: RelayCommand,
        payload: Vec<u8>,
        target: &str,
    ) -> Result<TorStream> {
        let state = self.state();
        if !state.accepts_streams() {
            return Err(TorError::InvalidState(format!(
                "circuit {} is {:?}, cannot open streams",
                self.id, state
            )));
        }

        let shared = lock(&self.streams).open()?;
        let stream_id = shared.id;
        log::info!(
            "📡 Opening stream {} on circuit {} to {}",
            stream_id,
            self.id,
            target
        );

        if let Err(e) = self.send_relay(None, RelayCell::new(command, stream_id, payload), false) {
            self.release_stream(stream_id);
            return Err(e);
        }

        let stream = TorStream::new(self.clone(), shared, self.config.stream.clone());
        stream.wait_connected()?;
        Ok(stream)
    }

    pub(crate) fn release_stream(&self, stream_id: u16) {
        lock(&self.streams).remove(stream_id);
    }

    fn stream(&self, stream_id: u16) -> Option<Arc<StreamShared>> {
        lock(&self.streams).get(stream_id)
    }

    /// Send a stream control cell (END) to the last hop
    pub(crate) fn send_relay_cell(&self, cell: RelayCell) -> Result<()> {
        self.send_relay(None, cell, false)
    }

    /// Send one RELAY_DATA cell to the last hop
    ///
    /// Takes a slot in the last hop's circuit package window, waiting up to
    /// the write timeout for a SENDME to open one.
    pub(crate) fn send_data(&self, stream_id: u16, data: &[u8]) -> Result<()> {
        let mut payload = RelayCell::new(RelayCommand::Data, stream_id, data.to_vec()).to_bytes()?;

        self.hops
            .wait_for(
                self.config.stream.write_timeout(),
                "circuit package window",
                |hops| {
                    if self.is_destroyed() {
                        return Some(Err(self.closed_error()));
                    }
                    let can_send = hops.nodes.last().map(|n| n.flow.can_send());
                    match can_send {
                        None => Some(Err(TorError::InvalidState(format!(
                            "circuit {} has no hops",
                            self.id
                        )))),
                        Some(false) => None,
                        Some(true) => Some(self.seal_and_send(hops, None, &mut payload, false, true)),
                    }
                },
            )
            .map_err(|e| match e {
                TorError::Timeout(_) => {
                    TorError::WindowExhausted(format!("circuit {} package window", self.id))
                }
                e => e,
            })
    }

    // ===== Sending =====

    /// Seal a relay cell for `hop` (the last hop when `None`) and send it
    fn send_relay(&self, hop: Option<usize>, cell: RelayCell, early: bool) -> Result<()> {
        log::trace!(
            "📤 Circuit {} relay {:?} stream={} len={}",
            self.id,
            cell.command,
            cell.stream_id,
            cell.data.len()
        );
        let mut payload = cell.to_bytes()?;
        self.hops
            .modify(|hops| self.seal_and_send(hops, hop, &mut payload, early, false))
    }

    fn seal_and_send(
        &self,
        hops: &mut Hops,
        hop: Option<usize>,
        payload: &mut [u8],
        early: bool,
        counts_against_window: bool,
    ) -> Result<()> {
        if self.is_destroyed() {
            return Err(self.closed_error());
        }

        let target = match hop {
            Some(index) if index < hops.nodes.len() => index,
            Some(index) => {
                return Err(TorError::InvalidState(format!(
                    "circuit {} has no hop {}",
                    self.id, index
                )))
            }
            None => hops.nodes.len().checked_sub(1).ok_or_else(|| {
                TorError::InvalidState(format!("circuit {} has no hops", self.id))
            })?,
        };

        if counts_against_window {
            hops.nodes[target].flow.on_send()?;
        }

        encrypt_outbound(
            hops.nodes[..=target].iter_mut().filter_map(|n| n.layer()),
            payload,
        );

        let cell = if early {
            Cell::relay_early(self.id, payload.to_vec())
        } else {
            Cell::relay(self.id, payload.to_vec())
        };
        self.link()?.send_cell(&cell)
    }

    fn closed_error(&self) -> TorError {
        self.last_failure()
            .unwrap_or_else(|| TorError::CircuitClosed(format!("circuit {}", self.id)))
    }

    // ===== Receiving =====

    /// Handle a cell the link routed to this circuit
    ///
    /// Runs on the link's receive thread.
    pub fn handle_cell(&self, cell: Cell) {
        let result = match cell.command {
            CellCommand::Created => self.complete_handshake(&cell.payload, CircuitState::Creating),
            CellCommand::Relay | CellCommand::RelayEarly => self.on_relay(cell.payload),
            CellCommand::Destroy => {
                let reason = cell.payload.first().copied().unwrap_or(DESTROY_REASON_NONE);
                log::warn!("💥 Relay destroyed circuit {} (reason {})", self.id, reason);
                self.teardown(TorError::circuit_destroyed(reason));
                Ok(())
            }
            CellCommand::Padding => Ok(()),
            other => {
                log::debug!("Ignoring {:?} cell on circuit {}", other, self.id);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn on_relay(&self, mut payload: Vec<u8>) -> Result<()> {
        if payload.len() != Cell::PAYLOAD_SIZE {
            return Err(TorError::ProtocolFraming(format!(
                "relay payload of {} bytes",
                payload.len()
            )));
        }

        let hop = self.hops.modify(|hops| {
            decrypt_inbound(hops.nodes.iter_mut().filter_map(|n| n.layer()), &mut payload)
                .ok_or_else(|| {
                    TorError::CryptoIntegrity(format!(
                        "relay cell on circuit {} not recognized by any hop",
                        self.id
                    ))
                })
        })?;

        if RelayCommand::from_u8(payload[0]).is_none() {
            log::debug!(
                "Dropping relay command {} from hop {} on circuit {}",
                payload[0],
                hop,
                self.id
            );
            return Ok(());
        }
        let cell = RelayCell::from_bytes(&payload)?;

        log::trace!(
            "📥 Circuit {} hop {} relay {:?} stream={} len={}",
            self.id,
            hop,
            cell.command,
            cell.stream_id,
            cell.data.len()
        );

        match cell.command {
            RelayCommand::Data => self.on_data(hop, cell),
            RelayCommand::Sendme => self.on_sendme(hop, cell.stream_id),
            RelayCommand::Connected => {
                match self.stream(cell.stream_id) {
                    Some(stream) => stream.on_connected(),
                    None => log::debug!("CONNECTED for unknown stream {}", cell.stream_id),
                }
                Ok(())
            }
            RelayCommand::End => {
                let reason = cell.data.first().copied().unwrap_or(END_REASON_MISC);
                if let Some(stream) = lock(&self.streams).remove(cell.stream_id) {
                    stream.on_end(reason);
                }
                Ok(())
            }
            RelayCommand::Truncated => {
                let reason = cell.data.first().copied().unwrap_or(DESTROY_REASON_NONE);
                log::warn!("✂️ Circuit {} truncated at hop {} (reason {})", self.id, hop, reason);
                if let Ok(link) = self.link() {
                    if let Err(e) = link.send_cell(&Cell::destroy(self.id, DESTROY_REASON_NONE)) {
                        log::debug!("DESTROY for circuit {} failed: {}", self.id, e);
                    }
                }
                self.teardown(TorError::circuit_destroyed(reason));
                Ok(())
            }
            RelayCommand::Extended => self.complete_handshake(&cell.data, CircuitState::Extending),
            RelayCommand::Rendezvous2 => {
                self.complete_handshake(&cell.data, CircuitState::RendezvousCompleting)
            }
            RelayCommand::RendezvousEstablished => {
                if !self.status.update(|s| {
                    (s.state == CircuitState::RendezvousEstablishing)
                        .then(|| Status::new(CircuitState::RendezvousEstablished))
                }) {
                    log::debug!("Unsolicited RENDEZVOUS_ESTABLISHED on circuit {}", self.id);
                }
                Ok(())
            }
            RelayCommand::IntroduceAck => {
                let accepted = cell.data.is_empty();
                let next = if accepted {
                    Status::new(CircuitState::RendezvousIntroduced)
                } else {
                    log::warn!("⚠️ Introduction point on circuit {} refused INTRODUCE1", self.id);
                    Status {
                        state: CircuitState::Ready,
                        failure: Some(TorError::CircuitBuildFailed(
                            "introduction point refused INTRODUCE1".into(),
                        )),
                    }
                };
                if !self.status.update(|s| {
                    (s.state == CircuitState::RendezvousIntroducing).then(|| next)
                }) {
                    log::debug!("Unsolicited INTRODUCE_ACK on circuit {}", self.id);
                }
                Ok(())
            }
            RelayCommand::Drop => Ok(()),
            other => {
                log::debug!("Ignoring relay {:?} on circuit {}", other, self.id);
                Ok(())
            }
        }
    }

    fn on_data(&self, hop: usize, cell: RelayCell) -> Result<()> {
        let circuit_sendme = self.hops.modify(|hops| match hops.nodes.get_mut(hop) {
            Some(node) => node.flow.on_receive(),
            None => Ok(false),
        })?;
        if circuit_sendme {
            log::debug!("Circuit {} sending SENDME to hop {}", self.id, hop);
            self.send_relay(Some(hop), RelayCell::new(RelayCommand::Sendme, 0, vec![]), false)?;
        }

        match self.stream(cell.stream_id) {
            Some(stream) => {
                if stream.on_data(&cell.data)? {
                    self.send_relay(
                        Some(hop),
                        RelayCell::new(RelayCommand::Sendme, cell.stream_id, vec![]),
                        false,
                    )?;
                }
            }
            None => log::debug!(
                "Dropping {} bytes for unknown stream {} on circuit {}",
                cell.data.len(),
                cell.stream_id,
                self.id
            ),
        }
        Ok(())
    }

    fn on_sendme(&self, hop: usize, stream_id: u16) -> Result<()> {
        if stream_id == 0 {
            self.hops.modify(|hops| match hops.nodes.get_mut(hop) {
                Some(node) => node.flow.on_sendme_received(),
                None => Ok(()),
            })
        } else {
            match self.stream(stream_id) {
                Some(stream) => stream.on_sendme(),
                None => Ok(()),
            }
        }
    }

    // ===== Teardown =====

    /// Close the circuit: END every stream, DESTROY, then tear down
    pub fn close(&self) {
        if self.is_destroyed() {
            return;
        }
        log::info!("🔒 Closing circuit {}", self.id);

        let open = lock(&self.streams).ids();
        for stream_id in open {
            if let Err(e) = self.send_relay(
                None,
                RelayCell::new(RelayCommand::End, stream_id, vec![END_REASON_DONE]),
                false,
            ) {
                log::debug!("END for stream {} failed: {}", stream_id, e);
            }
        }

        if let Ok(link) = self.link() {
            if let Err(e) = link.send_cell(&Cell::destroy(self.id, DESTROY_REASON_NONE)) {
                log::debug!("DESTROY for circuit {} failed: {}", self.id, e);
            }
        }

        self.teardown(TorError::Cancelled(format!("circuit {} closed", self.id)));
    }

    /// Destroy after a protocol error, telling the relay why
    fn fail(&self, error: TorError) {
        log::warn!("❌ Circuit {} failed: {}", self.id, error);
        if let Ok(link) = self.link() {
            if let Err(e) = link.send_cell(&Cell::destroy(self.id, DESTROY_REASON_PROTOCOL)) {
                log::debug!("DESTROY for circuit {} failed: {}", self.id, e);
            }
        }
        self.teardown(error);
    }

    /// The link under this circuit went away
    pub(crate) fn on_link_closed(&self, error: &TorError) {
        self.teardown(TorError::CircuitClosed(format!(
            "link closed under circuit {}: {}",
            self.id, error
        )));
    }

    /// Move to `Destroyed` exactly once and wake everyone waiting
    fn teardown(&self, failure: TorError) {
        let changed = self.status.update(|s| {
            (s.state != CircuitState::Destroyed).then(|| Status {
                state: CircuitState::Destroyed,
                failure: Some(failure.clone()),
            })
        });
        if !changed {
            return;
        }
        log::info!("Circuit {} destroyed: {}", self.id, failure);

        let streams = lock(&self.streams).drain();
        for stream in streams {
            stream.on_circuit_destroyed(&failure);
        }

        self.hops.modify(|hops| hops.pending = None);

        if let Some(link) = self.link.upgrade() {
            link.release_circuit(self.id);
        }
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("hops", &self.hop_count())
            .finish()
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            log::debug!("Circuit {} dropped while {:?}", self.id, self.state());
        }
    }
}
