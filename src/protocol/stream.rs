//! Tor stream management
//!
//! Streams are multiplexed over a circuit by stream id. The circuit owns a
//! [`StreamTable`] of per-stream shared state which its receive path feeds
//! (DATA, CONNECTED, END, SENDME); the application holds a [`TorStream`]
//! handle over the same state. Integrates with [`FlowControl`] for SENDME
//! window management (500-cell initial window, 50-cell SENDME increments).

use super::cell::{RelayCell, RelayCommand};
use super::circuit::Circuit;
use super::flow_control::FlowControl;
use super::state::Watch;
use crate::config::StreamConfig;
use crate::error::{Result, TorError};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

/// RELAY_END reason: MISC
pub const END_REASON_MISC: u8 = 1;

/// RELAY_END reason: DONE (clean close)
pub const END_REASON_DONE: u8 = 6;

/// Name of a RELAY_END reason code
pub fn end_reason_name(reason: u8) -> &'static str {
    match reason {
        1 => "MISC",
        2 => "RESOLVEFAILED",
        3 => "CONNECTREFUSED",
        4 => "EXITPOLICY",
        5 => "DESTROY",
        6 => "DONE",
        7 => "TIMEOUT",
        8 => "NOROUTE",
        9 => "HIBERNATING",
        10 => "INTERNAL",
        11 => "RESOURCELIMIT",
        12 => "CONNRESET",
        13 => "TORPROTOCOL",
        14 => "NOTDIRECTORY",
        _ => "UNKNOWN",
    }
}

/// Stream lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// BEGIN sent, waiting for CONNECTED
    Connecting,
    Open,
    /// END sent or received, or the circuit died
    Destroyed,
}

#[derive(Debug)]
pub(crate) struct StreamInner {
    pub(crate) state: StreamState,
    buffer: VecDeque<u8>,
    pub(crate) flow: FlowControl,
    end_reason: Option<u8>,
    /// Set when the circuit died under the stream
    failure: Option<TorError>,
}

/// Stream state shared between the circuit and the application handle
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub(crate) id: u16,
    pub(crate) inner: Watch<StreamInner>,
}

impl StreamShared {
    fn new(id: u16) -> Self {
        Self {
            id,
            inner: Watch::new(StreamInner {
                state: StreamState::Connecting,
                buffer: VecDeque::new(),
                flow: FlowControl::stream(),
                end_reason: None,
                failure: None,
            }),
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        self.inner.with(|inner| inner.state)
    }

    pub(crate) fn on_connected(&self) {
        self.inner.modify(|inner| {
            if inner.state == StreamState::Connecting {
                inner.state = StreamState::Open;
            }
        });
        log::info!("✅ Stream {} connected", self.id);
    }

    /// Buffer received data
    ///
    /// Returns `true` when a stream-level SENDME is due.
    pub(crate) fn on_data(&self, data: &[u8]) -> Result<bool> {
        self.inner.modify(|inner| {
            let sendme = inner.flow.on_receive()?;
            inner.buffer.extend(data);
            Ok(sendme)
        })
    }

    pub(crate) fn on_sendme(&self) -> Result<()> {
        self.inner.modify(|inner| inner.flow.on_sendme_received())
    }

    pub(crate) fn on_end(&self, reason: u8) {
        self.inner.modify(|inner| {
            inner.state = StreamState::Destroyed;
            inner.end_reason = Some(reason);
        });
        log::info!(
            "Stream {} ended by peer: {} ({})",
            self.id,
            reason,
            end_reason_name(reason)
        );
    }

    pub(crate) fn on_circuit_destroyed(&self, failure: &TorError) {
        self.inner.modify(|inner| {
            if inner.state != StreamState::Destroyed {
                inner.state = StreamState::Destroyed;
                inner.failure = Some(TorError::Stream(format!(
                    "stream {} lost its circuit: {}",
                    self.id, failure
                )));
            }
        });
    }
}

/// Live streams of one circuit, keyed by stream id
#[derive(Debug)]
pub(crate) struct StreamTable {
    streams: HashMap<u16, Arc<StreamShared>>,

    /// Next stream ID to try
    next_stream_id: u16,
}

impl StreamTable {
    pub(crate) fn new() -> Self {
        Self {
            streams: HashMap::new(),
            next_stream_id: 1, // Stream IDs start at 1
        }
    }

    /// Allocate a new stream ID, skipping 0 and ids still in use
    fn allocate_stream_id(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_stream_id;
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            if self.next_stream_id == 0 {
                self.next_stream_id = 1; // Skip 0
            }
            if !self.streams.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(TorError::Stream("no free stream ids on circuit".into()))
    }

    /// Register a new stream in `Connecting` state
    pub(crate) fn open(&mut self) -> Result<Arc<StreamShared>> {
        let id = self.allocate_stream_id()?;
        let shared = Arc::new(StreamShared::new(id));
        self.streams.insert(id, shared.clone());
        Ok(shared)
    }

    pub(crate) fn get(&self, id: u16) -> Option<Arc<StreamShared>> {
        self.streams.get(&id).cloned()
    }

    pub(crate) fn remove(&mut self, id: u16) -> Option<Arc<StreamShared>> {
        self.streams.remove(&id)
    }

    pub(crate) fn ids(&self) -> Vec<u16> {
        self.streams.keys().copied().collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<StreamShared>> {
        self.streams.drain().map(|(_, s)| s).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }
}

/// A Tor stream for sending/receiving data
///
/// Closing is explicit through [`TorStream::close`]; dropping an open
/// stream closes it as well and logs a warning.
pub struct TorStream {
    circuit: Arc<Circuit>,
    shared: Arc<StreamShared>,
    config: StreamConfig,
}

impl TorStream {
    pub(crate) fn new(circuit: Arc<Circuit>, shared: Arc<StreamShared>, config: StreamConfig) -> Self {
        Self {
            circuit,
            shared,
            config,
        }
    }

    /// Get the stream ID
    pub fn stream_id(&self) -> u16 {
        self.shared.id
    }

    /// Get the circuit ID
    pub fn circuit_id(&self) -> u32 {
        self.circuit.id()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Check if stream is closed
    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Destroyed
    }

    /// Snapshot of the stream's flow-control windows
    pub fn flow_control(&self) -> FlowControl {
        self.shared.inner.with(|inner| inner.flow.clone())
    }

    /// Block until CONNECTED, END or the connect timeout
    pub(crate) fn wait_connected(&self) -> Result<()> {
        let id = self.shared.id;
        self.shared.inner.wait_for(
            self.config.connect_timeout(),
            &format!("CONNECTED for stream {}", id),
            |inner| match inner.state {
                StreamState::Open => Some(Ok(())),
                StreamState::Destroyed => Some(Err(inner.failure.clone().unwrap_or_else(|| {
                    let reason = inner.end_reason.unwrap_or(END_REASON_MISC);
                    TorError::Stream(format!(
                        "stream {} refused: {} ({})",
                        id,
                        reason,
                        end_reason_name(reason)
                    ))
                }))),
                StreamState::Connecting => None,
            },
        )
    }

    /// Send data, one RELAY_DATA cell per 498 bytes
    ///
    /// Each cell first takes a slot in the stream's package window and then
    /// one in the circuit's. Waiting for either is bounded by the write
    /// timeout, after which the send fails with `WindowExhausted`. A cell
    /// the circuit does not take gives its stream slot back.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let id = self.shared.id;

        for chunk in data.chunks(RelayCell::MAX_DATA_SIZE) {
            self.shared
                .inner
                .wait_for(
                    self.config.write_timeout(),
                    "stream package window",
                    |inner| {
                        if inner.state == StreamState::Destroyed {
                            return Some(Err(TorError::Stream(format!("stream {} is closed", id))));
                        }
                        if !inner.flow.can_send() {
                            return None;
                        }
                        Some(inner.flow.on_send())
                    },
                )
                .map_err(|e| match e {
                    TorError::Timeout(_) => {
                        TorError::WindowExhausted(format!("stream {} package window", id))
                    }
                    e => e,
                })?;

            if let Err(e) = self.circuit.send_data(id, chunk) {
                self.shared.inner.modify(|inner| inner.flow.refund_send());
                return Err(e);
            }
            log::trace!("Stream {} sent {} bytes", id, chunk.len());
        }

        Ok(())
    }

    /// Read buffered bytes, waiting up to the read timeout for some to arrive
    ///
    /// Returns `Ok(0)` once the peer ended the stream and the buffer is
    /// drained.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        self.shared.inner.wait_for(
            self.config.read_timeout(),
            &format!("data on stream {}", self.shared.id),
            |inner| {
                if !inner.buffer.is_empty() {
                    let n = inner.buffer.len().min(buf.len());
                    for (slot, byte) in buf.iter_mut().zip(inner.buffer.drain(..n)) {
                        *slot = byte;
                    }
                    return Some(Ok(n));
                }
                match inner.state {
                    StreamState::Destroyed => Some(inner.failure.clone().map_or(Ok(0), Err)),
                    _ => None,
                }
            },
        )
    }

    /// Read everything until the peer ends the stream
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut response = Vec::new();
        let mut buf = [0u8; RelayCell::MAX_DATA_SIZE];

        loop {
            match self.recv(&mut buf)? {
                0 => {
                    log::debug!("Stream {} EOF after {} bytes", self.shared.id, response.len());
                    return Ok(response);
                }
                n => response.extend_from_slice(&buf[..n]),
            }
        }
    }

    /// Close the stream by sending RELAY_END
    pub fn close(&self) -> Result<()> {
        let was_live = self.shared.inner.modify(|inner| {
            let live = inner.state != StreamState::Destroyed;
            inner.state = StreamState::Destroyed;
            live
        });
        self.circuit.release_stream(self.shared.id);

        if !was_live {
            return Ok(());
        }

        log::info!("Closing stream {}", self.shared.id);
        self.circuit.send_relay_cell(RelayCell::new(
            RelayCommand::End,
            self.shared.id,
            vec![END_REASON_DONE],
        ))
    }
}

impl Drop for TorStream {
    fn drop(&mut self) {
        if !self.is_closed() {
            log::warn!("Stream {} dropped without being closed", self.shared.id);
            if let Err(e) = self.close() {
                log::debug!("END for dropped stream {} failed: {}", self.shared.id, e);
            }
        }
    }
}

impl io::Read for TorStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.recv(buf)?)
    }
}

impl io::Write for TorStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Cells go out as soon as they are written
        Ok(())
    }
}

impl std::fmt::Debug for TorStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorStream")
            .field("circuit", &self.circuit.id())
            .field("stream", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
