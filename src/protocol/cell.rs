//! Tor cell protocol
//!
//! Implements the Tor cell format for communication with relays.
//! Cells are the basic unit of communication in the Tor protocol.
//!
//! ```text
//! fixed:    CIRCID (2 or 4) | COMMAND (1) | PAYLOAD (509)
//! variable: CIRCID (2 or 4) | COMMAND (1) | LENGTH (2) | PAYLOAD (LENGTH)
//! ```
//!
//! The circuit id is 2 bytes below link protocol 4. VERSIONS and every
//! command >= 128 use the variable layout.

use crate::error::{Result, TorError};
use std::net::{IpAddr, Ipv4Addr};

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - used for padding
    Padding = 0,
    /// CREATE - create a circuit (TAP)
    Create = 1,
    /// CREATED - circuit created (TAP)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - fast circuit creation
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created
    CreatedFast = 6,
    /// VERSIONS - negotiate versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell that can be sent early
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// PADDING_NEGOTIATE - negotiate padding
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Whether cells with this command carry a 2-byte length prefix
    pub fn is_variable_length(self) -> bool {
        is_variable_code(self as u8)
    }
}

fn is_variable_code(code: u8) -> bool {
    code == CellCommand::Versions as u8 || code >= 128
}

/// Width of the circuit id field for a link protocol version
pub fn circ_id_len(link_version: u16) -> usize {
    if link_version < 4 {
        2
    } else {
        4
    }
}

/// Tor cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (2 bytes on the wire below link version 4)
    pub circuit_id: u32,

    /// Command
    pub command: CellCommand,

    /// Payload (509 bytes for fixed-length cells)
    pub payload: Vec<u8>,
}

impl Cell {
    /// Payload size for fixed-length cells
    pub const PAYLOAD_SIZE: usize = 509;

    /// Create a new cell
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a RELAY cell
    pub fn relay(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::Relay, relay_payload)
    }

    /// Create a RELAY_EARLY cell (required for EXTEND)
    pub fn relay_early(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::RelayEarly, relay_payload)
    }

    /// Create a DESTROY cell with a reason code
    pub fn destroy(circuit_id: u32, reason: u8) -> Self {
        Self::new(circuit_id, CellCommand::Destroy, vec![reason])
    }

    /// Create a VERSIONS cell listing the versions we speak
    pub fn versions(versions: &[u16]) -> Self {
        let payload = versions.iter().flat_map(|v| v.to_be_bytes()).collect();
        Self::new(0, CellCommand::Versions, payload)
    }

    /// Create a NETINFO cell
    ///
    /// Format: TIME (4) | OTHERADDR | NMYADDR (1) | MYADDRS. Clients
    /// advertise no addresses of their own.
    pub fn netinfo(timestamp: u32, peer: IpAddr) -> Self {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&timestamp.to_be_bytes());
        match peer {
            IpAddr::V4(v4) => {
                payload.push(0x04);
                payload.push(4);
                payload.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                payload.push(0x06);
                payload.push(16);
                payload.extend_from_slice(&v6.octets());
            }
        }
        payload.push(0);
        Self::new(0, CellCommand::Netinfo, payload)
    }

    /// Versions listed in a VERSIONS payload
    pub fn parse_versions(payload: &[u8]) -> Result<Vec<u16>> {
        if payload.len() % 2 != 0 {
            return Err(TorError::ProtocolFraming(
                "VERSIONS payload has odd length".into(),
            ));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    /// Address the peer claims for itself in a NETINFO payload, if IPv4
    pub fn parse_netinfo_peer(payload: &[u8]) -> Option<Ipv4Addr> {
        // TIME (4) | ATYPE (1) | ALEN (1) | OTHERADDR | NMYADDR (1) | ATYPE | ALEN | ADDR
        let alen = *payload.get(5)? as usize;
        let mut pos = 6 + alen;
        let count = *payload.get(pos)?;
        pos += 1;
        for _ in 0..count {
            let atype = *payload.get(pos)?;
            let len = *payload.get(pos + 1)? as usize;
            let addr = payload.get(pos + 2..pos + 2 + len)?;
            if atype == 0x04 && len == 4 {
                return Some(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]));
            }
            pos += 2 + len;
        }
        None
    }

    /// Serialize cell to bytes for the given link protocol version
    pub fn serialize(&self, link_version: u16) -> Result<Vec<u8>> {
        let id_len = circ_id_len(link_version);
        let mut buf = Vec::with_capacity(id_len + 3 + Self::PAYLOAD_SIZE);

        // Circuit ID (big-endian)
        if id_len == 2 {
            let id = u16::try_from(self.circuit_id).map_err(|_| {
                TorError::ProtocolFraming(format!(
                    "Circuit id {:#x} does not fit link version {}",
                    self.circuit_id, link_version
                ))
            })?;
            buf.extend_from_slice(&id.to_be_bytes());
        } else {
            buf.extend_from_slice(&self.circuit_id.to_be_bytes());
        }

        // Command (1 byte)
        buf.push(self.command as u8);

        if self.command.is_variable_length() {
            let len = u16::try_from(self.payload.len()).map_err(|_| {
                TorError::ProtocolFraming(format!(
                    "Variable cell payload too long: {}",
                    self.payload.len()
                ))
            })?;
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&self.payload);
        } else {
            // Pad (or cut) to exactly 509 bytes
            let n = self.payload.len().min(Self::PAYLOAD_SIZE);
            buf.extend_from_slice(&self.payload[..n]);
            buf.resize(id_len + 1 + Self::PAYLOAD_SIZE, 0);
        }

        Ok(buf)
    }

    /// Parse exactly one cell from `data`
    pub fn parse(data: &[u8], link_version: u16) -> Result<Self> {
        match Self::decode(data, link_version)? {
            Some((cell, used)) if used == data.len() => Ok(cell),
            Some((_, used)) => Err(TorError::ProtocolFraming(format!(
                "{} trailing bytes after cell",
                data.len() - used
            ))),
            None => Err(TorError::ProtocolFraming("Cell too short".into())),
        }
    }

    /// Decode one cell from the front of a receive buffer
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a whole cell,
    /// otherwise the cell and the number of bytes it occupied.
    pub fn decode(data: &[u8], link_version: u16) -> Result<Option<(Self, usize)>> {
        let Some(frame) = Frame::locate(data, link_version) else {
            return Ok(None);
        };

        let command = CellCommand::from_u8(frame.code).ok_or_else(|| {
            TorError::ProtocolFraming(format!("Unknown command: {}", frame.code))
        })?;

        Ok(Some((
            Self {
                circuit_id: frame.circuit_id,
                command,
                payload: data[frame.start..frame.end].to_vec(),
            },
            frame.end,
        )))
    }

    /// Command code and length of a whole cell at the front of `data` whose
    /// command this crate does not know
    ///
    /// Lets a receive buffer skip such cells instead of failing on them.
    pub fn unknown_command(data: &[u8], link_version: u16) -> Option<(u8, usize)> {
        Frame::locate(data, link_version)
            .filter(|frame| CellCommand::from_u8(frame.code).is_none())
            .map(|frame| (frame.code, frame.end))
    }
}

/// Position of one whole cell inside a receive buffer
struct Frame {
    circuit_id: u32,
    code: u8,
    start: usize,
    end: usize,
}

impl Frame {
    fn locate(data: &[u8], link_version: u16) -> Option<Self> {
        let id_len = circ_id_len(link_version);
        if data.len() < id_len + 1 {
            return None;
        }

        let circuit_id = if id_len == 2 {
            u16::from_be_bytes([data[0], data[1]]) as u32
        } else {
            u32::from_be_bytes([data[0], data[1], data[2], data[3]])
        };
        let code = data[id_len];

        let (start, end) = if is_variable_code(code) {
            let header = id_len + 3;
            if data.len() < header {
                return None;
            }
            let len = u16::from_be_bytes([data[id_len + 1], data[id_len + 2]]) as usize;
            (header, header + len)
        } else {
            (id_len + 1, id_len + 1 + Cell::PAYLOAD_SIZE)
        };

        (data.len() >= end).then_some(Self {
            circuit_id,
            code,
            start,
            end,
        })
    }
}

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - relay data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (TAP)
    Extend = 6,
    /// EXTENDED - circuit extended (TAP)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - drop cell
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory connection
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
    /// ESTABLISH_INTRO - service registers an introduction point
    EstablishIntro = 32,
    /// ESTABLISH_RENDEZVOUS - client sets up a rendezvous point
    EstablishRendezvous = 33,
    /// INTRODUCE1 - client to introduction point
    Introduce1 = 34,
    /// INTRODUCE2 - introduction point to service
    Introduce2 = 35,
    /// RENDEZVOUS1 - service to rendezvous point
    Rendezvous1 = 36,
    /// RENDEZVOUS2 - rendezvous point to client
    Rendezvous2 = 37,
    /// INTRO_ESTABLISHED - introduction point acknowledged
    IntroEstablished = 38,
    /// RENDEZVOUS_ESTABLISHED - rendezvous point acknowledged
    RendezvousEstablished = 39,
    /// INTRODUCE_ACK - introduction point relayed our INTRODUCE1
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            32 => Some(RelayCommand::EstablishIntro),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            35 => Some(RelayCommand::Introduce2),
            36 => Some(RelayCommand::Rendezvous1),
            37 => Some(RelayCommand::Rendezvous2),
            38 => Some(RelayCommand::IntroEstablished),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }
}

/// Relay cell (payload within a RELAY or RELAY_EARLY cell)
///
/// ```text
/// CMD (1) | RECOGNIZED (2) | STREAM_ID (2) | DIGEST (4) | LENGTH (2) | DATA | padding
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized (always 0 for outgoing)
    pub recognized: u16,

    /// Stream ID (0 for circuit-level commands)
    pub stream_id: u16,

    /// Digest (4 bytes)
    pub digest: [u8; 4],

    /// Length of data
    pub length: u16,

    /// Data (up to 498 bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Size of the relay header
    pub const HEADER_SIZE: usize = 11;

    /// Maximum data size in relay cell
    pub const MAX_DATA_SIZE: usize = Cell::PAYLOAD_SIZE - Self::HEADER_SIZE;

    /// Byte range of the "recognized" field
    pub const RECOGNIZED_RANGE: std::ops::Range<usize> = 1..3;

    /// Byte range of the digest field
    pub const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

    /// Create a new relay cell
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            length: data.len() as u16,
            data,
        }
    }

    /// Serialize relay cell to the 509-byte relay payload
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::ProtocolFraming(format!(
                "Relay data too long: {} > {}",
                self.data.len(),
                Self::MAX_DATA_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(Cell::PAYLOAD_SIZE);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);

        // Pad to Cell::PAYLOAD_SIZE
        buf.resize(Cell::PAYLOAD_SIZE, 0);

        Ok(buf)
    }

    /// Parse relay cell from a decrypted relay payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(TorError::ProtocolFraming("Relay cell too short".into()));
        }

        let command = RelayCommand::from_u8(data[0]).ok_or_else(|| {
            TorError::ProtocolFraming(format!("Unknown relay command: {}", data[0]))
        })?;

        let recognized = u16::from_be_bytes([data[1], data[2]]);
        let stream_id = u16::from_be_bytes([data[3], data[4]]);
        let digest = [data[5], data[6], data[7], data[8]];
        let length = u16::from_be_bytes([data[9], data[10]]);

        if length as usize > Self::MAX_DATA_SIZE {
            return Err(TorError::ProtocolFraming(format!(
                "Relay length field too large: {}",
                length
            )));
        }

        let data_end = Self::HEADER_SIZE + length as usize;
        if data_end > data.len() {
            return Err(TorError::ProtocolFraming("Relay cell data truncated".into()));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            length,
            data: data[Self::HEADER_SIZE..data_end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_payload(seed: u8) -> Vec<u8> {
        (0..Cell::PAYLOAD_SIZE).map(|i| (i as u8).wrapping_mul(seed)).collect()
    }

    #[test]
    fn test_cell_round_trip_both_versions() {
        for version in [3u16, 4] {
            let fixed = Cell::new(0x1234, CellCommand::Relay, full_payload(7));
            let bytes = fixed.serialize(version).unwrap();
            assert_eq!(bytes.len(), circ_id_len(version) + 1 + Cell::PAYLOAD_SIZE);
            assert_eq!(Cell::parse(&bytes, version).unwrap(), fixed);

            let variable = Cell::new(0x1234, CellCommand::Certs, vec![9; 700]);
            let bytes = variable.serialize(version).unwrap();
            assert_eq!(bytes.len(), circ_id_len(version) + 3 + 700);
            assert_eq!(Cell::parse(&bytes, version).unwrap(), variable);
        }
    }

    #[test]
    fn test_fixed_cell_padding() {
        let cell = Cell::new(0x8000_0001, CellCommand::Create2, vec![1, 2, 3, 4]);
        let bytes = cell.serialize(4).unwrap();
        assert_eq!(bytes.len(), 514);
        assert_eq!(&bytes[..4], &0x8000_0001u32.to_be_bytes());
        assert_eq!(bytes[4], CellCommand::Create2 as u8);

        let parsed = Cell::parse(&bytes, 4).unwrap();
        assert_eq!(parsed.payload.len(), Cell::PAYLOAD_SIZE);
        assert_eq!(&parsed.payload[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_versions_cell_layout() {
        let cell = Cell::versions(&[3, 4]);
        let bytes = cell.serialize(3).unwrap();
        assert_eq!(bytes, vec![0, 0, 7, 0, 4, 0, 3, 0, 4]);
        let parsed = Cell::parse(&bytes, 3).unwrap();
        assert_eq!(Cell::parse_versions(&parsed.payload).unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_wide_circuit_id_rejected_on_v3() {
        let cell = Cell::new(0x8000_0001, CellCommand::Relay, vec![]);
        assert!(cell.serialize(3).is_err());
    }

    #[test]
    fn test_decode_incremental() {
        let cell = Cell::destroy(0x8000_0002, 3);
        let bytes = cell.serialize(4).unwrap();

        assert!(Cell::decode(&bytes[..100], 4).unwrap().is_none());
        let (parsed, used) = Cell::decode(&bytes, 4).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(parsed.command, CellCommand::Destroy);
        assert_eq!(parsed.payload[0], 3);

        let mut two = bytes.clone();
        two.extend_from_slice(&bytes);
        let (_, used) = Cell::decode(&two, 4).unwrap().unwrap();
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut bytes = Cell::new(1, CellCommand::Padding, vec![]).serialize(4).unwrap();
        bytes[4] = 99;
        assert!(Cell::parse(&bytes, 4).is_err());
    }

    #[test]
    fn test_unknown_command_length() {
        let mut bytes = Cell::new(1, CellCommand::Padding, vec![]).serialize(4).unwrap();
        bytes[4] = 20;
        assert_eq!(Cell::unknown_command(&bytes, 4), Some((20, bytes.len())));
        assert_eq!(Cell::unknown_command(&bytes[..100], 4), None);

        // Unassigned variable-length code: header plus declared length
        let unknown_var = [0, 0, 0, 0, 200, 0, 3, 1, 2, 3];
        assert_eq!(Cell::unknown_command(&unknown_var, 4), Some((200, 10)));

        let known = Cell::new(1, CellCommand::Padding, vec![]).serialize(4).unwrap();
        assert_eq!(Cell::unknown_command(&known, 4), None);
    }

    #[test]
    fn test_netinfo_round_trip() {
        let cell = Cell::netinfo(1_700_000_000, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(cell.payload.len(), 4 + 2 + 4 + 1);
        assert_eq!(Cell::parse_netinfo_peer(&cell.payload), None);

        let relay_netinfo = [
            0, 0, 0, 0, 4, 4, 127, 0, 0, 1, 1, 4, 4, 192, 0, 2, 1,
        ];
        assert_eq!(
            Cell::parse_netinfo_peer(&relay_netinfo),
            Some(Ipv4Addr::new(192, 0, 2, 1))
        );
    }

    #[test]
    fn test_relay_cell_serialization() {
        let relay = RelayCell::new(RelayCommand::Begin, 100, vec![5, 6, 7]);
        let bytes = relay.to_bytes().unwrap();
        assert_eq!(bytes.len(), Cell::PAYLOAD_SIZE);

        let parsed = RelayCell::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.command, RelayCommand::Begin);
        assert_eq!(parsed.stream_id, 100);
        assert_eq!(parsed.data, vec![5, 6, 7]);
    }

    #[test]
    fn test_relay_cell_size_limits() {
        assert_eq!(RelayCell::MAX_DATA_SIZE, 498);

        let max = RelayCell::new(RelayCommand::Data, 1, vec![0xaa; 498]);
        assert!(max.to_bytes().is_ok());

        let too_big = RelayCell::new(RelayCommand::Data, 1, vec![0xaa; 499]);
        assert!(too_big.to_bytes().is_err());

        let mut bytes = max.to_bytes().unwrap();
        bytes[9..11].copy_from_slice(&499u16.to_be_bytes());
        assert!(RelayCell::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_rendezvous_commands() {
        assert_eq!(RelayCommand::from_u8(33), Some(RelayCommand::EstablishRendezvous));
        assert_eq!(RelayCommand::from_u8(37), Some(RelayCommand::Rendezvous2));
        assert_eq!(RelayCommand::from_u8(40), Some(RelayCommand::IntroduceAck));
        assert_eq!(RelayCommand::from_u8(41), None);
    }
}
