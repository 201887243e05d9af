//! In-memory Tor network for integration tests
//!
//! [`FakeNetwork`] plays every relay a client talks to. It answers the link
//! handshake, keys hops from CREATE / EXTEND onion skins, peels and adds
//! relay crypto layers and runs streams at the exit. It also stands in for
//! one v2 hidden service: HSDirs serve its signed descriptor and its
//! introduction point splices the service onto the client's rendezvous
//! circuit.
//!
//! Exit streams echo what they receive, except for a few magic hosts:
//! `refused.example` (END before CONNECTED), `sink.example` (never sends a
//! stream SENDME) and `closing.example` (echoes one cell, then ENDs).

#![allow(dead_code)]

use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tor_circuit::crypto::{hybrid, keys, sha1, DhKeyPair, DH_LEN, HASH_LEN};
use tor_circuit::network::{Connector, Transport};
use tor_circuit::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand};
use tor_circuit::protocol::crypto::{encrypt_outbound, CryptoState, HopKeys};
use tor_circuit::protocol::descriptor::{encode_base32, time_period, OnionAddress};
use tor_circuit::protocol::relay::{Relay, RelayFlags, StaticDirectory};
use tor_circuit::{Result, TorClient, TorConfig, TorError};

/// Hybrid-encrypted `g^x` in CREATE / EXTEND
const ONION_SKIN_LEN: usize = 186;

/// EXTEND payload: address | port | onion skin | identity
const EXTEND_LEN: usize = 6 + ONION_SKIN_LEN + HASH_LEN;

const LINK_VERSIONS: [u16; 3] = [3, 4, 5];

const END_REASON_CONNECTREFUSED: u8 = 3;
const END_REASON_DONE: u8 = 6;
const DESTROY_REASON_CONNECTFAILED: u8 = 6;

pub fn onion_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs1_pem(include_str!("../fixtures/relay_onion_key.pem")).unwrap()
}

pub fn service_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs1_pem(include_str!("../fixtures/service_key.pem")).unwrap()
}

/// Poll `done` until it holds or five seconds pass
pub fn wait_until<F: FnMut() -> bool>(mut done: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

// ===== Byte pipe =====

#[derive(Default)]
struct Inbox {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// Relay-to-client half of a link
#[derive(Default)]
struct Pipe {
    inbox: Mutex<Inbox>,
    ready: Condvar,
}

impl Pipe {
    fn push(&self, bytes: &[u8]) {
        let mut inbox = self.inbox.lock().unwrap();
        if !inbox.closed {
            inbox.bytes.extend(bytes);
            self.ready.notify_all();
        }
    }

    fn close(&self) {
        self.inbox.lock().unwrap().closed = true;
        self.ready.notify_all();
    }

    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inbox = self.inbox.lock().unwrap();

        loop {
            if !inbox.bytes.is_empty() {
                let n = inbox.bytes.len().min(buf.len());
                for (slot, byte) in buf.iter_mut().zip(inbox.bytes.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if inbox.closed {
                return Ok(0);
            }

            inbox = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TorError::Timeout("fake link read".into()));
                    }
                    self.ready.wait_timeout(inbox, deadline - now).unwrap().0
                }
                None => self.ready.wait(inbox).unwrap(),
            };
        }
    }
}

/// Client end of a link into the fake network
pub struct FakeTransport {
    network: Arc<FakeNetwork>,
    link: usize,
    pipe: Arc<Pipe>,
    read_timeout: Mutex<Option<Duration>>,
}

impl Transport for FakeTransport {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let timeout = *self.read_timeout.lock().unwrap();
        self.pipe.read(buf, timeout)
    }

    fn write_all(&self, buf: &[u8]) -> Result<()> {
        self.network.receive(self.link, buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        *self.read_timeout.lock().unwrap() = timeout;
        Ok(())
    }

    fn close(&self) {
        self.pipe.close();
        self.network.state().close_link(self.link);
    }
}

/// Connects to relays of a [`FakeNetwork`] by address
pub struct MemoryConnector {
    network: Arc<FakeNetwork>,
}

impl Connector for MemoryConnector {
    fn connect(&self, addr: SocketAddr, _timeout: Duration) -> Result<Arc<dyn Transport>> {
        self.network.open_link(addr)
    }
}

// ===== Network state =====

/// What the network observed, for assertions
#[derive(Debug, Clone, Default)]
pub struct NetLog {
    pub connections: usize,
    pub extends: usize,
    pub extends_early: usize,
    pub begins: Vec<String>,
    pub descriptor_fetches: usize,
    pub introductions: usize,
    pub destroys: usize,
    /// SENDMEs the client sent, circuit-level (stream 0) and per stream
    pub circuit_sendmes: usize,
    pub stream_sendmes: usize,
}

struct FakeRelay {
    relay: Relay,
    offline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Echo,
    Sink,
    Closing,
    Directory,
}

struct FakeStream {
    kind: StreamKind,
    received: u32,
    request: Vec<u8>,
}

/// Relay end of one circuit hop
struct FakeHop {
    crypto: CryptoState,
    /// DATA cells received at this hop, for circuit SENDMEs
    received: u32,
    streams: HashMap<u16, FakeStream>,
}

impl FakeHop {
    fn new(keys: &HopKeys) -> Self {
        Self {
            crypto: CryptoState::new(&keys.reversed()),
            received: 0,
            streams: HashMap::new(),
        }
    }
}

struct LinkState {
    relay: usize,
    version: Option<u16>,
    pending: Vec<u8>,
    pipe: Arc<Pipe>,
    circuits: HashMap<u32, Vec<FakeHop>>,
    closed: bool,
}

struct FakeService {
    key: RsaPrivateKey,
    intro: Option<usize>,
    publish: bool,
    tamper: bool,
    refuse_introductions: bool,
}

struct NetState {
    relays: Vec<FakeRelay>,
    links: Vec<LinkState>,
    onion_key: RsaPrivateKey,
    service: FakeService,
    /// Cookie to (link, circuit, hop) of the rendezvous point
    rendezvous: HashMap<[u8; 20], (usize, u32, usize)>,
    log: NetLog,
}

/// A simulated set of relays plus one hidden service
pub struct FakeNetwork {
    state: Mutex<NetState>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetState {
                relays: Vec::new(),
                links: Vec::new(),
                onion_key: onion_key(),
                service: FakeService {
                    key: service_key(),
                    intro: None,
                    publish: true,
                    tamper: false,
                    refuse_introductions: false,
                },
                rendezvous: HashMap::new(),
                log: NetLog::default(),
            }),
        })
    }

    /// One guard, two middles, one exit, three HSDirs and an introduction point
    pub fn standard() -> Arc<Self> {
        let network = Self::new();
        network.add_relay("guard", "Guard Fast Running Stable Valid");
        network.add_relay("middle1", "Fast Running Valid");
        network.add_relay("middle2", "Fast Running Valid");
        network.add_relay("exit", "Exit Running Valid");
        network.add_relay("hsdir1", "HSDir V2Dir Running Valid");
        network.add_relay("hsdir2", "HSDir V2Dir Running Valid");
        network.add_relay("hsdir3", "HSDir V2Dir Running Valid");
        let intro = network.add_relay("intro", "Running Valid");

        let mut state = network.state();
        state.service.intro = state
            .relays
            .iter()
            .position(|r| r.relay.fingerprint == intro.fingerprint);
        drop(state);
        network
    }

    fn state(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap()
    }

    /// Add a relay listening on its own loopback address
    pub fn add_relay(&self, nickname: &str, flags: &str) -> Relay {
        let mut state = self.state();
        let index = state.relays.len() as u8;

        let mut relay = Relay::new(
            nickname,
            hex::encode_upper(sha1(nickname.as_bytes())),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 10 + index)),
            9001,
        );
        relay.flags = RelayFlags::from_string(flags);
        relay.onion_key = Some(keys::public_key_to_der(&state.onion_key.to_public_key()).unwrap());

        state.relays.push(FakeRelay {
            relay: relay.clone(),
            offline: false,
        });
        relay
    }

    /// A relay record nobody in the network answers for
    pub fn stranger(&self) -> Relay {
        let state = self.state();
        let mut relay = Relay::new(
            "stranger",
            "EE".repeat(20),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 250)),
            9001,
        );
        relay.onion_key = Some(keys::public_key_to_der(&state.onion_key.to_public_key()).unwrap());
        relay
    }

    pub fn relay(&self, nickname: &str) -> Relay {
        self.state()
            .relays
            .iter()
            .find(|r| r.relay.nickname == nickname)
            .map(|r| r.relay.clone())
            .unwrap()
    }

    pub fn directory(&self) -> Arc<StaticDirectory> {
        Arc::new(StaticDirectory::new(
            self.state().relays.iter().map(|r| r.relay.clone()).collect(),
        ))
    }

    pub fn client(self: &Arc<Self>) -> Arc<TorClient> {
        self.client_with(TorConfig::default())
    }

    pub fn client_with(self: &Arc<Self>, config: TorConfig) -> Arc<TorClient> {
        let connector = Arc::new(MemoryConnector {
            network: self.clone(),
        });
        Arc::new(TorClient::new(connector, self.directory(), config).unwrap())
    }

    pub fn log(&self) -> NetLog {
        self.state().log.clone()
    }

    pub fn service_address(&self) -> OnionAddress {
        OnionAddress::from_key(&self.state().service.key.to_public_key()).unwrap()
    }

    pub fn set_offline(&self, nickname: &str, offline: bool) {
        let mut state = self.state();
        if let Some(relay) = state.relays.iter_mut().find(|r| r.relay.nickname == nickname) {
            relay.offline = offline;
        }
    }

    /// HSDirs answer 404 when unpublished
    pub fn set_publish(&self, publish: bool) {
        self.state().service.publish = publish;
    }

    /// Serve descriptors altered after signing
    pub fn set_tamper_descriptors(&self, tamper: bool) {
        self.state().service.tamper = tamper;
    }

    pub fn set_refuse_introductions(&self, refuse: bool) {
        self.state().service.refuse_introductions = refuse;
    }

    /// Send DESTROY for every circuit on links to `nickname`
    pub fn destroy_circuits(&self, nickname: &str, reason: u8) {
        let mut state = self.state();
        for link in state.links_to(nickname) {
            let ids: Vec<u32> = state.links[link].circuits.drain().map(|(id, _)| id).collect();
            for id in ids {
                state.send(link, Cell::destroy(id, reason));
            }
        }
    }

    /// Drop every link to `nickname` as if the relay went away
    pub fn hang_up(&self, nickname: &str) {
        let mut state = self.state();
        for link in state.links_to(nickname) {
            state.links[link].pipe.close();
            state.close_link(link);
        }
    }

    fn open_link(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<dyn Transport>> {
        let mut state = self.state();
        state.log.connections += 1;

        let relay = state
            .relays
            .iter()
            .position(|r| r.relay.socket_addr() == addr && !r.offline)
            .ok_or_else(|| TorError::ConnectionFailed(format!("{} refused", addr)))?;

        let pipe = Arc::new(Pipe::default());
        state.links.push(LinkState {
            relay,
            version: None,
            pending: Vec::new(),
            pipe: pipe.clone(),
            circuits: HashMap::new(),
            closed: false,
        });

        Ok(Arc::new(FakeTransport {
            network: self.clone(),
            link: state.links.len() - 1,
            pipe,
            read_timeout: Mutex::new(None),
        }))
    }

    fn receive(&self, link: usize, bytes: &[u8]) -> Result<()> {
        self.state().receive(link, bytes)
    }
}

impl NetState {
    fn links_to(&self, nickname: &str) -> Vec<usize> {
        (0..self.links.len())
            .filter(|&l| !self.links[l].closed && self.relays[self.links[l].relay].relay.nickname == nickname)
            .collect()
    }

    fn close_link(&mut self, link: usize) {
        if let Some(state) = self.links.get_mut(link) {
            state.closed = true;
            state.circuits.clear();
        }
        self.rendezvous.retain(|_, (l, _, _)| *l != link);
    }

    fn send(&mut self, link: usize, cell: Cell) {
        let state = &self.links[link];
        let framing = if cell.command == CellCommand::Versions {
            3
        } else {
            state.version.unwrap_or(3)
        };
        state.pipe.push(&cell.serialize(framing).unwrap());
    }

    fn receive(&mut self, link: usize, bytes: &[u8]) -> Result<()> {
        if self.links[link].closed {
            return Err(TorError::Transport("fake link closed".into()));
        }
        self.links[link].pending.extend_from_slice(bytes);

        loop {
            let state = &mut self.links[link];
            let framing = state.version.unwrap_or(3);
            let (cell, used) = match Cell::decode(&state.pending, framing)? {
                Some(decoded) => decoded,
                None => return Ok(()),
            };
            state.pending.drain(..used);
            self.handle_cell(link, cell);
        }
    }

    fn handle_cell(&mut self, link: usize, cell: Cell) {
        match cell.command {
            CellCommand::Versions => {
                let offered = Cell::parse_versions(&cell.payload).unwrap_or_default();
                let version = LINK_VERSIONS
                    .iter()
                    .copied()
                    .filter(|v| offered.contains(v))
                    .max()
                    .unwrap_or(3);
                self.send(link, Cell::versions(&LINK_VERSIONS));
                self.links[link].version = Some(version);
                self.send(link, Cell::new(0, CellCommand::Certs, vec![0]));
                self.send(link, Cell::netinfo(0, IpAddr::V4(Ipv4Addr::LOCALHOST)));
            }
            CellCommand::Create => self.on_create(link, cell),
            CellCommand::Relay | CellCommand::RelayEarly => self.on_relay(link, cell),
            CellCommand::Destroy => {
                self.log.destroys += 1;
                self.links[link].circuits.remove(&cell.circuit_id);
            }
            _ => {}
        }
    }

    /// `g^y | KH` for an onion skin, with the relay's view of the keys
    fn tap_reply(&self, skin: &[u8]) -> Option<(Vec<u8>, HopKeys)> {
        let client_public = hybrid::decrypt(skin.get(..ONION_SKIN_LEN)?, &self.onion_key).ok()?;
        let dh = DhKeyPair::generate();
        let keys = HopKeys::derive(&dh.shared_secret(&client_public).ok()?);
        let mut reply = dh.public_bytes().to_vec();
        reply.extend_from_slice(&keys.key_hash);
        Some((reply, keys))
    }

    fn on_create(&mut self, link: usize, cell: Cell) {
        match self.tap_reply(&cell.payload) {
            Some((reply, keys)) => {
                self.links[link]
                    .circuits
                    .insert(cell.circuit_id, vec![FakeHop::new(&keys)]);
                self.send(link, Cell::new(cell.circuit_id, CellCommand::Created, reply));
            }
            None => self.send(link, Cell::destroy(cell.circuit_id, 1)),
        }
    }

    fn on_relay(&mut self, link: usize, cell: Cell) {
        let early = cell.command == CellCommand::RelayEarly;
        let circ = cell.circuit_id;
        let mut payload = cell.payload;

        let hop = match self.links[link].circuits.get_mut(&circ) {
            Some(hops) => hops
                .iter_mut()
                .position(|hop| hop.crypto.decrypt_backward(&mut payload)),
            None => return,
        };
        let (hop, relay_cell) = match hop.map(|h| (h, RelayCell::from_bytes(&payload))) {
            Some((hop, Ok(relay_cell))) => (hop, relay_cell),
            _ => return,
        };

        let stream_id = relay_cell.stream_id;
        match relay_cell.command {
            RelayCommand::Extend => self.on_extend(link, circ, hop, &relay_cell.data, early),
            RelayCommand::Begin => self.on_begin(link, circ, hop, stream_id, &relay_cell.data),
            RelayCommand::BeginDir => {
                self.open_stream(link, circ, hop, stream_id, StreamKind::Directory);
                self.reply(link, circ, hop, RelayCommand::Connected, stream_id, vec![]);
            }
            RelayCommand::Data => self.on_data(link, circ, hop, stream_id, relay_cell.data),
            RelayCommand::End => {
                if let Some(h) = self.hop_mut(link, circ, hop) {
                    h.streams.remove(&stream_id);
                }
            }
            RelayCommand::EstablishRendezvous => {
                if let Ok(cookie) = <[u8; 20]>::try_from(relay_cell.data.as_slice()) {
                    self.rendezvous.insert(cookie, (link, circ, hop));
                    self.reply(link, circ, hop, RelayCommand::RendezvousEstablished, 0, vec![]);
                }
            }
            RelayCommand::Introduce1 => self.on_introduce(link, circ, hop, &relay_cell.data),
            RelayCommand::Sendme if stream_id == 0 => self.log.circuit_sendmes += 1,
            RelayCommand::Sendme => self.log.stream_sendmes += 1,
            _ => {}
        }
    }

    fn hop_mut(&mut self, link: usize, circ: u32, hop: usize) -> Option<&mut FakeHop> {
        self.links[link].circuits.get_mut(&circ)?.get_mut(hop)
    }

    /// Seal a relay cell at `hop` and layer it back toward the client
    fn reply(&mut self, link: usize, circ: u32, hop: usize, command: RelayCommand, stream_id: u16, data: Vec<u8>) {
        let mut payload = match RelayCell::new(command, stream_id, data).to_bytes() {
            Ok(payload) => payload,
            Err(_) => return,
        };
        let hops = match self.links[link].circuits.get_mut(&circ) {
            Some(hops) => hops,
            None => return,
        };
        encrypt_outbound(hops[..=hop].iter_mut().map(|h| &mut h.crypto), &mut payload);
        self.send(link, Cell::relay(circ, payload));
    }

    fn on_extend(&mut self, link: usize, circ: u32, hop: usize, data: &[u8], early: bool) {
        self.log.extends += 1;
        if early {
            self.log.extends_early += 1;
        }
        if data.len() < EXTEND_LEN {
            return;
        }

        let identity = hex::encode_upper(&data[6 + ONION_SKIN_LEN..EXTEND_LEN]);
        let reachable = self
            .relays
            .iter()
            .any(|r| r.relay.fingerprint == identity && !r.offline);
        let answer = if reachable {
            self.tap_reply(&data[6..6 + ONION_SKIN_LEN])
        } else {
            None
        };

        match answer {
            Some((reply, keys)) => {
                if let Some(hops) = self.links[link].circuits.get_mut(&circ) {
                    hops.push(FakeHop::new(&keys));
                }
                self.reply(link, circ, hop, RelayCommand::Extended, 0, reply);
            }
            None => {
                self.reply(
                    link,
                    circ,
                    hop,
                    RelayCommand::Truncated,
                    0,
                    vec![DESTROY_REASON_CONNECTFAILED],
                );
                if let Some(hops) = self.links[link].circuits.get_mut(&circ) {
                    hops.truncate(hop + 1);
                }
            }
        }
    }

    fn open_stream(&mut self, link: usize, circ: u32, hop: usize, stream_id: u16, kind: StreamKind) {
        if let Some(h) = self.hop_mut(link, circ, hop) {
            h.streams.insert(
                stream_id,
                FakeStream {
                    kind,
                    received: 0,
                    request: Vec::new(),
                },
            );
        }
    }

    fn on_begin(&mut self, link: usize, circ: u32, hop: usize, stream_id: u16, data: &[u8]) {
        let target_bytes = data.split(|&b| b == 0).next().unwrap_or(&[]);
        let target = String::from_utf8_lossy(target_bytes).into_owned();
        self.log.begins.push(target.clone());

        let host = target.rsplit_once(':').map(|(host, _)| host).unwrap_or("");
        let kind = match host {
            "refused.example" => {
                self.reply(
                    link,
                    circ,
                    hop,
                    RelayCommand::End,
                    stream_id,
                    vec![END_REASON_CONNECTREFUSED],
                );
                return;
            }
            "sink.example" => StreamKind::Sink,
            "closing.example" => StreamKind::Closing,
            _ => StreamKind::Echo,
        };

        self.open_stream(link, circ, hop, stream_id, kind);
        self.reply(link, circ, hop, RelayCommand::Connected, stream_id, vec![]);
    }

    fn on_data(&mut self, link: usize, circ: u32, hop: usize, stream_id: u16, data: Vec<u8>) {
        let (circuit_sendme, stream) = match self.hop_mut(link, circ, hop) {
            Some(h) => {
                h.received += 1;
                let circuit_sendme = h.received % 100 == 0;
                let stream = h.streams.get_mut(&stream_id).map(|s| {
                    s.received += 1;
                    if s.kind == StreamKind::Directory {
                        s.request.extend_from_slice(&data);
                    }
                    (s.kind, s.received % 50 == 0, s.request.clone())
                });
                (circuit_sendme, stream)
            }
            None => return,
        };

        if circuit_sendme {
            self.reply(link, circ, hop, RelayCommand::Sendme, 0, vec![]);
        }
        let (kind, stream_sendme, request) = match stream {
            Some(stream) => stream,
            None => return,
        };
        if stream_sendme && kind != StreamKind::Sink {
            self.reply(link, circ, hop, RelayCommand::Sendme, stream_id, vec![]);
        }

        match kind {
            StreamKind::Echo => self.reply(link, circ, hop, RelayCommand::Data, stream_id, data),
            StreamKind::Closing => {
                self.reply(link, circ, hop, RelayCommand::Data, stream_id, data);
                self.end_stream(link, circ, hop, stream_id);
            }
            StreamKind::Sink => {}
            StreamKind::Directory => {
                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let response = self.serve_directory(&request);
                    for chunk in response.chunks(RelayCell::MAX_DATA_SIZE) {
                        self.reply(link, circ, hop, RelayCommand::Data, stream_id, chunk.to_vec());
                    }
                    self.end_stream(link, circ, hop, stream_id);
                }
            }
        }
    }

    fn end_stream(&mut self, link: usize, circ: u32, hop: usize, stream_id: u16) {
        self.reply(link, circ, hop, RelayCommand::End, stream_id, vec![END_REASON_DONE]);
        if let Some(h) = self.hop_mut(link, circ, hop) {
            h.streams.remove(&stream_id);
        }
    }

    fn serve_directory(&mut self, request: &[u8]) -> Vec<u8> {
        self.log.descriptor_fetches += 1;

        let request = String::from_utf8_lossy(request);
        let path = request.split_whitespace().nth(1).unwrap_or("");
        let descriptor = path
            .strip_prefix("/tor/rendezvous2/")
            .and_then(|id| self.descriptor_for(id));

        match descriptor {
            Some(text) => format!("HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\n{}", text).into_bytes(),
            None => b"HTTP/1.0 404 Not found\r\n\r\n".to_vec(),
        }
    }

    fn descriptor_for(&self, requested: &str) -> Option<String> {
        if !self.service.publish {
            return None;
        }
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();

        (0..2u8).find_map(|replica| {
            let (id, text) = self.signed_descriptor(replica, now)?;
            (encode_base32(&id) == requested).then_some(text)
        })
    }

    /// Signed v2 descriptor for `replica`, listing the introduction point
    fn signed_descriptor(&self, replica: u8, now: u64) -> Option<([u8; HASH_LEN], String)> {
        let intro = &self.relays[self.service.intro?].relay;
        let service = self.service.key.to_public_key();
        let address = OnionAddress::from_key(&service).ok()?;

        let mut secret_input = time_period(address.permanent_id(), now).to_be_bytes().to_vec();
        secret_input.push(replica);
        let secret_id_part = sha1(&secret_input);
        let mut id_input = address.permanent_id().to_vec();
        id_input.extend_from_slice(&secret_id_part);
        let id = sha1(&id_input);

        let intro_block = format!(
            "introduction-point {}\nip-address {}\nonion-port {}\nonion-key\n{}service-key\n{}",
            encode_base32(&hex::decode(&intro.fingerprint).ok()?),
            intro.address,
            intro.or_port,
            key_block(&self.onion_key.to_public_key()),
            key_block(&service),
        );

        let mut text = format!(
            "rendezvous-service-descriptor {}\nversion 2\npermanent-key\n{}secret-id-part {}\npublication-time 2024-01-01 00:00:00\nprotocol-versions 2,3\nintroduction-points\n{}signature\n",
            encode_base32(&id),
            key_block(&service),
            encode_base32(&secret_id_part),
            pem_block("MESSAGE", intro_block.as_bytes()),
        );

        let signature = self
            .service
            .key
            .sign(Pkcs1v15Sign::new_unprefixed(), &sha1(text.as_bytes()))
            .ok()?;
        text.push_str(&pem_block("SIGNATURE", &signature));

        if self.service.tamper {
            text = text.replace("protocol-versions 2,3", "protocol-versions 2");
        }
        Some((id, text))
    }

    fn on_introduce(&mut self, link: usize, circ: u32, hop: usize, data: &[u8]) {
        self.log.introductions += 1;

        match self.accept_introduction(data) {
            Some((rendezvous, reply, keys)) => {
                self.reply(link, circ, hop, RelayCommand::IntroduceAck, 0, vec![]);

                let (rlink, rcirc, rhop) = rendezvous;
                if let Some(hops) = self.links[rlink].circuits.get_mut(&rcirc) {
                    hops.push(FakeHop::new(&keys));
                }
                self.reply(rlink, rcirc, rhop, RelayCommand::Rendezvous2, 0, reply);
            }
            None => self.reply(link, circ, hop, RelayCommand::IntroduceAck, 0, vec![1]),
        }
    }

    /// The service's side of INTRODUCE1: find the rendezvous point, answer `g^x`
    #[allow(clippy::type_complexity)]
    fn accept_introduction(&self, data: &[u8]) -> Option<((usize, u32, usize), Vec<u8>, HopKeys)> {
        if self.service.refuse_introductions || data.len() <= HASH_LEN {
            return None;
        }
        let digest = keys::key_digest(&self.service.key.to_public_key()).ok()?;
        if data[..HASH_LEN] != digest[..] {
            return None;
        }

        // VER | IP | PORT | ID | KLEN | KEY | COOKIE | g^x
        let handshake = hybrid::decrypt(&data[HASH_LEN..], &self.service.key).ok()?;
        if handshake.first() != Some(&2) {
            return None;
        }
        let key_len = u16::from_be_bytes([*handshake.get(27)?, *handshake.get(28)?]) as usize;
        let rest = handshake.get(29 + key_len..)?;
        let cookie = <[u8; 20]>::try_from(rest.get(..20)?).ok()?;
        let client_public = rest.get(20..20 + DH_LEN)?;

        let rendezvous = *self.rendezvous.get(&cookie)?;
        let dh = DhKeyPair::generate();
        let keys = HopKeys::derive(&dh.shared_secret(client_public).ok()?);
        let mut reply = dh.public_bytes().to_vec();
        reply.extend_from_slice(&keys.key_hash);
        Some((rendezvous, reply, keys))
    }
}

fn pem_block(tag: &str, contents: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(contents);
    let mut out = format!("-----BEGIN {}-----\n", tag);
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", tag));
    out
}

fn key_block(key: &RsaPublicKey) -> String {
    pem_block("RSA PUBLIC KEY", &keys::public_key_to_der(key).unwrap())
}
