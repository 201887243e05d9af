//! Client façade
//!
//! Owns one link per guard, picks paths from the directory and builds
//! circuits along them. It is also the [`CircuitProvider`] the hidden
//! service code builds its directory, introduction and rendezvous circuits
//! with.

use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::network::{Connector, Link, NetworkStats};
use crate::protocol::circuit::Circuit;
use crate::protocol::descriptor::OnionAddress;
use crate::protocol::hidden_service::{CircuitProvider, HiddenService};
use crate::protocol::relay::{Directory, Relay, RelaySelector};
use crate::protocol::state::lock;
use crate::protocol::stream::TorStream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Tor client
pub struct TorClient {
    connector: Arc<dyn Connector>,
    directory: Arc<dyn Directory>,
    config: TorConfig,

    /// Open links keyed by uppercase relay fingerprint
    links: Mutex<HashMap<String, Arc<Link>>>,
    stats: Mutex<NetworkStats>,
}

impl TorClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        directory: Arc<dyn Directory>,
        config: TorConfig,
    ) -> Result<Self> {
        config.validate()?;
        log::info!("✅ Tor client created");
        Ok(Self {
            connector,
            directory,
            config,
            links: Mutex::new(HashMap::new()),
            stats: Mutex::new(NetworkStats::default()),
        })
    }

    pub fn config(&self) -> &TorConfig {
        &self.config
    }

    pub fn stats(&self) -> NetworkStats {
        lock(&self.stats).clone()
    }

    /// Number of open links
    pub fn link_count(&self) -> usize {
        lock(&self.links).values().filter(|l| !l.is_closed()).count()
    }

    /// Open link to `relay`, reusing one that is still up
    pub fn link_to(&self, relay: &Relay) -> Result<Arc<Link>> {
        let key = relay.fingerprint.to_ascii_uppercase();
        if let Some(link) = lock(&self.links).get(&key) {
            if !link.is_closed() {
                return Ok(link.clone());
            }
        }

        lock(&self.stats).connections_attempted += 1;
        let result = self
            .connector
            .connect(relay.socket_addr(), self.config.link.connect_timeout())
            .and_then(|transport| Link::connect(transport, relay, &self.config));

        match result {
            Ok(link) => {
                lock(&self.stats).connections_successful += 1;
                lock(&self.links).insert(key, link.clone());
                Ok(link)
            }
            Err(e) => {
                lock(&self.stats).connections_failed += 1;
                Err(e)
            }
        }
    }

    /// Build a circuit along exactly `path`, guard first
    ///
    /// A failed build closes the partial circuit.
    pub fn build_circuit_through(&self, path: &[Relay]) -> Result<Arc<Circuit>> {
        let (first, rest) = path
            .split_first()
            .ok_or_else(|| TorError::CircuitBuildFailed("empty path".into()))?;

        log::info!(
            "🔨 Building circuit: {}",
            path.iter()
                .map(|r| r.nickname.as_str())
                .collect::<Vec<_>>()
                .join(" → ")
        );

        let circuit = self.link_to(first)?.create_circuit()?;
        let built = std::iter::once(first)
            .map(|relay| circuit.create(relay))
            .chain(rest.iter().map(|relay| circuit.extend(relay)))
            .collect::<Result<Vec<()>>>();

        match built {
            Ok(_) => {
                log::info!("✅ Circuit {} built with {} hops", circuit.id(), circuit.hop_count());
                Ok(circuit)
            }
            Err(e) => {
                circuit.close();
                Err(e)
            }
        }
    }

    /// Build a circuit on a random path
    ///
    /// The last hop is `last_hop` when given, otherwise an exit admitting
    /// `exit_port` when given, otherwise any running relay. Retryable
    /// failures are retried on a fresh path up to the configured attempts.
    pub fn build_circuit_with(
        &self,
        last_hop: Option<&Relay>,
        exit_port: Option<u16>,
    ) -> Result<Arc<Circuit>> {
        let attempts = self.config.circuit.max_build_attempts.max(1);

        let mut attempt = 1;
        loop {
            let result = self
                .select_path(last_hop, exit_port)
                .and_then(|path| self.build_circuit_through(&path));

            match result {
                Ok(circuit) => return Ok(circuit),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    log::warn!(
                        "⚠️ Circuit build attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn select_path(&self, last_hop: Option<&Relay>, exit_port: Option<u16>) -> Result<Vec<Relay>> {
        let selector = RelaySelector::from_directory(self.directory.as_ref());
        let hop_count = self.config.circuit.hop_count;

        let mut exclude: Vec<String> = last_hop.map(|r| r.fingerprint.clone()).into_iter().collect();
        let mut path: Vec<Relay> = Vec::with_capacity(hop_count);
        let free_hops = if last_hop.is_some() { hop_count - 1 } else { hop_count };

        for index in 0..free_hops {
            let excluded: Vec<&str> = exclude.iter().map(String::as_str).collect();
            let is_final = last_hop.is_none() && index + 1 == free_hops;

            let relay = if index == 0 && hop_count > 1 {
                selector.select_guard(&excluded)
            } else if is_final && exit_port.is_some() {
                selector.select_exit(&excluded, exit_port)
            } else if is_final {
                selector.select_any(&excluded)
            } else {
                selector.select_middle(&excluded)
            }
            .cloned()
            .ok_or_else(|| {
                TorError::NoRelaysAvailable(format!("no relay for hop {} of {}", index + 1, hop_count))
            })?;

            exclude.push(relay.fingerprint.clone());
            path.push(relay);
        }

        if let Some(relay) = last_hop {
            path.push(relay.clone());
        }
        Ok(path)
    }

    /// Open a stream to `host:port` through a fresh exit circuit
    pub fn connect(&self, host: &str, port: u16) -> Result<TorStream> {
        log::info!("🌐 Connecting to {}:{} via Tor...", host, port);
        let circuit = self.build_circuit_with(None, Some(port))?;
        match circuit.begin_stream(host, port) {
            Ok(stream) => Ok(stream),
            Err(e) => {
                circuit.close();
                Err(e)
            }
        }
    }

    /// Rendezvous with a v2 onion service
    ///
    /// Returns the joined rendezvous circuit; open streams on it with
    /// [`Circuit::begin_stream`] and an empty host.
    pub fn connect_onion(self: &Arc<Self>, address: &str) -> Result<Arc<Circuit>> {
        let address = OnionAddress::parse(address)?;
        let rendezvous = self.build_circuit_with(None, None)?;

        let provider: Arc<dyn CircuitProvider> = self.clone();
        let service = HiddenService::new(
            address,
            self.directory.clone(),
            provider,
            self.config.hidden_service.clone(),
        );

        match service.connect(&rendezvous) {
            Ok(()) => Ok(rendezvous),
            Err(e) => {
                rendezvous.close();
                Err(e)
            }
        }
    }

    /// Close every link and the circuits on them
    pub fn close(&self) {
        let links: Vec<_> = lock(&self.links).drain().map(|(_, l)| l).collect();
        for link in links {
            link.close();
        }
    }
}

impl CircuitProvider for TorClient {
    fn build_circuit(&self, last_hop: Option<&Relay>) -> Result<Arc<Circuit>> {
        self.build_circuit_with(last_hop, None)
    }
}

impl Drop for TorClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorClient")
            .field("links", &self.link_count())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Transport;
    use crate::protocol::relay::{RelayFlags, StaticDirectory};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    struct RefusingConnector;

    impl Connector for RefusingConnector {
        fn connect(&self, addr: SocketAddr, _timeout: Duration) -> Result<Arc<dyn Transport>> {
            Err(TorError::ConnectionFailed(format!("{} refused", addr)))
        }
    }

    fn relay(name: &str, fp: char, flags: &str) -> Relay {
        let mut relay = Relay::new(
            name,
            fp.to_string().repeat(40),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            9001,
        );
        relay.flags = RelayFlags::from_string(flags);
        relay.onion_key = Some(vec![0x30]);
        relay
    }

    fn client(relays: Vec<Relay>) -> TorClient {
        TorClient::new(
            Arc::new(RefusingConnector),
            Arc::new(StaticDirectory::new(relays)),
            TorConfig::default(),
        )
        .unwrap()
    }

    fn network() -> Vec<Relay> {
        vec![
            relay("guard", 'A', "Guard Fast Running Stable Valid"),
            relay("middle", 'B', "Fast Running Valid"),
            relay("exit", 'C', "Exit Running Valid"),
        ]
    }

    #[test]
    fn test_path_shape() {
        let client = client(network());
        let path = client.select_path(None, Some(443)).unwrap();
        let names: Vec<&str> = path.iter().map(|r| r.nickname.as_str()).collect();
        assert_eq!(names, vec!["guard", "middle", "exit"]);
    }

    #[test]
    fn test_path_to_fixed_last_hop() {
        let client = client(network());
        let target = relay("hsdir", 'D', "HSDir V2Dir Running");
        let path = client.select_path(Some(&target), None).unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path[0].nickname, "guard");
        assert_eq!(path[2].nickname, "hsdir");
    }

    #[test]
    fn test_no_exit_for_port() {
        let mut relays = network();
        relays[2].exit_ports = vec![80];
        let client = client(relays);
        assert!(matches!(
            client.select_path(None, Some(22)),
            Err(TorError::NoRelaysAvailable(_))
        ));
    }

    #[test]
    fn test_connection_failures_are_retried_and_counted() {
        let client = client(network());
        let err = client.build_circuit_with(None, Some(443)).unwrap_err();
        assert!(matches!(err, TorError::ConnectionFailed(_)));

        let stats = client.stats();
        assert_eq!(
            stats.connections_attempted,
            client.config().circuit.max_build_attempts as u64
        );
        assert_eq!(stats.connections_failed, stats.connections_attempted);
        assert_eq!(client.link_count(), 0);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = TorConfig::default();
        config.circuit.hop_count = 0;
        assert!(TorClient::new(
            Arc::new(RefusingConnector),
            Arc::new(StaticDirectory::default()),
            config
        )
        .is_err());
    }
}
