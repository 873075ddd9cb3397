// standard
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

// internal crates
use crate::config::ServiceConfig;
use crate::tor_crypto::*;
use crate::tor_engine;
use crate::tor_engine::*;

// bootstrap steps reported by successive calls to update()
const BOOTSTRAP_STEPS: [(u32, &str, &str); 3] = [
    (10, "conn_done", "Connected to a relay"),
    (50, "loading_descriptors", "Loading relay descriptors"),
    (100, "done", "Done"),
];

// a client which stalls mid-handshake gets dropped after this long
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// SOCKS5 reply codes
const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
const REPLY_ONION_SERVICE_NOT_FOUND: u8 = 0xF0;
const REPLY_ONION_ADDRESS_INVALID: u8 = 0xF6;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("mock launch failure")]
    LaunchFailureInjected(),

    #[error("failed to create data directory")]
    DataDirectoryCreationFailed(#[source] std::io::Error),

    #[error("failed to bind socks listener")]
    SocksListenerBindFailed(#[source] std::io::Error),

    #[error("failed to start socks listener thread")]
    SocksListenerThreadFailed(#[source] std::io::Error),

    #[error("mock bootstrap failure")]
    BootstrapFailureInjected(),

    #[error("onion address collision")]
    OnionAddressCollision(),

    #[error("Unknown Onion Service id")]
    UnknownOnionServiceId(),

    #[error("mock tor engine has been shut down")]
    EngineShutDown(),
}

impl From<Error> for tor_engine::Error {
    fn from(error: Error) -> Self {
        tor_engine::Error::Generic(error.to_string())
    }
}

/// How engines launched by a [`MockTorEngineFactory`] behave
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockBehavior {
    /// Bootstrap completes after a few calls to `update()`
    Normal,
    /// Bootstrap starts but never progresses
    StallBootstrap,
    /// `update()` fails once bootstrap has started
    FailBootstrap,
    /// `launch()` fails, as it would with a missing tor binary
    FailLaunch,
}

#[derive(Default)]
struct FactoryState {
    behavior: Mutex<Option<MockBehavior>>,
    launch_count: AtomicUsize,
    live_engines: Mutex<Vec<Arc<AtomicBool>>>,
}

/// Creates in-process [`MockTorEngine`]s. Clones share their behavior and
/// counters, so tests can keep a handle after passing one to a supervisor.
#[derive(Clone, Default)]
pub struct MockTorEngineFactory {
    state: Arc<FactoryState>,
}

impl MockTorEngineFactory {
    pub fn new() -> MockTorEngineFactory {
        Default::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> MockTorEngineFactory {
        let factory = MockTorEngineFactory::new();
        factory.set_behavior(behavior);
        factory
    }

    /// Applies to engines launched from now on
    pub fn set_behavior(&self, behavior: MockBehavior) {
        match self.state.behavior.lock() {
            Ok(mut current) => *current = Some(behavior),
            Err(_) => unreachable!("another thread panicked while holding the mock behavior lock"),
        }
    }

    pub fn behavior(&self) -> MockBehavior {
        match self.state.behavior.lock() {
            Ok(current) => current.unwrap_or(MockBehavior::Normal),
            Err(_) => unreachable!("another thread panicked while holding the mock behavior lock"),
        }
    }

    /// Number of calls to `launch()` so far
    pub fn launch_count(&self) -> usize {
        self.state.launch_count.load(Ordering::SeqCst)
    }

    /// Number of launched engines not yet shut down or dropped
    pub fn live_engine_count(&self) -> usize {
        match self.state.live_engines.lock() {
            Ok(engines) => engines.len(),
            Err(_) => unreachable!("another thread panicked while holding the mock engine lock"),
        }
    }

    /// Make every live engine fail its next `update()`, as a tor daemon
    /// exiting unexpectedly would
    pub fn crash_engines(&self) {
        match self.state.live_engines.lock() {
            Ok(engines) => {
                for crashed in engines.iter() {
                    crashed.store(true, Ordering::SeqCst);
                }
            }
            Err(_) => unreachable!("another thread panicked while holding the mock engine lock"),
        }
    }
}

impl TorEngineFactory for MockTorEngineFactory {
    fn launch(&self, config: &ServiceConfig) -> Result<Box<dyn TorEngine>, tor_engine::Error> {
        self.state.launch_count.fetch_add(1, Ordering::SeqCst);

        let behavior = self.behavior();
        if behavior == MockBehavior::FailLaunch {
            return Err(tor_engine::Error::LaunchFailed(Box::new(
                Error::LaunchFailureInjected(),
            )));
        }

        let mut engine = MockTorEngine::new(config, behavior)
            .map_err(|err| tor_engine::Error::LaunchFailed(Box::new(err)))?;
        match self.state.live_engines.lock() {
            Ok(mut engines) => engines.push(engine.crashed.clone()),
            Err(_) => unreachable!("another thread panicked while holding the mock engine lock"),
        }
        engine.factory = Some(self.state.clone());
        Ok(Box::new(engine))
    }
}

// onion service id -> (virtual port, target port)
type OnionServiceTable = Arc<Mutex<HashMap<V3OnionServiceId, (u16, u16)>>>;

/// An engine which never touches the network: a local SOCKS5 listener routes
/// `<service id>.onion:<virt port>` to `127.0.0.1:<target port>` for onion
/// services registered with it
pub struct MockTorEngine {
    behavior: MockBehavior,
    crashed: Arc<AtomicBool>,
    // set when launched by a factory, which tracks the crash flag until release
    factory: Option<Arc<FactoryState>>,
    bootstrap_started: bool,
    bootstrap_step: usize,
    pending_events: Vec<TorEvent>,
    onion_services: OnionServiceTable,
    socks_addr: SocketAddr,
    socks_server: Option<SocksServer>,
}

impl MockTorEngine {
    pub fn new(config: &ServiceConfig, behavior: MockBehavior) -> Result<MockTorEngine, Error> {
        std::fs::create_dir_all(config.data_dir()).map_err(Error::DataDirectoryCreationFailed)?;

        let onion_services: OnionServiceTable = Default::default();
        let socks_server = SocksServer::start(config.socks_port(), onion_services.clone())?;
        let socks_addr = socks_server.addr;

        Ok(MockTorEngine {
            behavior,
            crashed: Default::default(),
            factory: None,
            bootstrap_started: false,
            bootstrap_step: 0,
            pending_events: vec![TorEvent::LogReceived {
                line: format!("[notice] Opened Socks listener connection on {}", socks_addr),
            }],
            onion_services,
            socks_addr,
            socks_server: Some(socks_server),
        })
    }

    // stop the listener and drop out of the factory's crash list
    fn release(&mut self) {
        if let Some(socks_server) = self.socks_server.take() {
            socks_server.shutdown();
        }
        if let Some(factory) = self.factory.take() {
            match factory.live_engines.lock() {
                Ok(mut engines) => engines.retain(|crashed| !Arc::ptr_eq(crashed, &self.crashed)),
                Err(_) => unreachable!("another thread panicked while holding the mock engine lock"),
            }
        }
    }

    fn ensure_running(&self) -> Result<(), Error> {
        match self.socks_server {
            Some(_) => Ok(()),
            None => Err(Error::EngineShutDown()),
        }
    }
}

impl TorEngine for MockTorEngine {
    fn update(&mut self) -> Result<Vec<TorEvent>, tor_engine::Error> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(tor_engine::Error::Exited("mock tor engine crashed".to_string()));
        }

        let mut events = std::mem::take(&mut self.pending_events);
        if !self.bootstrap_started || self.bootstrap_step >= BOOTSTRAP_STEPS.len() {
            return Ok(events);
        }

        match self.behavior {
            MockBehavior::Normal | MockBehavior::FailLaunch => {
                let (progress, tag, summary) = BOOTSTRAP_STEPS[self.bootstrap_step];
                self.bootstrap_step += 1;
                events.push(TorEvent::BootstrapStatus {
                    progress,
                    tag: tag.to_string(),
                    summary: summary.to_string(),
                });
                if progress == 100 {
                    events.push(TorEvent::BootstrapComplete);
                }
            }
            MockBehavior::StallBootstrap => (),
            MockBehavior::FailBootstrap => return Err(Error::BootstrapFailureInjected().into()),
        }
        Ok(events)
    }

    fn bootstrap(&mut self) -> Result<(), tor_engine::Error> {
        self.ensure_running()?;
        if !self.bootstrap_started {
            self.bootstrap_started = true;
            self.pending_events.push(TorEvent::BootstrapStatus {
                progress: 5,
                tag: "conn".to_string(),
                summary: "Connecting to a relay".to_string(),
            });
        }
        Ok(())
    }

    fn socks_addr(&mut self) -> Result<Option<SocketAddr>, tor_engine::Error> {
        Ok(self.socks_server.as_ref().map(|_| self.socks_addr))
    }

    fn control_metadata(&self) -> String {
        format!("mock:{}", self.socks_addr)
    }

    fn add_onion_service(
        &mut self,
        private_key: Option<&Ed25519PrivateKey>,
        virt_port: u16,
        target_port: u16,
    ) -> Result<(Ed25519PrivateKey, V3OnionServiceId), tor_engine::Error> {
        self.ensure_running()?;

        let private_key = match private_key {
            Some(private_key) => private_key.clone(),
            None => Ed25519PrivateKey::generate(),
        };
        let service_id = V3OnionServiceId::from_private_key(&private_key);

        let mut onion_services = match self.onion_services.lock() {
            Ok(onion_services) => onion_services,
            Err(_) => unreachable!("another thread panicked while holding the onion service lock"),
        };
        if onion_services.contains_key(&service_id) {
            return Err(Error::OnionAddressCollision().into());
        }
        onion_services.insert(service_id.clone(), (virt_port, target_port));

        self.pending_events.push(TorEvent::OnionServicePublished {
            service_id: service_id.clone(),
        });
        Ok((private_key, service_id))
    }

    fn remove_onion_service(
        &mut self,
        service_id: &V3OnionServiceId,
    ) -> Result<(), tor_engine::Error> {
        let mut onion_services = match self.onion_services.lock() {
            Ok(onion_services) => onion_services,
            Err(_) => unreachable!("another thread panicked while holding the onion service lock"),
        };
        match onion_services.remove(service_id) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownOnionServiceId().into()),
        }
    }

    fn shutdown(&mut self) -> Result<(), tor_engine::Error> {
        self.release();
        match self.onion_services.lock() {
            Ok(mut onion_services) => onion_services.clear(),
            Err(_) => unreachable!("another thread panicked while holding the onion service lock"),
        }
        Ok(())
    }
}

impl Drop for MockTorEngine {
    fn drop(&mut self) {
        self.release();
    }
}

//
// SOCKS5 server
//

#[derive(Default)]
struct Connections {
    next_id: u64,
    streams: BTreeMap<u64, TcpStream>,
}

struct SocksServerState {
    stop: AtomicBool,
    onion_services: OnionServiceTable,
    // every open socket, so shutdown can sever relayed connections
    connections: Mutex<Connections>,
}

impl SocksServerState {
    fn track(&self, stream: &TcpStream) -> Option<u64> {
        let stream = stream.try_clone().ok()?;
        match self.connections.lock() {
            Ok(mut connections) => {
                let id = connections.next_id;
                connections.next_id += 1;
                connections.streams.insert(id, stream);
                Some(id)
            }
            Err(_) => unreachable!("another thread panicked while holding the connection lock"),
        }
    }

    fn untrack(&self, id: Option<u64>) {
        if let Some(id) = id {
            match self.connections.lock() {
                Ok(mut connections) => {
                    connections.streams.remove(&id);
                }
                Err(_) => unreachable!("another thread panicked while holding the connection lock"),
            }
        }
    }

    fn sever_all(&self) {
        let streams = match self.connections.lock() {
            Ok(mut connections) => std::mem::take(&mut connections.streams),
            Err(_) => unreachable!("another thread panicked while holding the connection lock"),
        };
        for stream in streams.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

struct SocksServer {
    addr: SocketAddr,
    state: Arc<SocksServerState>,
    accept_thread: Option<JoinHandle<()>>,
}

impl SocksServer {
    fn start(port: u16, onion_services: OnionServiceTable) -> Result<SocksServer, Error> {
        let listener = TcpListener::bind(("127.0.0.1", port)).map_err(Error::SocksListenerBindFailed)?;
        let addr = listener.local_addr().map_err(Error::SocksListenerBindFailed)?;

        let state = Arc::new(SocksServerState {
            stop: AtomicBool::new(false),
            onion_services,
            connections: Default::default(),
        });

        let accept_state = state.clone();
        let accept_thread = std::thread::Builder::new()
            .name("mock-socks-accept".to_string())
            .spawn(move || accept_loop(listener, accept_state))
            .map_err(Error::SocksListenerThreadFailed)?;

        Ok(SocksServer {
            addr,
            state,
            accept_thread: Some(accept_thread),
        })
    }

    // returns once the listener is closed and every connection is severed
    fn shutdown(mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        // wake the accept thread
        let _ = TcpStream::connect_timeout(&self.addr, Duration::from_secs(1));
        if let Some(accept_thread) = self.accept_thread.take() {
            let _ = accept_thread.join();
        }
        self.state.sever_all();
    }
}

fn accept_loop(listener: TcpListener, state: Arc<SocksServerState>) {
    for stream in listener.incoming() {
        if state.stop.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(error = %err, "mock socks accept failed");
                continue;
            }
        };
        let state = state.clone();
        let spawned = std::thread::Builder::new()
            .name("mock-socks-conn".to_string())
            .spawn(move || {
                let id = state.track(&stream);
                if let Err(err) = handle_connection(stream, &state) {
                    tracing::trace!(error = %err, "mock socks connection ended");
                }
                state.untrack(id);
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "failed to spawn mock socks connection thread");
        }
    }
    tracing::debug!("mock socks listener closed");
}

fn reply(stream: &mut TcpStream, code: u8) -> std::io::Result<()> {
    stream.write_all(&[0x05, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])?;
    stream.flush()
}

fn handle_connection(mut client: TcpStream, state: &SocksServerState) -> std::io::Result<()> {
    client.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

    // greeting: version, method count, methods
    let mut header = [0u8; 2];
    client.read_exact(&mut header)?;
    if header[0] != 0x05 {
        return Ok(());
    }
    let mut methods = vec![0u8; header[1] as usize];
    client.read_exact(&mut methods)?;
    if !methods.contains(&0x00) {
        client.write_all(&[0x05, 0xFF])?;
        return Ok(());
    }
    client.write_all(&[0x05, 0x00])?;

    // request: version, command, reserved, address type
    let mut request = [0u8; 4];
    client.read_exact(&mut request)?;
    if request[1] != 0x01 {
        return reply(&mut client, REPLY_COMMAND_NOT_SUPPORTED);
    }
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip)?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len)?;
            let mut domain = vec![0u8; len[0] as usize];
            client.read_exact(&mut domain)?;
            String::from_utf8_lossy(&domain).to_string()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip)?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        _ => return reply(&mut client, REPLY_ADDRESS_TYPE_NOT_SUPPORTED),
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port)?;
    let port = u16::from_be_bytes(port);

    tracing::trace!(%host, port, "mock socks CONNECT");

    // only onion services are reachable
    let service_id = match host.strip_suffix(".onion") {
        Some(_) => match V3OnionServiceId::from_onion_address(&host) {
            Ok(service_id) => service_id,
            Err(_) => return reply(&mut client, REPLY_ONION_ADDRESS_INVALID),
        },
        None => return reply(&mut client, REPLY_HOST_UNREACHABLE),
    };
    let ports = match state.onion_services.lock() {
        Ok(onion_services) => onion_services.get(&service_id).copied(),
        Err(_) => unreachable!("another thread panicked while holding the onion service lock"),
    };
    let target_port = match ports {
        Some((virt_port, target_port)) if virt_port == port => target_port,
        Some(_) => return reply(&mut client, REPLY_GENERAL_FAILURE),
        None => return reply(&mut client, REPLY_ONION_SERVICE_NOT_FOUND),
    };

    let upstream = match TcpStream::connect(("127.0.0.1", target_port)) {
        Ok(upstream) => upstream,
        Err(_) => return reply(&mut client, REPLY_CONNECTION_REFUSED),
    };
    reply(&mut client, REPLY_SUCCEEDED)?;
    client.set_read_timeout(None)?;

    relay(client, upstream, state)
}

// copy both directions until either side closes
fn relay(client: TcpStream, upstream: TcpStream, state: &SocksServerState) -> std::io::Result<()> {
    let upstream_id = state.track(&upstream);

    let mut client_reader = client.try_clone()?;
    let mut upstream_writer = upstream.try_clone()?;
    let outbound = std::thread::spawn(move || {
        let _ = std::io::copy(&mut client_reader, &mut upstream_writer);
        let _ = upstream_writer.shutdown(Shutdown::Write);
    });

    let mut upstream_reader = upstream;
    let mut client_writer = client;
    let _ = std::io::copy(&mut upstream_reader, &mut client_writer);
    let _ = client_writer.shutdown(Shutdown::Write);

    let _ = outbound.join();
    state.untrack(upstream_id);
    Ok(())
}

#[cfg(test)]
fn socks_connect(
    proxy: SocketAddr,
    host: &str,
    port: u16,
) -> anyhow::Result<(u8, TcpStream)> {
    let mut stream = TcpStream::connect(proxy)?;
    stream.write_all(&[0x05, 0x01, 0x00])?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method)?;
    anyhow::ensure!(method == [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request)?;

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply)?;
    Ok((reply[1], stream))
}

#[test]
fn test_mock_tor_engine() -> anyhow::Result<()> {
    let data_dir = std::env::temp_dir().join("test_mock_tor_engine");
    let factory = MockTorEngineFactory::new();
    let mut engine = factory.launch(&ServiceConfig::new(&data_dir, 0))?;
    assert_eq!(factory.launch_count(), 1);

    engine.bootstrap()?;
    let mut bootstrapped = false;
    for _ in 0..10 {
        if engine.update()?.contains(&TorEvent::BootstrapComplete) {
            bootstrapped = true;
            break;
        }
    }
    assert!(bootstrapped);

    let socks_addr = engine
        .socks_addr()?
        .ok_or_else(|| anyhow::anyhow!("no socks listener"))?;
    assert_eq!(engine.control_metadata(), format!("mock:{}", socks_addr));

    // route an onion service to a local listener
    let target = TcpListener::bind("127.0.0.1:0")?;
    let target_port = target.local_addr()?.port();
    let (private_key, service_id) = engine.add_onion_service(None, 80, target_port)?;
    assert_eq!(V3OnionServiceId::from_private_key(&private_key), service_id);
    assert!(engine.add_onion_service(Some(&private_key), 80, target_port).is_err());
    assert!(engine
        .update()?
        .contains(&TorEvent::OnionServicePublished {
            service_id: service_id.clone()
        }));

    let (code, mut client) = socks_connect(socks_addr, &service_id.to_onion_address(), 80)?;
    assert_eq!(code, REPLY_SUCCEEDED);
    let (mut server, _) = target.accept()?;
    client.write_all(b"ping")?;
    let mut buf = [0u8; 4];
    server.read_exact(&mut buf)?;
    assert_eq!(&buf, b"ping");
    server.write_all(b"pong")?;
    client.read_exact(&mut buf)?;
    assert_eq!(&buf, b"pong");

    // unknown onion services and clearnet hosts are unreachable
    let unknown = V3OnionServiceId::from_private_key(&Ed25519PrivateKey::generate());
    let (code, _) = socks_connect(socks_addr, &unknown.to_onion_address(), 80)?;
    assert_eq!(code, REPLY_ONION_SERVICE_NOT_FOUND);
    let (code, _) = socks_connect(socks_addr, "example.com", 80)?;
    assert_eq!(code, REPLY_HOST_UNREACHABLE);

    engine.remove_onion_service(&service_id)?;
    assert!(engine.remove_onion_service(&service_id).is_err());

    // shutdown severs relayed connections and closes the listener
    engine.shutdown()?;
    client.set_read_timeout(Some(Duration::from_secs(5)))?;
    assert_eq!(client.read(&mut buf)?, 0);
    assert!(TcpStream::connect(socks_addr).is_err());
    assert_eq!(engine.socks_addr()?, None);

    Ok(())
}

#[test]
fn test_mock_tor_engine_behaviors() -> anyhow::Result<()> {
    let data_dir = std::env::temp_dir().join("test_mock_tor_engine_behaviors");
    let config = ServiceConfig::new(&data_dir, 0);

    let factory = MockTorEngineFactory::with_behavior(MockBehavior::FailLaunch);
    assert!(matches!(
        factory.launch(&config),
        Err(tor_engine::Error::LaunchFailed(_))
    ));

    factory.set_behavior(MockBehavior::FailBootstrap);
    let mut engine = factory.launch(&config)?;
    engine.update()?;
    engine.bootstrap()?;
    assert!(engine.update().is_err());

    factory.set_behavior(MockBehavior::StallBootstrap);
    let mut engine = factory.launch(&config)?;
    engine.bootstrap()?;
    for _ in 0..10 {
        assert!(!engine.update()?.contains(&TorEvent::BootstrapComplete));
    }

    factory.crash_engines();
    assert!(matches!(engine.update(), Err(tor_engine::Error::Exited(_))));
    assert_eq!(factory.launch_count(), 3);

    // shut down and dropped engines leave the crash list
    assert_eq!(factory.live_engine_count(), 2);
    engine.shutdown()?;
    assert_eq!(factory.live_engine_count(), 1);
    drop(engine);
    assert_eq!(factory.live_engine_count(), 1);
    for _ in 0..3 {
        drop(factory.launch(&config)?);
    }
    assert_eq!(factory.live_engine_count(), 1);

    Ok(())
}
