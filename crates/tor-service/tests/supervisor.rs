// standard
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

// internal crates
use tor_service::config::ServiceConfig;
use tor_service::http_client::{HttpMethod, HttpRequest};
use tor_service::mock_tor_engine::{MockBehavior, MockTorEngineFactory};
use tor_service::registry::KeyOrigin;
use tor_service::tor_crypto::Ed25519PrivateKey;
use tor_service::tor_engine;
use tor_service::tor_engine::{TorEngine, TorEngineFactory};
use tor_service::{Error, ServiceStatus, TorSupervisor};

const TEST_KEY_BLOB: &str = "ED25519-V3:YE3GZtDmc+izGijWKgeVRabbXqK456JKKGONDBhV+kPBVKa2mHVQqnRTVuFXe3inU3YW6qvc7glYEwe9rK0LhQ==";
const TEST_ONION_ADDRESS: &str = "6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd.onion";

fn data_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join("tor_service_tests").join(name)
}

fn mock_supervisor() -> (MockTorEngineFactory, TorSupervisor) {
    let factory = MockTorEngineFactory::new();
    let supervisor = TorSupervisor::new(factory.clone());
    (factory, supervisor)
}

#[test]
fn test_init_or_start_idempotent() -> anyhow::Result<()> {
    let (factory, supervisor) = mock_supervisor();
    assert_eq!(supervisor.status(), ServiceStatus::NotStarted);

    let config = ServiceConfig::new(data_dir("test_init_or_start_idempotent"), 0);
    let first = supervisor.init_or_start(config.clone())?;
    assert_eq!(supervisor.status(), ServiceStatus::Running);
    assert_eq!(supervisor.socks_proxy()?, first.socks_addr);

    let second = supervisor.init_or_start(config.clone())?;
    assert_eq!(first, second);

    // naming the port picked by the engine is the same configuration
    let explicit = ServiceConfig::new(config.data_dir(), first.socks_addr.port());
    assert_eq!(supervisor.init_or_start(explicit)?, first);

    // a different timeout is not a different service
    let timeout = config.with_bootstrap_timeout(Duration::from_secs(5));
    assert_eq!(supervisor.init_or_start(timeout)?, first);

    assert_eq!(factory.launch_count(), 1);
    Ok(())
}

#[test]
fn test_init_or_start_conflict() -> anyhow::Result<()> {
    let (factory, supervisor) = mock_supervisor();
    let data_dir = data_dir("test_init_or_start_conflict");
    let running = supervisor.init_or_start(ServiceConfig::new(&data_dir, 0))?;

    let other_port = match running.socks_addr.port() {
        u16::MAX => 1024,
        port => port + 1,
    };
    assert!(matches!(
        supervisor.init_or_start(ServiceConfig::new(&data_dir, other_port)),
        Err(Error::AlreadyRunningConflict(_))
    ));
    assert!(matches!(
        supervisor.init_or_start(ServiceConfig::new(data_dir.join("other"), 0)),
        Err(Error::AlreadyRunningConflict(_))
    ));

    // running service untouched
    assert_eq!(supervisor.status(), ServiceStatus::Running);
    assert_eq!(supervisor.socks_proxy()?, running.socks_addr);
    assert_eq!(factory.launch_count(), 1);
    Ok(())
}

#[test]
fn test_invalid_config() {
    let (factory, supervisor) = mock_supervisor();
    assert!(matches!(
        supervisor.init_or_start(ServiceConfig::new("relative", 0)),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(supervisor.status(), ServiceStatus::NotStarted);
    assert_eq!(factory.launch_count(), 0);
}

#[test]
fn test_hidden_service_lifecycle() -> anyhow::Result<()> {
    let (_factory, supervisor) = mock_supervisor();

    // nothing works before the service runs
    assert!(matches!(
        supervisor.create_hidden_service(80, 8080, None),
        Err(Error::ServiceNotReady(ServiceStatus::NotStarted))
    ));

    let start = supervisor.init_or_start(ServiceConfig::new(
        data_dir("test_hidden_service_lifecycle"),
        0,
    ))?;

    let info = supervisor.create_hidden_service(80, 8080, None)?;
    assert_eq!(info.control, start.control);
    let services = supervisor.hidden_services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].onion_address(), info.onion_address);
    assert_eq!(services[0].key_origin, KeyOrigin::Generated);
    assert_eq!((services[0].virt_port, services[0].target_port), (80, 8080));

    // the mock engine publishes immediately
    supervisor.poll()?;
    assert!(supervisor.hidden_services()[0].published);

    // bare service ids are accepted too
    let service_id = info.onion_address.trim_end_matches(".onion");
    supervisor.delete_hidden_service(service_id)?;
    assert!(matches!(
        supervisor.delete_hidden_service(&info.onion_address),
        Err(Error::UnknownAddress(_))
    ));
    assert!(supervisor.hidden_services().is_empty());

    assert!(matches!(
        supervisor.delete_hidden_service("not-an-onion-address"),
        Err(Error::UnknownAddress(_))
    ));
    assert!(matches!(
        supervisor.create_hidden_service(0, 8080, None),
        Err(Error::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn test_supplied_key_is_deterministic() -> anyhow::Result<()> {
    let private_key = Ed25519PrivateKey::from_key_blob(TEST_KEY_BLOB)?;

    let mut addresses: Vec<String> = Default::default();
    for name in ["test_supplied_key_a", "test_supplied_key_b"] {
        let (_factory, supervisor) = mock_supervisor();
        supervisor.init_or_start(ServiceConfig::new(data_dir(name), 0))?;
        let info = supervisor.create_hidden_service(80, 8080, Some(private_key.clone()))?;
        assert_eq!(supervisor.hidden_services()[0].key_origin, KeyOrigin::Supplied);

        // the same key cannot be registered twice
        assert!(matches!(
            supervisor.create_hidden_service(81, 8081, Some(private_key.clone())),
            Err(Error::DuplicateAddress(_))
        ));
        addresses.push(info.onion_address);
        supervisor.shutdown()?;
    }
    assert_eq!(addresses, vec![TEST_ONION_ADDRESS, TEST_ONION_ADDRESS]);
    Ok(())
}

#[test]
fn test_start_if_not_running() -> anyhow::Result<()> {
    let (factory, supervisor) = mock_supervisor();
    let private_key = Ed25519PrivateKey::from_key_blob(TEST_KEY_BLOB)?;
    let config =
        ServiceConfig::new(data_dir("test_start_if_not_running"), 0).with_onion_key(private_key);

    let first = supervisor.start_if_not_running(config.clone(), 8080)?;
    assert_eq!(first.onion_address, TEST_ONION_ADDRESS);
    let second = supervisor.start_if_not_running(config.clone(), 8080)?;
    assert_eq!(first, second);
    assert_eq!(supervisor.hidden_services().len(), 1);
    assert_eq!(supervisor.hidden_services()[0].virt_port, 8080);
    assert_eq!(factory.launch_count(), 1);

    // same key on different ports
    assert!(matches!(
        supervisor.start_if_not_running(config, 8081),
        Err(Error::DuplicateAddress(_))
    ));

    // without a key every call creates a new onion service
    let config = ServiceConfig::new(data_dir("test_start_if_not_running"), 0);
    let generated = supervisor.start_if_not_running(config, 8080)?;
    assert_ne!(generated.onion_address, TEST_ONION_ADDRESS);
    assert_eq!(supervisor.hidden_services().len(), 2);
    Ok(())
}

#[test]
fn test_shutdown() -> anyhow::Result<()> {
    let (factory, supervisor) = mock_supervisor();

    // not running is a no-op
    supervisor.shutdown()?;
    assert_eq!(supervisor.status(), ServiceStatus::NotStarted);

    let start =
        supervisor.init_or_start(ServiceConfig::new(data_dir("test_shutdown"), 0))?;
    supervisor.create_hidden_service(80, 8080, None)?;

    supervisor.shutdown()?;
    assert_eq!(supervisor.status(), ServiceStatus::Stopped);
    assert!(supervisor.hidden_services().is_empty());
    assert!(matches!(
        supervisor.socks_proxy(),
        Err(Error::ProxyUnavailable(ServiceStatus::Stopped))
    ));
    // the listener is gone once shutdown returns
    assert!(std::net::TcpStream::connect(start.socks_addr).is_err());

    supervisor.shutdown()?;
    assert_eq!(supervisor.status(), ServiceStatus::Stopped);

    // and it can be started again
    supervisor.init_or_start(ServiceConfig::new(data_dir("test_shutdown"), 0))?;
    assert_eq!(supervisor.status(), ServiceStatus::Running);
    assert_eq!(factory.launch_count(), 2);
    Ok(())
}

#[test]
fn test_bootstrap_timeout() -> anyhow::Result<()> {
    let factory = MockTorEngineFactory::with_behavior(MockBehavior::StallBootstrap);
    let supervisor = TorSupervisor::new(factory.clone());
    let config = ServiceConfig::new(data_dir("test_bootstrap_timeout"), 0)
        .with_bootstrap_timeout(Duration::from_millis(200));

    let start = Instant::now();
    match supervisor.init_or_start(config.clone()) {
        Err(Error::BootstrapTimeout(message)) => assert!(message.contains("5%"), "{}", message),
        result => anyhow::bail!("expected a bootstrap timeout, got {:?}", result),
    }
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(supervisor.status(), ServiceStatus::Failed);
    assert!(matches!(
        supervisor.socks_proxy(),
        Err(Error::ProxyUnavailable(ServiceStatus::Failed))
    ));

    // a fresh engine is launched by the next attempt
    factory.set_behavior(MockBehavior::Normal);
    supervisor.init_or_start(config)?;
    assert_eq!(supervisor.status(), ServiceStatus::Running);
    assert_eq!(factory.launch_count(), 2);
    Ok(())
}

#[test]
fn test_bootstrap_failure() -> anyhow::Result<()> {
    let factory = MockTorEngineFactory::with_behavior(MockBehavior::FailLaunch);
    let supervisor = TorSupervisor::new(factory.clone());
    let config = ServiceConfig::new(data_dir("test_bootstrap_failure"), 0);

    match supervisor.init_or_start(config.clone()) {
        Err(Error::BootstrapFailed(message)) => {
            assert!(message.contains("mock launch failure"), "{}", message)
        }
        result => anyhow::bail!("expected a bootstrap failure, got {:?}", result),
    }
    assert_eq!(supervisor.status(), ServiceStatus::Failed);

    factory.set_behavior(MockBehavior::FailBootstrap);
    assert!(matches!(
        supervisor.init_or_start(config.clone()),
        Err(Error::BootstrapFailed(_))
    ));
    assert_eq!(supervisor.status(), ServiceStatus::Failed);

    factory.set_behavior(MockBehavior::Normal);
    supervisor.init_or_start(config)?;
    assert_eq!(supervisor.status(), ServiceStatus::Running);
    Ok(())
}

#[test]
fn test_concurrent_starts() -> anyhow::Result<()> {
    let factory = MockTorEngineFactory::new();
    let supervisor = Arc::new(TorSupervisor::new(factory.clone()));
    let config = ServiceConfig::new(data_dir("test_concurrent_starts"), 0);

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let supervisor = supervisor.clone();
            let config = config.clone();
            std::thread::spawn(move || supervisor.init_or_start(config))
        })
        .collect();

    let mut socks_addrs: Vec<std::net::SocketAddr> = Default::default();
    for thread in threads {
        let result = thread
            .join()
            .map_err(|_| anyhow::anyhow!("start thread panicked"))?;
        socks_addrs.push(result?.socks_addr);
    }
    socks_addrs.dedup();
    assert_eq!(socks_addrs.len(), 1);
    assert_eq!(factory.launch_count(), 1);
    Ok(())
}

#[test]
fn test_shutdown_cancels_bootstrap() -> anyhow::Result<()> {
    let factory = MockTorEngineFactory::with_behavior(MockBehavior::StallBootstrap);
    let supervisor = Arc::new(TorSupervisor::new(factory));
    let config = ServiceConfig::new(data_dir("test_shutdown_cancels_bootstrap"), 0)
        .with_bootstrap_timeout(Duration::from_secs(60));

    let start = Instant::now();
    let starting = {
        let supervisor = supervisor.clone();
        std::thread::spawn(move || supervisor.init_or_start(config))
    };
    while supervisor.status() != ServiceStatus::Bootstrapping {
        anyhow::ensure!(start.elapsed() < Duration::from_secs(5), "bootstrap never began");
        std::thread::sleep(Duration::from_millis(1));
    }

    supervisor.shutdown()?;
    assert_eq!(supervisor.status(), ServiceStatus::Stopped);
    let result = starting
        .join()
        .map_err(|_| anyhow::anyhow!("start thread panicked"))?;
    assert!(matches!(result, Err(Error::BootstrapFailed(_))));
    assert!(start.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[test]
fn test_engine_crash() -> anyhow::Result<()> {
    let (factory, supervisor) = mock_supervisor();
    let config = ServiceConfig::new(data_dir("test_engine_crash"), 0);
    supervisor.init_or_start(config.clone())?;
    supervisor.create_hidden_service(80, 8080, None)?;

    factory.crash_engines();
    assert!(matches!(supervisor.poll(), Err(Error::Engine(_))));
    assert_eq!(supervisor.status(), ServiceStatus::Failed);
    assert!(supervisor.hidden_services().is_empty());
    assert!(matches!(
        supervisor.http_request(&HttpRequest::new(HttpMethod::Get, "http://example.com/")),
        Err(Error::ProxyUnavailable(ServiceStatus::Failed))
    ));
    assert!(matches!(
        supervisor.create_hidden_service(80, 8080, None),
        Err(Error::ServiceNotReady(ServiceStatus::Failed))
    ));

    // full re-init with a fresh engine
    supervisor.init_or_start(config)?;
    assert_eq!(supervisor.status(), ServiceStatus::Running);
    assert_eq!(factory.launch_count(), 2);
    Ok(())
}

#[test]
fn test_restart_releases_engines() -> anyhow::Result<()> {
    let (factory, supervisor) = mock_supervisor();
    let config = ServiceConfig::new(data_dir("test_restart_releases_engines"), 0);

    for launches in 1..=3 {
        supervisor.init_or_start(config.clone())?;
        assert_eq!(factory.live_engine_count(), 1);
        supervisor.shutdown()?;
        assert_eq!(factory.live_engine_count(), 0);
        assert_eq!(factory.launch_count(), launches);
    }

    // a crashed engine is released once the supervisor notices
    supervisor.init_or_start(config)?;
    factory.crash_engines();
    assert_eq!(supervisor.status(), ServiceStatus::Failed);
    assert_eq!(factory.live_engine_count(), 0);
    Ok(())
}

// a mock engine factory whose launch takes a while, like a tor daemon
// writing its control port file
struct SlowLaunchFactory {
    inner: MockTorEngineFactory,
    delay: Duration,
}

impl TorEngineFactory for SlowLaunchFactory {
    fn launch(&self, config: &ServiceConfig) -> Result<Box<dyn TorEngine>, tor_engine::Error> {
        std::thread::sleep(self.delay);
        self.inner.launch(config)
    }
}

#[test]
fn test_bootstrap_timeout_includes_launch() -> anyhow::Result<()> {
    // launch alone outlasts the timeout: even an engine which would bootstrap
    // immediately is too late
    let factory = MockTorEngineFactory::new();
    let supervisor = TorSupervisor::new(SlowLaunchFactory {
        inner: factory.clone(),
        delay: Duration::from_millis(300),
    });
    let config = ServiceConfig::new(data_dir("test_bootstrap_timeout_includes_launch"), 0)
        .with_bootstrap_timeout(Duration::from_millis(200));
    match supervisor.init_or_start(config) {
        Err(Error::BootstrapTimeout(message)) => {
            assert!(message.contains("200 ms"), "{}", message)
        }
        result => anyhow::bail!("expected a bootstrap timeout, got {:?}", result),
    }
    assert_eq!(supervisor.status(), ServiceStatus::Failed);
    assert_eq!(factory.launch_count(), 1);

    // a stalled bootstrap gets only what launch left of the timeout
    let factory = MockTorEngineFactory::with_behavior(MockBehavior::StallBootstrap);
    let supervisor = TorSupervisor::new(SlowLaunchFactory {
        inner: factory,
        delay: Duration::from_millis(1000),
    });
    let config = ServiceConfig::new(data_dir("test_bootstrap_timeout_includes_launch_stall"), 0)
        .with_bootstrap_timeout(Duration::from_millis(1100));
    let start = Instant::now();
    assert!(matches!(
        supervisor.init_or_start(config),
        Err(Error::BootstrapTimeout(_))
    ));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1100));
    assert!(elapsed < Duration::from_millis(1800), "{:?}", elapsed);
    Ok(())
}

#[test]
fn test_engine_crash_detected_by_status() -> anyhow::Result<()> {
    let (factory, supervisor) = mock_supervisor();
    let config = ServiceConfig::new(data_dir("test_engine_crash_detected_by_status"), 0);
    supervisor.init_or_start(config)?;
    supervisor.create_hidden_service(80, 8080, None)?;
    assert_eq!(supervisor.status(), ServiceStatus::Running);

    // no explicit poll: reading the status notices the dead engine
    factory.crash_engines();
    assert_eq!(supervisor.status(), ServiceStatus::Failed);
    assert!(supervisor.hidden_services().is_empty());

    let (factory, supervisor) = mock_supervisor();
    let config = ServiceConfig::new(data_dir("test_engine_crash_detected_by_http"), 0);
    supervisor.init_or_start(config)?;

    // nor does an http request go to a dead proxy
    factory.crash_engines();
    assert!(matches!(
        supervisor.http_request(&HttpRequest::new(HttpMethod::Get, "http://example.com/")),
        Err(Error::ProxyUnavailable(ServiceStatus::Failed))
    ));
    assert_eq!(supervisor.status(), ServiceStatus::Failed);
    Ok(())
}
