// standard
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

// internal crates
use crate::config::ServiceConfig;
use crate::error::{error_chain, Error};
use crate::http_client;
use crate::http_client::{HttpRequest, HttpResponse};
use crate::registry::*;
use crate::status::*;
use crate::tor_crypto::*;
use crate::tor_engine;
use crate::tor_engine::{TorEngine, TorEngineFactory, TorEvent};

// sleep between engine polls which returned no events
const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_millis(10);
// the socks listener may lag behind bootstrap completion
const SOCKS_CONNECT_ATTEMPTS: usize = 3;
const SOCKS_CONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// Returned by [`TorSupervisor::init_or_start`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartInfo {
    pub socks_addr: SocketAddr,
    /// Opaque, engine-specific control metadata
    pub control: String,
}

/// Returned when a hidden service is created
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HiddenServiceInfo {
    /// `<service id>.onion`
    pub onion_address: String,
    /// Opaque, engine-specific control metadata
    pub control: String,
}

enum Phase {
    Idle,
    // the bootstrapping thread runs without the state lock; shutdown sets
    // cancel and waits on the condvar
    Bootstrapping {
        config: ServiceConfig,
        cancel: Arc<AtomicBool>,
    },
    Running {
        config: ServiceConfig,
        engine: Box<dyn TorEngine>,
        socks_addr: SocketAddr,
        control: String,
    },
}

struct State {
    phase: Phase,
    registry: HiddenServiceRegistry,
}

// last bootstrap status reported by the engine
#[derive(Default)]
struct BootstrapProgress {
    progress: u32,
    tag: String,
    summary: String,
}

/// Owns the tor engine and the onion services registered with it, and drives
/// the service lifecycle:
///
/// NotStarted/Stopped/Failed -> Bootstrapping -> Running -> Stopped/Failed
///
/// Every lifecycle operation serializes on one mutex, except that the
/// network-bound bootstrap wait runs with it released. [`TorSupervisor::status`]
/// never blocks on that mutex.
pub struct TorSupervisor {
    factory: Box<dyn TorEngineFactory>,
    state: Mutex<State>,
    bootstrap_done: Condvar,
    status: StatusCell,
}

impl TorSupervisor {
    pub fn new<F: TorEngineFactory + 'static>(factory: F) -> TorSupervisor {
        TorSupervisor {
            factory: Box::new(factory),
            state: Mutex::new(State {
                phase: Phase::Idle,
                registry: Default::default(),
            }),
            bootstrap_done: Condvar::new(),
            status: StatusCell::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(_) => unreachable!("another thread panicked while holding the supervisor lock"),
        }
    }

    fn wait_bootstrap_done<'a>(&self, state: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        match self.bootstrap_done.wait(state) {
            Ok(state) => state,
            Err(_) => unreachable!("another thread panicked while holding the supervisor lock"),
        }
    }

    /// Current status. A dead engine is noticed here unless another lifecycle
    /// operation holds the supervisor lock, in which case the last published
    /// status is returned without waiting.
    pub fn status(&self) -> ServiceStatus {
        self.snapshot().status
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        self.refresh();
        self.status.snapshot()
    }

    // poll the engine if the lifecycle lock is free
    fn refresh(&self) {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => return,
            Err(TryLockError::Poisoned(_)) => {
                unreachable!("another thread panicked while holding the supervisor lock")
            }
        };
        if let Err(err) = self.poll_locked(&mut state) {
            tracing::debug!(error = %error_chain(&err), "poll while reading status failed");
        }
    }

    /// Ensure a bootstrapped tor engine with a live SOCKS listener.
    ///
    /// Succeeds immediately if a compatible service is already running, and
    /// waits for a compatible bootstrap already in progress. On failure or
    /// timeout the engine is torn down and the status becomes Failed.
    pub fn init_or_start(&self, config: ServiceConfig) -> Result<StartInfo, Error> {
        config.validate()?;

        let cancel = {
            let mut state = self.lock_state();
            loop {
                match &state.phase {
                    Phase::Idle => break,
                    Phase::Running {
                        config: running,
                        socks_addr,
                        control,
                        ..
                    } => {
                        if running.is_compatible(&config, Some(socks_addr.port())) {
                            return Ok(StartInfo {
                                socks_addr: *socks_addr,
                                control: control.clone(),
                            });
                        }
                        return Err(Error::AlreadyRunningConflict(
                            running.describe_conflict(&config),
                        ));
                    }
                    Phase::Bootstrapping {
                        config: pending, ..
                    } => {
                        // an auto-assigned port is only known once running
                        let maybe_compatible = pending.is_compatible(&config, None)
                            || (pending.socks_port() == 0 && pending.data_dir() == config.data_dir());
                        if !maybe_compatible {
                            return Err(Error::AlreadyRunningConflict(
                                pending.describe_conflict(&config),
                            ));
                        }
                    }
                }
                state = self.wait_bootstrap_done(state);
            }

            let cancel = Arc::new(AtomicBool::new(false));
            state.phase = Phase::Bootstrapping {
                config: config.clone(),
                cancel: cancel.clone(),
            };
            self.status.publish(ServiceStatus::Bootstrapping, None);
            cancel
        };

        let result = self.bootstrap(&config, &cancel);

        let mut state = self.lock_state();
        let cancelled = cancel.load(Ordering::SeqCst);
        let outcome = match result {
            Ok((engine, socks_addr)) if !cancelled => {
                let control = engine.control_metadata();
                tracing::info!(%socks_addr, %control, "tor service running");
                state.phase = Phase::Running {
                    config,
                    engine,
                    socks_addr,
                    control: control.clone(),
                };
                self.status.publish(ServiceStatus::Running, Some(socks_addr));
                Ok(StartInfo {
                    socks_addr,
                    control,
                })
            }
            Ok((mut engine, _)) => {
                if let Err(err) = engine.shutdown() {
                    tracing::warn!(error = %error_chain(&err), "failed to stop tor engine");
                }
                state.phase = Phase::Idle;
                self.status.publish(ServiceStatus::Stopped, None);
                Err(Error::BootstrapFailed(
                    "bootstrap cancelled by shutdown".to_string(),
                ))
            }
            Err(err) => {
                tracing::warn!(error = %error_chain(&err), "tor service failed to start");
                state.phase = Phase::Idle;
                self.status.publish(
                    if cancelled {
                        ServiceStatus::Stopped
                    } else {
                        ServiceStatus::Failed
                    },
                    None,
                );
                Err(err)
            }
        };
        self.bootstrap_done.notify_all();
        outcome
    }

    // launch an engine and wait for it to bootstrap; the engine is torn down on
    // failure
    fn bootstrap(
        &self,
        config: &ServiceConfig,
        cancel: &AtomicBool,
    ) -> Result<(Box<dyn TorEngine>, SocketAddr), Error> {
        tracing::info!(
            data_dir = %config.data_dir().display(),
            socks_port = config.socks_port(),
            timeout_ms = config.bootstrap_timeout().as_millis() as u64,
            "starting tor service"
        );

        // launch time counts against the bootstrap timeout
        let deadline = BootstrapDeadline::new(config.bootstrap_timeout());
        let mut engine = self
            .factory
            .launch(config)
            .map_err(|err| Error::BootstrapFailed(error_chain(&err)))?;
        match wait_for_bootstrap(engine.as_mut(), &deadline, cancel) {
            Ok(socks_addr) => Ok((engine, socks_addr)),
            Err(err) => {
                if let Err(err) = engine.shutdown() {
                    tracing::warn!(error = %error_chain(&err), "failed to stop tor engine");
                }
                Err(err)
            }
        }
    }

    /// Stop the service: remove every onion service, stop the engine and wait
    /// for its resources to be released. A bootstrap in progress is cancelled.
    /// Does nothing if the service is not running.
    pub fn shutdown(&self) -> Result<(), Error> {
        let mut state = self.lock_state();
        while let Phase::Bootstrapping { cancel, .. } = &state.phase {
            cancel.store(true, Ordering::SeqCst);
            state = self.wait_bootstrap_done(state);
        }

        let state = &mut *state;
        match std::mem::replace(&mut state.phase, Phase::Idle) {
            Phase::Running { mut engine, .. } => {
                for service_id in state.registry.service_ids() {
                    if let Err(err) = engine.remove_onion_service(&service_id) {
                        tracing::warn!(
                            %service_id,
                            error = %error_chain(&err),
                            "failed to remove onion service"
                        );
                    }
                }
                state.registry.clear();

                let result = engine.shutdown();
                drop(engine);
                self.status.publish(ServiceStatus::Stopped, None);
                tracing::info!("tor service stopped");
                result.map_err(Error::Engine)
            }
            phase => {
                state.phase = phase;
                Ok(())
            }
        }
    }

    /// Process the events the engine reported since the last poll. An engine
    /// failure moves the service to Failed.
    pub fn poll(&self) -> Result<(), Error> {
        let mut state = self.lock_state();
        self.poll_locked(&mut state)
    }

    fn poll_locked(&self, state: &mut State) -> Result<(), Error> {
        let events = match &mut state.phase {
            Phase::Running { engine, .. } => engine.update(),
            _ => return Ok(()),
        };

        match events {
            Ok(events) => {
                for event in events {
                    match event {
                        TorEvent::OnionServicePublished { service_id } => {
                            if state.registry.mark_published(&service_id) {
                                tracing::info!(%service_id, "onion service published");
                            }
                        }
                        TorEvent::LogReceived { line } => tracing::debug!(%line, "tor log"),
                        TorEvent::BootstrapStatus {
                            progress,
                            tag,
                            summary,
                        } => tracing::debug!(progress, %tag, %summary, "tor bootstrap status"),
                        TorEvent::BootstrapComplete => (),
                    }
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %error_chain(&err), "tor engine failed");
                if let Phase::Running { mut engine, .. } =
                    std::mem::replace(&mut state.phase, Phase::Idle)
                {
                    // release whatever the failed engine still holds
                    let _ = engine.shutdown();
                }
                state.registry.clear();
                self.status.publish(ServiceStatus::Failed, None);
                Err(Error::Engine(err))
            }
        }
    }

    /// Create an onion service forwarding `virt_port` to `target_port` on
    /// localhost. Without a key the engine generates one; with a key the onion
    /// address is derived from it and must not already be registered.
    pub fn create_hidden_service(
        &self,
        virt_port: u16,
        target_port: u16,
        private_key: Option<Ed25519PrivateKey>,
    ) -> Result<HiddenServiceInfo, Error> {
        if virt_port == 0 || target_port == 0 {
            return Err(Error::InvalidArgument(
                "onion service ports must not be zero".to_string(),
            ));
        }

        let mut guard = self.lock_state();
        if let Err(err) = self.poll_locked(&mut guard) {
            tracing::debug!(error = %error_chain(&err), "poll before creating onion service failed");
        }
        let state = &mut *guard;

        let (engine, control) = match &mut state.phase {
            Phase::Running {
                engine, control, ..
            } => (engine, control),
            _ => return Err(Error::ServiceNotReady(self.status.snapshot().status)),
        };

        if let Some(private_key) = &private_key {
            let service_id = V3OnionServiceId::from_private_key(private_key);
            if state.registry.contains(&service_id) {
                return Err(Error::DuplicateAddress(service_id.to_onion_address()));
            }
        }

        let key_origin = match private_key {
            Some(_) => KeyOrigin::Supplied,
            None => KeyOrigin::Generated,
        };
        let (private_key, service_id) = engine
            .add_onion_service(private_key.as_ref(), virt_port, target_port)
            .map_err(Error::Engine)?;

        let service = HiddenService {
            service_id,
            virt_port,
            target_port,
            private_key,
            key_origin,
            published: false,
        };
        let onion_address = service.onion_address();
        state.registry.insert(service)?;

        tracing::info!(%onion_address, virt_port, target_port, "onion service created");
        Ok(HiddenServiceInfo {
            onion_address,
            control: control.clone(),
        })
    }

    /// Remove the onion service with address `<service id>` or
    /// `<service id>.onion`
    pub fn delete_hidden_service(&self, address: &str) -> Result<(), Error> {
        let service_id = parse_onion_address(address)?;

        let mut guard = self.lock_state();
        if let Err(err) = self.poll_locked(&mut guard) {
            tracing::debug!(error = %error_chain(&err), "poll before deleting onion service failed");
        }
        let state = &mut *guard;

        if !state.registry.contains(&service_id) {
            return Err(Error::UnknownAddress(address.to_string()));
        }
        let engine = match &mut state.phase {
            Phase::Running { engine, .. } => engine,
            _ => return Err(Error::ServiceNotReady(self.status.snapshot().status)),
        };

        // tear down in the engine first so a failure leaves the entry in place
        engine
            .remove_onion_service(&service_id)
            .map_err(Error::Engine)?;
        state.registry.remove(&service_id);

        tracing::info!(%service_id, "onion service deleted");
        Ok(())
    }

    /// Onion services currently registered
    pub fn hidden_services(&self) -> Vec<HiddenService> {
        self.lock_state().registry.list()
    }

    /// Start the service if needed, then create an onion service forwarding
    /// `target_port` to `target_port` on localhost with the config's onion key.
    /// Repeating the call with the same key and port returns the existing
    /// onion service.
    pub fn start_if_not_running(
        &self,
        config: ServiceConfig,
        target_port: u16,
    ) -> Result<HiddenServiceInfo, Error> {
        let private_key = config.onion_key().cloned();
        let start_info = self.init_or_start(config)?;

        if let Some(private_key) = &private_key {
            let service_id = V3OnionServiceId::from_private_key(private_key);
            let state = self.lock_state();
            if let Some(existing) = state.registry.get(&service_id) {
                if existing.virt_port == target_port && existing.target_port == target_port {
                    return Ok(HiddenServiceInfo {
                        onion_address: existing.onion_address(),
                        control: start_info.control,
                    });
                }
            }
        }

        self.create_hidden_service(target_port, target_port, private_key)
    }

    /// Address of the SOCKS listener, if the service is running
    pub fn socks_proxy(&self) -> Result<SocketAddr, Error> {
        let snapshot = self.snapshot();
        match (snapshot.status, snapshot.socks_addr) {
            (ServiceStatus::Running, Some(socks_addr)) => Ok(socks_addr),
            (status, _) => Err(Error::ProxyUnavailable(status)),
        }
    }

    /// Send `request` through the tor SOCKS proxy. Fails with
    /// `ProxyUnavailable` without any network activity unless running.
    pub fn http_request(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        let socks_addr = self.socks_proxy()?;
        http_client::send(&socks_addr, request)
    }
}

impl Drop for TorSupervisor {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(error = %error_chain(&err), "failed to shut down tor service");
        }
    }
}

// bounds everything from engine launch to socks readiness
struct BootstrapDeadline {
    start: Instant,
    timeout: Duration,
}

impl BootstrapDeadline {
    fn new(timeout: Duration) -> BootstrapDeadline {
        BootstrapDeadline {
            start: Instant::now(),
            timeout,
        }
    }

    fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start.elapsed())
    }

    fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    fn timed_out(&self, last: &BootstrapProgress) -> Error {
        Error::BootstrapTimeout(format!(
            "not bootstrapped after {} ms, last progress {}% ({}: {})",
            self.timeout.as_millis(),
            last.progress,
            last.tag,
            last.summary
        ))
    }
}

fn wait_for_bootstrap(
    engine: &mut dyn TorEngine,
    deadline: &BootstrapDeadline,
    cancel: &AtomicBool,
) -> Result<SocketAddr, Error> {
    let bootstrap_failed = |err: tor_engine::Error| Error::BootstrapFailed(error_chain(&err));

    let mut last = BootstrapProgress::default();
    if deadline.expired() {
        return Err(deadline.timed_out(&last));
    }
    engine.bootstrap().map_err(bootstrap_failed)?;

    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(Error::BootstrapFailed(
                "bootstrap cancelled by shutdown".to_string(),
            ));
        }
        if deadline.expired() {
            return Err(deadline.timed_out(&last));
        }

        let events = engine.update().map_err(bootstrap_failed)?;
        let idle = events.is_empty();
        let mut complete = false;
        for event in events {
            match event {
                TorEvent::BootstrapStatus {
                    progress,
                    tag,
                    summary,
                } => {
                    tracing::info!(progress, %tag, %summary, "tor bootstrap progress");
                    last = BootstrapProgress {
                        progress,
                        tag,
                        summary,
                    };
                }
                TorEvent::BootstrapComplete => complete = true,
                TorEvent::LogReceived { line } => tracing::debug!(%line, "tor log"),
                TorEvent::OnionServicePublished { .. } => (),
            }
        }
        if complete {
            break;
        }
        if idle {
            std::thread::sleep(BOOTSTRAP_POLL_INTERVAL.min(deadline.remaining()));
        }
    }

    for attempt in 1..=SOCKS_CONNECT_ATTEMPTS {
        match engine.socks_addr() {
            Ok(Some(socks_addr)) => return Ok(socks_addr),
            Ok(None) => tracing::debug!(attempt, "tor socks listener not ready"),
            Err(err) => {
                tracing::debug!(attempt, error = %error_chain(&err), "failed to query tor socks listener")
            }
        }
        if deadline.expired() {
            return Err(Error::BootstrapTimeout(format!(
                "tor socks listener not ready after {} ms",
                deadline.timeout.as_millis()
            )));
        }
        if attempt < SOCKS_CONNECT_ATTEMPTS {
            std::thread::sleep(SOCKS_CONNECT_INTERVAL.min(deadline.remaining()));
        }
    }
    Err(Error::BootstrapFailed(
        "tor socks listener unavailable after bootstrap".to_string(),
    ))
}
