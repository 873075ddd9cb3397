// standard
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// internal crates
use crate::config::*;
use crate::error::error_chain;
use crate::legacy_tor_control_stream::*;
use crate::legacy_tor_controller::*;
use crate::legacy_tor_process::*;
use crate::tor_crypto::*;
use crate::tor_engine;
use crate::tor_engine::*;

// control port read timeout; also the granularity of event polling
const CONTROL_READ_TIMEOUT: Duration = Duration::from_millis(16);
// time the daemon gets to exit after SIGNAL HALT before being killed
const HALT_TIMEOUT: Duration = Duration::from_secs(5);

/// [`LegacyTorEngine`]-specific error type
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create LegacyTorProcess object")]
    LegacyTorProcessCreationFailed(#[source] crate::legacy_tor_process::Error),

    #[error("failed to create LegacyControlStream object")]
    LegacyControlStreamCreationFailed(#[source] crate::legacy_tor_control_stream::Error),

    #[error("failed to create LegacyTorController object")]
    LegacyTorControllerCreationFailed(#[source] crate::legacy_tor_controller::Error),

    #[error("failed to authenticate with the tor process")]
    LegacyTorProcessAuthenticationFailed(#[source] crate::legacy_tor_controller::Error),

    #[error("failed to determine the tor process version")]
    GetInfoVersionFailed(#[source] crate::legacy_tor_controller::Error),

    #[error("failed to register for STATUS_CLIENT and HS_DESC events")]
    SetEventsFailed(#[source] crate::legacy_tor_controller::Error),

    #[error("failed waiting for async events")]
    WaitAsyncEventsFailed(#[source] crate::legacy_tor_controller::Error),

    #[error("failed to begin bootstrap")]
    SetConfDisableNetwork0Failed(#[source] crate::legacy_tor_controller::Error),

    #[error("failed to get socks listener")]
    GetInfoNetListenersSocksFailed(#[source] crate::legacy_tor_controller::Error),

    #[error("failed to create onion service")]
    AddOnionFailed(#[source] crate::legacy_tor_controller::Error),

    #[error("tor did not return the private key of the generated onion service")]
    AddOnionPrivateKeyMissing(),

    #[error("failed to delete onion service")]
    DelOnionFailed(#[source] crate::legacy_tor_controller::Error),

    #[error("tor process exited ({0})")]
    TorProcessExited(String),
}

impl From<Error> for tor_engine::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::TorProcessExited(status) => tor_engine::Error::Exited(status),
            error => tor_engine::Error::Generic(error_chain(&error)),
        }
    }
}

/// Launches a tor daemon per engine, locating the binary via
/// [`find_tor_binary`]
#[derive(Clone, Default)]
pub struct LegacyTorEngineFactory {
    tor_bin_path: Option<PathBuf>,
}

impl LegacyTorEngineFactory {
    pub fn new() -> LegacyTorEngineFactory {
        Default::default()
    }

    /// Use `tor_bin_path` for configs which do not name a binary themselves
    pub fn with_tor_bin_path<P: Into<PathBuf>>(tor_bin_path: P) -> LegacyTorEngineFactory {
        LegacyTorEngineFactory {
            tor_bin_path: Some(tor_bin_path.into()),
        }
    }
}

impl TorEngineFactory for LegacyTorEngineFactory {
    fn launch(&self, config: &ServiceConfig) -> Result<Box<dyn TorEngine>, tor_engine::Error> {
        let configured = config.tor_bin_path().or(self.tor_bin_path.as_deref());
        let tor_bin_path = find_tor_binary(configured)?;
        let engine = LegacyTorEngine::new(&tor_bin_path, config)
            .map_err(|err| tor_engine::Error::LaunchFailed(Box::new(err)))?;
        Ok(Box::new(engine))
    }
}

/// A tor engine backed by a tor daemon we launched and control over its
/// control port
pub struct LegacyTorEngine {
    daemon: LegacyTorProcess,
    controller: LegacyTorController,
    bootstrapped: bool,
    halted: bool,
}

impl LegacyTorEngine {
    pub fn new(tor_bin_path: &std::path::Path, config: &ServiceConfig) -> Result<LegacyTorEngine, Error> {
        let daemon = LegacyTorProcess::new(
            tor_bin_path,
            config.data_dir(),
            config.socks_port(),
            config.bootstrap_timeout(),
        )
            .map_err(Error::LegacyTorProcessCreationFailed)?;

        // open a control stream
        let control_stream = LegacyControlStream::new(daemon.get_control_addr(), CONTROL_READ_TIMEOUT)
            .map_err(Error::LegacyControlStreamCreationFailed)?;

        // create a controller
        let mut controller = LegacyTorController::new(control_stream)
            .map_err(Error::LegacyTorControllerCreationFailed)?;

        // authenticate
        controller
            .authenticate(daemon.get_password())
            .map_err(Error::LegacyTorProcessAuthenticationFailed)?;

        let version = controller
            .getinfo_version()
            .map_err(Error::GetInfoVersionFailed)?;
        tracing::info!(%version, control_addr = %daemon.get_control_addr(), "connected to tor daemon");

        // register for STATUS_CLIENT async events
        controller
            .setevents(&["STATUS_CLIENT", "HS_DESC"])
            .map_err(Error::SetEventsFailed)?;

        Ok(LegacyTorEngine {
            daemon,
            controller,
            bootstrapped: false,
            halted: false,
        })
    }

    fn ensure_alive(&mut self) -> Result<(), Error> {
        if let Some(status) = self.daemon.exit_status() {
            return Err(Error::TorProcessExited(status.to_string()));
        }
        Ok(())
    }
}

impl TorEngine for LegacyTorEngine {
    fn update(&mut self) -> Result<Vec<TorEvent>, tor_engine::Error> {
        let mut events: Vec<TorEvent> = Default::default();

        // bundled tor gives us log-lines
        for log_line in self.daemon.wait_log_lines().iter_mut() {
            events.push(TorEvent::LogReceived {
                line: std::mem::take(log_line),
            });
        }

        self.ensure_alive()?;

        for async_event in self
            .controller
            .wait_async_events()
            .map_err(Error::WaitAsyncEventsFailed)?
        {
            match async_event {
                AsyncEvent::StatusClient {
                    severity,
                    action,
                    arguments,
                } => {
                    if severity == "NOTICE" && action == "BOOTSTRAP" {
                        let mut progress: u32 = 0;
                        let mut tag: String = Default::default();
                        let mut summary: String = Default::default();
                        for (key, val) in arguments {
                            match key.as_str() {
                                "PROGRESS" => progress = val.parse().unwrap_or(0u32),
                                "TAG" => tag = val,
                                "SUMMARY" => summary = val,
                                _ => {} // ignore unexpected arguments
                            }
                        }
                        events.push(TorEvent::BootstrapStatus {
                            progress,
                            tag,
                            summary,
                        });
                        if progress == 100u32 && !self.bootstrapped {
                            events.push(TorEvent::BootstrapComplete);
                            self.bootstrapped = true;
                        }
                    }
                }
                AsyncEvent::HsDesc { action, hs_address } => {
                    if action == "UPLOADED" {
                        events.push(TorEvent::OnionServicePublished {
                            service_id: hs_address,
                        });
                    }
                }
                AsyncEvent::Unknown { lines } => {
                    tracing::trace!(event = %lines.join(" "), "ignoring control port event");
                }
            }
        }

        Ok(events)
    }

    fn bootstrap(&mut self) -> Result<(), tor_engine::Error> {
        if !self.bootstrapped {
            self.controller
                .setconf(&[("DisableNetwork", "0".to_string())])
                .map_err(Error::SetConfDisableNetwork0Failed)?;
        }
        Ok(())
    }

    fn socks_addr(&mut self) -> Result<Option<SocketAddr>, tor_engine::Error> {
        let listeners = self
            .controller
            .getinfo_net_listeners_socks()
            .map_err(Error::GetInfoNetListenersSocksFailed)?;
        Ok(listeners.into_iter().next())
    }

    fn control_metadata(&self) -> String {
        self.daemon.get_control_addr().to_string()
    }

    fn add_onion_service(
        &mut self,
        private_key: Option<&Ed25519PrivateKey>,
        virt_port: u16,
        target_port: u16,
    ) -> Result<(Ed25519PrivateKey, V3OnionServiceId), tor_engine::Error> {
        let target = SocketAddr::from(([127, 0, 0, 1], target_port));
        let (returned_key, service_id) = self
            .controller
            .add_onion(private_key, &Default::default(), virt_port, Some(target))
            .map_err(Error::AddOnionFailed)?;

        let private_key = match (private_key, returned_key) {
            (Some(private_key), _) => private_key.clone(),
            (None, Some(returned_key)) => returned_key,
            (None, None) => return Err(Error::AddOnionPrivateKeyMissing().into()),
        };
        Ok((private_key, service_id))
    }

    fn remove_onion_service(
        &mut self,
        service_id: &V3OnionServiceId,
    ) -> Result<(), tor_engine::Error> {
        self.controller
            .del_onion(service_id)
            .map_err(Error::DelOnionFailed)?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), tor_engine::Error> {
        if self.halted {
            return Ok(());
        }
        self.halted = true;
        // HALT exits immediately; failure to deliver it only means we kill the
        // daemon instead
        if self.daemon.exit_status().is_none() {
            if let Err(err) = self.controller.signal("HALT") {
                if !self.controller.closed_by_remote() {
                    tracing::warn!(error = %error_chain(&err), "failed to send HALT to tor daemon");
                }
            }
        }
        self.daemon.wait_or_kill(HALT_TIMEOUT);
        Ok(())
    }
}

#[cfg(test)]
use serial_test::serial;

#[test]
#[serial]
fn test_legacy_tor_engine() -> anyhow::Result<()> {
    let tor_path = match which::which(format!("tor{}", std::env::consts::EXE_SUFFIX)) {
        Ok(tor_path) => tor_path,
        Err(_) => {
            println!("tor binary not found; skipping test_legacy_tor_engine");
            return Ok(());
        }
    };
    let data_path = std::env::temp_dir().join("test_legacy_tor_engine");
    let config = ServiceConfig::new(&data_path, 0);

    let mut engine = LegacyTorEngine::new(&tor_path, &config)?;
    assert!(engine.control_metadata().starts_with("127.0.0.1:"));

    // the socks listener is up before bootstrapping completes
    assert!(engine.socks_addr()?.is_some());

    // onion services can be registered while the network is still disabled
    let (private_key, service_id) = engine.add_onion_service(None, 80, 8080)?;
    assert_eq!(V3OnionServiceId::from_private_key(&private_key), service_id);
    engine.remove_onion_service(&service_id)?;
    assert!(engine.remove_onion_service(&service_id).is_err());

    engine.update()?;
    engine.shutdown()?;
    assert!(engine.daemon.exit_status().is_some());

    Ok(())
}
