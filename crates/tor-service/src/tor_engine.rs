// standard
use std::net::SocketAddr;

// internal crates
use crate::config::ServiceConfig;
use crate::tor_crypto::*;

/// Errors reported by a [`TorEngine`] implementation
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to launch tor engine")]
    LaunchFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("tor engine exited: {0}")]
    Exited(String),

    #[error("{0}")]
    Generic(String),
}

/// Events reported by a [`TorEngine`] when polled
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TorEvent {
    BootstrapStatus {
        progress: u32,
        tag: String,
        summary: String,
    },
    BootstrapComplete,
    LogReceived {
        line: String,
    },
    OnionServicePublished {
        service_id: V3OnionServiceId,
    },
}

/// The tor client implementation beneath the supervisor.
///
/// All methods are expected to return promptly; the supervisor drives
/// bootstrap by polling [`TorEngine::update`].
pub trait TorEngine: Send {
    /// Drain the events which have occurred since the last call. An error means
    /// the engine is no longer usable.
    fn update(&mut self) -> Result<Vec<TorEvent>, Error>;

    /// Begin connecting to the tor network
    fn bootstrap(&mut self) -> Result<(), Error>;

    /// Address of the engine's SOCKS5 listener, if it is listening yet
    fn socks_addr(&mut self) -> Result<Option<SocketAddr>, Error>;

    /// Opaque, engine-specific description of how the engine is controlled
    fn control_metadata(&self) -> String;

    /// Publish an onion service forwarding `virt_port` to `target_port` on
    /// localhost. A new key is generated when none is provided.
    fn add_onion_service(
        &mut self,
        private_key: Option<&Ed25519PrivateKey>,
        virt_port: u16,
        target_port: u16,
    ) -> Result<(Ed25519PrivateKey, V3OnionServiceId), Error>;

    fn remove_onion_service(&mut self, service_id: &V3OnionServiceId) -> Result<(), Error>;

    /// Stop the engine and release its resources (processes, ports) before
    /// returning
    fn shutdown(&mut self) -> Result<(), Error>;
}

/// Creates [`TorEngine`] instances; each call yields a fresh engine
pub trait TorEngineFactory: Send + Sync {
    fn launch(&self, config: &ServiceConfig) -> Result<Box<dyn TorEngine>, Error>;
}
