#![doc = include_str!("../README.md")]

/// Service configuration and tor binary discovery
pub mod config;
/// Error type shared by the supervisor and the HTTP client
pub mod error;
/// HTTP/1.1 requests routed through the tor SOCKS proxy
pub mod http_client;
#[cfg(feature = "legacy-tor-engine")]
mod legacy_tor_control_stream;
#[cfg(feature = "legacy-tor-engine")]
mod legacy_tor_controller;
/// Implementation of an out-of-process legacy [c-tor daemon](https://gitlab.torproject.org/tpo/core/tor)-based `TorEngine`
#[cfg(feature = "legacy-tor-engine")]
pub mod legacy_tor_engine;
#[cfg(feature = "legacy-tor-engine")]
mod legacy_tor_process;
/// Implementation of a local, in-process, mock `TorEngine` for testing.
#[cfg(feature = "mock-tor-engine")]
pub mod mock_tor_engine;
/// Onion services registered with the running engine
pub mod registry;
/// SOCKS5 client handshake
pub mod socks;
/// Lifecycle status of the tor service
pub mod status;
/// Lifecycle management of the tor engine and its onion services
pub mod supervisor;
/// Tor-specific cryptographic primitives, operations, and conversion functions.
pub mod tor_crypto;
/// Traits and types implemented by tor engines.
pub mod tor_engine;

pub use error::Error;
pub use status::ServiceStatus;
pub use supervisor::TorSupervisor;
