// internal crates
use crate::status::ServiceStatus;

/// Errors surfaced by the [`TorSupervisor`](crate::supervisor::TorSupervisor) and the
/// SOCKS-routed HTTP client
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("tor library already initialized")]
    AlreadyInitialized(),

    #[error("tor service already running with a different configuration: {0}")]
    AlreadyRunningConflict(String),

    #[error("tor bootstrap timed out: {0}")]
    BootstrapTimeout(String),

    #[error("tor bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("tor service not ready (status: {0})")]
    ServiceNotReady(ServiceStatus),

    #[error("unknown onion service address '{0}'")]
    UnknownAddress(String),

    #[error("onion service '{0}' already registered")]
    DuplicateAddress(String),

    #[error("tor socks proxy unavailable (status: {0})")]
    ProxyUnavailable(ServiceStatus),

    #[error("request timed out after {0} ms")]
    RequestTimeout(u128),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("malformed headers: {0}")]
    MalformedHeaders(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tor engine failure")]
    Engine(#[source] crate::tor_engine::Error),
}

/// Render an error and its chain of sources as a single line of diagnostic
/// text, e.g. `tor bootstrap failed: failed to start tor process: No such file`
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        text.push_str(": ");
        text.push_str(&err.to_string());
        source = err.source();
    }
    text
}

#[test]
fn test_error_chain() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "tor not found");
    let engine_error = crate::tor_engine::Error::LaunchFailed(Box::new(io_error));
    let err = Error::Engine(engine_error);

    assert_eq!(
        error_chain(&err),
        "tor engine failure: failed to launch tor engine: tor not found"
    );
    assert_eq!(
        error_chain(&Error::UnknownAddress("abc".to_string())),
        "unknown onion service address 'abc'"
    );
}
