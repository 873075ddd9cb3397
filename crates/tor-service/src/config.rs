// standard
use std::path::{Path, PathBuf};
use std::time::Duration;

// internal crates
use crate::error::Error;
use crate::tor_crypto::Ed25519PrivateKey;
use crate::tor_engine;

/// Bootstrap timeout used when none (or zero) is supplied
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(60);
/// Environment variable overriding the tor binary location
pub const TOR_BIN_PATH_ENV: &str = "TOR_BIN_PATH";

/// Configuration supplied when starting the tor service.
///
/// A `socks_port` of 0 lets the engine pick a free port; the chosen address is
/// reported back once the service is running.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    data_dir: PathBuf,
    socks_port: u16,
    bootstrap_timeout: Duration,
    tor_bin_path: Option<PathBuf>,
    onion_key: Option<Ed25519PrivateKey>,
}

impl ServiceConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P, socks_port: u16) -> ServiceConfig {
        ServiceConfig {
            data_dir: data_dir.into(),
            socks_port,
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            tor_bin_path: None,
            onion_key: None,
        }
    }

    /// Zero selects [`DEFAULT_BOOTSTRAP_TIMEOUT`]
    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> ServiceConfig {
        self.bootstrap_timeout = if timeout.is_zero() {
            DEFAULT_BOOTSTRAP_TIMEOUT
        } else {
            timeout
        };
        self
    }

    pub fn with_tor_bin_path<P: Into<PathBuf>>(mut self, tor_bin_path: P) -> ServiceConfig {
        self.tor_bin_path = Some(tor_bin_path.into());
        self
    }

    /// Key for the onion service created alongside the start of the service
    pub fn with_onion_key(mut self, onion_key: Ed25519PrivateKey) -> ServiceConfig {
        self.onion_key = Some(onion_key);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        self.bootstrap_timeout
    }

    pub fn tor_bin_path(&self) -> Option<&Path> {
        self.tor_bin_path.as_deref()
    }

    pub fn onion_key(&self) -> Option<&Ed25519PrivateKey> {
        self.onion_key.as_ref()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(
                "data directory must not be empty".to_string(),
            ));
        }
        if self.data_dir.is_relative() {
            return Err(Error::InvalidArgument(format!(
                "data directory '{}' must be an absolute path",
                self.data_dir.display()
            )));
        }
        if self.data_dir.is_file() {
            return Err(Error::InvalidArgument(format!(
                "data directory '{}' is an existing file",
                self.data_dir.display()
            )));
        }
        if let Some(tor_bin_path) = &self.tor_bin_path {
            if tor_bin_path.is_relative() {
                return Err(Error::InvalidArgument(format!(
                    "tor bin path '{}' must be an absolute path",
                    tor_bin_path.display()
                )));
            }
        }
        Ok(())
    }

    /// Whether a service started with `self` (listening on `running_socks_port`)
    /// can satisfy a request for `requested`. Timeouts and keys never conflict.
    pub fn is_compatible(&self, requested: &ServiceConfig, running_socks_port: Option<u16>) -> bool {
        if self.data_dir != requested.data_dir {
            return false;
        }
        match requested.socks_port {
            0 => true,
            port => port == self.socks_port || Some(port) == running_socks_port,
        }
    }

    /// Describe why `requested` conflicts with `self`
    pub(crate) fn describe_conflict(&self, requested: &ServiceConfig) -> String {
        format!(
            "running with data directory '{}' and socks port {}; requested data directory '{}' and socks port {}",
            self.data_dir.display(),
            self.socks_port,
            requested.data_dir.display(),
            requested.socks_port
        )
    }
}

/// Locate the tor binary: the configured path, else `$TOR_BIN_PATH`, else `tor`
/// on the `$PATH`
pub fn find_tor_binary(configured: Option<&Path>) -> Result<PathBuf, tor_engine::Error> {
    if let Some(configured) = configured {
        return Ok(configured.to_path_buf());
    }
    if let Some(from_env) = std::env::var_os(TOR_BIN_PATH_ENV) {
        let from_env = PathBuf::from(from_env);
        if !from_env.as_os_str().is_empty() {
            return Ok(from_env);
        }
    }
    which::which(format!("tor{}", std::env::consts::EXE_SUFFIX)).map_err(|err| {
        tor_engine::Error::Generic(format!(
            "unable to find a tor binary (set {}): {}",
            TOR_BIN_PATH_ENV, err
        ))
    })
}

#[test]
fn test_service_config() -> anyhow::Result<()> {
    let data_dir = std::env::temp_dir().join("test_service_config");
    let config = ServiceConfig::new(&data_dir, 9150);
    config.validate()?;
    assert_eq!(config.bootstrap_timeout(), DEFAULT_BOOTSTRAP_TIMEOUT);

    let config = config.with_bootstrap_timeout(Duration::ZERO);
    assert_eq!(config.bootstrap_timeout(), DEFAULT_BOOTSTRAP_TIMEOUT);

    let config = config.with_bootstrap_timeout(Duration::from_millis(1500));
    assert_eq!(config.bootstrap_timeout(), Duration::from_millis(1500));

    assert!(matches!(
        ServiceConfig::new("relative/dir", 9150).validate(),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        ServiceConfig::new("", 9150).validate(),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        ServiceConfig::new(&data_dir, 9150)
            .with_tor_bin_path("tor")
            .validate(),
        Err(Error::InvalidArgument(_))
    ));

    Ok(())
}

#[test]
fn test_config_compatibility() {
    let data_dir = std::env::temp_dir().join("test_config_compatibility");
    let running = ServiceConfig::new(&data_dir, 9150);

    // same settings, different timeout
    assert!(running.is_compatible(
        &ServiceConfig::new(&data_dir, 9150).with_bootstrap_timeout(Duration::from_secs(1)),
        Some(9150)
    ));
    // any port
    assert!(running.is_compatible(&ServiceConfig::new(&data_dir, 0), Some(9150)));
    // different port
    assert!(!running.is_compatible(&ServiceConfig::new(&data_dir, 9151), Some(9150)));
    // different data directory
    assert!(!running.is_compatible(
        &ServiceConfig::new(data_dir.join("other"), 9150),
        Some(9150)
    ));

    // auto-assigned port matches the actual listener
    let auto = ServiceConfig::new(&data_dir, 0);
    assert!(auto.is_compatible(&ServiceConfig::new(&data_dir, 40123), Some(40123)));
    assert!(!auto.is_compatible(&ServiceConfig::new(&data_dir, 40124), Some(40123)));
}
