// standard
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uchar, c_ulong, c_ushort};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// extern crates
use anyhow::bail;
use tor_service::config::ServiceConfig;
use tor_service::http_client::{HttpMethod, HttpRequest};
#[cfg(not(feature = "mock-tor-engine"))]
use tor_service::legacy_tor_engine::LegacyTorEngineFactory;
#[cfg(feature = "mock-tor-engine")]
use tor_service::mock_tor_engine::MockTorEngineFactory;
use tor_service::tor_crypto::{Ed25519PrivateKey, ED25519_PRIVATE_KEY_SIZE};
use tor_service::{Error, ServiceStatus, TorSupervisor};
use tracing_subscriber::EnvFilter;

// internal crates
use crate::error::*;
use crate::macros::*;
use crate::string_registry::*;

// environment variable holding the tracing filter directives
const LOG_FILTER_ENV: &str = "TOR_FFI_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

// the process-wide library instance; callers clone the Arc and release the
// mutex before doing any blocking work
static LIBRARY: Mutex<Option<Arc<TorSupervisor>>> = Mutex::new(None);

fn get_library<'a>() -> MutexGuard<'a, Option<Arc<TorSupervisor>>> {
    match LIBRARY.lock() {
        Ok(library) => library,
        Err(_) => unreachable!("another thread panicked while holding the library mutex"),
    }
}

fn current_supervisor() -> Option<Arc<TorSupervisor>> {
    get_library().clone()
}

fn initialized_supervisor() -> anyhow::Result<Arc<TorSupervisor>> {
    match current_supervisor() {
        Some(supervisor) => Ok(supervisor),
        None => bail!("tor library not initialized; call initialize_tor_library() first"),
    }
}

#[cfg(feature = "mock-tor-engine")]
fn new_supervisor() -> TorSupervisor {
    TorSupervisor::new(MockTorEngineFactory::new())
}

#[cfg(not(feature = "mock-tor-engine"))]
fn new_supervisor() -> TorSupervisor {
    TorSupervisor::new(LegacyTorEngineFactory::new())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("global tracing subscriber already installed");
    }
}

// returns the library instance, creating it on first use
fn initialize() -> Arc<TorSupervisor> {
    let mut library = get_library();
    match library.as_ref() {
        Some(supervisor) => supervisor.clone(),
        None => {
            init_logging();
            let supervisor = Arc::new(new_supervisor());
            *library = Some(supervisor.clone());
            tracing::info!("tor library initialized");
            supervisor
        }
    }
}

//
// Argument conversion
//

unsafe fn str_arg<'a>(ptr: *const c_char, name: &str) -> anyhow::Result<&'a str> {
    match CStr::from_ptr(ptr).to_str() {
        Ok(value) => Ok(value),
        Err(_) => bail!("{} must be valid UTF-8", name),
    }
}

// null is treated as the empty string
unsafe fn optional_str_arg<'a>(ptr: *const c_char, name: &str) -> anyhow::Result<&'a str> {
    if ptr.is_null() {
        Ok("")
    } else {
        str_arg(ptr, name)
    }
}

unsafe fn key_arg(
    key_data: *const c_uchar,
    has_key: bool,
) -> anyhow::Result<Option<Ed25519PrivateKey>> {
    if !has_key {
        return Ok(None);
    }
    ensure_not_null!(key_data);
    let raw = &*(key_data as *const [u8; ED25519_PRIVATE_KEY_SIZE]);
    Ok(Some(Ed25519PrivateKey::from_raw(raw)))
}

fn config_arg(data_dir: &str, socks_port: c_ushort, timeout_ms: c_ulong) -> ServiceConfig {
    ServiceConfig::new(PathBuf::from(data_dir), socks_port)
        .with_bootstrap_timeout(Duration::from_millis(timeout_ms as u64))
}

//
// Response types
//

/// Result of create_hidden_service()
///
/// On success is_success is true and both strings are allocated; on failure
/// is_success is false and both strings are null. Strings must be released
/// with free_string().
#[repr(C)]
pub struct HiddenServiceResponse {
    pub is_success: bool,
    pub onion_address: *mut c_char,
    pub control: *mut c_char,
}

impl FailureValue for HiddenServiceResponse {
    fn failure(_message: &str) -> HiddenServiceResponse {
        HiddenServiceResponse {
            is_success: false,
            onion_address: std::ptr::null_mut(),
            control: std::ptr::null_mut(),
        }
    }
}

/// Result of start_tor_if_not_running()
///
/// On success is_success is true, onion_address and control are allocated and
/// error_message is null; on failure is_success is false, onion_address and
/// control are null and error_message is allocated. Strings must be released
/// with free_string().
#[repr(C)]
pub struct StartTorResponse {
    pub is_success: bool,
    pub onion_address: *mut c_char,
    pub control: *mut c_char,
    pub error_message: *mut c_char,
}

impl FailureValue for StartTorResponse {
    fn failure(message: &str) -> StartTorResponse {
        StartTorResponse {
            is_success: false,
            onion_address: std::ptr::null_mut(),
            control: std::ptr::null_mut(),
            error_message: to_c_string(message),
        }
    }
}

/// Result of the http_* functions, released with free_http_response()
///
/// On success status_code is the HTTP status, body is allocated and error is
/// null; on failure status_code is 0, body is null and error is allocated.
#[repr(C)]
pub struct CHttpResponse {
    pub status_code: c_ushort,
    pub body: *mut c_char,
    pub error: *mut c_char,
}

impl FailureValue for CHttpResponse {
    fn failure(message: &str) -> CHttpResponse {
        CHttpResponse {
            status_code: 0,
            body: std::ptr::null_mut(),
            error: to_c_string(message),
        }
    }
}

//
// Library lifecycle
//

/// Initialize the process-wide tor library instance and its logging. Calling
/// it again while initialized succeeds without effect.
///
/// Log output is filtered by the TOR_FFI_LOG environment variable (tracing
/// filter directives, default "info").
///
/// @return true on success
#[no_mangle]
pub extern "C" fn initialize_tor_library() -> bool {
    translate_failures("initialize_tor_library", || -> anyhow::Result<bool> {
        initialize();
        Ok(true)
    })
}

/// Shut down the tor service and drop the process-wide library instance.
/// Strings previously returned by the library remain valid until freed.
///
/// @return true on success
#[no_mangle]
pub extern "C" fn teardown_tor_library() -> bool {
    translate_failures("teardown_tor_library", || -> anyhow::Result<bool> {
        let supervisor = get_library().take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown()?;
            tracing::info!("tor library torn down");
        }
        Ok(true)
    })
}

//
// Service lifecycle
//

/// Start the tor service and wait for it to bootstrap. Requires
/// initialize_tor_library(). Succeeds immediately if a compatible service is
/// already running.
///
/// @param socks_port: SOCKS listener port, 0 for any free port
/// @param data_dir: tor data directory
/// @param timeout_ms: bootstrap timeout in milliseconds, 0 for the default
/// @return true on success
#[no_mangle]
pub unsafe extern "C" fn init_tor_service(
    socks_port: c_ushort,
    data_dir: *const c_char,
    timeout_ms: c_ulong,
) -> bool {
    translate_failures("init_tor_service", || -> anyhow::Result<bool> {
        ensure_not_null!(data_dir);
        let data_dir = str_arg(data_dir, "data_dir")?;

        let supervisor = initialized_supervisor()?;
        supervisor.init_or_start(config_arg(data_dir, socks_port, timeout_ms))?;
        Ok(true)
    })
}

/// Initialize the library and start the tor service if needed, then create an
/// onion service forwarding target_port to target_port on localhost.
/// Repeating the call with the same key and port returns the existing onion
/// service.
///
/// @param data_dir: tor data directory
/// @param key_data: 64 byte expanded ed25519 secret key of the onion service
/// @param has_key: whether key_data holds a key; a fresh key is generated otherwise
/// @param socks_port: SOCKS listener port, 0 for any free port
/// @param target_port: local port the onion service forwards to, also its virtual port
/// @param timeout_ms: bootstrap timeout in milliseconds, 0 for the default
#[no_mangle]
pub unsafe extern "C" fn start_tor_if_not_running(
    data_dir: *const c_char,
    key_data: *const c_uchar,
    has_key: bool,
    socks_port: c_ushort,
    target_port: c_ushort,
    timeout_ms: c_ulong,
) -> StartTorResponse {
    translate_failures("start_tor_if_not_running", || -> anyhow::Result<StartTorResponse> {
        ensure_not_null!(data_dir);
        let data_dir = str_arg(data_dir, "data_dir")?;
        let private_key = key_arg(key_data, has_key)?;

        let mut config = config_arg(data_dir, socks_port, timeout_ms);
        if let Some(private_key) = private_key {
            config = config.with_onion_key(private_key);
        }

        let supervisor = initialize();
        let info = supervisor.start_if_not_running(config, target_port)?;
        Ok(StartTorResponse {
            is_success: true,
            onion_address: to_c_string(&info.onion_address),
            control: to_c_string(&info.control),
            error_message: std::ptr::null_mut(),
        })
    })
}

/// Get the status of the tor service: 0 not started, 1 bootstrapping,
/// 2 running, 3 failed, 4 stopped
#[no_mangle]
pub extern "C" fn get_service_status() -> c_int {
    translate_failures("get_service_status", || -> anyhow::Result<c_int> {
        let status = match current_supervisor() {
            Some(supervisor) => supervisor.status(),
            None => ServiceStatus::NotStarted,
        };
        Ok(status.as_int())
    })
}

/// Stop the tor service, removing all onion services. Succeeds if the service
/// is not running.
///
/// @return true on success
#[no_mangle]
pub extern "C" fn shutdown_service() -> bool {
    translate_failures("shutdown_service", || -> anyhow::Result<bool> {
        if let Some(supervisor) = current_supervisor() {
            supervisor.shutdown()?;
        }
        Ok(true)
    })
}

//
// Onion services
//

/// Create an onion service forwarding port to target_port on localhost. The
/// tor service must be running.
///
/// @param port: virtual port of the onion service
/// @param target_port: local port connections are forwarded to
/// @param key_data: 64 byte expanded ed25519 secret key of the onion service
/// @param has_key: whether key_data holds a key; a fresh key is generated otherwise
#[no_mangle]
pub unsafe extern "C" fn create_hidden_service(
    port: c_ushort,
    target_port: c_ushort,
    key_data: *const c_uchar,
    has_key: bool,
) -> HiddenServiceResponse {
    translate_failures("create_hidden_service", || -> anyhow::Result<HiddenServiceResponse> {
        let private_key = key_arg(key_data, has_key)?;

        let supervisor = initialized_supervisor()?;
        let info = supervisor.create_hidden_service(port, target_port, private_key)?;
        Ok(HiddenServiceResponse {
            is_success: true,
            onion_address: to_c_string(&info.onion_address),
            control: to_c_string(&info.control),
        })
    })
}

/// Remove an onion service
///
/// @param address: onion address, with or without the .onion suffix
/// @return true on success
#[no_mangle]
pub unsafe extern "C" fn delete_hidden_service(address: *const c_char) -> bool {
    translate_failures("delete_hidden_service", || -> anyhow::Result<bool> {
        ensure_not_null!(address);
        let address = str_arg(address, "address")?;

        let supervisor = initialized_supervisor()?;
        supervisor.delete_hidden_service(address)?;
        Ok(true)
    })
}

//
// HTTP client
//

unsafe fn http_request(
    function: &str,
    method: HttpMethod,
    url: *const c_char,
    body: *const c_char,
    headers_json: *const c_char,
    timeout_ms: c_ulong,
) -> CHttpResponse {
    translate_failures(function, || -> anyhow::Result<CHttpResponse> {
        ensure_not_null!(url);
        let url = str_arg(url, "url")?;
        let body = optional_str_arg(body, "body")?;
        let headers_json = optional_str_arg(headers_json, "headers_json")?;

        let request = HttpRequest::new(method, url)
            .with_headers_json(headers_json)?
            .with_body(body)
            .with_timeout(Duration::from_millis(timeout_ms as u64));

        let supervisor = match current_supervisor() {
            Some(supervisor) => supervisor,
            None => return Err(Error::ProxyUnavailable(ServiceStatus::NotStarted).into()),
        };
        let response = supervisor.http_request(&request)?;
        Ok(CHttpResponse {
            status_code: response.status_code,
            body: to_c_string(&response.body_text()),
            error: std::ptr::null_mut(),
        })
    })
}

/// Send a GET request through the tor SOCKS proxy
///
/// @param url: http:// url, onion or clearnet
/// @param headers_json: JSON object of header names to string values, may be null
/// @param timeout_ms: overall request timeout in milliseconds, 0 for the default
#[no_mangle]
pub unsafe extern "C" fn http_get(
    url: *const c_char,
    headers_json: *const c_char,
    timeout_ms: c_ulong,
) -> CHttpResponse {
    http_request(
        "http_get",
        HttpMethod::Get,
        url,
        std::ptr::null(),
        headers_json,
        timeout_ms,
    )
}

/// Send a POST request through the tor SOCKS proxy; see http_get()
///
/// @param body: request body, may be null for an empty body
#[no_mangle]
pub unsafe extern "C" fn http_post(
    url: *const c_char,
    body: *const c_char,
    headers_json: *const c_char,
    timeout_ms: c_ulong,
) -> CHttpResponse {
    http_request("http_post", HttpMethod::Post, url, body, headers_json, timeout_ms)
}

/// Send a PUT request through the tor SOCKS proxy; see http_post()
#[no_mangle]
pub unsafe extern "C" fn http_put(
    url: *const c_char,
    body: *const c_char,
    headers_json: *const c_char,
    timeout_ms: c_ulong,
) -> CHttpResponse {
    http_request("http_put", HttpMethod::Put, url, body, headers_json, timeout_ms)
}

/// Send a DELETE request through the tor SOCKS proxy; see http_get()
#[no_mangle]
pub unsafe extern "C" fn http_delete(
    url: *const c_char,
    headers_json: *const c_char,
    timeout_ms: c_ulong,
) -> CHttpResponse {
    http_request(
        "http_delete",
        HttpMethod::Delete,
        url,
        std::ptr::null(),
        headers_json,
        timeout_ms,
    )
}

/// Send a HEAD request through the tor SOCKS proxy; the body is always empty
#[no_mangle]
pub unsafe extern "C" fn http_head(
    url: *const c_char,
    headers_json: *const c_char,
    timeout_ms: c_ulong,
) -> CHttpResponse {
    http_request(
        "http_head",
        HttpMethod::Head,
        url,
        std::ptr::null(),
        headers_json,
        timeout_ms,
    )
}

/// Send an OPTIONS request through the tor SOCKS proxy; see http_get()
#[no_mangle]
pub unsafe extern "C" fn http_options(
    url: *const c_char,
    headers_json: *const c_char,
    timeout_ms: c_ulong,
) -> CHttpResponse {
    http_request(
        "http_options",
        HttpMethod::Options,
        url,
        std::ptr::null(),
        headers_json,
        timeout_ms,
    )
}

//
// Memory management
//

/// Release a string returned by the library. Null, already freed and foreign
/// pointers are ignored.
#[no_mangle]
pub extern "C" fn free_string(s: *mut c_char) {
    translate_failures("free_string", || -> anyhow::Result<()> {
        free_c_string(s);
        Ok(())
    })
}

/// Release the strings held by an http response
#[no_mangle]
pub extern "C" fn free_http_response(response: CHttpResponse) {
    translate_failures("free_http_response", || -> anyhow::Result<()> {
        free_c_string(response.body);
        free_c_string(response.error);
        Ok(())
    })
}
