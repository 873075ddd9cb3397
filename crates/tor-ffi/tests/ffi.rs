// standard
use std::ffi::{CStr, CString};
#[cfg(feature = "mock-tor-engine")]
use std::io::{Read, Write};
#[cfg(feature = "mock-tor-engine")]
use std::net::{TcpListener, TcpStream};
use std::os::raw::c_char;
use std::ptr;

// external crates
#[cfg(test)]
use serial_test::serial;
#[cfg(feature = "mock-tor-engine")]
use tor_service::tor_crypto::Ed25519PrivateKey;

// internal crates
use tor_ffi::error::*;
use tor_ffi::ffi::*;

macro_rules! require_success {
    ($func:ident($($arg:tt)*)) => {
        #[allow(unused_unsafe)]
        let succeeded = unsafe { $func($($arg)*) };
        if !succeeded {
            anyhow::bail!("{} failed: {}", stringify!($func), last_error());
        }
    }
}

fn last_error() -> String {
    let message = tor_last_error_message();
    if message.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .to_string()
}

fn read_string(ptr: *const c_char) -> anyhow::Result<String> {
    if ptr.is_null() {
        anyhow::bail!("unexpected null string");
    }
    Ok(unsafe { CStr::from_ptr(ptr) }.to_str()?.to_string())
}

#[cfg(feature = "mock-tor-engine")]
const TEST_KEY_BLOB: &str = "ED25519-V3:YE3GZtDmc+izGijWKgeVRabbXqK456JKKGONDBhV+kPBVKa2mHVQqnRTVuFXe3inU3YW6qvc7glYEwe9rK0LhQ==";
#[cfg(feature = "mock-tor-engine")]
const TEST_ONION_ADDRESS: &str = "6l62fw7tqctlu5fesdqukvpoxezkaxbzllrafa2ve6ewuhzphxczsjyd.onion";

#[cfg(feature = "mock-tor-engine")]
fn data_dir(name: &str) -> anyhow::Result<CString> {
    let data_dir = std::env::temp_dir().join("tor_ffi_tests").join(name);
    Ok(CString::new(data_dir.to_string_lossy().as_bytes())?)
}

// Answers each request with its request line as the body
#[cfg(feature = "mock-tor-engine")]
fn start_http_server() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    std::thread::spawn(move || {
                        let _ = answer(stream);
                    });
                }
                Err(_) => break,
            }
        }
    });
    Ok(port)
}

#[cfg(feature = "mock-tor-engine")]
fn answer(mut stream: TcpStream) -> std::io::Result<()> {
    let mut request: Vec<u8> = Default::default();
    let mut buffer = [0u8; 1024];
    while !request.windows(4).any(|window| window == b"\r\n\r\n") {
        let count = stream.read(&mut buffer)?;
        if count == 0 {
            return Ok(());
        }
        request.extend_from_slice(&buffer[..count]);
    }
    let request = String::from_utf8_lossy(&request).to_string();
    let request_line = request.split("\r\n").next().unwrap_or("").to_string();
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        request_line.len(),
        request_line
    )?;
    stream.flush()
}

#[test]
#[serial]
fn test_ffi_before_initialization() -> anyhow::Result<()> {
    require_success!(teardown_tor_library());
    assert_eq!(get_service_status(), 0);

    // the service functions need an initialized library
    let data_dir = CString::new("/tmp/tor_ffi_tests/uninitialized")?;
    assert!(!unsafe { init_tor_service(0, data_dir.as_ptr(), 0) });
    assert!(last_error().contains("not initialized"), "{}", last_error());

    let response = unsafe { create_hidden_service(80, 8080, ptr::null(), false) };
    assert!(!response.is_success);
    assert!(response.onion_address.is_null());
    assert!(response.control.is_null());

    // shutting down nothing succeeds
    require_success!(shutdown_service());
    require_success!(shutdown_service());

    // no proxy, no request
    let url = CString::new("http://example.com/")?;
    let response = unsafe { http_get(url.as_ptr(), ptr::null(), 1000) };
    assert_eq!(response.status_code, 0);
    assert!(response.body.is_null());
    assert!(read_string(response.error)?.contains("proxy unavailable"));
    free_http_response(response);

    Ok(())
}

#[test]
#[serial]
fn test_ffi_invalid_arguments() -> anyhow::Result<()> {
    let url = CString::new("http://example.com/")?;

    // malformed headers
    for headers in [r#"[1, 2]"#, r#"{"X-Count": 1}"#, "{not json"] {
        let headers = CString::new(headers)?;
        let response = unsafe { http_get(url.as_ptr(), headers.as_ptr(), 1000) };
        assert_eq!(response.status_code, 0);
        assert!(response.body.is_null());
        assert!(read_string(response.error)?.contains("malformed headers"));
        free_http_response(response);
    }

    // null url
    let response = unsafe { http_post(ptr::null(), ptr::null(), ptr::null(), 1000) };
    assert_eq!(response.status_code, 0);
    assert_eq!(read_string(response.error)?, "url must not be null");
    assert_eq!(last_error(), "url must not be null");
    free_http_response(response);

    // a key flag without key data
    let data_dir = CString::new("/tmp/tor_ffi_tests/invalid_arguments")?;
    let response = unsafe { start_tor_if_not_running(data_dir.as_ptr(), ptr::null(), true, 0, 8080, 0) };
    assert!(!response.is_success);
    assert!(response.onion_address.is_null());
    assert!(response.control.is_null());
    assert_eq!(read_string(response.error_message)?, "key_data must not be null");
    free_string(response.error_message);

    // null addresses
    assert!(!unsafe { delete_hidden_service(ptr::null()) });
    assert_eq!(last_error(), "address must not be null");

    Ok(())
}

#[test]
#[serial]
fn test_ffi_free_string() -> anyhow::Result<()> {
    let url = CString::new("http://example.com/")?;
    let headers = CString::new("[]")?;
    let response = unsafe { http_get(url.as_ptr(), headers.as_ptr(), 1000) };
    assert!(!response.error.is_null());

    // double frees and foreign pointers are ignored
    free_string(response.error);
    free_string(response.error);
    free_string(ptr::null_mut());
    let foreign = CString::new("not ours")?.into_raw();
    free_string(foreign);
    assert_eq!(unsafe { CString::from_raw(foreign) }.to_str()?, "not ours");

    Ok(())
}

#[test]
#[serial]
#[cfg(feature = "mock-tor-engine")]
fn test_ffi_service_lifecycle() -> anyhow::Result<()> {
    require_success!(teardown_tor_library());
    require_success!(initialize_tor_library());
    require_success!(initialize_tor_library());
    assert_eq!(get_service_status(), 0);

    let data_dir = data_dir("test_ffi_service_lifecycle")?;
    require_success!(init_tor_service(0, data_dir.as_ptr(), 0));
    require_success!(init_tor_service(0, data_dir.as_ptr(), 0));
    assert_eq!(get_service_status(), 2);

    // onion service in front of a local http server
    let port = start_http_server()?;
    let response = unsafe { create_hidden_service(80, port, ptr::null(), false) };
    assert!(response.is_success, "{}", last_error());
    let onion_address = read_string(response.onion_address)?;
    assert_eq!(onion_address.len(), 62);
    assert!(onion_address.ends_with(".onion"));
    assert!(read_string(response.control)?.starts_with("mock:"));
    free_string(response.onion_address);
    free_string(response.control);

    let url = CString::new(format!("http://{}/path", onion_address))?;
    let headers = CString::new(r#"{"Accept": "text/plain"}"#)?;
    let response = unsafe { http_get(url.as_ptr(), headers.as_ptr(), 0) };
    assert_eq!(response.status_code, 200, "{}", last_error());
    assert!(response.error.is_null());
    assert_eq!(read_string(response.body)?, "GET /path HTTP/1.1");
    free_http_response(response);

    let body = CString::new("{\"key\":\"value\"}")?;
    let response = unsafe { http_post(url.as_ptr(), body.as_ptr(), ptr::null(), 0) };
    assert_eq!(response.status_code, 200, "{}", last_error());
    assert_eq!(read_string(response.body)?, "POST /path HTTP/1.1");
    free_http_response(response);

    let response = unsafe { http_head(url.as_ptr(), ptr::null(), 0) };
    assert_eq!(response.status_code, 200, "{}", last_error());
    assert_eq!(read_string(response.body)?, "");
    free_http_response(response);

    // delete twice
    let address = CString::new(onion_address.as_str())?;
    require_success!(delete_hidden_service(address.as_ptr()));
    assert!(!unsafe { delete_hidden_service(address.as_ptr()) });
    assert!(last_error().contains("unknown onion service address"));

    // shutdown twice
    require_success!(shutdown_service());
    require_success!(shutdown_service());
    assert_eq!(get_service_status(), 4);

    let response = unsafe { http_get(url.as_ptr(), ptr::null(), 0) };
    assert_eq!(response.status_code, 0);
    assert!(read_string(response.error)?.contains("proxy unavailable"));
    free_http_response(response);

    require_success!(teardown_tor_library());
    assert_eq!(get_service_status(), 0);
    Ok(())
}

#[test]
#[serial]
#[cfg(feature = "mock-tor-engine")]
fn test_ffi_start_tor_if_not_running() -> anyhow::Result<()> {
    require_success!(teardown_tor_library());

    let key_data = Ed25519PrivateKey::from_key_blob(TEST_KEY_BLOB)?.to_bytes();
    let data_dir = data_dir("test_ffi_start_tor_if_not_running")?;

    // initializes the library implicitly; repeating returns the same service
    for _ in 0..2 {
        let response = unsafe {
            start_tor_if_not_running(data_dir.as_ptr(), key_data.as_ptr(), true, 0, 8080, 0)
        };
        assert!(response.is_success, "{}", last_error());
        assert!(response.error_message.is_null());
        assert_eq!(read_string(response.onion_address)?, TEST_ONION_ADDRESS);
        assert!(!response.control.is_null());
        free_string(response.onion_address);
        free_string(response.control);
        assert_eq!(get_service_status(), 2);
    }

    // the same key cannot back a second onion service
    let response = unsafe { create_hidden_service(80, 8081, key_data.as_ptr(), true) };
    assert!(!response.is_success);
    assert!(last_error().contains("already registered"), "{}", last_error());

    // a different data directory conflicts with the running service
    let other_dir = data_dir_other()?;
    let response =
        unsafe { start_tor_if_not_running(other_dir.as_ptr(), ptr::null(), false, 0, 8080, 0) };
    assert!(!response.is_success);
    assert!(read_string(response.error_message)?.contains("different configuration"));
    free_string(response.error_message);
    assert_eq!(get_service_status(), 2);

    require_success!(teardown_tor_library());
    Ok(())
}

#[cfg(feature = "mock-tor-engine")]
fn data_dir_other() -> anyhow::Result<CString> {
    data_dir("test_ffi_start_tor_if_not_running_other")
}
