// standard
use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::{c_char, c_int};

thread_local! {
    // message of the most recent failure on this thread
    static LAST_ERROR: RefCell<Option<CString>> = RefCell::new(None);
}

/// Value returned to C when an exported function fails
pub(crate) trait FailureValue {
    fn failure(message: &str) -> Self;
}

impl FailureValue for bool {
    fn failure(_message: &str) -> bool {
        false
    }
}

impl FailureValue for c_int {
    fn failure(_message: &str) -> c_int {
        0
    }
}

impl FailureValue for () {
    fn failure(_message: &str) {}
}

fn set_last_error(message: &str) {
    let message = CString::new(message.replace('\0', "")).unwrap_or_default();
    LAST_ERROR.with(|last_error| *last_error.borrow_mut() = Some(message));
}

/// Get the message of the most recent failed call on the calling thread
///
/// @return null-terminated string with the error message, or null if no call
///  has failed on this thread. The string is owned by the library and remains
///  valid until the next failing call on the same thread; it must not be passed
///  to free_string()
#[no_mangle]
pub extern "C" fn tor_last_error_message() -> *const c_char {
    LAST_ERROR.with(|last_error| match &*last_error.borrow() {
        Some(message) => message.as_ptr(),
        None => std::ptr::null(),
    })
}

/// Wrapper around rust code which may panic or return a failing Result to be used at FFI boundaries.
/// Converts panics or error Results into the failure value of R and records the message as this
/// thread's last error.
///
/// @param function: Name of the exported function, for diagnostics
/// @param closure: The functionality we need to encapsulate behind the error handling logic
/// @return The result of closure() on success, or R::failure() with the error chain on failure.
pub(crate) fn translate_failures<R, F>(function: &str, closure: F) -> R
where
    R: FailureValue,
    F: FnOnce() -> anyhow::Result<R> + std::panic::UnwindSafe,
{
    let message = match std::panic::catch_unwind(closure) {
        // handle success
        Ok(Ok(retval)) => return retval,
        // handle runtime error, rendered with its chain of sources
        Ok(Err(err)) => format!("{:#}", err),
        // handle panic
        Err(panic) => match panic.downcast_ref::<&str>() {
            Some(reason) => format!("panic occurred: {}", reason),
            None => match panic.downcast_ref::<String>() {
                Some(reason) => format!("panic occurred: {}", reason),
                None => "panic occurred".to_string(),
            },
        },
    };

    tracing::warn!(function, error = %message, "tor-ffi call failed");
    set_last_error(&message);
    R::failure(&message)
}

#[test]
fn test_translate_failures() -> anyhow::Result<()> {
    // success passes through untouched
    assert!(translate_failures("succeeds", || -> anyhow::Result<bool> { Ok(true) }));

    // errors report their whole chain
    let result: bool = translate_failures("fails", || -> anyhow::Result<bool> {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "tor not found");
        Err(anyhow::Error::new(err).context("failed to launch tor"))
    });
    assert!(!result);
    let message = unsafe { std::ffi::CStr::from_ptr(tor_last_error_message()) };
    assert_eq!(message.to_str()?, "failed to launch tor: tor not found");

    // panics do not cross the boundary
    let status: c_int = translate_failures("panics", || -> anyhow::Result<c_int> {
        panic!("boom");
    });
    assert_eq!(status, 0);
    let message = unsafe { std::ffi::CStr::from_ptr(tor_last_error_message()) };
    assert_eq!(message.to_str()?, "panic occurred: boom");

    // last error is per thread
    std::thread::spawn(|| assert!(tor_last_error_message().is_null()))
        .join()
        .map_err(|_| anyhow::anyhow!("thread panicked"))?;

    Ok(())
}
