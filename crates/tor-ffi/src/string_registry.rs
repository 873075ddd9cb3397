// standard
use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::raw::c_char;

// internal crates
use crate::macros::*;

// Every string handed across the C boundary is owned here, keyed by the
// address of its buffer, until the caller passes it back to free_string().
// Freeing a pointer the registry does not own (null, foreign or already
// freed) is a no-op.
pub(crate) struct StringRegistry {
    map: BTreeMap<usize, CString>,
}

impl StringRegistry {
    pub const fn new() -> StringRegistry {
        StringRegistry {
            map: BTreeMap::new(),
        }
    }

    // take ownership of string and return the pointer handed to C
    pub fn insert(&mut self, string: CString) -> *mut c_char {
        // the heap buffer does not move with the CString
        let ptr = string.as_ptr() as *mut c_char;
        self.map.insert(ptr as usize, string);
        ptr
    }

    pub fn contains(&self, ptr: *const c_char) -> bool {
        self.map.contains_key(&(ptr as usize))
    }

    pub fn remove(&mut self, ptr: *const c_char) -> Option<CString> {
        self.map.remove(&(ptr as usize))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.len()
    }
}

define_registry! {string: StringRegistry}

/// Allocate a C copy of text with any interior NUL bytes dropped
pub(crate) fn to_c_string(text: &str) -> *mut c_char {
    let string = CString::new(text.replace('\0', "")).unwrap_or_default();
    get_string_registry().insert(string)
}

pub(crate) fn free_c_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    if get_string_registry().remove(ptr).is_none() {
        tracing::debug!("ignoring free of a string not owned by tor-ffi");
    }
}

#[test]
fn test_string_registry() -> anyhow::Result<()> {
    let mut registry = StringRegistry::new();

    let hello = registry.insert(CString::new("hello")?);
    let world = registry.insert(CString::new("world")?);
    assert_ne!(hello, world);
    assert!(registry.contains(hello));
    assert!(registry.contains(world));
    assert_eq!(registry.len(), 2);

    let string = unsafe { std::ffi::CStr::from_ptr(hello) };
    assert_eq!(string.to_str()?, "hello");

    // double free and foreign pointers are ignored
    assert_eq!(registry.remove(hello), Some(CString::new("hello")?));
    assert_eq!(registry.remove(hello), None);
    assert_eq!(registry.remove(std::ptr::null()), None);
    assert!(!registry.contains(hello));
    assert_eq!(registry.len(), 1);

    Ok(())
}

#[test]
fn test_to_c_string() -> anyhow::Result<()> {
    let ptr = to_c_string("nul\0in\0the middle");
    assert!(get_string_registry().contains(ptr));
    let string = unsafe { std::ffi::CStr::from_ptr(ptr) };
    assert_eq!(string.to_str()?, "nulinthe middle");

    free_c_string(ptr);
    assert!(!get_string_registry().contains(ptr));
    free_c_string(ptr);
    free_c_string(std::ptr::null_mut());

    Ok(())
}
