// we don't generate Rust docs since this crate should never be used from
// Rust, only from languages where the c-ffi is the only option; developers
// should consult the generated tor_ffi.h header
#![allow(clippy::missing_safety_doc)]

pub mod error;
pub mod ffi;
mod macros;
mod string_registry;
