// defines a process-wide registry plus its accessor, e.g. for
// `define_registry! {string: StringRegistry}` a STRING_REGISTRY static and
// get_string_registry()
macro_rules! define_registry {
    ($name:ident: $type:ident) => {
        paste::paste! {
            static [<$name:upper _REGISTRY>]: std::sync::Mutex<$type> = std::sync::Mutex::new($type::new());

            pub(crate) fn [<get_ $name _registry>]<'a>() -> std::sync::MutexGuard<'a, $type> {
                match [<$name:upper _REGISTRY>].lock() {
                    Ok(registry) => registry,
                    Err(_) => unreachable!("another thread panicked while holding this registry's mutex"),
                }
            }
        }
    };
}
pub(crate) use define_registry;

//
// Argument validation macros
//

// ensure pointer is not null
macro_rules! ensure_not_null {
    ($ptr:ident) => {
        paste::paste! {
            if $ptr.is_null() {
                bail!(stringify!([<$ptr>] must not be null));
            }
        }
    };
}
pub(crate) use ensure_not_null;
