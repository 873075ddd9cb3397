extern crate cbindgen;

use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    // set by cargo
    let crate_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(crate_dir) => PathBuf::from(crate_dir),
        Err(err) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", err);
            return;
        }
    };
    // set by the user or by the embedding build system
    let target_dir = match std::env::var("CARGO_TARGET_DIR") {
        Ok(target) => PathBuf::from(target),
        Err(_) => crate_dir.join("target"),
    };

    let config = match cbindgen::Config::from_file(crate_dir.join("cbindgen.toml")) {
        Ok(config) => config,
        Err(err) => {
            println!("cargo:warning=failed to load cbindgen.toml: {}", err);
            return;
        }
    };

    // generate tor_ffi.h C++ header
    let include_dir = target_dir.join("include");
    if let Err(err) = std::fs::create_dir_all(&include_dir) {
        println!("cargo:warning=failed to create {}: {}", include_dir.display(), err);
        return;
    }
    let header_file_path = include_dir.join("tor_ffi.h");
    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(&header_file_path);
        }
        // ignore in favor of cargo's syntax check
        Err(cbindgen::Error::ParseSyntaxError { .. }) => (),
        Err(err) => println!("cargo:warning=failed to generate tor_ffi.h: {}", err),
    }
}
