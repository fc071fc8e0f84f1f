//! UniFFI bindings crate for the healthsync library
//!
//! This crate wraps healthsync for UniFFI library mode binding generation.
//! It re-exports the FFI module and UniFFI scaffolding from the healthsync crate.
//!
//! ## Building for iOS
//!
//! 1. Build the library:
//!    ```bash
//!    cargo build --release -p healthsync-ffi --target aarch64-apple-darwin
//!    cargo build --release -p healthsync-ffi --target aarch64-apple-ios
//!    ```
//!
//! 2. Generate Swift bindings:
//!    ```bash
//!    cargo run -p healthsync-ffi --features bindgen --bin uniffi-bindgen generate \
//!        --library target/aarch64-apple-darwin/release/libhealthsync_ffi.dylib \
//!        --language swift \
//!        --out-dir generated/swift
//!    ```
//!
//! ## Building for Android
//!
//! Build `libhealthsync_ffi.so` per ABI (e.g. with cargo-ndk) and generate
//! bindings with `--language kotlin`.

pub use healthsync::ffi::*;

// Library mode needs the scaffolding symbols exported from this crate too
healthsync::uniffi_reexport_scaffolding!();
