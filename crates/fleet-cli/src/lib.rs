//! Library wrapper around the `fleet-cache` CLI.
//!
//! Compiles the binary crate root as a module so `cargo test -p fleet-cli --lib` typechecks
//! the command layer without building the integration tests.

#[allow(dead_code)]
#[path = "main.rs"]
mod main_bin;
