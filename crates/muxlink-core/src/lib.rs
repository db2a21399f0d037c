//! Core defaults and I/O primitives shared across muxlink crates.

pub mod defaults;
pub mod io;

pub use defaults::*;

/// Project name.
pub const PROJECT_NAME: &str = "muxlink";
/// Project version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
