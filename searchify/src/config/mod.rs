//! Configuration module for the Searchify gateway
//!
//! The gateway is configured from a single TOML file; every section is optional
//! and falls back to the defaults defined in `types`.

pub mod types;

pub use types::*;
