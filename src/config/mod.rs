//! Configuration management module
//!
//! TOML-based configuration with serde defaults for every section.

mod config;

pub use config::*;
