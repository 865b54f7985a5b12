//! Configuration management module
//!
//! Provides TOML-based configuration for the daemon: upstream GitHub
//! credentials, scale-set parameters, compute engine selection, and
//! logging/telemetry settings.

mod config;

pub use config::*;
