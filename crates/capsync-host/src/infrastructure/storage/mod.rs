//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML host configuration from the
//! platform config directory (or the file named by `CAPSYNC_CONFIG`), writes
//! it back, and supplies defaults when no file exists yet.

pub mod config;
