//! TOML-based configuration for the capture host.
//!
//! Reads and writes [`HostConfig`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\CapSync\config.toml`
//! - Linux:    `~/.config/capsync/config.toml`
//! - macOS:    `~/Library/Application Support/CapSync/config.toml`
//!
//! # What is TOML? (for beginners)
//!
//! TOML is a small configuration format that looks like an INI file with
//! real data types.  A minimal host config:
//!
//! ```toml
//! [network]
//! port = 9000
//! bind_address = "0.0.0.0"
//!
//! [registry]
//! heartbeat_timeout_ms = 15000
//!
//! [adaptive.thresholds.cpu_percent]
//! good = 60.0
//! degraded = 75.0
//! critical = 90.0
//! ```
//!
//! # Serde default values
//!
//! Every section and every field has a default, so a file may set only the
//! values it cares about.  A missing file gives [`HostConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use capsync_core::PerformanceLevel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::adaptive_load::{default_actions, AdaptiveConfig, PerformanceThresholds};
use crate::application::orchestrate_session::SessionConfig;
use crate::infrastructure::network::RegistryConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "CAPSYNC_CONFIG";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level host configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub adaptive: AdaptiveSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub discovery: DiscoverySection,
}

/// General process settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostSection {
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How long shutdown waits for connection tasks before aborting them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Listening socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Connection registry limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrySection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Session history and sensor staleness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default = "default_stale_sweep_ms")]
    pub stale_sweep_ms: u64,
}

/// Adaptive load manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaptiveSection {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_backpressure_ratio")]
    pub backpressure_ratio: f64,
    #[serde(default = "default_emergency_drop_fraction")]
    pub emergency_drop_fraction: f64,
    /// Level assumed when metrics cannot be sampled.
    #[serde(default = "default_fallback_level")]
    pub fallback_level: PerformanceLevel,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    #[serde(default)]
    pub thresholds: PerformanceThresholds,
}

/// Handshake authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecuritySection {
    #[serde(default)]
    pub require_token: bool,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

/// UDP discovery responder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_max_connections() -> usize {
    10
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_receive_timeout_ms() -> u64 {
    1_000
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}
fn default_error_threshold() -> u32 {
    5
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_history_capacity() -> usize {
    100
}
fn default_stale_after_ms() -> u64 {
    60_000
}
fn default_stale_sweep_ms() -> u64 {
    5_000
}
fn default_tick_ms() -> u64 {
    5_000
}
fn default_backpressure_ratio() -> f64 {
    0.8
}
fn default_emergency_drop_fraction() -> f64 {
    0.3
}
fn default_fallback_level() -> PerformanceLevel {
    PerformanceLevel::Degraded
}
fn default_history_len() -> usize {
    60
}
fn default_token_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_true() -> bool {
    true
}
fn default_discovery_port() -> u16 {
    9001
}
fn default_service_name() -> String {
    "capsync-host".to_string()
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            error_threshold: default_error_threshold(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            stale_after_ms: default_stale_after_ms(),
            stale_sweep_ms: default_stale_sweep_ms(),
        }
    }
}

impl Default for AdaptiveSection {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            backpressure_ratio: default_backpressure_ratio(),
            emergency_drop_fraction: default_emergency_drop_fraction(),
            fallback_level: default_fallback_level(),
            history_len: default_history_len(),
            thresholds: PerformanceThresholds::default(),
        }
    }
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            require_token: false,
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_discovery_port(),
            service_name: default_service_name(),
        }
    }
}

// ── Conversions into runtime settings ─────────────────────────────────────────

impl HostConfig {
    /// `bind_address:port` for the TCP listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.bind_address, self.network.port)
    }

    /// `bind_address:discovery_port` for the UDP responder.
    pub fn discovery_addr(&self) -> String {
        format!("{}:{}", self.network.bind_address, self.discovery.port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.host.shutdown_grace_ms)
    }
}

/// Timer periods are at least 1 ms; a zero period would stall or panic a ticker.
fn period_ms(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

impl RegistrySection {
    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_connections: self.max_connections,
            handshake_timeout: period_ms(self.handshake_timeout_ms),
            receive_timeout: period_ms(self.receive_timeout_ms),
            heartbeat_interval: period_ms(self.heartbeat_interval_ms),
            heartbeat_timeout: period_ms(self.heartbeat_timeout_ms),
            error_threshold: self.error_threshold,
            queue_capacity: self.queue_capacity,
        }
    }
}

impl SessionSection {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            history_capacity: self.history_capacity,
            stale_after: period_ms(self.stale_after_ms),
        }
    }

    pub fn stale_sweep(&self) -> Duration {
        period_ms(self.stale_sweep_ms)
    }
}

impl AdaptiveSection {
    pub fn to_adaptive_config(&self) -> AdaptiveConfig {
        AdaptiveConfig {
            thresholds: self.thresholds,
            actions: default_actions(),
            backpressure_ratio: self.backpressure_ratio,
            emergency_drop_fraction: self.emergency_drop_fraction,
            fallback_level: self.fallback_level,
            history_len: self.history_len,
        }
    }

    pub fn tick(&self) -> Duration {
        period_ms(self.tick_ms)
    }
}

impl SecuritySection {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the config file path: `CAPSYNC_CONFIG` if set, else the
/// platform default.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if neither is available.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    if let Some(explicit) = std::env::var_os(CONFIG_ENV_VAR) {
        return Ok(PathBuf::from(explicit));
    }
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from [`config_file_path`].
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<HostConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `HostConfig` from `path`, returning defaults if the file does not
/// exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<HostConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HostConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to [`config_file_path`].
///
/// # Errors
///
/// See [`save_config_to`].
pub fn save_config(config: &HostConfig) -> Result<(), ConfigError> {
    save_config_to(&config_file_path()?, config)
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &HostConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config base directory including the `CapSync`
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("CapSync"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("capsync"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("CapSync"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
