//! TOML-based configuration and settings persistence.
//!
//! One file holds both the tunables of the client and the small amount of
//! state the connection lifecycle must remember across restarts:
//! - Windows:  `%APPDATA%\Pairlink\config.toml`
//! - Linux:    `~/.config/pairlink/config.toml`
//! - macOS:    `~/Library/Application Support/Pairlink/config.toml`
//!
//! ```toml
//! [client]
//! device_name = "Pixel 8"
//! log_level = "info"
//!
//! [link]
//! handshake_timeout_secs = 7
//! reconnect_window_secs = 600
//!
//! [preferences]
//! auto_reconnect_enabled = true
//!
//! [session]
//! manually_disconnected = false
//!
//! [[peers]]
//! name = "Studio"
//! port = 6996
//! key = "MDEy...ZWY="
//! last_connected_ms = 1760000000000
//!
//! [peers.addresses]
//! "192.168.1.23" = "192.168.1.10"
//! ```
//!
//! Every field has a `#[serde(default = ...)]`, so a missing file, a missing
//! section, or a file written by an older build all load cleanly.
//!
//! [`TomlSettingsStore`] is the production [`SettingsStore`]: it keeps the
//! parsed file in memory and writes it back on every change.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pairlink_core::{EndpointRecord, KnownPeer, ReconnectPolicy, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::ports::{LinkConfig, LinkSettings, SettingsStore};

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

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub link: LinkTimingConfig,
    #[serde(default)]
    pub preferences: PreferencesConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Endpoint registry table.
    #[serde(default)]
    pub peers: Vec<KnownPeer>,
}

/// Identity of this device and process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Name announced to the peer in the client hello.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Timing of the connection lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkTimingConfig {
    /// Silence allowed after the transport opens before the attempt fails.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Total lifetime of one auto-reconnect loop.
    #[serde(default = "default_reconnect_window_secs")]
    pub reconnect_window_secs: u64,
    /// Number of reconnect attempts preceded by the fast delay.
    #[serde(default = "default_fast_attempts")]
    pub fast_attempts: u32,
    #[serde(default = "default_fast_delay_secs")]
    pub fast_delay_secs: u64,
    #[serde(default = "default_slow_delay_secs")]
    pub slow_delay_secs: u64,
    /// How often a reconnect wait re-checks for success or cancellation.
    #[serde(default = "default_poll_tick_ms")]
    pub poll_tick_ms: u64,
    /// Port used when a peer is given without one.
    #[serde(default = "default_port")]
    pub default_port: u16,
    /// Upper bound on opening one dial candidate.
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    /// Interval at which the local network identity is sampled.
    #[serde(default = "default_network_poll_secs")]
    pub network_poll_secs: u64,
}

/// User-facing toggles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreferencesConfig {
    #[serde(default = "default_true")]
    pub auto_reconnect_enabled: bool,
    /// Allows dialling addresses outside the private LAN ranges.
    #[serde(default)]
    pub expanded_networking: bool,
}

/// Lifecycle state remembered across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default)]
    pub manually_disconnected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_device: Option<EndpointRecord>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_device_name() -> String {
    "pairlink".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_handshake_timeout_secs() -> u64 {
    7
}
fn default_reconnect_window_secs() -> u64 {
    600
}
fn default_fast_attempts() -> u32 {
    6
}
fn default_fast_delay_secs() -> u64 {
    10
}
fn default_slow_delay_secs() -> u64 {
    60
}
fn default_poll_tick_ms() -> u64 {
    500
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_open_timeout_secs() -> u64 {
    10
}
fn default_network_poll_secs() -> u64 {
    5
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for LinkTimingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            reconnect_window_secs: default_reconnect_window_secs(),
            fast_attempts: default_fast_attempts(),
            fast_delay_secs: default_fast_delay_secs(),
            slow_delay_secs: default_slow_delay_secs(),
            poll_tick_ms: default_poll_tick_ms(),
            default_port: default_port(),
            open_timeout_secs: default_open_timeout_secs(),
            network_poll_secs: default_network_poll_secs(),
        }
    }
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            auto_reconnect_enabled: default_true(),
            expanded_networking: false,
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl LinkTimingConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            window: Duration::from_secs(self.reconnect_window_secs),
            fast_attempts: self.fast_attempts,
            fast_delay: Duration::from_secs(self.fast_delay_secs),
            slow_delay: Duration::from_secs(self.slow_delay_secs),
            // A zero tick would spin the reconnect wait.
            poll_tick: Duration::from_millis(self.poll_tick_ms.max(1)),
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn network_poll_interval(&self) -> Duration {
        Duration::from_secs(self.network_poll_secs.max(1))
    }
}

impl AppConfig {
    /// Lifecycle tunables for the connection manager.
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            device_name: self.client.device_name.clone(),
            handshake_timeout: Duration::from_secs(self.link.handshake_timeout_secs),
            reconnect: self.link.reconnect_policy(),
        }
    }

    /// The persisted settings the lifecycle reads.
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            manually_disconnected: self.session.manually_disconnected,
            auto_reconnect_enabled: self.preferences.auto_reconnect_enabled,
            expanded_networking: self.preferences.expanded_networking,
            last_active_device: self.session.last_active_device.clone(),
            peers: self.peers.clone(),
        }
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

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
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

/// Resolves the platform config base directory including the `Pairlink` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Pairlink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("pairlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Pairlink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Settings store ────────────────────────────────────────────────────────────

/// Write-through [`SettingsStore`] backed by the config file.
///
/// Every change lands in memory at once.  The file is then rewritten from the
/// latest in-memory state, one write at a time, so a slow write can never
/// overwrite a newer one.  Inside a Tokio runtime the write runs on the
/// blocking pool and the caller does not wait for it.
///
/// Save failures are logged and swallowed: the in-memory copy stays
/// authoritative for the rest of the process.
#[derive(Debug, Clone)]
pub struct TomlSettingsStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    path: PathBuf,
    /// Current configuration and its change counter.
    config: Mutex<(AppConfig, u64)>,
    /// Held for the whole write; holds the counter value last written.
    writer: Mutex<u64>,
}

impl StoreInner {
    fn current(&self) -> std::sync::MutexGuard<'_, (AppConfig, u64)> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the latest state unless a newer or equal one is already on disk.
    fn persist(&self) -> Result<bool, ConfigError> {
        let mut written = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let (snapshot, version) = {
            let current = self.current();
            if current.1 <= *written {
                return Ok(false);
            }
            current.clone()
        };
        save_config(&self.path, &snapshot)?;
        *written = version;
        Ok(true)
    }

    fn persist_logged(&self, what: &str) {
        match self.persist() {
            Ok(true) => debug!(path = %self.path.display(), "saved {what}"),
            Ok(false) => debug!(path = %self.path.display(), "{what} already on disk"),
            Err(e) => warn!(path = %self.path.display(), "failed to save {what}: {e}"),
        }
    }
}

impl TomlSettingsStore {
    pub fn new(path: PathBuf, config: AppConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path,
                config: Mutex::new((config, 0)),
                writer: Mutex::new(0),
            }),
        }
    }

    /// Loads the file at `path` (defaults if absent).
    ///
    /// # Errors
    ///
    /// See [`load_config`].
    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        let config = load_config(&path)?;
        Ok(Self::new(path, config))
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Copy of the whole configuration as currently held in memory.
    pub fn config(&self) -> AppConfig {
        self.inner.current().0.clone()
    }

    /// Writes any change not yet on disk and waits for it.
    ///
    /// # Errors
    ///
    /// See [`save_config`].
    pub fn flush(&self) -> Result<(), ConfigError> {
        self.inner.persist().map(|_| ())
    }

    fn update(&self, what: &'static str, f: impl FnOnce(&mut AppConfig)) {
        {
            let mut current = self.inner.current();
            f(&mut current.0);
            current.1 += 1;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(&self.inner);
                runtime.spawn_blocking(move || inner.persist_logged(what));
            }
            Err(_) => self.inner.persist_logged(what),
        }
    }
}

impl SettingsStore for TomlSettingsStore {
    fn snapshot(&self) -> LinkSettings {
        self.inner.current().0.link_settings()
    }

    fn set_manually_disconnected(&self, value: bool) {
        self.update("manual-disconnect flag", |c| {
            c.session.manually_disconnected = value
        });
    }

    fn set_auto_reconnect_enabled(&self, value: bool) {
        self.update("auto-reconnect preference", |c| {
            c.preferences.auto_reconnect_enabled = value
        });
    }

    fn set_last_active_device(&self, record: &EndpointRecord) {
        self.update("last active device", |c| {
            c.session.last_active_device = Some(record.clone())
        });
    }

    fn save_peers(&self, peers: &[KnownPeer]) {
        self.update("peer registry", |c| c.peers = peers.to_vec());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
