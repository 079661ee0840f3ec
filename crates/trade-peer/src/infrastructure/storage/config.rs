//! TOML-based persistence of user preferences.
//!
//! Reads and writes [`Preferences`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\LanTrade\preferences.toml`
//! - Linux:    `~/.config/lantrade/preferences.toml`
//! - macOS:    `~/Library/Application Support/LanTrade/preferences.toml`
//!
//! Every field carries a `#[serde(default = ...)]`, so a missing or partial
//! file yields working settings:
//!
//! ```toml
//! user_name = "alice"
//! user_id = "5f0c…"
//! passcode = "1155"
//! control_port = 24800
//! balance_btc = 2.0
//! balance_usd = 100000.0
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::application::wallet::{BalanceStore, Balances, WalletError};

/// Error type for preference file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing preferences at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse preferences TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The preferences could not be serialized to TOML.
    #[error("failed to serialize preferences: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// `announce_addr` is not a socket address.
    #[error("invalid announce address '{0}'")]
    InvalidAnnounceAddr(String),
}

// ── Schema ────────────────────────────────────────────────────────────────────

/// Persisted user settings and balances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preferences {
    /// Display identity; also the name listings are published under.
    #[serde(default)]
    pub user_name: String,
    /// Stable identifier, created the first time a name is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    /// Shared secret presented when opening a negotiation connection.
    #[serde(default = "default_passcode")]
    pub passcode: String,
    /// TCP port a seller listens on.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// UDP port buyers browse on.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Destination of listing announcements.
    #[serde(default = "default_announce_addr")]
    pub announce_addr: String,
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    /// Largest frame payload accepted from a peer.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// USD per BTC used for balance bookkeeping.
    #[serde(default = "default_rate")]
    pub rate: f64,
    #[serde(default)]
    pub balance_btc: f64,
    #[serde(default)]
    pub balance_usd: f64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_passcode() -> String {
    "1155".to_string()
}
fn default_control_port() -> u16 {
    24800
}
fn default_discovery_port() -> u16 {
    24802
}
fn default_announce_addr() -> String {
    "255.255.255.255:24802".to_string()
}
fn default_announce_interval_ms() -> u64 {
    1000
}
fn default_max_payload_bytes() -> usize {
    64 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_rate() -> f64 {
    49000.0
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            user_name: String::new(),
            user_id: None,
            passcode: default_passcode(),
            control_port: default_control_port(),
            discovery_port: default_discovery_port(),
            announce_addr: default_announce_addr(),
            announce_interval_ms: default_announce_interval_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            log_level: default_log_level(),
            rate: default_rate(),
            balance_btc: 0.0,
            balance_usd: 0.0,
        }
    }
}

impl Preferences {
    /// `true` once a display name has been chosen.
    pub fn has_profile(&self) -> bool {
        !self.user_name.trim().is_empty()
    }

    /// Sets the display name, creating the user id on first use.
    pub fn set_user_name(&mut self, name: impl Into<String>) {
        self.user_name = name.into();
        if self.user_id.is_none() {
            self.user_id = Some(Uuid::new_v4());
        }
    }

    /// Parsed `announce_addr`.
    pub fn announce_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.announce_addr
            .parse()
            .map_err(|_| ConfigError::InvalidAnnounceAddr(self.announce_addr.clone()))
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms.max(1))
    }
}

// ── Repository ────────────────────────────────────────────────────────────────

/// Resolves the default preferences file path.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform base
/// directory cannot be determined from the environment.
pub fn preferences_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("preferences.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads preferences from `path`, returning defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_preferences(path: &Path) -> Result<Preferences, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no preferences at {}; using defaults", path.display());
            Ok(Preferences::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `prefs` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_preferences(path: &Path, prefs: &Preferences) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(prefs)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("LanTrade"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("lantrade"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("LanTrade")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Balance store ─────────────────────────────────────────────────────────────

/// [`BalanceStore`] backed by the preferences file.
///
/// Adjustments re-read the file and write it back, so settings changed on disk
/// by another process survive.  Only the balance fields are modified.
pub struct PreferencesStore {
    path: PathBuf,
    balances: Balances,
}

impl PreferencesStore {
    pub fn new(path: PathBuf, prefs: &Preferences) -> Self {
        Self {
            path,
            balances: Balances {
                btc: prefs.balance_btc,
                usd: prefs.balance_usd,
            },
        }
    }
}

impl BalanceStore for PreferencesStore {
    fn balances(&self) -> Balances {
        self.balances
    }

    fn adjust(&mut self, btc_delta: f64, usd_delta: f64) -> Result<Balances, WalletError> {
        let store_err = |e: ConfigError| WalletError::Store(e.to_string());
        let mut stored = load_preferences(&self.path).map_err(store_err)?;
        stored.balance_btc += btc_delta;
        stored.balance_usd += usd_delta;
        save_preferences(&self.path, &stored).map_err(store_err)?;
        self.balances = Balances {
            btc: stored.balance_btc,
            usd: stored.balance_usd,
        };
        Ok(self.balances)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
