//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::{AppError, Result};

/// Which sink a connection's records are bound to.
///
/// Chosen from configuration before the first message and never changed
/// for the lifetime of a connection.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Terminal receiver: event log plus I/O-log directory trees.
    Local,
    /// Relaying intermediary: raw framed messages journaled to disk.
    Relay,
}

/// Server socket and timeout settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// TCP listen address.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Idle timeout applied to client reads and queued writes.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_listen_address() -> String {
    "0.0.0.0:30344".to_owned()
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Relay sink settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RelayConfig {
    /// Directory holding `incoming/` and `outgoing/` journal files.
    #[serde(default = "default_relay_dir")]
    pub dir: PathBuf,
}

fn default_relay_dir() -> PathBuf {
    PathBuf::from("/var/log/audit-logd/relay")
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dir: default_relay_dir(),
        }
    }
}

/// Local I/O-log sink settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct IologConfig {
    /// Root directory for per-session I/O-log trees.
    #[serde(default = "default_iolog_dir")]
    pub dir: PathBuf,
    /// File creation mode for log files, written in octal (e.g. "0600").
    #[serde(default = "default_iolog_mode", deserialize_with = "de_octal_mode")]
    pub mode: u32,
    /// Whether payload streams are gzip-compressed.
    #[serde(default)]
    pub compress: bool,
}

fn default_iolog_dir() -> PathBuf {
    PathBuf::from("/var/log/audit-logd/io")
}

fn default_iolog_mode() -> u32 {
    0o600
}

impl Default for IologConfig {
    fn default() -> Self {
        Self {
            dir: default_iolog_dir(),
            mode: default_iolog_mode(),
            compress: false,
        }
    }
}

/// Event-log output settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EventLogConfig {
    /// Directory receiving the daily-rotating JSONL event log.
    #[serde(default = "default_eventlog_dir")]
    pub dir: PathBuf,
}

fn default_eventlog_dir() -> PathBuf {
    PathBuf::from("/var/log/audit-logd/events")
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            dir: default_eventlog_dir(),
        }
    }
}

/// Test-harness settings. Must stay at their defaults in production.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct DebugConfig {
    /// Probability, as a percentage, of dropping a connection after a
    /// stored I/O buffer. Exercises client restart paths.
    #[serde(default)]
    pub random_drop_percent: f64,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Sink bound to every accepted connection.
    #[serde(default = "default_sink")]
    pub sink: SinkKind,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub iolog: IologConfig,
    #[serde(default)]
    pub eventlog: EventLogConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

fn default_sink() -> SinkKind {
    SinkKind::Local
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            sink: default_sink(),
            server: ServerConfig::default(),
            relay: RelayConfig::default(),
            iolog: IologConfig::default(),
            eventlog: EventLogConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] on syntax errors or invalid values.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!("unable to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.debug.random_drop_percent) {
            return Err(AppError::Config(format!(
                "random_drop_percent out of range: {}",
                self.debug.random_drop_percent
            )));
        }
        if self.server.timeout_seconds == 0 {
            return Err(AppError::Config(
                "server timeout_seconds must be nonzero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Directory holding `incoming/` and `outgoing/` journal files.
    #[must_use]
    pub fn relay_dir(&self) -> &Path {
        &self.relay.dir
    }

    /// File creation mode for I/O-log files.
    #[must_use]
    pub fn iolog_mode(&self) -> u32 {
        self.iolog.mode
    }

    /// Idle timeout for client connections.
    #[must_use]
    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_seconds)
    }

    /// Drop probability in [0, 1], converted from the configured
    /// percentage.
    #[must_use]
    pub fn random_drop(&self) -> f64 {
        self.debug.random_drop_percent / 100.0
    }
}

/// Deserialize a file mode written as an octal string ("0600").
fn de_octal_mode<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    u32::from_str_radix(raw.trim_start_matches("0o"), 8)
        .map_err(|err| serde::de::Error::custom(format!("invalid octal mode '{raw}': {err}")))
}
