//! Structured event logging for session accept/reject/alert/exit events.
//!
//! Provides the [`EventLogger`] trait and the [`EventLogRecord`] descriptor
//! built from client-supplied metadata. The primary implementation,
//! [`JsonlEventWriter`], appends JSONL records to daily-rotating files.

pub mod writer;

use chrono::{DateTime, Utc};

use crate::protocol::{info_message, InfoMessage, TimeSpec};
use crate::{AppError, Result};

/// Parsed event-log descriptor for one session.
///
/// Present on the connection once an accept/reject/alert has been
/// processed, or synthesized from the `log_id` on restart.
#[derive(Debug, Clone, Default)]
pub struct EventLogRecord {
    /// Client-reported submission time.
    pub submit_time: Option<DateTime<Utc>>,
    /// I/O-log directory path relative to the I/O-log root, when the
    /// session produces I/O logs.
    pub iolog_path: Option<String>,
    /// Client-supplied key/value metadata in submission order.
    pub info: serde_json::Map<String, serde_json::Value>,
}

impl EventLogRecord {
    /// Build a record from a submit time and client metadata.
    ///
    /// Metadata values have three variants: integer, string, and string
    /// list (rendered as a JSON array in order). A metadata entry with an
    /// unknown or missing variant is a protocol violation.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] on an invalid submit time or an
    /// unknown metadata variant.
    pub fn from_info(submit_time: Option<&TimeSpec>, info_msgs: &[InfoMessage]) -> Result<Self> {
        let submit_time = submit_time
            .map(|ts| {
                u32::try_from(ts.tv_nsec)
                    .ok()
                    .and_then(|nsecs| DateTime::from_timestamp(ts.tv_sec, nsecs))
                    .ok_or_else(|| {
                        AppError::Protocol(format!(
                            "invalid submit time [{}, {}]",
                            ts.tv_sec, ts.tv_nsec
                        ))
                    })
            })
            .transpose()?;

        let mut info = serde_json::Map::with_capacity(info_msgs.len());
        for msg in info_msgs {
            let value = match &msg.value {
                Some(info_message::Value::Numval(n)) => serde_json::Value::from(*n),
                Some(info_message::Value::Strval(s)) => serde_json::Value::from(s.clone()),
                Some(info_message::Value::Strlistval(list)) => {
                    serde_json::Value::from(list.strings.clone())
                }
                None => {
                    return Err(AppError::Protocol(format!(
                        "unknown metadata value for key '{}'",
                        msg.key
                    )));
                }
            };
            info.insert(msg.key.clone(), value);
        }

        Ok(Self {
            submit_time,
            iolog_path: None,
            info,
        })
    }

    /// Synthesize a minimal record for a restarted session.
    #[must_use]
    pub fn for_restart(iolog_path: String) -> Self {
        Self {
            submit_time: None,
            iolog_path: Some(iolog_path),
            info: serde_json::Map::new(),
        }
    }
}

/// Exit status recorded when a session's command completes.
#[derive(Debug, Clone, Default)]
pub struct SessionExit {
    /// Numeric exit value, meaningful when `signal` is `None`.
    pub exit_value: i32,
    /// Name of the killing signal, without "SIG" prefix.
    pub signal: Option<String>,
    /// Whether the command dumped core.
    pub dumped_core: bool,
}

/// Writes structured session events to a persistent store.
///
/// Implementations must be [`Send`] and [`Sync`] so a single backend can
/// serve every connection via [`std::sync::Arc`].
pub trait EventLogger: Send + Sync {
    /// Record an accepted session.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn accept(&self, evlog: &EventLogRecord) -> Result<()>;

    /// Record a rejected session with the policy's reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn reject(&self, evlog: &EventLogRecord, reason: &str) -> Result<()>;

    /// Record an administrative alert raised during a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn alert(
        &self,
        evlog: Option<&EventLogRecord>,
        alert_time: DateTime<Utc>,
        reason: &str,
    ) -> Result<()>;

    /// Record a session's command completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn exit(&self, evlog: Option<&EventLogRecord>, status: &SessionExit) -> Result<()>;
}

pub use writer::JsonlEventWriter;
