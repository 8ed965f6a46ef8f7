//! JSONL event log writer with daily file rotation.

use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::warn;

use super::{EventLogRecord, EventLogger, SessionExit};
use crate::{AppError, Result};

/// Internal state protected by a mutex.
struct WriterState {
    current_date: NaiveDate,
    writer: BufWriter<fs::File>,
}

/// A daily-rotating JSONL event log writer.
///
/// Appends one JSON object per line to `<log_dir>/events-YYYY-MM-DD.jsonl`.
/// Automatically opens a new file when the calendar date changes between
/// writes.
pub struct JsonlEventWriter {
    log_dir: PathBuf,
    state: Mutex<Option<WriterState>>,
}

/// One serialized event line.
#[derive(Serialize)]
struct EventLine<'a> {
    timestamp: DateTime<Utc>,
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    submit_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iolog_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alert_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_value: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signal: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dumped_core: Option<bool>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    info: serde_json::Map<String, serde_json::Value>,
}

impl<'a> EventLine<'a> {
    fn new(event: &'static str, evlog: Option<&'a EventLogRecord>) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            submit_time: evlog.and_then(|e| e.submit_time),
            iolog_path: evlog.and_then(|e| e.iolog_path.as_deref()),
            reason: None,
            alert_time: None,
            exit_value: None,
            signal: None,
            dumped_core: None,
            info: evlog.map(|e| e.info.clone()).unwrap_or_default(),
        }
    }
}

impl JsonlEventWriter {
    /// Construct a writer that stores logs in `log_dir`.
    ///
    /// Creates `log_dir` and all parent directories if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::EventLog`] if the directory cannot be created.
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&log_dir).map_err(|err| {
            AppError::EventLog(format!(
                "failed to create event log directory {}: {err}",
                log_dir.display()
            ))
        })?;
        Ok(Self {
            log_dir,
            state: Mutex::new(None),
        })
    }

    fn open_for_date(log_dir: &Path, date: NaiveDate) -> Result<BufWriter<fs::File>> {
        let path = log_dir.join(format!("events-{date}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                AppError::EventLog(format!("failed to open event log {}: {err}", path.display()))
            })?;
        Ok(BufWriter::new(file))
    }

    fn write_line(&self, line: &EventLine<'_>) -> Result<()> {
        let today = Utc::now().date_naive();

        let mut guard = self
            .state
            .lock()
            .map_err(|_| AppError::EventLog("event writer mutex poisoned".to_owned()))?;

        let needs_rotation = guard.as_ref().is_none_or(|s| s.current_date != today);
        if needs_rotation {
            let writer = Self::open_for_date(&self.log_dir, today)?;
            *guard = Some(WriterState {
                current_date: today,
                writer,
            });
        }

        if let Some(state) = guard.as_mut() {
            let json = serde_json::to_string(line).map_err(|err| {
                AppError::EventLog(format!("failed to serialize event entry: {err}"))
            })?;
            if let Err(err) = writeln!(state.writer, "{json}") {
                warn!(%err, "failed to write event log entry");
                return Err(AppError::EventLog(format!("event write failed: {err}")));
            }
            if let Err(err) = state.writer.flush() {
                warn!(%err, "failed to flush event log");
                return Err(AppError::EventLog(format!("event flush failed: {err}")));
            }
        }

        Ok(())
    }
}

impl EventLogger for JsonlEventWriter {
    fn accept(&self, evlog: &EventLogRecord) -> Result<()> {
        self.write_line(&EventLine::new("accept", Some(evlog)))
    }

    fn reject(&self, evlog: &EventLogRecord, reason: &str) -> Result<()> {
        let mut line = EventLine::new("reject", Some(evlog));
        line.reason = Some(reason);
        self.write_line(&line)
    }

    fn alert(
        &self,
        evlog: Option<&EventLogRecord>,
        alert_time: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        let mut line = EventLine::new("alert", evlog);
        line.alert_time = Some(alert_time);
        line.reason = Some(reason);
        self.write_line(&line)
    }

    fn exit(&self, evlog: Option<&EventLogRecord>, status: &SessionExit) -> Result<()> {
        let mut line = EventLine::new("exit", evlog);
        line.exit_value = Some(status.exit_value);
        line.signal = status.signal.as_deref();
        line.dumped_core = status.dumped_core.then_some(true);
        self.write_line(&line)
    }
}
