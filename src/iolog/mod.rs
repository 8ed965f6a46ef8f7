//! Per-session I/O-log directory trees.
//!
//! A session that expects I/O buffers gets a directory under the
//! configured root containing a `log` event record, a `timing` file
//! ordering every captured event by its incremental delay, and up to five
//! payload stream files (`ttyin`, `ttyout`, `stdin`, `stdout`, `stderr`).
//! Stream files are opened lazily on first write and may be
//! gzip-compressed; the timing file is always plaintext. Clearing the
//! write bits on `timing` seals the session.

pub mod restart;

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::config::IologConfig;
use crate::errors::{AppError, Result};
use crate::eventlog::EventLogRecord;
use crate::protocol::TimeSpec;

/// Name of the timing file within a session directory.
pub const TIMING_FILE: &str = "timing";

/// Name of the per-session event record file.
pub const LOG_FILE: &str = "log";

/// Timing-file event kind for window-size changes.
pub const EVENT_WINSIZE: u8 = 5;

/// Timing-file event kind for suspend/resume signals.
pub const EVENT_SUSPEND: u8 = 6;

/// Longest accepted suspend signal name, e.g. "TSTP".
const SIGNAME_MAX: usize = 32;

/// Attempts at generating a unique session directory name.
const MKDTEMP_TRIES: u32 = 64;

/// Payload stream kinds, in timing-file event order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStream {
    TtyIn = 0,
    TtyOut = 1,
    Stdin = 2,
    Stdout = 3,
    Stderr = 4,
}

impl IoStream {
    /// All streams in event-kind order.
    pub const ALL: [IoStream; 5] = [
        Self::TtyIn,
        Self::TtyOut,
        Self::Stdin,
        Self::Stdout,
        Self::Stderr,
    ];

    /// On-disk file name for this stream.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::TtyIn => "ttyin",
            Self::TtyOut => "ttyout",
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// Timing-file event kind (equal to the stream index).
    #[must_use]
    pub fn event_kind(self) -> u8 {
        self as u8
    }

    /// Reverse of [`IoStream::event_kind`].
    #[must_use]
    pub fn from_event_kind(kind: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.event_kind() == kind)
    }
}

/// Open write handle on one log file, plain or gzip-compressed.
#[derive(Debug)]
pub(crate) enum IologHandle {
    Plain(File),
    Gzip(GzEncoder<File>),
}

impl IologHandle {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(file) => file.write_all(data),
            Self::Gzip(enc) => enc.write_all(data),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(file) => file.flush(),
            Self::Gzip(enc) => enc.flush(),
        }
    }
}

/// One slot in the per-session file set: enabled/compressed flags plus the
/// open handle once the file has been created or reopened.
#[derive(Debug, Default)]
pub struct IologFile {
    pub(crate) enabled: bool,
    pub(crate) compressed: bool,
    pub(crate) handle: Option<IologHandle>,
}

impl IologFile {
    /// Whether this slot has been created for the session.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the on-disk file is gzip-compressed.
    #[must_use]
    pub fn compressed(&self) -> bool {
        self.compressed
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| AppError::Iolog("write to unopened log file".to_owned()))?;
        handle.write_all(data)?;
        Ok(())
    }
}

/// Fixed, ordered set of the five payload streams plus the timing file.
#[derive(Debug, Default)]
pub struct IologFiles {
    streams: [IologFile; 5],
    timing: IologFile,
}

impl IologFiles {
    /// Access a payload stream slot.
    #[must_use]
    pub fn stream(&self, stream: IoStream) -> &IologFile {
        &self.streams[stream as usize]
    }

    pub(crate) fn stream_mut(&mut self, stream: IoStream) -> &mut IologFile {
        &mut self.streams[stream as usize]
    }

    /// Access the timing slot.
    #[must_use]
    pub fn timing(&self) -> &IologFile {
        &self.timing
    }

    pub(crate) fn timing_mut(&mut self) -> &mut IologFile {
        &mut self.timing
    }

    /// Whether any stream file is gzip-compressed. Compressed streams do
    /// not support random access, so restarts must take the rewrite path.
    #[must_use]
    pub fn any_compressed(&self) -> bool {
        self.streams.iter().any(|f| f.enabled && f.compressed)
    }

    /// Flush every open handle.
    pub(crate) fn flush_all(&mut self) -> Result<()> {
        for file in self.streams.iter_mut().chain([&mut self.timing]) {
            if let Some(handle) = file.handle.as_mut() {
                handle.flush()?;
            }
        }
        Ok(())
    }
}

/// Create the I/O-log directory tree for a newly accepted session.
///
/// The relative session path is `<user>/<host>/<6 random characters>`,
/// where user and host come from the parsed metadata. The directory is
/// created with a mkdtemp-style retry loop, the `log` event record is
/// written, the timing file is opened eagerly, and
/// `evlog.iolog_path` is set to the relative path. Returns the absolute
/// session directory.
///
/// # Errors
///
/// Returns [`AppError::Iolog`] on directory or file creation failure.
pub fn init_session(
    config: &IologConfig,
    evlog: &mut EventLogRecord,
    files: &mut IologFiles,
) -> Result<PathBuf> {
    let user = safe_component(meta_str(evlog, "user").unwrap_or("unknown"));
    let host = safe_component(meta_str(evlog, "host").unwrap_or("localhost"));
    let parent_rel = PathBuf::from(user).join(host);
    let parent = config.dir.join(&parent_rel);

    DirBuilder::new()
        .recursive(true)
        .mode(0o711)
        .create(&parent)
        .map_err(|err| {
            AppError::Iolog(format!(
                "unable to create I/O log parent {}: {err}",
                parent.display()
            ))
        })?;

    let (session_dir, session_name) = mkdtemp_in(&parent)?;
    debug!(dir = %session_dir.display(), "created I/O log directory");

    let rel = parent_rel.join(&session_name);
    evlog.iolog_path = Some(rel.to_string_lossy().into_owned());

    // Per-session event record.
    write_log_file(&session_dir, evlog, config.mode)?;

    // The timing file exists for the whole session; its write bits are the
    // completion marker.
    let timing = open_create(&session_dir.join(TIMING_FILE), config.mode)?;
    *files.timing_mut() = IologFile {
        enabled: true,
        compressed: false,
        handle: Some(IologHandle::Plain(timing)),
    };

    Ok(session_dir)
}

/// Open a payload stream file for its first write.
///
/// # Errors
///
/// Returns [`AppError::Iolog`] if the file cannot be created.
pub fn create_stream(
    dir: &Path,
    stream: IoStream,
    files: &mut IologFiles,
    config: &IologConfig,
) -> Result<()> {
    let path = dir.join(stream.name());
    let file = open_create(&path, config.mode)?;
    let handle = if config.compress {
        IologHandle::Gzip(GzEncoder::new(file, Compression::default()))
    } else {
        IologHandle::Plain(file)
    };
    *files.stream_mut(stream) = IologFile {
        enabled: true,
        compressed: config.compress,
        handle: Some(handle),
    };
    debug!(stream = stream.name(), "opened I/O log stream");
    Ok(())
}

/// Write a payload chunk to an open stream file.
///
/// # Errors
///
/// Returns [`AppError::Iolog`] if the stream is not open or the write
/// fails.
pub fn write_payload(files: &mut IologFiles, stream: IoStream, data: &[u8]) -> Result<()> {
    files.stream_mut(stream).write(data).map_err(|err| {
        AppError::Iolog(format!("unable to write to {}: {err}", stream.name()))
    })
}

/// Append one formatted record to the timing file.
///
/// # Errors
///
/// Returns [`AppError::Iolog`] if the write fails.
pub fn write_timing(files: &mut IologFiles, line: &str) -> Result<()> {
    files
        .timing_mut()
        .write(line.as_bytes())
        .map_err(|err| AppError::Iolog(format!("unable to write to {TIMING_FILE}: {err}")))
}

/// Format a timing record for an I/O buffer event.
#[must_use]
pub fn fmt_timing_iobuf(stream: IoStream, delay: &TimeSpec, len: usize) -> String {
    format!(
        "{} {}.{:09} {}\n",
        stream.event_kind(),
        delay.tv_sec,
        delay.tv_nsec,
        len
    )
}

/// Format a timing record for a window-size event.
#[must_use]
pub fn fmt_timing_winsize(delay: &TimeSpec, rows: i32, cols: i32) -> String {
    format!(
        "{EVENT_WINSIZE} {}.{:09} {rows} {cols}\n",
        delay.tv_sec, delay.tv_nsec
    )
}

/// Format a timing record for a suspend event.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] for an empty, oversized, or
/// non-alphanumeric signal name.
pub fn fmt_timing_suspend(delay: &TimeSpec, signal: &str) -> Result<String> {
    if signal.is_empty()
        || signal.len() > SIGNAME_MAX
        || !signal.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(AppError::Protocol(format!(
            "invalid suspend signal name '{signal}'"
        )));
    }
    Ok(format!(
        "{EVENT_SUSPEND} {}.{:09} {signal}\n",
        delay.tv_sec, delay.tv_nsec
    ))
}

/// Seal a completed session by clearing the write bits on its timing
/// file. A sealed session cannot be restarted.
///
/// # Errors
///
/// Returns [`AppError::Iolog`] if the permission change fails.
pub fn seal(dir: &Path, files: &mut IologFiles, iolog_mode: u32) -> Result<()> {
    files.flush_all()?;
    let path = dir.join(TIMING_FILE);
    let mode = iolog_mode & !0o222;
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).map_err(|err| {
        AppError::Iolog(format!(
            "unable to clear write bits on {}: {err}",
            path.display()
        ))
    })
}

fn meta_str<'a>(evlog: &'a EventLogRecord, key: &str) -> Option<&'a str> {
    evlog.info.get(key).and_then(|v| v.as_str())
}

/// Reduce a client-supplied name to one safe path component. Anything
/// outside [A-Za-z0-9._-] is replaced, and names that would resolve as
/// "." or ".." are rejected outright.
fn safe_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "unknown".to_owned()
    } else {
        cleaned
    }
}

fn open_create(path: &Path, mode: u32) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|err| AppError::Iolog(format!("unable to create {}: {err}", path.display())))
}

fn write_log_file(dir: &Path, evlog: &EventLogRecord, mode: u32) -> Result<()> {
    let mut file = open_create(&dir.join(LOG_FILE), mode)?;
    let record = serde_json::json!({
        "submit_time": evlog.submit_time,
        "info": evlog.info,
    });
    writeln!(file, "{record}")
        .map_err(|err| AppError::Iolog(format!("unable to write {LOG_FILE}: {err}")))?;
    Ok(())
}

/// Create a uniquely named session directory under `parent` using six
/// random alphanumeric characters, retrying on collision.
fn mkdtemp_in(parent: &Path) -> Result<(PathBuf, String)> {
    let mut rng = rand::thread_rng();
    for _ in 0..MKDTEMP_TRIES {
        let name: String = (&mut rng)
            .sample_iter(Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        let candidate = parent.join(&name);
        match DirBuilder::new().mode(0o700).create(&candidate) {
            Ok(()) => return Ok((candidate, name)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(AppError::Iolog(format!(
                    "unable to create {}: {err}",
                    candidate.display()
                )));
            }
        }
    }
    Err(AppError::Iolog(format!(
        "unable to find a unique session directory under {}",
        parent.display()
    )))
}
