//! Restarting interrupted I/O-log sessions.
//!
//! A reconnecting client names a session and the elapsed time up to which
//! it was acknowledged. Plain stream files are repositioned by walking the
//! timing file (seek mode). Compressed streams do not support random
//! access, so the whole file set is regenerated up to the target from the
//! old set (rewrite mode). In both modes, passing the target without
//! landing on it exactly means the stored log disagrees with the client
//! and the restart is refused.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use super::{IoStream, IologFile, IologFiles, IologHandle, EVENT_SUSPEND, EVENT_WINSIZE, TIMING_FILE};
use crate::config::IologConfig;
use crate::elapsed::ElapsedTime;
use crate::errors::{AppError, Result};
use crate::protocol::TimeSpec;

/// Operator-facing message for a restart against a sealed session.
pub const ERR_ALREADY_COMPLETE: &str = "log is already complete, cannot be restarted";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One parsed timing-file record.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TimingRecord {
    pub delay: TimeSpec,
    pub event: TimingEvent,
}

/// Event payload of a timing record.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TimingEvent {
    IoBuf { stream: IoStream, len: u64 },
    Winsize { rows: i32, cols: i32 },
    Suspend { signal: String },
}

impl TimingRecord {
    /// Parse one LF-stripped timing line.
    pub(crate) fn parse(line: &str) -> Result<Self> {
        let bad = || AppError::Protocol(format!("invalid timing record '{line}'"));

        let mut parts = line.split_ascii_whitespace();
        let kind: u8 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;

        let (sec, nsec) = parts.next().and_then(|s| s.split_once('.')).ok_or_else(bad)?;
        if nsec.len() != 9 {
            return Err(bad());
        }
        let delay = TimeSpec {
            tv_sec: sec.parse().map_err(|_| bad())?,
            tv_nsec: nsec.parse().map_err(|_| bad())?,
        };

        let event = if let Some(stream) = IoStream::from_event_kind(kind) {
            let len = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            TimingEvent::IoBuf { stream, len }
        } else if kind == EVENT_WINSIZE {
            let rows = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            let cols = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            TimingEvent::Winsize { rows, cols }
        } else if kind == EVENT_SUSPEND {
            let signal = parts.next().ok_or_else(bad)?.to_owned();
            TimingEvent::Suspend { signal }
        } else {
            return Err(bad());
        };

        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self { delay, event })
    }
}

/// Resolve a client-supplied `log_id` to an existing session directory.
///
/// # Errors
///
/// Returns [`AppError::Restart`] if the identifier escapes the I/O-log
/// root or names no session.
pub fn open_session(root: &Path, log_id: &str) -> Result<PathBuf> {
    let rel = Path::new(log_id);
    let escapes = rel.is_absolute()
        || rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(AppError::Restart(format!("invalid log id '{log_id}'")));
    }

    let dir = root.join(rel);
    if !dir.is_dir() {
        return Err(AppError::Restart(format!(
            "no I/O log session at {}",
            dir.display()
        )));
    }
    Ok(dir)
}

/// Reopen an interrupted session's file set for restart.
///
/// Fails with [`ERR_ALREADY_COMPLETE`] when the timing file's owner-write
/// bit is clear. Stream files are opened read+write and probed for the
/// gzip magic to detect compression.
///
/// # Errors
///
/// Returns [`AppError::Restart`] on a missing or sealed timing file and
/// [`AppError::Io`] on other failures.
pub fn reopen(dir: &Path, files: &mut IologFiles) -> Result<()> {
    let timing_path = dir.join(TIMING_FILE);
    let meta = fs::metadata(&timing_path).map_err(|err| {
        AppError::Restart(format!("unable to stat {}: {err}", timing_path.display()))
    })?;
    if meta.permissions().mode() & 0o200 == 0 {
        return Err(AppError::Restart(ERR_ALREADY_COMPLETE.to_owned()));
    }

    let timing = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&timing_path)?;
    *files.timing_mut() = IologFile {
        enabled: true,
        compressed: false,
        handle: Some(IologHandle::Plain(timing)),
    };

    for stream in IoStream::ALL {
        let slot = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join(stream.name()))
        {
            Ok(mut file) => {
                let compressed = has_gzip_magic(&mut file)?;
                IologFile {
                    enabled: true,
                    compressed,
                    handle: Some(IologHandle::Plain(file)),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => IologFile::default(),
            Err(err) => return Err(err.into()),
        };
        *files.stream_mut(stream) = slot;
    }
    Ok(())
}

/// Advance a reopened session to `target`.
///
/// Chooses rewrite mode when any stream is compressed, seek mode
/// otherwise. On success `elapsed` equals `target` and every handle is
/// positioned for appending.
///
/// # Errors
///
/// Returns [`AppError::Restart`] when the target cannot be reached
/// exactly and [`AppError::Protocol`] on malformed timing records.
pub fn seek_session(
    dir: &Path,
    files: &mut IologFiles,
    elapsed: &mut ElapsedTime,
    target: ElapsedTime,
    config: &IologConfig,
) -> Result<()> {
    if files.any_compressed() {
        rewrite(dir, files, elapsed, target, config)
    } else {
        seek_to(files, elapsed, target)
    }
}

/// Seek mode: walk the timing file, repositioning plain stream files by
/// their recorded payload lengths.
fn seek_to(files: &mut IologFiles, elapsed: &mut ElapsedTime, target: ElapsedTime) -> Result<()> {
    let Some(IologHandle::Plain(timing)) = files.timing_mut().handle.take() else {
        return Err(AppError::Iolog("timing file is not open".to_owned()));
    };
    let mut reader = BufReader::new(timing);
    let mut line = String::new();

    while *elapsed != target {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(AppError::Restart(format!(
                "unable to find resume point {target}"
            )));
        }
        let record = TimingRecord::parse(line.trim_end_matches('\n'))?;
        if let TimingEvent::IoBuf { stream, len } = record.event {
            let slot = files.stream_mut(stream);
            match slot.handle.as_mut() {
                Some(IologHandle::Plain(file)) => {
                    let offset = i64::try_from(len).map_err(|_| {
                        AppError::Protocol(format!("timing record length out of range: {len}"))
                    })?;
                    file.seek(SeekFrom::Current(offset))?;
                }
                _ => {
                    return Err(AppError::Restart(format!(
                        "timing file references missing stream {}",
                        stream.name()
                    )));
                }
            }
        }
        elapsed.advance(&record.delay);
        if *elapsed > target {
            debug!(%elapsed, %target, "resume point not aligned with timing file");
            return Err(AppError::Restart(format!(
                "unable to find resume point {target}"
            )));
        }
    }

    // Mandatory position-preserving seek before the handle switches from
    // read to write.
    reader.seek(SeekFrom::Current(0))?;
    files.timing_mut().handle = Some(IologHandle::Plain(reader.into_inner()));
    Ok(())
}

fn has_gzip_magic(file: &mut File) -> Result<bool> {
    let mut magic = [0u8; 2];
    let probe = file.read_exact(&mut magic);
    file.seek(SeekFrom::Start(0))?;
    match probe {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Read side of an existing stream during a rewrite.
enum StreamReader {
    Plain(File),
    Gzip(GzDecoder<File>),
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(file) => file.read(buf),
            Self::Gzip(dec) => dec.read(buf),
        }
    }
}

/// Rewrite mode: regenerate the whole file set up to `target`.
///
/// Compressed streams cannot be repositioned, so every enabled file is
/// replayed from the beginning into a fresh set created in a temporary
/// directory inside the session directory, then renamed over the
/// originals. Handles stay open across the rename so subsequent writes
/// continue on the new set.
fn rewrite(
    dir: &Path,
    files: &mut IologFiles,
    elapsed: &mut ElapsedTime,
    target: ElapsedTime,
    config: &IologConfig,
) -> Result<()> {
    let Some(IologHandle::Plain(old_timing)) = files.timing_mut().handle.take() else {
        return Err(AppError::Iolog("timing file is not open".to_owned()));
    };
    let mut timing_reader = BufReader::new(old_timing);

    // Readers over the old payload streams, decompressing as needed.
    let mut readers: [Option<StreamReader>; 5] = [None, None, None, None, None];
    for stream in IoStream::ALL {
        let slot = files.stream_mut(stream);
        if !slot.enabled {
            continue;
        }
        let Some(IologHandle::Plain(file)) = slot.handle.take() else {
            return Err(AppError::Iolog(format!(
                "stream {} is not open",
                stream.name()
            )));
        };
        readers[stream as usize] = Some(if slot.compressed {
            StreamReader::Gzip(GzDecoder::new(file))
        } else {
            StreamReader::Plain(file)
        });
    }

    // Fresh output set, created in the session directory so the final
    // renames stay on one filesystem.
    let tmp = tempfile::Builder::new()
        .prefix("restart.")
        .tempdir_in(dir)
        .map_err(|err| AppError::Iolog(format!("unable to create rewrite dir: {err}")))?;

    let mut new_timing = super::open_create(&tmp.path().join(TIMING_FILE), config.mode)?;
    let mut writers: [Option<IologHandle>; 5] = [None, None, None, None, None];
    for stream in IoStream::ALL {
        let slot = files.stream(stream);
        if !slot.enabled() {
            continue;
        }
        let file = super::open_create(&tmp.path().join(stream.name()), config.mode)?;
        writers[stream as usize] = Some(if slot.compressed() {
            IologHandle::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            IologHandle::Plain(file)
        });
    }

    let mut line = String::new();
    while *elapsed != target {
        line.clear();
        if timing_reader.read_line(&mut line)? == 0 {
            return Err(AppError::Restart(format!(
                "unable to find resume point {target}"
            )));
        }
        let record = TimingRecord::parse(line.trim_end_matches('\n'))?;
        if let TimingEvent::IoBuf { stream, len } = record.event {
            let reader = readers[stream as usize].as_mut().ok_or_else(|| {
                AppError::Restart(format!(
                    "timing file references missing stream {}",
                    stream.name()
                ))
            })?;
            let writer = writers[stream as usize]
                .as_mut()
                .ok_or_else(|| AppError::Iolog("rewrite stream not open".to_owned()))?;
            let copied = match writer {
                IologHandle::Plain(file) => io::copy(&mut reader.take(len), file)?,
                IologHandle::Gzip(enc) => io::copy(&mut reader.take(len), enc)?,
            };
            if copied != len {
                return Err(AppError::Eof(format!(
                    "stream {} ends before the resume point",
                    stream.name()
                )));
            }
        }
        io::Write::write_all(&mut new_timing, line.as_bytes())?;
        elapsed.advance(&record.delay);
        if *elapsed > target {
            debug!(%elapsed, %target, "resume point not aligned with timing file");
            return Err(AppError::Restart(format!(
                "unable to find resume point {target}"
            )));
        }
    }

    // Commit: rename the fresh set over the originals. The open handles
    // follow the renamed files.
    fs::rename(tmp.path().join(TIMING_FILE), dir.join(TIMING_FILE))?;
    files.timing_mut().handle = Some(IologHandle::Plain(new_timing));
    for stream in IoStream::ALL {
        if let Some(handle) = writers[stream as usize].take() {
            fs::rename(tmp.path().join(stream.name()), dir.join(stream.name()))?;
            files.stream_mut(stream).handle = Some(handle);
        }
    }
    debug!(dir = %dir.display(), %target, "rewrote compressed I/O log for restart");
    Ok(())
}
