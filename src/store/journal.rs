//! Relay sink: per-session journals of raw framed client messages.
//!
//! A journal is created under `<relay_dir>/incoming/` by the first accept
//! or reject, appended to for the life of the session, and moved to
//! `<relay_dir>/outgoing/` by the exit handler. The move is the commit
//! point; files left in `incoming/` after a failure are retained for
//! operator recovery. Restarting clients reopen their incoming journal
//! and the seeker replays it forward, counting delays without executing
//! records, until the resume point is hit exactly.

use std::borrow::Cow;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

use fs2::FileExt;
use prost::Message;
use tracing::{debug, warn};

use super::MessageSwitch;
use crate::connection::ConnectionClosure;
use crate::elapsed::ElapsedTime;
use crate::errors::{AppError, Result};
use crate::iolog::IoStream;
use crate::protocol::framing::{write_frame, FrameReader};
use crate::protocol::{
    client_message, AcceptMessage, AlertMessage, ChangeWindowSize, ClientMessage, CommandSuspend,
    ExitMessage, IoBuffer, RejectMessage, RestartMessage,
};

/// Dispatch table for the relay sink.
pub static SWITCH: MessageSwitch = MessageSwitch {
    accept: journal_accept,
    reject: journal_reject,
    exit: journal_exit,
    restart: journal_restart,
    alert: journal_alert,
    iobuf: journal_iobuf,
    suspend: journal_suspend,
    winsize: journal_winsize,
};

const ERR_CREATE: &str = "unable to create journal file";
const ERR_LOCK: &str = "unable to lock journal file";
const ERR_WRITE: &str = "unable to write journal file";
const ERR_RENAME: &str = "unable to rename journal file";
const ERR_INVALID: &str = "invalid journal file, unable to restart";
const ERR_EOF: &str = "unexpected EOF reading journal file";
const ERR_READ: &str = "error reading journal file";
const ERR_TOO_LARGE: &str = "client message too large";

/// Open per-session journal file plus its owned path.
#[derive(Debug)]
pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Create a uniquely named, exclusively locked journal under
    /// `<relay_dir>/incoming/`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Journal`] on directory or file creation
    /// failure and [`AppError::Contention`] if the lock is held.
    pub fn create(relay_dir: &Path) -> Result<Self> {
        let (file, path) = journal_mkstemp(relay_dir, "incoming")?;
        if let Err(err) = file.try_lock_exclusive() {
            let _ = fs::remove_file(&path);
            return Err(AppError::Contention(format!(
                "unable to lock {}: {err}",
                path.display()
            )));
        }
        debug!(path = %path.display(), "created journal file");
        Ok(Self { file, path })
    }

    /// Reopen an existing incoming journal for restart, positioned at the
    /// beginning.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Journal`] if the file cannot be opened.
    pub fn open_incoming(relay_dir: &Path, name: &str) -> Result<Self> {
        let path = relay_dir.join("incoming").join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                AppError::Journal(format!("unable to open {}: {err}", path.display()))
            })?;
        Ok(Self { file, path })
    }

    /// The journal's current on-disk path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one raw framed record.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if either part of the write fails.
    pub fn append(&mut self, raw: &[u8]) -> Result<()> {
        write_frame(&mut self.file, raw)
    }

    /// Finalize the journal: flush, rewind, and move it to
    /// `<relay_dir>/outgoing/` under a fresh unique name. The in-memory
    /// path is replaced by the outgoing path.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] on flush failure and
    /// [`AppError::Journal`] if the outgoing name cannot be allocated or
    /// the rename fails. On rename failure the outgoing placeholder is
    /// unlinked best-effort; the incoming file is left in place.
    pub fn finish(&mut self, relay_dir: &Path) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        self.file.seek(SeekFrom::Start(0))?;

        let (placeholder, outgoing_path) = journal_mkstemp(relay_dir, "outgoing")?;
        drop(placeholder);
        if let Err(err) = fs::rename(&self.path, &outgoing_path) {
            let _ = fs::remove_file(&outgoing_path);
            return Err(AppError::Journal(format!(
                "unable to rename {} -> {}: {err}",
                self.path.display(),
                outgoing_path.display()
            )));
        }
        debug!(
            from = %self.path.display(),
            to = %outgoing_path.display(),
            "renamed journal"
        );
        self.path = outgoing_path;
        Ok(())
    }

    /// Replay the journal forward until `elapsed` reaches `target`
    /// exactly, counting record delays without executing them.
    ///
    /// The walk doubles as structural validation of the journal up to the
    /// restart point: any unreadable frame, undecodable payload, or
    /// unknown variant fails the restart, and passing the target without
    /// landing on it means the stored delays disagree with the client.
    ///
    /// On success the file is positioned immediately past the record that
    /// reached the target, ready for appending.
    ///
    /// # Errors
    ///
    /// [`AppError::Eof`], [`AppError::Io`], [`AppError::Protocol`], or
    /// [`AppError::Restart`] as described above.
    pub fn seek_to(&mut self, target: ElapsedTime, elapsed: &mut ElapsedTime) -> Result<()> {
        let mut reader = BufReader::new(&mut self.file);
        let mut frames = FrameReader::new();

        loop {
            let payload = frames.read_frame(&mut reader)?;
            let msg = ClientMessage::decode(payload).map_err(|err| {
                AppError::Protocol(format!("unable to decode journal record: {err}"))
            })?;

            let delay = match &msg.r#type {
                Some(
                    client_message::Type::TtyinBuf(buf)
                    | client_message::Type::TtyoutBuf(buf)
                    | client_message::Type::StdinBuf(buf)
                    | client_message::Type::StdoutBuf(buf)
                    | client_message::Type::StderrBuf(buf),
                ) => buf.delay,
                Some(client_message::Type::WinsizeEvent(ev)) => ev.delay,
                Some(client_message::Type::SuspendEvent(ev)) => ev.delay,
                Some(
                    client_message::Type::HelloMsg(_)
                    | client_message::Type::AcceptMsg(_)
                    | client_message::Type::RejectMsg(_)
                    | client_message::Type::ExitMsg(_)
                    | client_message::Type::RestartMsg(_)
                    | client_message::Type::AlertMsg(_),
                ) => None,
                None => {
                    return Err(AppError::Protocol(
                        "unknown message variant in journal".to_owned(),
                    ));
                }
            };
            if let Some(delay) = delay {
                elapsed.advance(&delay);
                debug!(%elapsed, "journal seek advanced");
            }

            if *elapsed >= target {
                if *elapsed == target {
                    break;
                }
                // Mismatch between resume point and stored log.
                return Err(AppError::Restart(format!(
                    "unable to find resume point {target} in {}",
                    self.path.display()
                )));
            }
        }

        // Reposition the underlying file at the logical read offset
        // before writes resume.
        reader.seek(SeekFrom::Current(0))?;
        Ok(())
    }
}

/// Create a uniquely named 0600 file under `<relay_dir>/<subdir>/`,
/// creating intermediate directories with mode 0711.
fn journal_mkstemp(relay_dir: &Path, subdir: &str) -> Result<(File, PathBuf)> {
    let parent = relay_dir.join(subdir);
    DirBuilder::new()
        .recursive(true)
        .mode(0o711)
        .create(&parent)
        .map_err(|err| {
            AppError::Journal(format!(
                "unable to create parent dir {}: {err}",
                parent.display()
            ))
        })?;

    let temp = tempfile::Builder::new()
        .prefix("journal.")
        .rand_bytes(6)
        .tempfile_in(&parent)
        .map_err(|err| {
            AppError::Journal(format!(
                "unable to create journal file in {}: {err}",
                parent.display()
            ))
        })?;
    temp.keep()
        .map_err(|err| AppError::Journal(format!("unable to persist journal file: {err}")))
}

/// Map a seek failure to its operator-facing message.
fn seek_errstr(err: &AppError) -> &'static str {
    match err {
        AppError::Eof(_) => ERR_EOF,
        AppError::Io(_) => ERR_READ,
        AppError::Protocol(msg) if msg.starts_with("client message too large") => ERR_TOO_LARGE,
        _ => ERR_INVALID,
    }
}

/// Create the session journal in the closure, mapping failures to their
/// operator-facing message.
fn create_in_closure(closure: &mut ConnectionClosure) -> Result<()> {
    let relay_dir = closure.config.relay_dir().to_owned();
    match Journal::create(&relay_dir) {
        Ok(journal) => {
            closure.journal = Some(journal);
            Ok(())
        }
        Err(err) => {
            closure.errstr = Some(Cow::Borrowed(match err {
                AppError::Contention(_) => ERR_LOCK,
                _ => ERR_CREATE,
            }));
            Err(err)
        }
    }
}

/// Store an accept decision: create the journal and append the original
/// encoded bytes. When the client will stream I/O buffers, send the log
/// id it needs to restart later.
fn journal_accept(msg: &AcceptMessage, raw: &[u8], closure: &mut ConnectionClosure) -> Result<()> {
    create_in_closure(closure)?;
    append_raw(raw, closure)?;

    if msg.expect_iobufs {
        let log_id = closure
            .journal
            .as_ref()
            .and_then(|j| j.path().file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        closure.send_log_id(log_id);
    }
    Ok(())
}

/// Store a reject decision in the journal.
fn journal_reject(_msg: &RejectMessage, raw: &[u8], closure: &mut ConnectionClosure) -> Result<()> {
    create_in_closure(closure)?;
    append_raw(raw, closure)
}

/// Store the exit record, then commit the journal to `outgoing/`.
fn journal_exit(_msg: &ExitMessage, raw: &[u8], closure: &mut ConnectionClosure) -> Result<()> {
    append_raw(raw, closure)?;
    let relay_dir = closure.config.relay_dir().to_owned();
    let res = match closure.journal.as_mut() {
        Some(journal) => journal.finish(&relay_dir),
        None => Err(AppError::Journal("no journal open for session".to_owned())),
    };
    if let Err(err) = res {
        closure.errstr = Some(Cow::Borrowed(match err {
            AppError::Io(_) => ERR_WRITE,
            _ => ERR_RENAME,
        }));
        return Err(err);
    }
    Ok(())
}

/// Reopen the incoming journal named by the restart's `log_id` and seek
/// to the resume point.
fn journal_restart(
    msg: &RestartMessage,
    _raw: &[u8],
    closure: &mut ConnectionClosure,
) -> Result<()> {
    let relay_dir = closure.config.relay_dir().to_owned();
    let opened = incoming_name(&msg.log_id)
        .and_then(|name| Journal::open_incoming(&relay_dir, name));
    match opened {
        Ok(journal) => closure.journal = Some(journal),
        Err(err) => {
            closure.errstr = Some(Cow::Borrowed(ERR_CREATE));
            return Err(err);
        }
    }

    let Some(target) = msg.resume_point.as_ref().map(ElapsedTime::from) else {
        closure.errstr = Some(Cow::Borrowed(ERR_INVALID));
        return Err(AppError::Protocol("restart without resume point".to_owned()));
    };
    let mut elapsed = closure.elapsed_time;
    let res = match closure.journal.as_mut() {
        Some(journal) => journal.seek_to(target, &mut elapsed),
        None => Err(AppError::Journal("no journal open for session".to_owned())),
    };
    match res {
        Ok(()) => {
            closure.elapsed_time = elapsed;
            Ok(())
        }
        Err(err) => {
            warn!(%err, log_id = %msg.log_id, "journal restart failed");
            closure.errstr = Some(Cow::Borrowed(seek_errstr(&err)));
            Err(err)
        }
    }
}

/// Store an alert record in the journal.
fn journal_alert(_msg: &AlertMessage, raw: &[u8], closure: &mut ConnectionClosure) -> Result<()> {
    append_raw(raw, closure)
}

/// Store an I/O buffer record and account its delay.
fn journal_iobuf(
    _stream: IoStream,
    iobuf: &IoBuffer,
    raw: &[u8],
    closure: &mut ConnectionClosure,
) -> Result<()> {
    append_raw(raw, closure)?;
    if let Some(delay) = &iobuf.delay {
        closure.elapsed_time.advance(delay);
    }
    Ok(())
}

/// Store a suspend record in the journal.
fn journal_suspend(
    _msg: &CommandSuspend,
    raw: &[u8],
    closure: &mut ConnectionClosure,
) -> Result<()> {
    append_raw(raw, closure)
}

/// Store a window-size record in the journal.
fn journal_winsize(
    _msg: &ChangeWindowSize,
    raw: &[u8],
    closure: &mut ConnectionClosure,
) -> Result<()> {
    append_raw(raw, closure)
}

fn append_raw(raw: &[u8], closure: &mut ConnectionClosure) -> Result<()> {
    let res = match closure.journal.as_mut() {
        Some(journal) => journal.append(raw),
        None => Err(AppError::Journal("no journal open for session".to_owned())),
    };
    if res.is_err() {
        closure.errstr = Some(Cow::Borrowed(ERR_WRITE));
    }
    res
}

/// Resolve a restart `log_id` to a file name under `incoming/`.
///
/// A `hostname/name` id is split on the first slash and the suffix names
/// the journal. The result must be a single path component.
fn incoming_name(log_id: &str) -> Result<&str> {
    let name = match log_id.split_once('/') {
        Some((host, rest)) if !host.is_empty() => rest,
        _ => log_id,
    };
    let valid = !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        && !name.contains('/');
    if !valid {
        return Err(AppError::Protocol(format!(
            "invalid restart log id '{log_id}'"
        )));
    }
    Ok(name)
}
