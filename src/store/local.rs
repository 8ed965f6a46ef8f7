//! Local sink: event log plus per-session I/O-log trees.
//!
//! Accept and reject decisions are parsed into event-log records and
//! emitted through the event-log backend. Sessions that stream I/O
//! buffers additionally get an I/O-log directory: payloads go to their
//! stream file, every event appends a timing record, and the exit handler
//! seals the tree by clearing the write bits on the timing file.

use std::borrow::Cow;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, warn};

use super::MessageSwitch;
use crate::connection::ConnectionClosure;
use crate::elapsed::ElapsedTime;
use crate::errors::{AppError, Result};
use crate::eventlog::{EventLogRecord, SessionExit};
use crate::iolog::{self, restart, IoStream};
use crate::protocol::{
    AcceptMessage, AlertMessage, ChangeWindowSize, CommandSuspend, ExitMessage, IoBuffer,
    RejectMessage, RestartMessage, TimeSpec,
};

/// Dispatch table for the local sink.
pub static SWITCH: MessageSwitch = MessageSwitch {
    accept: store_accept,
    reject: store_reject,
    exit: store_exit,
    restart: store_restart,
    alert: store_alert,
    iobuf: store_iobuf,
    suspend: store_suspend,
    winsize: store_winsize,
};

const ERR_PARSE_ACCEPT: &str = "error parsing AcceptMessage";
const ERR_PARSE_REJECT: &str = "error parsing RejectMessage";
const ERR_PARSE_ALERT: &str = "error parsing AlertMessage";
const ERR_CREATE_IOLOG: &str = "error creating I/O log";
const ERR_LOG_ACCEPT: &str = "error logging accept event";
const ERR_LOG_REJECT: &str = "error logging reject event";
const ERR_LOG_ALERT: &str = "error logging alert event";
const ERR_LOG_EXIT: &str = "error logging exit event";
const ERR_WRITE_IOBUF: &str = "error writing IoBuffer";
const ERR_WRITE_WINSIZE: &str = "error writing ChangeWindowSize";
const ERR_WRITE_SUSPEND: &str = "error writing CommandSuspend";
const ERR_RESTART: &str = "unable to restart log";

/// Parse an accept decision, create the I/O-log tree when the client
/// will stream buffers, and emit the accept event.
fn store_accept(msg: &AcceptMessage, _raw: &[u8], closure: &mut ConnectionClosure) -> Result<()> {
    let mut evlog = match EventLogRecord::from_info(msg.submit_time.as_ref(), &msg.info_msgs) {
        Ok(evlog) => evlog,
        Err(err) => {
            closure.errstr = Some(Cow::Borrowed(ERR_PARSE_ACCEPT));
            return Err(err);
        }
    };

    let mut log_id = None;
    if msg.expect_iobufs {
        let config = Arc::clone(&closure.config);
        match iolog::init_session(&config.iolog, &mut evlog, &mut closure.iolog_files) {
            Ok(dir) => {
                closure.iolog_dir = Some(dir);
                closure.log_io = true;
                log_id = evlog.iolog_path.clone();
            }
            Err(err) => {
                closure.errstr = Some(Cow::Borrowed(ERR_CREATE_IOLOG));
                return Err(err);
            }
        }
    }

    if let Err(err) = closure.evlogger.accept(&evlog) {
        closure.errstr = Some(Cow::Borrowed(ERR_LOG_ACCEPT));
        return Err(err);
    }
    closure.evlog = Some(evlog);

    if let Some(log_id) = log_id {
        // The client needs the log id to request a restart later.
        closure.send_log_id(log_id);
    }
    Ok(())
}

/// Parse a reject decision and emit the reject event with its reason.
fn store_reject(msg: &RejectMessage, _raw: &[u8], closure: &mut ConnectionClosure) -> Result<()> {
    let evlog = match EventLogRecord::from_info(msg.submit_time.as_ref(), &msg.info_msgs) {
        Ok(evlog) => evlog,
        Err(err) => {
            closure.errstr = Some(Cow::Borrowed(ERR_PARSE_REJECT));
            return Err(err);
        }
    };

    if let Err(err) = closure.evlogger.reject(&evlog, &msg.reason) {
        closure.errstr = Some(Cow::Borrowed(ERR_LOG_REJECT));
        return Err(err);
    }
    closure.evlog = Some(evlog);
    Ok(())
}

/// Record the command's completion and seal the I/O log.
fn store_exit(msg: &ExitMessage, _raw: &[u8], closure: &mut ConnectionClosure) -> Result<()> {
    if msg.signal.is_empty() {
        debug!(exit_value = msg.exit_value, "command exited");
    } else {
        debug!(
            signal = %msg.signal,
            dumped_core = msg.dumped_core,
            "command was killed by signal"
        );
    }

    let status = SessionExit {
        exit_value: msg.exit_value,
        signal: (!msg.signal.is_empty()).then(|| msg.signal.clone()),
        dumped_core: msg.dumped_core,
    };
    if let Err(err) = closure.evlogger.exit(closure.evlog.as_ref(), &status) {
        closure.errstr = Some(Cow::Borrowed(ERR_LOG_EXIT));
        return Err(err);
    }

    if closure.log_io {
        // Clearing the write bits marks the session complete; a failure
        // here leaves the log restartable but does not fail the exit.
        let mode = closure.config.iolog_mode();
        if let Some(dir) = closure.iolog_dir.clone() {
            if let Err(err) = iolog::seal(&dir, &mut closure.iolog_files, mode) {
                warn!(%err, "unable to seal timing file");
            }
        }
    }
    Ok(())
}

/// Reopen an interrupted session's I/O log and advance it to the resume
/// point.
fn store_restart(msg: &RestartMessage, _raw: &[u8], closure: &mut ConnectionClosure) -> Result<()> {
    let res = try_restart(msg, closure);
    if let Err(err) = &res {
        warn!(%err, log_id = %msg.log_id, "I/O log restart failed");
        let errstr = restart_errstr(err);
        closure.errstr.get_or_insert(Cow::Borrowed(errstr));
    }
    res
}

fn try_restart(msg: &RestartMessage, closure: &mut ConnectionClosure) -> Result<()> {
    let target: ElapsedTime = msg
        .resume_point
        .as_ref()
        .map(ElapsedTime::from)
        .ok_or_else(|| AppError::Protocol("restart without resume point".to_owned()))?;

    closure.evlog = Some(EventLogRecord::for_restart(msg.log_id.clone()));

    let config = Arc::clone(&closure.config);
    let dir = restart::open_session(&config.iolog.dir, &msg.log_id)?;
    restart::reopen(&dir, &mut closure.iolog_files)?;

    let mut elapsed = closure.elapsed_time;
    restart::seek_session(
        &dir,
        &mut closure.iolog_files,
        &mut elapsed,
        target,
        &config.iolog,
    )?;
    closure.elapsed_time = elapsed;
    closure.iolog_dir = Some(dir);
    closure.log_io = true;
    Ok(())
}

fn restart_errstr(err: &AppError) -> &'static str {
    match err {
        AppError::Restart(msg) if msg == restart::ERR_ALREADY_COMPLETE => {
            restart::ERR_ALREADY_COMPLETE
        }
        _ => ERR_RESTART,
    }
}

/// Emit an alert event, parsing any metadata the alert carries.
fn store_alert(msg: &AlertMessage, _raw: &[u8], closure: &mut ConnectionClosure) -> Result<()> {
    if !msg.info_msgs.is_empty() {
        match EventLogRecord::from_info(None, &msg.info_msgs) {
            Ok(evlog) => closure.evlog = Some(evlog),
            Err(err) => {
                closure.errstr = Some(Cow::Borrowed(ERR_PARSE_ALERT));
                return Err(err);
            }
        }
    }

    let Some(alert_time) = msg.alert_time.as_ref().and_then(wallclock) else {
        closure.errstr = Some(Cow::Borrowed(ERR_PARSE_ALERT));
        return Err(AppError::Protocol("alert without a valid time".to_owned()));
    };
    if let Err(err) = closure
        .evlogger
        .alert(closure.evlog.as_ref(), alert_time, &msg.reason)
    {
        closure.errstr = Some(Cow::Borrowed(ERR_LOG_ALERT));
        return Err(err);
    }
    Ok(())
}

/// Store one I/O payload chunk plus its timing record, then account its
/// delay. May randomly drop the connection afterwards when the test
/// facility is enabled.
fn store_iobuf(
    stream: IoStream,
    iobuf: &IoBuffer,
    _raw: &[u8],
    closure: &mut ConnectionClosure,
) -> Result<()> {
    let res = try_iobuf(stream, iobuf, closure);
    if let Err(err) = res {
        closure.errstr.get_or_insert(Cow::Borrowed(ERR_WRITE_IOBUF));
        return Err(err);
    }

    // Random drop exercises client restart handling.
    let drop_prob = closure.config.random_drop();
    if drop_prob > 0.0 {
        let randval = rand::thread_rng().gen::<f64>();
        if randval < drop_prob {
            warn!(randval, drop_prob, "randomly dropping connection");
            return Err(AppError::Io("randomly dropping connection".to_owned()));
        }
    }
    Ok(())
}

fn try_iobuf(stream: IoStream, iobuf: &IoBuffer, closure: &mut ConnectionClosure) -> Result<()> {
    let Some(delay) = iobuf.delay else {
        return Err(AppError::Protocol("I/O buffer without delay".to_owned()));
    };

    if !closure.iolog_files.stream(stream).enabled() {
        let config = Arc::clone(&closure.config);
        let Some(dir) = closure.iolog_dir.clone() else {
            return Err(AppError::Iolog(
                "no I/O log directory for session".to_owned(),
            ));
        };
        iolog::create_stream(&dir, stream, &mut closure.iolog_files, &config.iolog)?;
    }

    let timing = iolog::fmt_timing_iobuf(stream, &delay, iobuf.data.len());
    iolog::write_payload(&mut closure.iolog_files, stream, &iobuf.data)?;
    iolog::write_timing(&mut closure.iolog_files, &timing)?;
    closure.elapsed_time.advance(&delay);
    Ok(())
}

/// Store a suspend timing record and account its delay.
fn store_suspend(msg: &CommandSuspend, _raw: &[u8], closure: &mut ConnectionClosure) -> Result<()> {
    let res = try_suspend(msg, closure);
    if res.is_err() {
        closure
            .errstr
            .get_or_insert(Cow::Borrowed(ERR_WRITE_SUSPEND));
    }
    res
}

fn try_suspend(msg: &CommandSuspend, closure: &mut ConnectionClosure) -> Result<()> {
    let Some(delay) = msg.delay else {
        return Err(AppError::Protocol("suspend without delay".to_owned()));
    };
    let timing = iolog::fmt_timing_suspend(&delay, &msg.signal)?;
    iolog::write_timing(&mut closure.iolog_files, &timing)?;
    closure.elapsed_time.advance(&delay);
    Ok(())
}

/// Store a window-size timing record and account its delay.
fn store_winsize(
    msg: &ChangeWindowSize,
    _raw: &[u8],
    closure: &mut ConnectionClosure,
) -> Result<()> {
    let res = try_winsize(msg, closure);
    if res.is_err() {
        closure
            .errstr
            .get_or_insert(Cow::Borrowed(ERR_WRITE_WINSIZE));
    }
    res
}

fn try_winsize(msg: &ChangeWindowSize, closure: &mut ConnectionClosure) -> Result<()> {
    let Some(delay) = msg.delay else {
        return Err(AppError::Protocol("window-size change without delay".to_owned()));
    };
    let timing = iolog::fmt_timing_winsize(&delay, msg.rows, msg.cols);
    iolog::write_timing(&mut closure.iolog_files, &timing)?;
    closure.elapsed_time.advance(&delay);
    Ok(())
}

fn wallclock(ts: &TimeSpec) -> Option<DateTime<Utc>> {
    u32::try_from(ts.tv_nsec)
        .ok()
        .and_then(|nsecs| DateTime::from_timestamp(ts.tv_sec, nsecs))
}
