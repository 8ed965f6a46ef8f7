//! Per-connection state container.
//!
//! One closure is created when a connection is accepted and owns
//! everything a session touches: the elapsed-time clock, the bound sink,
//! the error slot consumed by the event loop, the event-log descriptor,
//! the I/O-log file set, the journal, and the outbound message queue. It
//! is only ever accessed by the task that owns the connection, so no
//! locking is involved; every owned handle is released on drop.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{GlobalConfig, SinkKind};
use crate::elapsed::ElapsedTime;
use crate::errors::{AppError, Result};
use crate::eventlog::{EventLogRecord, EventLogger};
use crate::iolog::{IoStream, IologFiles};
use crate::protocol::{client_message, server_message, ClientMessage, ServerMessage, TimeSpec};
use crate::store::{self, journal::Journal};

/// Message-ordering state for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// No session opened yet; expecting accept, reject, or restart.
    Initial,
    /// Session open; expecting I/O records, alerts, or exit.
    Running,
    /// Session closed by exit or reject.
    Exited,
}

/// Per-connection aggregate tying the sinks together.
pub struct ConnectionClosure {
    /// Cumulative delay of all records processed on this connection.
    pub elapsed_time: ElapsedTime,
    /// Sink every message on this connection is bound to.
    pub sink: SinkKind,
    /// Operator-facing failure message, set by handlers and consumed by
    /// the event loop when it tears the connection down.
    pub errstr: Option<Cow<'static, str>>,
    /// Event-log descriptor, present once an accept/reject/alert has been
    /// processed or synthesized on restart.
    pub evlog: Option<EventLogRecord>,
    /// Whether this session produces I/O logs.
    pub log_io: bool,
    /// Root of the session's I/O-log tree.
    pub iolog_dir: Option<PathBuf>,
    /// The five payload streams plus the timing file.
    pub iolog_files: IologFiles,
    /// Relay-sink journal.
    pub journal: Option<Journal>,
    pub(crate) config: Arc<GlobalConfig>,
    pub(crate) evlogger: Arc<dyn EventLogger>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    state: SessionState,
}

impl ConnectionClosure {
    /// Construct the closure for a freshly accepted connection.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        evlogger: Arc<dyn EventLogger>,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            elapsed_time: ElapsedTime::default(),
            sink: config.sink,
            errstr: None,
            evlog: None,
            log_io: false,
            iolog_dir: None,
            iolog_files: IologFiles::default(),
            journal: None,
            config,
            evlogger,
            outbound,
            state: SessionState::Initial,
        }
    }

    /// Return the closure to its initial per-session state, releasing
    /// every session handle. The sink binding and backends survive.
    pub fn reset(&mut self) {
        self.elapsed_time = ElapsedTime::default();
        self.errstr = None;
        self.evlog = None;
        self.log_io = false;
        self.iolog_dir = None;
        self.iolog_files = IologFiles::default();
        self.journal = None;
        self.state = SessionState::Initial;
    }

    /// Route one inbound message to the single handler bound for its
    /// variant, enforcing session ordering first.
    ///
    /// `raw` is the message's original encoding, persisted verbatim by
    /// the relay sink. `ClientHello` is a connection-layer exchange and
    /// never reaches the dispatch table.
    ///
    /// # Errors
    ///
    /// Propagates the handler's error; `errstr` carries the
    /// operator-facing message.
    pub fn dispatch(&mut self, msg: &ClientMessage, raw: &[u8]) -> Result<()> {
        use client_message::Type;

        let Some(ty) = msg.r#type.as_ref() else {
            self.errstr = Some(Cow::Borrowed("unrecognized client message"));
            return Err(AppError::Protocol(
                "unknown client message variant".to_owned(),
            ));
        };

        let switch = store::switch_for(self.sink);
        match ty {
            Type::HelloMsg(_) => {
                self.state_error("ClientHello after session start")
            }
            Type::AcceptMsg(m) => {
                self.require_state(SessionState::Initial, "AcceptMessage")?;
                (switch.accept)(m, raw, self)?;
                self.state = SessionState::Running;
                Ok(())
            }
            Type::RejectMsg(m) => {
                self.require_state(SessionState::Initial, "RejectMessage")?;
                (switch.reject)(m, raw, self)?;
                self.state = SessionState::Exited;
                Ok(())
            }
            Type::RestartMsg(m) => {
                self.require_state(SessionState::Initial, "RestartMessage")?;
                (switch.restart)(m, raw, self)?;
                self.state = SessionState::Running;
                Ok(())
            }
            Type::ExitMsg(m) => {
                self.require_state(SessionState::Running, "ExitMessage")?;
                (switch.exit)(m, raw, self)?;
                self.state = SessionState::Exited;
                Ok(())
            }
            Type::AlertMsg(m) => {
                if self.state == SessionState::Exited {
                    return self.state_error("AlertMessage after exit");
                }
                (switch.alert)(m, raw, self)
            }
            Type::TtyinBuf(m) => self.dispatch_iobuf(IoStream::TtyIn, m, raw),
            Type::TtyoutBuf(m) => self.dispatch_iobuf(IoStream::TtyOut, m, raw),
            Type::StdinBuf(m) => self.dispatch_iobuf(IoStream::Stdin, m, raw),
            Type::StdoutBuf(m) => self.dispatch_iobuf(IoStream::Stdout, m, raw),
            Type::StderrBuf(m) => self.dispatch_iobuf(IoStream::Stderr, m, raw),
            Type::WinsizeEvent(m) => {
                self.require_state(SessionState::Running, "ChangeWindowSize")?;
                (switch.winsize)(m, raw, self)
            }
            Type::SuspendEvent(m) => {
                self.require_state(SessionState::Running, "CommandSuspend")?;
                (switch.suspend)(m, raw, self)
            }
        }
    }

    fn dispatch_iobuf(
        &mut self,
        stream: IoStream,
        buf: &crate::protocol::IoBuffer,
        raw: &[u8],
    ) -> Result<()> {
        self.require_state(SessionState::Running, "IoBuffer")?;
        let switch = store::switch_for(self.sink);
        (switch.iobuf)(stream, buf, raw, self)
    }

    fn require_state(&mut self, expected: SessionState, what: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            self.state_error(what)
        }
    }

    fn state_error(&mut self, what: &str) -> Result<()> {
        self.errstr = Some(Cow::Borrowed("state machine error"));
        Err(AppError::Protocol(format!(
            "unexpected {what} in state {:?}",
            self.state
        )))
    }

    /// Whether a session has been opened on this connection.
    #[must_use]
    pub fn started(&self) -> bool {
        self.state != SessionState::Initial
    }

    /// Whether the session has been closed by an exit or reject.
    #[must_use]
    pub fn exited(&self) -> bool {
        self.state == SessionState::Exited
    }

    /// Queue a log-id response telling the client how to restart this
    /// session later.
    pub(crate) fn send_log_id(&mut self, log_id: String) {
        self.send(ServerMessage {
            r#type: Some(server_message::Type::LogId(log_id)),
        });
    }

    /// Queue a commit-point acknowledgement carrying the current elapsed
    /// time.
    pub fn send_commit_point(&mut self) {
        let point = TimeSpec::new(self.elapsed_time.secs, self.elapsed_time.nsecs);
        self.send(ServerMessage {
            r#type: Some(server_message::Type::CommitPoint(point)),
        });
    }

    pub(crate) fn send(&mut self, msg: ServerMessage) {
        if self.outbound.send(msg).is_err() {
            debug!("outbound queue closed; dropping server message");
        }
    }
}

impl Drop for ConnectionClosure {
    fn drop(&mut self) {
        if let Some(journal) = &self.journal {
            if !self.exited() {
                // The file stays under incoming/ for a recovery pass.
                debug!(
                    path = %journal.path().display(),
                    "connection closed mid-session; retaining incoming journal"
                );
            }
        }
    }
}
