//! Unit tests for the dispatch switch: exactly one handler per variant,
//! sink binding, and session-ordering enforcement.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use prost::Message;
use tokio::sync::mpsc;

use audit_logd::config::{GlobalConfig, SinkKind};
use audit_logd::connection::ConnectionClosure;
use audit_logd::eventlog::{EventLogRecord, EventLogger, SessionExit};
use audit_logd::protocol::{client_message, server_message, AcceptMessage, AlertMessage,
    ClientMessage, ExitMessage, IoBuffer, RejectMessage, ServerMessage, TimeSpec};
use audit_logd::Result;

/// Event-log backend that counts calls per event kind.
#[derive(Default)]
struct CountingLogger {
    accepts: AtomicUsize,
    rejects: AtomicUsize,
    alerts: AtomicUsize,
    exits: AtomicUsize,
}

impl EventLogger for CountingLogger {
    fn accept(&self, _evlog: &EventLogRecord) -> Result<()> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reject(&self, _evlog: &EventLogRecord, _reason: &str) -> Result<()> {
        self.rejects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn alert(
        &self,
        _evlog: Option<&EventLogRecord>,
        _alert_time: DateTime<Utc>,
        _reason: &str,
    ) -> Result<()> {
        self.alerts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn exit(&self, _evlog: Option<&EventLogRecord>, _status: &SessionExit) -> Result<()> {
        self.exits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    closure: ConnectionClosure,
    logger: Arc<CountingLogger>,
    outbound: mpsc::UnboundedReceiver<ServerMessage>,
    _temp: tempfile::TempDir,
}

fn harness(sink: SinkKind) -> Harness {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = GlobalConfig::default();
    config.sink = sink;
    config.relay.dir = temp.path().join("relay");
    config.iolog.dir = temp.path().join("io");
    config.eventlog.dir = temp.path().join("events");

    let logger = Arc::new(CountingLogger::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let closure = ConnectionClosure::new(
        Arc::new(config),
        Arc::clone(&logger) as Arc<dyn EventLogger>,
        tx,
    );
    Harness {
        closure,
        logger,
        outbound: rx,
        _temp: temp,
    }
}

fn msg(ty: client_message::Type) -> (ClientMessage, Vec<u8>) {
    let msg = ClientMessage { r#type: Some(ty) };
    let raw = msg.encode_to_vec();
    (msg, raw)
}

fn accept(expect_iobufs: bool) -> (ClientMessage, Vec<u8>) {
    msg(client_message::Type::AcceptMsg(AcceptMessage {
        submit_time: Some(TimeSpec::new(1_700_000_000, 0)),
        info_msgs: Vec::new(),
        expect_iobufs,
    }))
}

// ── Exclusivity ─────────────────────────────────────────────────────────────

/// Each variant reaches only its own slot: an accept never touches the
/// reject/alert/exit handlers and vice versa.
#[test]
fn each_variant_hits_exactly_one_handler() {
    let mut h = harness(SinkKind::Local);

    let (m, raw) = accept(false);
    h.closure.dispatch(&m, &raw).expect("accept dispatch");
    assert_eq!(h.logger.accepts.load(Ordering::SeqCst), 1);
    assert_eq!(h.logger.rejects.load(Ordering::SeqCst), 0);
    assert_eq!(h.logger.alerts.load(Ordering::SeqCst), 0);
    assert_eq!(h.logger.exits.load(Ordering::SeqCst), 0);

    let (m, raw) = msg(client_message::Type::AlertMsg(AlertMessage {
        alert_time: Some(TimeSpec::new(1_700_000_100, 0)),
        reason: "suspicious".to_owned(),
        info_msgs: Vec::new(),
    }));
    h.closure.dispatch(&m, &raw).expect("alert dispatch");
    assert_eq!(h.logger.alerts.load(Ordering::SeqCst), 1);

    let (m, raw) = msg(client_message::Type::ExitMsg(ExitMessage::default()));
    h.closure.dispatch(&m, &raw).expect("exit dispatch");
    assert_eq!(h.logger.exits.load(Ordering::SeqCst), 1);
    assert_eq!(h.logger.accepts.load(Ordering::SeqCst), 1);
}

/// A rejected session logs exactly one reject event.
#[test]
fn reject_hits_reject_slot() {
    let mut h = harness(SinkKind::Local);
    let (m, raw) = msg(client_message::Type::RejectMsg(RejectMessage {
        submit_time: Some(TimeSpec::new(1_700_000_000, 0)),
        reason: "denied".to_owned(),
        info_msgs: Vec::new(),
    }));
    h.closure.dispatch(&m, &raw).expect("reject dispatch");
    assert_eq!(h.logger.rejects.load(Ordering::SeqCst), 1);
    assert_eq!(h.logger.accepts.load(Ordering::SeqCst), 0);
}

/// A message with no recognized variant never reaches any handler.
#[test]
fn unknown_variant_is_rejected_before_dispatch() {
    let mut h = harness(SinkKind::Local);
    let unknown = ClientMessage { r#type: None };
    let raw = unknown.encode_to_vec();
    assert!(h.closure.dispatch(&unknown, &raw).is_err());
    assert_eq!(h.logger.accepts.load(Ordering::SeqCst), 0);
}

// ── Sink binding ────────────────────────────────────────────────────────────

/// With the relay sink bound, an accept creates a journal and emits no
/// local events.
#[test]
fn relay_sink_routes_to_journal_table() {
    let mut h = harness(SinkKind::Relay);
    let (m, raw) = accept(false);
    h.closure.dispatch(&m, &raw).expect("accept dispatch");

    assert!(h.closure.journal.is_some(), "journal must be created");
    assert_eq!(
        h.logger.accepts.load(Ordering::SeqCst),
        0,
        "relay sink must not emit local events"
    );
}

/// With the local sink bound, an accept emits an event and creates no
/// journal.
#[test]
fn local_sink_routes_to_local_table() {
    let mut h = harness(SinkKind::Local);
    let (m, raw) = accept(false);
    h.closure.dispatch(&m, &raw).expect("accept dispatch");

    assert!(h.closure.journal.is_none(), "local sink must not journal");
    assert_eq!(h.logger.accepts.load(Ordering::SeqCst), 1);
}

// ── Session ordering ────────────────────────────────────────────────────────

/// An exit before any accept is a state machine error.
#[test]
fn exit_before_accept_is_rejected() {
    let mut h = harness(SinkKind::Local);
    let (m, raw) = msg(client_message::Type::ExitMsg(ExitMessage::default()));
    assert!(h.closure.dispatch(&m, &raw).is_err());
    assert_eq!(
        h.closure.errstr.as_deref(),
        Some("state machine error"),
        "errstr must name the ordering violation"
    );
    assert_eq!(h.logger.exits.load(Ordering::SeqCst), 0);
}

/// A second accept on the same connection is rejected.
#[test]
fn second_accept_is_rejected() {
    let mut h = harness(SinkKind::Local);
    let (m, raw) = accept(false);
    h.closure.dispatch(&m, &raw).expect("first accept");
    assert!(h.closure.dispatch(&m, &raw).is_err());
    assert_eq!(h.logger.accepts.load(Ordering::SeqCst), 1);
}

/// No messages are accepted after an exit.
#[test]
fn messages_after_exit_are_rejected() {
    let mut h = harness(SinkKind::Local);
    let (m, raw) = accept(false);
    h.closure.dispatch(&m, &raw).expect("accept");
    let (m, raw) = msg(client_message::Type::ExitMsg(ExitMessage::default()));
    h.closure.dispatch(&m, &raw).expect("exit");
    assert!(h.closure.exited());

    let (m, raw) = msg(client_message::Type::StdoutBuf(IoBuffer {
        delay: Some(TimeSpec::new(0, 1)),
        data: b"late".to_vec(),
    }));
    assert!(h.closure.dispatch(&m, &raw).is_err());
}

// ── Log-id response ─────────────────────────────────────────────────────────

/// Accepting a session that expects I/O buffers queues a log-id response
/// for the client.
#[test]
fn accept_with_iobufs_sends_log_id() {
    let mut h = harness(SinkKind::Local);
    let (m, raw) = accept(true);
    h.closure.dispatch(&m, &raw).expect("accept dispatch");

    let sent = h.outbound.try_recv().expect("a log-id response is queued");
    match sent.r#type {
        Some(server_message::Type::LogId(log_id)) => {
            assert!(!log_id.is_empty(), "log id must name the session");
        }
        other => panic!("expected log-id response, got: {other:?}"),
    }
}
