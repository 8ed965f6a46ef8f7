//! End-to-end restarts of local I/O-log sessions.

use std::fs;
use std::io::Read;

use flate2::read::GzDecoder;

use audit_logd::config::SinkKind;
use audit_logd::elapsed::ElapsedTime;

use super::common::{accept, exit, info_str, restart, ttyout_buf, TestReceiver};

/// Run a session up to two ttyout chunks without an exit and return its
/// log id, simulating a dropped connection.
fn interrupted_session(rx: &mut TestReceiver) -> String {
    let (m, raw) = accept(true, vec![info_str("user", "alice")]);
    rx.feed(&m, &raw);
    let log_id = rx.take_log_id().expect("log id");

    let (m, raw) = ttyout_buf(0, 500_000_000, b"hello\n");
    rx.feed(&m, &raw);
    let (m, raw) = ttyout_buf(1, 0, b"world\n");
    rx.feed(&m, &raw);
    log_id
}

// ── Completed sessions ──────────────────────────────────────────────────────

/// Restarting a session whose exit already sealed the timing file is
/// refused with the canonical error string.
#[test]
fn completed_session_cannot_be_restarted() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut rx = TestReceiver::new(temp.path(), SinkKind::Local, false);
    let log_id = interrupted_session(&mut rx);
    let (m, raw) = exit(0);
    rx.feed(&m, &raw);

    let mut rx = rx.reconnect();
    let (m, raw) = restart(&log_id, 1, 500_000_000);
    assert!(rx.closure.dispatch(&m, &raw).is_err());
    assert_eq!(
        rx.closure.errstr.as_deref(),
        Some("log is already complete, cannot be restarted")
    );
}

/// Restarting a session that never existed is refused.
#[test]
fn missing_session_cannot_be_restarted() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut rx = TestReceiver::new(temp.path(), SinkKind::Local, false);

    let (m, raw) = restart("alice/nosuch/XXXXXX", 0, 1);
    assert!(rx.closure.dispatch(&m, &raw).is_err());
    assert_eq!(rx.closure.errstr.as_deref(), Some("unable to restart log"));
}

// ── Plain-stream restart ────────────────────────────────────────────────────

/// A reconnecting client resumes a plain-stream session at its resume
/// point; the retransmitted tail overwrites the abandoned one and the
/// exit seals the session as usual.
#[test]
fn plain_session_restart_resumes_and_completes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut rx = TestReceiver::new(temp.path(), SinkKind::Local, false);
    let log_id = interrupted_session(&mut rx);

    // Connection drops before exit; handles close with the closure.
    drop(rx.closure);

    let mut rx = TestReceiver::new(temp.path(), SinkKind::Local, false);
    let (m, raw) = restart(&log_id, 0, 500_000_000);
    rx.feed(&m, &raw);
    assert_eq!(rx.closure.elapsed_time, ElapsedTime::new(0, 500_000_000));
    assert!(rx.closure.log_io, "restart reopens the I/O log");

    let (m, raw) = ttyout_buf(2, 0, b"again\n");
    rx.feed(&m, &raw);
    assert_eq!(rx.closure.elapsed_time, ElapsedTime::new(2, 500_000_000));
    let (m, raw) = exit(0);
    rx.feed(&m, &raw);

    let session_dir = rx.iolog_dir().join(&log_id);
    assert_eq!(
        fs::read_to_string(session_dir.join("ttyout")).expect("read ttyout"),
        "hello\nagain\n"
    );
    assert_eq!(
        fs::read_to_string(session_dir.join("timing")).expect("read timing"),
        "1 0.500000000 6\n1 2.000000000 6\n"
    );
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(session_dir.join("timing"))
        .expect("stat timing")
        .permissions()
        .mode();
    assert_eq!(mode & 0o222, 0, "the restarted session seals on exit");
}

// ── Compressed-stream restart ───────────────────────────────────────────────

/// With compressed streams the restart regenerates the file set up to
/// the resume point instead of seeking.
#[test]
fn compressed_session_restart_rewrites_streams() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut rx = TestReceiver::new(temp.path(), SinkKind::Local, true);
    let log_id = interrupted_session(&mut rx);

    drop(rx.closure);

    let mut rx = TestReceiver::new(temp.path(), SinkKind::Local, true);
    let (m, raw) = restart(&log_id, 0, 500_000_000);
    rx.feed(&m, &raw);
    assert_eq!(rx.closure.elapsed_time, ElapsedTime::new(0, 500_000_000));

    let (m, raw) = ttyout_buf(2, 0, b"again\n");
    rx.feed(&m, &raw);
    let (m, raw) = exit(0);
    rx.feed(&m, &raw);
    drop(rx.closure);

    let session_dir = rx.config.iolog.dir.join(&log_id);
    let mut decoded = String::new();
    GzDecoder::new(fs::File::open(session_dir.join("ttyout")).expect("open ttyout"))
        .read_to_string(&mut decoded)
        .expect("gunzip ttyout");
    assert_eq!(decoded, "hello\nagain\n");
    assert_eq!(
        fs::read_to_string(session_dir.join("timing")).expect("read timing"),
        "1 0.500000000 6\n1 2.000000000 6\n"
    );
}
