//! Unit tests for the I/O-log store: directory trees, stream files,
//! timing records, and session sealing.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use audit_logd::config::IologConfig;
use audit_logd::eventlog::EventLogRecord;
use audit_logd::iolog::{self, IoStream, IologFiles};
use audit_logd::protocol::{info_message, InfoMessage, TimeSpec};

fn test_config(root: &std::path::Path) -> IologConfig {
    IologConfig {
        dir: root.to_owned(),
        ..IologConfig::default()
    }
}

fn session_evlog() -> EventLogRecord {
    let info = [
        InfoMessage {
            key: "user".to_owned(),
            value: Some(info_message::Value::Strval("alice".to_owned())),
        },
        InfoMessage {
            key: "host".to_owned(),
            value: Some(info_message::Value::Strval("buildbox".to_owned())),
        },
    ];
    EventLogRecord::from_info(Some(&TimeSpec::new(1_700_000_000, 0)), &info).expect("evlog")
}

// ── Session tree creation ───────────────────────────────────────────────────

/// The session directory lands under `<root>/<user>/<host>/` with the
/// `log` and `timing` files in place and the relative path recorded.
#[test]
fn init_session_builds_tree() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let mut evlog = session_evlog();
    let mut files = IologFiles::default();

    let dir = iolog::init_session(&config, &mut evlog, &mut files).expect("init session");

    assert!(dir.starts_with(temp.path().join("alice").join("buildbox")));
    assert!(dir.join("log").is_file(), "log file must exist");
    assert!(dir.join("timing").is_file(), "timing file must exist");
    assert!(files.timing().enabled(), "timing slot must be enabled");

    let rel = evlog.iolog_path.as_deref().expect("iolog_path recorded");
    assert_eq!(temp.path().join(rel), dir);

    // The timing file stays writable until the session is sealed.
    let mode = fs::metadata(dir.join("timing"))
        .expect("stat timing")
        .permissions()
        .mode();
    assert_ne!(mode & 0o200, 0, "owner write bit must be set before exit");
}

/// Session names never collide even for identical user/host pairs.
#[test]
fn init_session_names_are_unique() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());

    let mut first_evlog = session_evlog();
    let mut first_files = IologFiles::default();
    let first = iolog::init_session(&config, &mut first_evlog, &mut first_files).expect("first");

    let mut second_evlog = session_evlog();
    let mut second_files = IologFiles::default();
    let second =
        iolog::init_session(&config, &mut second_evlog, &mut second_files).expect("second");

    assert_ne!(first, second);
}

/// Hostile user/host metadata cannot steer the session directory out of
/// the configured root.
#[test]
fn init_session_neutralizes_hostile_names() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let info = [
        InfoMessage {
            key: "user".to_owned(),
            value: Some(info_message::Value::Strval("../../etc".to_owned())),
        },
        InfoMessage {
            key: "host".to_owned(),
            value: Some(info_message::Value::Strval("a/b".to_owned())),
        },
    ];
    let mut evlog = EventLogRecord::from_info(None, &info).expect("evlog");
    let mut files = IologFiles::default();

    let dir = iolog::init_session(&config, &mut evlog, &mut files).expect("init session");
    assert!(
        dir.starts_with(temp.path()),
        "session directory must stay under the I/O-log root: {}",
        dir.display()
    );
}

// ── Stream writes ───────────────────────────────────────────────────────────

/// Payloads accumulate in the stream file and timing records in the
/// timing file, in write order.
#[test]
fn payload_and_timing_writes_accumulate() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let mut evlog = session_evlog();
    let mut files = IologFiles::default();
    let dir = iolog::init_session(&config, &mut evlog, &mut files).expect("init session");

    iolog::create_stream(&dir, IoStream::TtyOut, &mut files, &config).expect("create stream");
    iolog::write_payload(&mut files, IoStream::TtyOut, b"hello\n").expect("payload 1");
    iolog::write_timing(
        &mut files,
        &iolog::fmt_timing_iobuf(IoStream::TtyOut, &TimeSpec::new(0, 500_000_000), 6),
    )
    .expect("timing 1");
    iolog::write_payload(&mut files, IoStream::TtyOut, b"world\n").expect("payload 2");
    iolog::write_timing(
        &mut files,
        &iolog::fmt_timing_iobuf(IoStream::TtyOut, &TimeSpec::new(1, 0), 6),
    )
    .expect("timing 2");

    assert_eq!(
        fs::read_to_string(dir.join("ttyout")).expect("read ttyout"),
        "hello\nworld\n"
    );
    assert_eq!(
        fs::read_to_string(dir.join("timing")).expect("read timing"),
        "1 0.500000000 6\n1 1.000000000 6\n"
    );
}

/// Writing to a stream that was never created is an error, not a silent
/// drop.
#[test]
fn write_to_unopened_stream_fails() {
    let mut files = IologFiles::default();
    assert!(iolog::write_payload(&mut files, IoStream::Stdin, b"x").is_err());
}

// ── Timing record formats ───────────────────────────────────────────────────

/// Stream, window-size, and suspend records follow the documented
/// grammar with nine-digit nanoseconds.
#[test]
fn timing_formats_match_grammar() {
    assert_eq!(
        iolog::fmt_timing_iobuf(IoStream::TtyIn, &TimeSpec::new(0, 1), 42),
        "0 0.000000001 42\n"
    );
    assert_eq!(
        iolog::fmt_timing_winsize(&TimeSpec::new(1, 0), 24, 80),
        "5 1.000000000 24 80\n"
    );
    assert_eq!(
        iolog::fmt_timing_suspend(&TimeSpec::new(2, 250_000_000), "TSTP").expect("suspend"),
        "6 2.250000000 TSTP\n"
    );
}

/// Suspend signal names are validated before they reach the timing file.
#[test]
fn bogus_suspend_signals_are_rejected() {
    let delay = TimeSpec::new(0, 0);
    assert!(iolog::fmt_timing_suspend(&delay, "").is_err());
    assert!(iolog::fmt_timing_suspend(&delay, "T STP").is_err());
    assert!(iolog::fmt_timing_suspend(&delay, &"X".repeat(64)).is_err());
}

// ── Sealing ─────────────────────────────────────────────────────────────────

/// Sealing clears every write bit on the timing file; stream files are
/// untouched.
#[test]
fn seal_clears_timing_write_bits() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let mut evlog = session_evlog();
    let mut files = IologFiles::default();
    let dir = iolog::init_session(&config, &mut evlog, &mut files).expect("init session");

    iolog::seal(&dir, &mut files, config.mode).expect("seal");

    let mode = fs::metadata(dir.join("timing"))
        .expect("stat timing")
        .permissions()
        .mode();
    assert_eq!(mode & 0o222, 0, "no write bits may remain after sealing");
}
