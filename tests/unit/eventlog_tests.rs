//! Unit tests for event-log records and the JSONL writer.

use std::fs;
use std::path::Path;

use chrono::Utc;

use audit_logd::eventlog::{EventLogRecord, EventLogger, JsonlEventWriter, SessionExit};
use audit_logd::protocol::{info_message, InfoMessage, TimeSpec};
use audit_logd::AppError;

fn info_str(key: &str, value: &str) -> InfoMessage {
    InfoMessage {
        key: key.to_owned(),
        value: Some(info_message::Value::Strval(value.to_owned())),
    }
}

fn info_num(key: &str, value: i64) -> InfoMessage {
    InfoMessage {
        key: key.to_owned(),
        value: Some(info_message::Value::Numval(value)),
    }
}

fn info_list(key: &str, values: &[&str]) -> InfoMessage {
    InfoMessage {
        key: key.to_owned(),
        value: Some(info_message::Value::Strlistval(info_message::StringList {
            strings: values.iter().map(|s| (*s).to_owned()).collect(),
        })),
    }
}

fn read_only_jsonl_file(dir: &Path) -> String {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .expect("read_dir")
        .map(|e| e.expect("dir entry").path())
        .collect();
    assert_eq!(entries.len(), 1, "exactly one event log file expected");
    fs::read_to_string(entries.pop().expect("one entry")).expect("read event log")
}

// ── Metadata parsing ────────────────────────────────────────────────────────

/// All three metadata variants parse, and string lists keep their order.
#[test]
fn metadata_variants_parse() {
    let record = EventLogRecord::from_info(
        Some(&TimeSpec::new(1_700_000_000, 0)),
        &[
            info_str("user", "alice"),
            info_num("lines", 24),
            info_list("argv", &["/bin/ls", "-l", "/etc"]),
        ],
    )
    .expect("metadata must parse");

    assert!(record.submit_time.is_some());
    assert_eq!(record.info["user"], "alice");
    assert_eq!(record.info["lines"], 24);
    let argv: Vec<_> = record.info["argv"]
        .as_array()
        .expect("argv must be an array")
        .iter()
        .map(|v| v.as_str().expect("argv entries are strings"))
        .collect();
    assert_eq!(argv, ["/bin/ls", "-l", "/etc"]);
}

/// Metadata keys keep their submission order in the parsed record.
#[test]
fn metadata_preserves_key_order() {
    let record = EventLogRecord::from_info(
        None,
        &[
            info_str("zebra", "1"),
            info_str("apple", "2"),
            info_str("mango", "3"),
        ],
    )
    .expect("metadata must parse");

    let keys: Vec<_> = record.info.keys().cloned().collect();
    assert_eq!(keys, ["zebra", "apple", "mango"]);
}

/// A metadata entry with no value variant is a protocol violation.
#[test]
fn unknown_metadata_variant_is_rejected() {
    let bad = InfoMessage {
        key: "mystery".to_owned(),
        value: None,
    };
    let err = EventLogRecord::from_info(None, &[bad]).expect_err("must reject");
    assert!(matches!(err, AppError::Protocol(_)), "got: {err:?}");
}

// ── JSONL writer ────────────────────────────────────────────────────────────

/// An accept event is written as one JSON line carrying the submit time
/// and metadata.
#[test]
fn accept_event_written_to_jsonl() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = JsonlEventWriter::new(temp.path().to_owned()).expect("writer");

    let record = EventLogRecord::from_info(
        Some(&TimeSpec::new(1_700_000_000, 0)),
        &[info_str("user", "alice")],
    )
    .expect("record");
    writer.accept(&record).expect("accept event");

    let jsonl = read_only_jsonl_file(temp.path());
    let parsed: serde_json::Value =
        serde_json::from_str(jsonl.lines().next().expect("one line")).expect("valid JSON");
    assert_eq!(parsed["event"], "accept");
    assert_eq!(parsed["info"]["user"], "alice");
    assert!(
        parsed["submit_time"].is_string(),
        "submit_time must be serialized"
    );
}

/// Reject events carry the policy's reason.
#[test]
fn reject_event_includes_reason() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = JsonlEventWriter::new(temp.path().to_owned()).expect("writer");

    let record = EventLogRecord::from_info(None, &[info_str("user", "mallory")]).expect("record");
    writer
        .reject(&record, "not in sudoers")
        .expect("reject event");

    let jsonl = read_only_jsonl_file(temp.path());
    assert!(jsonl.contains("\"reject\""));
    assert!(jsonl.contains("not in sudoers"));
}

/// Alert events carry the alert time and reason even without metadata.
#[test]
fn alert_event_written_without_record() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = JsonlEventWriter::new(temp.path().to_owned()).expect("writer");

    writer
        .alert(None, Utc::now(), "command denied by policy")
        .expect("alert event");

    let jsonl = read_only_jsonl_file(temp.path());
    assert!(jsonl.contains("\"alert\""));
    assert!(jsonl.contains("command denied by policy"));
}

/// Exit events record the signal name and core-dump flag.
#[test]
fn exit_event_records_signal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = JsonlEventWriter::new(temp.path().to_owned()).expect("writer");

    let status = SessionExit {
        exit_value: 0,
        signal: Some("SEGV".to_owned()),
        dumped_core: true,
    };
    writer.exit(None, &status).expect("exit event");

    let jsonl = read_only_jsonl_file(temp.path());
    let parsed: serde_json::Value =
        serde_json::from_str(jsonl.lines().next().expect("one line")).expect("valid JSON");
    assert_eq!(parsed["event"], "exit");
    assert_eq!(parsed["signal"], "SEGV");
    assert_eq!(parsed["dumped_core"], true);
}
