//! Audit log line format, escaping, locking and failure reporting.

use std::sync::Arc;

use classcloud::audit::{AuditError, AuditLog, REJECTION_TAG};
use classcloud::identity::RealIdentity;

fn temp_log() -> (tempfile::TempDir, AuditLog) {
    let dir = tempfile::tempdir().expect("temp dir");
    let log = AuditLog::new(dir.path().join("audit.log"));
    (dir, log)
}

fn read_lines(log: &AuditLog) -> Vec<String> {
    std::fs::read_to_string(log.path())
        .expect("audit log readable")
        .lines()
        .map(str::to_owned)
        .collect()
}

#[test]
fn entry_is_stamped_with_real_identity() {
    let (_dir, log) = temp_log();
    let actor = RealIdentity::from_process();
    log.record(&actor, "Creating user u1").expect("record");

    let lines = read_lines(&log);
    assert_eq!(lines.len(), 1);
    let fields: Vec<&str> = lines[0].splitn(3, ": ").collect();
    assert_eq!(fields.len(), 3);
    assert!(chrono::DateTime::parse_from_rfc3339(fields[0]).is_ok());
    assert_eq!(fields[1], actor.name());
    assert_eq!(fields[2], "Creating user u1");
}

#[test]
fn multi_line_message_stays_on_one_line() {
    let (_dir, log) = temp_log();
    let actor = RealIdentity::from_process();
    log.record(&actor, "line one\nline two").expect("record");
    log.record(&actor, "after").expect("record");

    let lines = read_lines(&log);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("line one\\nline two"));
}

#[test]
fn rejection_entries_are_tagged() {
    let (_dir, log) = temp_log();
    let actor = RealIdentity::from_process();
    log.record_rejection(&actor, "launch for u1: over budget")
        .expect("record");

    let lines = read_lines(&log);
    assert!(lines[0].contains(&format!("{REJECTION_TAG}: launch for u1")));
}

#[test]
fn concurrent_writers_never_interleave() {
    let (_dir, log) = temp_log();
    let log = Arc::new(log);
    let handles: Vec<_> = (0..8)
        .map(|writer| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                let actor = RealIdentity::from_process();
                for n in 0..50 {
                    let message = format!("writer {writer} entry {n} {}", "x".repeat(200));
                    log.record(&actor, &message).expect("record");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let lines = read_lines(&log);
    assert_eq!(lines.len(), 400);
    assert!(lines
        .iter()
        .all(|line| line.contains("writer ") && line.ends_with(&"x".repeat(200))));
}

#[test]
fn unwritable_log_reports_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    // A directory cannot be opened for appending.
    let log = AuditLog::new(dir.path());
    let result = log.record(&RealIdentity::from_process(), "anything");
    assert!(matches!(result, Err(AuditError::Io { .. })));
}
