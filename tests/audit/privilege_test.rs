//! Owned-file creation semantics.

use std::io::Write;

use classcloud::privilege::PrivilegeBroker;

#[test]
fn exclusive_create_leaves_existing_file_untouched() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("config");
    std::fs::write(&path, "original").expect("seed file");

    let broker = PrivilegeBroker::new();
    let handle = broker.write_owned_file(&path, false).expect("no os error");
    assert!(handle.is_none());
    assert_eq!(std::fs::read_to_string(&path).expect("read"), "original");
}

#[test]
fn exclusive_create_writes_new_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("fresh");

    let mut file = PrivilegeBroker::new()
        .write_owned_file(&path, false)
        .expect("no os error")
        .expect("file created");
    file.write_all(b"hello").expect("write");
    drop(file);
    assert_eq!(std::fs::read_to_string(&path).expect("read"), "hello");
}

#[test]
fn overwrite_truncates() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("key.pem");
    std::fs::write(&path, "a much longer previous key").expect("seed file");

    let mut file = PrivilegeBroker::new()
        .write_owned_file(&path, true)
        .expect("no os error")
        .expect("file opened");
    file.write_all(b"new").expect("write");
    drop(file);
    assert_eq!(std::fs::read_to_string(&path).expect("read"), "new");
}

#[cfg(unix)]
#[test]
fn new_files_are_private() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("secret");
    let file = PrivilegeBroker::new()
        .write_owned_file(&path, true)
        .expect("no os error");
    assert!(file.is_some());
    let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
    assert_eq!(mode & 0o077, 0);
}

#[test]
fn ensure_dir_accepts_existing_directory() {
    let dir = tempfile::tempdir().expect("temp dir");
    let target = dir.path().join("keys");
    let broker = PrivilegeBroker::new();
    assert!(broker.ensure_owned_dir(&target).is_ok());
    assert!(broker.ensure_owned_dir(&target).is_ok());
    assert!(target.is_dir());
}

#[test]
fn ensure_dir_reports_missing_parent() {
    let dir = tempfile::tempdir().expect("temp dir");
    let target = dir.path().join("missing").join("keys");
    assert!(PrivilegeBroker::new().ensure_owned_dir(&target).is_err());
}
