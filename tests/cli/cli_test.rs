//! CLI contract tests against an isolated config and ledger.

use std::sync::Arc;

use assert_cmd::Command;
use classcloud::accounts::{AccessKeyCredential, AccountStore};
use classcloud::audit::AuditLog;
use classcloud::credentials::Secret;
use classcloud::identity::RealIdentity;
use tempfile::TempDir;

fn classcloud(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("classcloud").expect("binary built");
    cmd.env("CLASSCLOUD_CONFIG_PATH", dir.path().join("missing.toml"))
        .env("CLASSCLOUD_ACCOUNTS_DB", dir.path().join("accounts.db"))
        .env("CLASSCLOUD_USAGE_DB", dir.path().join("usage.db"))
        .env("CLASSCLOUD_AUDIT_LOG", dir.path().join("audit.log"))
        .env("CLASSCLOUD_ROOT_CREDENTIALS", dir.path().join("root.env"))
        .env_remove("RUST_LOG")
        .env_remove("REAL_USERNAME");
    cmd
}

/// Root credentials the binary can load; nothing is ever sent with them.
#[cfg(unix)]
fn write_root_credentials(dir: &TempDir) {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("root.env");
    std::fs::write(
        &path,
        "ROOT_ACCESS_KEY_ID=ROOTKEY\nROOT_SECRET_ACCESS_KEY=root-secret\n",
    )
    .expect("write root credentials");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).expect("chmod");
}

/// Record the invoking user with one access key, as `init` would.
async fn seed_invoking_user(dir: &TempDir, key: Option<AccessKeyCredential>) -> String {
    let me = RealIdentity::from_process();
    let store = AccountStore::open(
        &dir.path().join("accounts.db"),
        Arc::new(AuditLog::new(dir.path().join("audit.log"))),
        me.clone(),
    )
    .await
    .expect("open store");
    store.create_identity(me.name(), None).await.expect("create");
    if let Some(key) = key {
        store.add_access_key(me.name(), &key).await.expect("add key");
    }
    me.name().to_owned()
}

#[test]
fn help_lists_subcommands() {
    let dir = tempfile::tempdir().expect("temp dir");
    let output = classcloud(&dir).arg("--help").output().expect("run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["init", "rotate", "env", "ssh-key", "launch", "wait-spot", "report"] {
        assert!(stdout.contains(command), "help is missing {command}");
    }
}

#[test]
fn offline_report_on_empty_ledger() {
    let dir = tempfile::tempdir().expect("temp dir");
    let output = classcloud(&dir)
        .args(["report", "--no-refresh"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("Usage report for "));
    assert!(stdout.contains("Finished instances:\n(none)\n"));
    assert!(stdout.contains("estimated total spending = $ 0.000"));
}

#[test]
fn aggregate_report_requires_staff() {
    let dir = tempfile::tempdir().expect("temp dir");
    let output = classcloud(&dir)
        .args(["report", "--all"])
        .output()
        .expect("run");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("restricted to staff"));

    let audit = std::fs::read_to_string(dir.path().join("audit.log")).expect("audit written");
    assert!(audit.contains("REJECTED: aggregate report requires staff"));
}

#[test]
fn missing_root_credentials_fail_cleanly() {
    let dir = tempfile::tempdir().expect("temp dir");
    let output = classcloud(&dir).arg("active").output().expect("run");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("root credentials"));
}

#[test]
fn malformed_launch_request_is_refused() {
    let dir = tempfile::tempdir().expect("temp dir");
    let output = classcloud(&dir)
        .arg("launch")
        .write_stdin("{ not json")
        .output()
        .expect("run");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("launch request"));
}

#[cfg(unix)]
#[tokio::test]
async fn env_exports_the_users_own_key() {
    let dir = tempfile::tempdir().expect("temp dir");
    write_root_credentials(&dir);
    seed_invoking_user(
        &dir,
        Some(AccessKeyCredential {
            access_key_id: "AKUSER".to_owned(),
            secret_access_key: Secret::new("user-secret"),
        }),
    )
    .await;

    let output = classcloud(&dir).arg("env").output().expect("run");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("export CLASSCLOUD_ACCESS_KEY_ID=AKUSER\n"));
    assert!(stdout.contains("export CLASSCLOUD_SECRET_ACCESS_KEY=user-secret\n"));
    assert!(stdout.contains("export CLASSCLOUD_PROVIDER_URL="));
    assert!(!stdout.contains("ROOTKEY"));
    assert!(!stdout.contains("root-secret"));
}

#[cfg(unix)]
#[tokio::test]
async fn env_without_a_key_points_at_init() {
    let dir = tempfile::tempdir().expect("temp dir");
    write_root_credentials(&dir);
    let me = seed_invoking_user(&dir, None).await;

    let output = classcloud(&dir).arg("env").output().expect("run");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(&format!("no access key for {me}")));
    assert!(stderr.contains("classcloud init"));
    assert!(output.stdout.is_empty());
}
