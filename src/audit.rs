//! Append-only audit trail for privileged actions.
//!
//! Every entry is one line: `<RFC 3339 timestamp>: <real identity>: <message>`.
//! Embedded newlines are escaped so an entry never spans lines. Writers take
//! an exclusive `flock` on the file for the duration of a single append, so
//! concurrent processes never interleave partial lines.
//!
//! Secrets are never passed to the audit log; callers record key ids only.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use nix::fcntl::{Flock, FlockArg};

use crate::identity::RealIdentity;

/// Marker inserted after the actor on entries recording a refused request.
pub const REJECTION_TAG: &str = "REJECTED";

/// The audit log could not be opened, locked or written.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Opening or writing the log file failed.
    #[error("cannot write audit log {path}: {source}")]
    Io {
        /// Log file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The exclusive advisory lock could not be taken.
    #[error("cannot lock audit log {path}: {errno}")]
    Lock {
        /// Log file path.
        path: PathBuf,
        /// Error number from `flock`.
        errno: nix::errno::Errno,
    },
}

/// Shared, lock-protected audit log file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Audit log appending to `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry stamped with the real invoking identity.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] if the file cannot be opened, locked, or
    /// written. Callers performing privileged mutations must abort on error.
    pub fn record(&self, actor: &RealIdentity, message: &str) -> Result<(), AuditError> {
        self.append(actor, message)
    }

    /// Append an entry for a refused request, tagged with [`REJECTION_TAG`].
    ///
    /// # Errors
    ///
    /// Same as [`AuditLog::record`].
    pub fn record_rejection(&self, actor: &RealIdentity, message: &str) -> Result<(), AuditError> {
        self.append(actor, &format!("{REJECTION_TAG}: {message}"))
    }

    fn append(&self, actor: &RealIdentity, message: &str) -> Result<(), AuditError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| AuditError::Io {
                path: self.path.clone(),
                source,
            })?;

        let mut locked =
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| AuditError::Lock {
                path: self.path.clone(),
                errno,
            })?;

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let line = format_line(&timestamp, actor.name(), message);
        locked
            .write_all(line.as_bytes())
            .and_then(|()| locked.sync_data())
            .map_err(|source| AuditError::Io {
                path: self.path.clone(),
                source,
            })?;

        // The lock is released when `locked` drops.
        tracing::trace!(path = %self.path.display(), "audit entry appended");
        Ok(())
    }
}

/// Render a single audit line, including the trailing newline.
pub fn format_line(timestamp: &str, actor: &str, message: &str) -> String {
    format!("{timestamp}: {actor}: {}\n", escape_message(message))
}

/// Escape line breaks so the message occupies one line.
pub fn escape_message(message: &str) -> String {
    let mut escaped = String::with_capacity(message.len());
    for c in message.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}
