//! The verified real identity of the invoking user.
//!
//! A [`RealIdentity`] can only be obtained from the process credentials or
//! from the variable exported by the setuid launcher, never from a name the
//! caller types. Audit lines are stamped with it.

use std::fmt;
use std::path::PathBuf;

use nix::unistd::{getuid, User};

/// Environment variable set by the setuid launcher to the name it resolved
/// from the real uid before exec.
pub const WRAPPER_ENV_VAR: &str = "REAL_USERNAME";

/// Longest name the launcher will export.
const MAX_WRAPPER_NAME_LEN: usize = 20;

/// Errors resolving the real identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The launcher variable is missing.
    #[error("{WRAPPER_ENV_VAR} is not set")]
    Missing,
    /// The launcher variable holds something that is not a username.
    #[error("invalid launcher identity: {0:?}")]
    Invalid(String),
}

/// The real (not effective) user on whose behalf the process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealIdentity {
    name: String,
}

impl RealIdentity {
    /// Resolve the real uid of this process through the passwd database.
    ///
    /// Falls back to `uid:<n>` when the uid has no passwd entry.
    pub fn from_process() -> Self {
        let uid = getuid();
        let name = match User::from_uid(uid) {
            Ok(Some(user)) => user.name,
            _ => format!("uid:{uid}"),
        };
        Self { name }
    }

    /// Read the identity exported by the setuid launcher.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] when the variable is absent or malformed.
    pub fn from_wrapper_env() -> Result<Self, IdentityError> {
        let value = std::env::var(WRAPPER_ENV_VAR).map_err(|_| IdentityError::Missing)?;
        parse_wrapper_value(&value)
    }

    /// Resolve the identity, preferring the launcher variable when trusted.
    pub fn resolve(trust_wrapper_env: bool) -> Self {
        if trust_wrapper_env {
            match Self::from_wrapper_env() {
                Ok(identity) => return identity,
                Err(err) => {
                    tracing::debug!(error = %err, "launcher identity unavailable, using process uid");
                }
            }
        }
        Self::from_process()
    }

    /// The username.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Home directory from the passwd database, if the user has an entry.
    pub fn home_dir(&self) -> Option<PathBuf> {
        match User::from_name(&self.name) {
            Ok(Some(user)) => Some(user.dir),
            _ => None,
        }
    }
}

impl fmt::Display for RealIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn parse_wrapper_value(value: &str) -> Result<RealIdentity, IdentityError> {
    let valid = !value.is_empty()
        && value.len() <= MAX_WRAPPER_NAME_LEN
        && value != "unset"
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid {
        return Err(IdentityError::Invalid(value.to_owned()));
    }
    Ok(RealIdentity {
        name: value.to_owned(),
    })
}
