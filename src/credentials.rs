//! Root account credentials and secret handling.
//!
//! The root credentials live in a dotenv-format file readable only by the
//! service account. They authenticate the provider gateway client and are
//! never handed to an identity or written to any log.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Key of the root access key id in the credentials file.
pub const ROOT_ACCESS_KEY_ID: &str = "ROOT_ACCESS_KEY_ID";
/// Key of the root secret in the credentials file.
pub const ROOT_SECRET_ACCESS_KEY: &str = "ROOT_SECRET_ACCESS_KEY";

/// Errors loading the root credentials file.
#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    /// The file is missing or unreadable.
    #[error("cannot read credentials file {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is readable by group or others.
    #[error("credentials file {path} must be 0600, found {mode:o}")]
    Permissions {
        /// File path.
        path: PathBuf,
        /// Observed permission bits.
        mode: u32,
    },
    /// A line is not valid dotenv syntax.
    #[error("cannot parse credentials file {path}: {message}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },
    /// A required key is absent or empty.
    #[error("missing required credential: {0}")]
    Missing(&'static str),
}

/// A secret string whose `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw secret, for sending to the remote provider or the owner.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Root access key pair.
#[derive(Debug, Clone)]
pub struct RootCredentials {
    /// Public key id.
    pub access_key_id: String,
    /// Secret key.
    pub secret_access_key: Secret,
}

/// Load root credentials from a dotenv-format file.
///
/// # Errors
///
/// Returns [`CredentialsError`] if the file is missing, has permissions
/// broader than 0600, fails to parse, or lacks either key.
pub fn load_root_credentials(path: &Path) -> Result<RootCredentials, CredentialsError> {
    validate_private_permissions(path)?;

    let iter = dotenvy::from_path_iter(path).map_err(|e| parse_error(path, &e))?;
    let mut vars = BTreeMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| parse_error(path, &e))?;
        vars.insert(key, value);
    }

    let mut take = |key: &'static str| {
        vars.remove(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or(CredentialsError::Missing(key))
    };
    let access_key_id = take(ROOT_ACCESS_KEY_ID)?;
    let secret_access_key = Secret::new(take(ROOT_SECRET_ACCESS_KEY)?);

    tracing::debug!(path = %path.display(), key_id = %access_key_id, "loaded root credentials");
    Ok(RootCredentials {
        access_key_id,
        secret_access_key,
    })
}

fn parse_error(path: &Path, err: &dotenvy::Error) -> CredentialsError {
    CredentialsError::Parse {
        path: path.to_owned(),
        message: err.to_string(),
    }
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> Result<(), CredentialsError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path).map_err(|source| CredentialsError::Read {
        path: path.to_owned(),
        source,
    })?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(CredentialsError::Permissions {
            path: path.to_owned(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(path: &Path) -> Result<(), CredentialsError> {
    fs::metadata(path)
        .map(|_| ())
        .map_err(|source| CredentialsError::Read {
            path: path.to_owned(),
            source,
        })
}
