//! Crate-wide error taxonomy.
//!
//! Component-level errors ([`AuditError`], [`PrivilegeError`],
//! [`ProviderError`]) convert into [`Error`] so callers of the orchestration
//! layer match on a single enum. Every rejection carries the specific reason.

use std::time::Duration;

use crate::audit::AuditError;
use crate::privilege::PrivilegeError;
use crate::provider::ProviderError;

/// Result alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the identity, credential and spend-governance core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identity with this name is already recorded.
    #[error("identity already exists: {0}")]
    DuplicateIdentity(String),

    /// The identity has not been provisioned.
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    /// An SSH key with this name already exists (for any identity).
    #[error("ssh key already exists: {0}")]
    DuplicateSshKey(String),

    /// The identity holds no SSH key with this name.
    #[error("unknown ssh key: {0}")]
    UnknownSshKey(String),

    /// A key or identity name does not fit the naming grammar.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// A credential or resource does not belong to the acting identity.
    #[error("credential {credential:?} does not belong to identity {identity:?}")]
    IdentityMismatch {
        /// Identity performing the action.
        identity: String,
        /// Credential name that failed the ownership check.
        credential: String,
    },

    /// The request would push the identity past the spend ceiling.
    #[error(
        "spend ceiling exceeded for {identity}: committed {current:.2} + requested {proposed:.2} > limit {limit:.2}"
    )]
    OverBudget {
        /// Identity whose budget was checked.
        identity: String,
        /// Cost already committed by running and pending resources.
        current: f64,
        /// Cost of the rejected request.
        proposed: f64,
        /// Configured ceiling.
        limit: f64,
    },

    /// The resource class has no entry in the unit cost table.
    #[error("unknown resource class: {0}")]
    UnknownResourceClass(String),

    /// The request is malformed (zero count, empty image, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The audit log could not be written; the triggering mutation is aborted.
    #[error("audit log unavailable: {0}")]
    AuditUnavailable(#[from] AuditError),

    /// A filesystem operation performed on behalf of the caller failed.
    #[error("filesystem error: {0}")]
    Filesystem(#[from] PrivilegeError),

    /// The remote identity or resource provider failed.
    #[error("remote provider error: {0}")]
    RemoteProvider(#[from] ProviderError),

    /// Spot requests were still unresolved when the deadline elapsed.
    #[error("{unresolved} spot request(s) unresolved after {waited:?}")]
    LaunchTimeout {
        /// Number of requests without a running instance.
        unresolved: usize,
        /// Time spent polling.
        waited: Duration,
    },

    /// Local durable store failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// Whether this error is a policy rejection (as opposed to an
    /// infrastructure failure).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::DuplicateIdentity(_)
                | Self::DuplicateSshKey(_)
                | Self::IdentityMismatch { .. }
                | Self::OverBudget { .. }
                | Self::UnknownResourceClass(_)
                | Self::InvalidName(_)
                | Self::InvalidRequest(_)
        )
    }
}
