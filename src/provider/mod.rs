//! Remote collaborator contracts.
//!
//! The core never talks to the cloud directly. It depends on two traits:
//!
//! - [`IdentityProvider`]: users, policies, groups, login profiles, access keys
//! - [`ComputeProvider`]: key pairs, instances, spot requests
//!
//! Both remote APIs are eventually consistent. A resource created a moment
//! ago may be missing from a list call; such misses surface as
//! [`ProviderError::NotFound`] and count as transient where the caller polls.
//!
//! [`http::HttpCloudClient`] is the JSON gateway client used by the binary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::credentials::Secret;

pub mod http;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from a remote provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP transport failure.
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Throttling or a server-side fault; safe to retry.
    #[error("provider temporarily unavailable: {0}")]
    Transient(String),
    /// The named entity is not (yet) visible.
    #[error("not found: {0}")]
    NotFound(String),
    /// The provider refused the request.
    #[error("provider rejected request: {0}")]
    Rejected(String),
    /// Response did not match the expected schema.
    #[error("provider response parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::NotFound(_) => true,
            Self::Request(err) => err.is_timeout() || err.is_connect(),
            Self::Rejected(_) | Self::Parse(_) => false,
        }
    }
}

/// Collapse whitespace, redact credential-looking tokens, and truncate an
/// error body before it is logged or returned.
pub fn sanitize_error_body(raw: &str) -> String {
    const MAX_ERROR_BODY_CHARS: usize = 256;

    let mut sanitized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    for pattern in [
        r"AKIA[A-Z0-9]{12,}",
        r#"(?i)(secret[_a-z]*"?\s*[:=]\s*"?)[A-Za-z0-9/+=]{16,}"#,
        r"-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "${1}[REDACTED]").into_owned();
        }
    }

    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }
    sanitized
}

// ---------------------------------------------------------------------------
// Identity provider types
// ---------------------------------------------------------------------------

/// A freshly issued access key. The secret is only ever returned once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedAccessKey {
    /// Public key id.
    pub access_key_id: String,
    /// Secret key.
    #[serde(with = "secret_string")]
    pub secret_access_key: Secret,
}

// ---------------------------------------------------------------------------
// Compute provider types
// ---------------------------------------------------------------------------

/// A freshly created SSH key pair.
#[derive(Debug, Clone)]
pub struct CreatedKeyPair {
    /// Key pair name.
    pub key_name: String,
    /// Public key fingerprint.
    pub fingerprint: String,
    /// PEM-encoded private key.
    pub private_key: Secret,
}

/// Lifecycle state of a compute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Booting.
    Pending,
    /// Running and billable.
    Running,
    /// Shutting down towards `Stopped`.
    Stopping,
    /// Stopped; not billable until resumed.
    Stopped,
    /// Shutting down towards `Terminated`.
    ShuttingDown,
    /// Gone for good.
    Terminated,
}

impl InstanceState {
    /// Provider wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        }
    }
}

/// Live view of a remote instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInstance {
    /// Instance id.
    pub id: String,
    /// Resource class.
    pub instance_type: String,
    /// Key pair the instance was launched with; owner is derived from it.
    pub key_name: Option<String>,
    /// Current state.
    pub state: InstanceState,
    /// Launch time.
    pub launch_time: DateTime<Utc>,
    /// Spot request that produced the instance, if any.
    pub spot_request_id: Option<String>,
}

impl RemoteInstance {
    /// Whether the instance was launched from a spot request.
    pub fn is_spot(&self) -> bool {
        self.spot_request_id.is_some()
    }
}

/// State of a spot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotRequestState {
    /// Waiting for capacity.
    Open,
    /// Fulfilled; an instance is running for it.
    Active,
    /// Fulfilled instance has gone away.
    Closed,
    /// Cancelled before or after fulfillment.
    Cancelled,
    /// Could not be fulfilled.
    Failed,
}

/// Live view of a remote spot request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSpotRequest {
    /// Request id.
    pub id: String,
    /// Resource class requested.
    pub instance_type: String,
    /// Key pair in the launch specification.
    pub key_name: Option<String>,
    /// Current state.
    pub state: SpotRequestState,
    /// Submission time.
    pub create_time: DateTime<Utc>,
    /// Instance started for the request, once fulfilled.
    pub instance_id: Option<String>,
}

/// Parameters of a launch, shared by on-demand and spot requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Machine image.
    pub image_id: String,
    /// Resource class.
    pub instance_type: String,
    /// Number of instances.
    pub count: u32,
    /// Key pair name; must belong to the launching identity.
    pub key_name: String,
    /// Security groups to attach.
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Opaque boot payload. Never audited.
    #[serde(default)]
    pub user_data: Option<String>,
    /// Availability zone hint.
    #[serde(default)]
    pub placement: Option<String>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Remote identity-management API.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Create a user.
    async fn create_user(&self, user: &str) -> Result<(), ProviderError>;
    /// Delete a user that has no attached policies, groups, or keys.
    async fn delete_user(&self, user: &str) -> Result<(), ProviderError>;
    /// List all users.
    async fn list_users(&self) -> Result<Vec<String>, ProviderError>;

    /// Attach or replace an inline policy.
    async fn put_user_policy(
        &self,
        user: &str,
        policy_name: &str,
        document: &serde_json::Value,
    ) -> Result<(), ProviderError>;
    /// Names of a user's inline policies.
    async fn list_user_policies(&self, user: &str) -> Result<Vec<String>, ProviderError>;
    /// Remove an inline policy.
    async fn delete_user_policy(&self, user: &str, policy_name: &str)
        -> Result<(), ProviderError>;

    /// Add a user to a group.
    async fn add_user_to_group(&self, user: &str, group: &str) -> Result<(), ProviderError>;
    /// Groups a user belongs to.
    async fn list_groups_for_user(&self, user: &str) -> Result<Vec<String>, ProviderError>;
    /// Remove a user from a group.
    async fn remove_user_from_group(&self, user: &str, group: &str)
        -> Result<(), ProviderError>;

    /// Signing certificate ids of a user.
    async fn list_signing_certificates(&self, user: &str) -> Result<Vec<String>, ProviderError>;
    /// Delete a signing certificate.
    async fn delete_signing_certificate(
        &self,
        user: &str,
        certificate_id: &str,
    ) -> Result<(), ProviderError>;

    /// Access key ids of a user.
    async fn list_access_keys(&self, user: &str) -> Result<Vec<String>, ProviderError>;
    /// Issue a new access key.
    async fn create_access_key(&self, user: &str) -> Result<CreatedAccessKey, ProviderError>;
    /// Revoke an access key.
    async fn delete_access_key(&self, user: &str, access_key_id: &str)
        -> Result<(), ProviderError>;

    /// Enable console login with a password.
    async fn create_login_profile(&self, user: &str, password: &Secret)
        -> Result<(), ProviderError>;
    /// Change the console password.
    async fn update_login_profile(&self, user: &str, password: &Secret)
        -> Result<(), ProviderError>;
    /// Disable console login.
    async fn delete_login_profile(&self, user: &str) -> Result<(), ProviderError>;
}

/// Remote resource-management API.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Create a key pair and return its private half.
    async fn create_key_pair(&self, key_name: &str) -> Result<CreatedKeyPair, ProviderError>;
    /// Delete a key pair.
    async fn delete_key_pair(&self, key_name: &str) -> Result<(), ProviderError>;

    /// Instances whose key name starts with `key_prefix` (all when `None`).
    async fn list_instances(
        &self,
        key_prefix: Option<&str>,
    ) -> Result<Vec<RemoteInstance>, ProviderError>;
    /// Look up specific instances. Fails with [`ProviderError::NotFound`] if
    /// any id is not visible yet.
    async fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<RemoteInstance>, ProviderError>;
    /// Launch on-demand instances; returns their ids.
    async fn run_instances(&self, spec: &LaunchSpec) -> Result<Vec<String>, ProviderError>;
    /// Terminate instances.
    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ProviderError>;

    /// Submit spot requests bidding `price` per hour; returns request ids.
    async fn request_spot_instances(
        &self,
        spec: &LaunchSpec,
        price: f64,
    ) -> Result<Vec<String>, ProviderError>;
    /// Spot requests whose key name starts with `key_prefix` (all when `None`).
    async fn list_spot_requests(
        &self,
        key_prefix: Option<&str>,
    ) -> Result<Vec<RemoteSpotRequest>, ProviderError>;
    /// Look up specific spot requests. Fails with [`ProviderError::NotFound`]
    /// if any id is not visible yet.
    async fn describe_spot_requests(
        &self,
        request_ids: &[String],
    ) -> Result<Vec<RemoteSpotRequest>, ProviderError>;
    /// Cancel spot requests.
    async fn cancel_spot_requests(&self, request_ids: &[String]) -> Result<(), ProviderError>;
}

/// Serialize a [`Secret`] as its plain value on the wire.
mod secret_string {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::credentials::Secret;

    pub fn serialize<S: Serializer>(secret: &Secret, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(secret.expose())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Secret, D::Error> {
        String::deserialize(deserializer).map(Secret::from)
    }
}
