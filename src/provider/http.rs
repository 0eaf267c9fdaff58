//! JSON gateway client for the remote identity and compute APIs.
//!
//! Every operation is a `POST {base_url}/{service}/{Action}` with a JSON body,
//! authenticated with the root access key over HTTP basic auth. Status codes
//! map onto [`ProviderError`]:
//!
//! | status | error |
//! |---|---|
//! | 2xx | success |
//! | 404 | `NotFound` (transient while polling) |
//! | 429, 5xx | `Transient` |
//! | other | `Rejected` |
//!
//! Private key material is returned base64-encoded by the gateway.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    sanitize_error_body, ComputeProvider, CreatedAccessKey, CreatedKeyPair, IdentityProvider,
    LaunchSpec, ProviderError, RemoteInstance, RemoteSpotRequest,
};
use crate::config::ProviderConfig;
use crate::credentials::{RootCredentials, Secret};

const IDENTITY_SERVICE: &str = "iam";
const COMPUTE_SERVICE: &str = "compute";

/// Gateway client authenticated with the root credentials.
#[derive(Debug, Clone)]
pub struct HttpCloudClient {
    base_url: String,
    credentials: RootCredentials,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct Names {
    names: Vec<String>,
}

#[derive(Deserialize)]
struct Ids {
    ids: Vec<String>,
}

#[derive(Deserialize)]
struct Instances {
    instances: Vec<RemoteInstance>,
}

#[derive(Deserialize)]
struct SpotRequests {
    requests: Vec<RemoteSpotRequest>,
}

#[derive(Deserialize)]
struct KeyPairResponse {
    key_name: String,
    fingerprint: String,
    key_material_base64: String,
}

#[derive(Serialize)]
struct SpotRequestBody<'a> {
    #[serde(flatten)]
    spec: &'a LaunchSpec,
    spot_price: String,
}

impl HttpCloudClient {
    /// Build a client for the configured gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: &ProviderConfig, credentials: RootCredentials) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            credentials,
            client,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        service: &str,
        action: &str,
        body: serde_json::Value,
    ) -> Result<T, ProviderError> {
        let url = format!("{}/{service}/{action}", self.base_url);
        tracing::debug!(%url, "provider call");
        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.credentials.access_key_id,
                Some(self.credentials.secret_access_key.expose()),
            )
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        if let Some(err) = classify_status(status, &text) {
            tracing::warn!(action, status, "provider call failed");
            return Err(err);
        }
        parse_body(&text)
    }

    async fn iam<T: DeserializeOwned>(
        &self,
        action: &str,
        body: serde_json::Value,
    ) -> Result<T, ProviderError> {
        self.call(IDENTITY_SERVICE, action, body).await
    }

    async fn compute<T: DeserializeOwned>(
        &self,
        action: &str,
        body: serde_json::Value,
    ) -> Result<T, ProviderError> {
        self.call(COMPUTE_SERVICE, action, body).await
    }
}

/// Map a non-success status to an error; `None` for 2xx.
fn classify_status(status: u16, body: &str) -> Option<ProviderError> {
    let detail = || format!("status {status}: {}", sanitize_error_body(body));
    match status {
        200..=299 => None,
        404 => Some(ProviderError::NotFound(detail())),
        429 | 500..=599 => Some(ProviderError::Transient(detail())),
        _ => Some(ProviderError::Rejected(detail())),
    }
}

/// Parse a success body; an empty body reads as JSON `null`.
fn parse_body<T: DeserializeOwned>(text: &str) -> Result<T, ProviderError> {
    let text = if text.trim().is_empty() { "null" } else { text };
    serde_json::from_str(text).map_err(|e| ProviderError::Parse(e.to_string()))
}

type Unit = serde::de::IgnoredAny;

#[async_trait]
impl IdentityProvider for HttpCloudClient {
    async fn create_user(&self, user: &str) -> Result<(), ProviderError> {
        self.iam::<Unit>("CreateUser", json!({ "user": user })).await?;
        Ok(())
    }

    async fn delete_user(&self, user: &str) -> Result<(), ProviderError> {
        self.iam::<Unit>("DeleteUser", json!({ "user": user })).await?;
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.iam::<Names>("ListUsers", json!({})).await?.names)
    }

    async fn put_user_policy(
        &self,
        user: &str,
        policy_name: &str,
        document: &serde_json::Value,
    ) -> Result<(), ProviderError> {
        self.iam::<Unit>(
            "PutUserPolicy",
            json!({ "user": user, "policy_name": policy_name, "document": document }),
        )
        .await?;
        Ok(())
    }

    async fn list_user_policies(&self, user: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .iam::<Names>("ListUserPolicies", json!({ "user": user }))
            .await?
            .names)
    }

    async fn delete_user_policy(&self, user: &str, policy_name: &str) -> Result<(), ProviderError> {
        self.iam::<Unit>(
            "DeleteUserPolicy",
            json!({ "user": user, "policy_name": policy_name }),
        )
        .await?;
        Ok(())
    }

    async fn add_user_to_group(&self, user: &str, group: &str) -> Result<(), ProviderError> {
        self.iam::<Unit>("AddUserToGroup", json!({ "user": user, "group": group }))
            .await?;
        Ok(())
    }

    async fn list_groups_for_user(&self, user: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .iam::<Names>("ListGroupsForUser", json!({ "user": user }))
            .await?
            .names)
    }

    async fn remove_user_from_group(&self, user: &str, group: &str) -> Result<(), ProviderError> {
        self.iam::<Unit>(
            "RemoveUserFromGroup",
            json!({ "user": user, "group": group }),
        )
        .await?;
        Ok(())
    }

    async fn list_signing_certificates(&self, user: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .iam::<Ids>("ListSigningCertificates", json!({ "user": user }))
            .await?
            .ids)
    }

    async fn delete_signing_certificate(
        &self,
        user: &str,
        certificate_id: &str,
    ) -> Result<(), ProviderError> {
        self.iam::<Unit>(
            "DeleteSigningCertificate",
            json!({ "user": user, "certificate_id": certificate_id }),
        )
        .await?;
        Ok(())
    }

    async fn list_access_keys(&self, user: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .iam::<Ids>("ListAccessKeys", json!({ "user": user }))
            .await?
            .ids)
    }

    async fn create_access_key(&self, user: &str) -> Result<CreatedAccessKey, ProviderError> {
        self.iam("CreateAccessKey", json!({ "user": user })).await
    }

    async fn delete_access_key(&self, user: &str, access_key_id: &str) -> Result<(), ProviderError> {
        self.iam::<Unit>(
            "DeleteAccessKey",
            json!({ "user": user, "access_key_id": access_key_id }),
        )
        .await?;
        Ok(())
    }

    async fn create_login_profile(&self, user: &str, password: &Secret) -> Result<(), ProviderError> {
        self.iam::<Unit>(
            "CreateLoginProfile",
            json!({ "user": user, "password": password.expose() }),
        )
        .await?;
        Ok(())
    }

    async fn update_login_profile(&self, user: &str, password: &Secret) -> Result<(), ProviderError> {
        self.iam::<Unit>(
            "UpdateLoginProfile",
            json!({ "user": user, "password": password.expose() }),
        )
        .await?;
        Ok(())
    }

    async fn delete_login_profile(&self, user: &str) -> Result<(), ProviderError> {
        self.iam::<Unit>("DeleteLoginProfile", json!({ "user": user }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ComputeProvider for HttpCloudClient {
    async fn create_key_pair(&self, key_name: &str) -> Result<CreatedKeyPair, ProviderError> {
        let response: KeyPairResponse = self
            .compute("CreateKeyPair", json!({ "key_name": key_name }))
            .await?;
        decode_key_pair(response)
    }

    async fn delete_key_pair(&self, key_name: &str) -> Result<(), ProviderError> {
        self.compute::<Unit>("DeleteKeyPair", json!({ "key_name": key_name }))
            .await?;
        Ok(())
    }

    async fn list_instances(
        &self,
        key_prefix: Option<&str>,
    ) -> Result<Vec<RemoteInstance>, ProviderError> {
        Ok(self
            .compute::<Instances>("DescribeInstances", json!({ "key_prefix": key_prefix }))
            .await?
            .instances)
    }

    async fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<RemoteInstance>, ProviderError> {
        Ok(self
            .compute::<Instances>("DescribeInstances", json!({ "ids": instance_ids }))
            .await?
            .instances)
    }

    async fn run_instances(&self, spec: &LaunchSpec) -> Result<Vec<String>, ProviderError> {
        let body = serde_json::to_value(spec).map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(self.compute::<Ids>("RunInstances", body).await?.ids)
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ProviderError> {
        self.compute::<Unit>("TerminateInstances", json!({ "ids": instance_ids }))
            .await?;
        Ok(())
    }

    async fn request_spot_instances(
        &self,
        spec: &LaunchSpec,
        price: f64,
    ) -> Result<Vec<String>, ProviderError> {
        let body = serde_json::to_value(SpotRequestBody {
            spec,
            spot_price: format!("{price:.3}"),
        })
        .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(self.compute::<Ids>("RequestSpotInstances", body).await?.ids)
    }

    async fn list_spot_requests(
        &self,
        key_prefix: Option<&str>,
    ) -> Result<Vec<RemoteSpotRequest>, ProviderError> {
        Ok(self
            .compute::<SpotRequests>(
                "DescribeSpotInstanceRequests",
                json!({ "key_prefix": key_prefix }),
            )
            .await?
            .requests)
    }

    async fn describe_spot_requests(
        &self,
        request_ids: &[String],
    ) -> Result<Vec<RemoteSpotRequest>, ProviderError> {
        Ok(self
            .compute::<SpotRequests>(
                "DescribeSpotInstanceRequests",
                json!({ "ids": request_ids }),
            )
            .await?
            .requests)
    }

    async fn cancel_spot_requests(&self, request_ids: &[String]) -> Result<(), ProviderError> {
        self.compute::<Unit>("CancelSpotInstanceRequests", json!({ "ids": request_ids }))
            .await?;
        Ok(())
    }
}

fn decode_key_pair(response: KeyPairResponse) -> Result<CreatedKeyPair, ProviderError> {
    let bytes = BASE64
        .decode(response.key_material_base64.trim())
        .map_err(|e| ProviderError::Parse(format!("key material: {e}")))?;
    let pem = String::from_utf8(bytes)
        .map_err(|_| ProviderError::Parse("key material is not UTF-8".to_owned()))?;
    Ok(CreatedKeyPair {
        key_name: response.key_name,
        fingerprint: response.fingerprint,
        private_key: Secret::new(pem),
    })
}
