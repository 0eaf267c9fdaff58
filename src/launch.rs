//! The only path from a resource request to the remote provider.
//!
//! `launch` reconciles the identity's usage, checks key ownership, reserves
//! the cost under the spend ceiling, audits, and only then calls the
//! provider. Refusals are audited with the rejection tag before the error is
//! returned, and no remote launch call is made for them.
//!
//! The reservation covers the gap between the provider accepting a launch
//! and listing its resources: until a reconciliation pass sees them, the
//! reserved rows are what counts against the ceiling. It is released if the
//! launch never reaches the provider or the provider refuses it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::config::LaunchConfig;
use crate::error::{Error, Result};
use crate::identity::RealIdentity;
use crate::ledger::{ReconcileScope, Reservation};
use crate::provider::{
    ComputeProvider, InstanceState, LaunchSpec, ProviderError, RemoteInstance, RemoteSpotRequest,
    SpotRequestState,
};
use crate::spend::{ResourceRequest, SpendGuard};

/// A launch as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LaunchRequest {
    /// What to launch.
    #[serde(flatten)]
    pub spec: LaunchSpec,
    /// Submit as spot requests instead of on-demand instances.
    #[serde(default)]
    pub use_spot: bool,
}

/// Ids handed back by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// On-demand instance ids.
    Instances(Vec<String>),
    /// Spot request ids; see [`LaunchOrchestrator::await_fulfillment`].
    SpotRequests(Vec<String>),
}

/// Live resources of one identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveResources {
    /// Instances not yet terminated.
    pub instances: Vec<RemoteInstance>,
    /// Spot requests still open.
    pub spot_requests: Vec<RemoteSpotRequest>,
}

/// Result of one fulfillment poll.
enum Poll {
    Done(Vec<String>),
    Waiting(usize),
}

/// Gatekeeper for launches and resource control.
pub struct LaunchOrchestrator {
    compute: Arc<dyn ComputeProvider>,
    guard: SpendGuard,
    audit: Arc<AuditLog>,
    actor: RealIdentity,
    settings: LaunchConfig,
}

impl LaunchOrchestrator {
    /// Assemble an orchestrator acting for `actor`.
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        guard: SpendGuard,
        audit: Arc<AuditLog>,
        actor: RealIdentity,
        settings: LaunchConfig,
    ) -> Self {
        Self {
            compute,
            guard,
            audit,
            actor,
            settings,
        }
    }

    /// Spend guard in use.
    pub fn guard(&self) -> &SpendGuard {
        &self.guard
    }

    /// Launch on behalf of `identity`.
    ///
    /// # Errors
    ///
    /// Rejections ([`Error::InvalidRequest`], [`Error::IdentityMismatch`],
    /// [`Error::UnknownResourceClass`], [`Error::OverBudget`]) are audited
    /// first and then returned. [`Error::AuditUnavailable`] aborts before
    /// any remote launch. Remote failures propagate.
    pub async fn launch(&self, identity: &str, request: &LaunchRequest) -> Result<LaunchOutcome> {
        let reservation = match self.admit(identity, request).await {
            Ok(reservation) => reservation,
            Err(err) => {
                if err.is_rejection() {
                    self.audit.record_rejection(
                        &self.actor,
                        &format!("launch for {identity}: {}: {err}", summarize(request)),
                    )?;
                    warn!(identity, error = %err, "launch rejected");
                }
                return Err(err);
            }
        };

        match self.submit(identity, request).await {
            Ok(outcome) => {
                let ids = match &outcome {
                    LaunchOutcome::Instances(ids) | LaunchOutcome::SpotRequests(ids) => ids,
                };
                self.guard.ledger().bind_reservation(&reservation, ids).await?;
                info!(identity, outcome = ?outcome, "launch submitted");
                Ok(outcome)
            }
            Err(err) => {
                if let Err(release_err) = self.guard.ledger().release_reservation(&reservation).await {
                    warn!(identity, error = %release_err, "could not release launch reservation");
                }
                Err(err)
            }
        }
    }

    /// Audit, then hand the launch to the provider.
    async fn submit(&self, identity: &str, request: &LaunchRequest) -> Result<LaunchOutcome> {
        self.audit.record(
            &self.actor,
            &format!("Launching for {identity}: {}", summarize(request)),
        )?;

        let spec = &request.spec;
        if request.use_spot {
            let bid = self
                .guard
                .cost_model()
                .spot_bid(&spec.instance_type)
                .ok_or_else(|| Error::UnknownResourceClass(spec.instance_type.clone()))?;
            Ok(LaunchOutcome::SpotRequests(
                self.compute.request_spot_instances(spec, bid).await?,
            ))
        } else {
            Ok(LaunchOutcome::Instances(self.compute.run_instances(spec).await?))
        }
    }

    /// Validation, reconciliation and the spend reservation. No remote
    /// mutation.
    async fn admit(&self, identity: &str, request: &LaunchRequest) -> Result<Reservation> {
        let spec = &request.spec;
        if spec.image_id.trim().is_empty() {
            return Err(Error::InvalidRequest("image id is empty".to_owned()));
        }
        if !self.guard.ledger().naming().belongs_to(&spec.key_name, identity) {
            return Err(Error::IdentityMismatch {
                identity: identity.to_owned(),
                credential: spec.key_name.clone(),
            });
        }
        self.guard
            .ledger()
            .reconcile(
                self.compute.as_ref(),
                &ReconcileScope::Identity(identity.to_owned()),
                Utc::now(),
            )
            .await?;
        let (approval, reservation) = self
            .guard
            .reserve(
                identity,
                &ResourceRequest {
                    resource_class: spec.instance_type.clone(),
                    count: spec.count,
                    uses_spot: request.use_spot,
                    key_name: spec.key_name.clone(),
                },
            )
            .await?;
        debug!(identity, current = approval.current, proposed = approval.proposed, "launch admitted");
        Ok(reservation)
    }

    /// Wait with the configured timeout. See [`Self::await_fulfillment`].
    ///
    /// # Errors
    ///
    /// Same as [`Self::await_fulfillment`].
    pub async fn await_fulfillment_default(&self, request_ids: &[String]) -> Result<Vec<String>> {
        self.await_fulfillment(request_ids, self.settings.fulfillment_timeout())
            .await
    }

    /// Poll until every spot request has a running instance; returns the
    /// instance ids in request order.
    ///
    /// Not-yet-visible requests and other transient errors are retried up
    /// to `max_transient_retries` times in total.
    ///
    /// # Errors
    ///
    /// [`Error::LaunchTimeout`] when the deadline passes with any request
    /// unresolved; nothing about the resolved ones is returned. A request
    /// that failed or was cancelled surfaces as a remote error.
    pub async fn await_fulfillment(
        &self,
        request_ids: &[String],
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout).unwrap_or(started);
        let mut unresolved = request_ids.len();
        let mut transient_errors = 0u32;

        loop {
            match self.poll_fulfillment(request_ids).await {
                Ok(Poll::Done(instance_ids)) => {
                    info!(requests = request_ids.len(), "spot requests fulfilled");
                    return Ok(instance_ids);
                }
                Ok(Poll::Waiting(count)) => {
                    debug!(unresolved = count, "spot requests pending");
                    unresolved = count;
                }
                Err(Error::RemoteProvider(err))
                    if err.is_transient() && transient_errors < self.settings.max_transient_retries =>
                {
                    transient_errors = transient_errors.saturating_add(1);
                    warn!(error = %err, attempt = transient_errors, "transient error while polling");
                }
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LaunchTimeout {
                    unresolved,
                    waited: now.saturating_duration_since(started),
                });
            }
            let pause = self
                .settings
                .poll_interval()
                .min(deadline.saturating_duration_since(now));
            tokio::time::sleep(pause).await;
        }
    }

    async fn poll_fulfillment(&self, request_ids: &[String]) -> Result<Poll> {
        let requests = self.compute.describe_spot_requests(request_ids).await?;
        let mut instance_ids = Vec::with_capacity(request_ids.len());
        let mut unresolved = 0usize;

        for id in request_ids {
            let Some(request) = requests.iter().find(|r| &r.id == id) else {
                return Err(ProviderError::NotFound(format!("spot request {id}")).into());
            };
            match (request.state, &request.instance_id) {
                (SpotRequestState::Active, Some(instance_id)) => instance_ids.push(instance_id.clone()),
                (SpotRequestState::Open, _) | (SpotRequestState::Active, None) => {
                    unresolved = unresolved.saturating_add(1);
                }
                (state, _) => {
                    return Err(ProviderError::Rejected(format!(
                        "spot request {id} ended as {state:?}"
                    ))
                    .into());
                }
            }
        }
        if unresolved > 0 {
            return Ok(Poll::Waiting(unresolved));
        }

        let not_running = self
            .compute
            .describe_instances(&instance_ids)
            .await?
            .iter()
            .filter(|instance| instance.state != InstanceState::Running)
            .count();
        if not_running > 0 {
            return Ok(Poll::Waiting(not_running));
        }
        Ok(Poll::Done(instance_ids))
    }

    // ── Resource control ────────────────────────────────────────

    /// Live non-terminated instances and open spot requests of `identity`.
    ///
    /// # Errors
    ///
    /// Remote failures propagate.
    pub async fn active(&self, identity: &str) -> Result<ActiveResources> {
        let prefix = format!("{identity}-");
        let naming = self.guard.ledger().naming();
        let owned = |key: Option<&str>| key.is_some_and(|k| naming.belongs_to(k, identity));

        let instances = self
            .compute
            .list_instances(Some(&prefix))
            .await?
            .into_iter()
            .filter(|i| i.state != InstanceState::Terminated && owned(i.key_name.as_deref()))
            .collect();
        let spot_requests = self
            .compute
            .list_spot_requests(Some(&prefix))
            .await?
            .into_iter()
            .filter(|r| r.state == SpotRequestState::Open && owned(r.key_name.as_deref()))
            .collect();
        Ok(ActiveResources {
            instances,
            spot_requests,
        })
    }

    /// Terminate every live instance of `identity`. Returns the ids.
    ///
    /// # Errors
    ///
    /// Audit and remote failures propagate.
    pub async fn terminate_all(&self, identity: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = self
            .active(identity)
            .await?
            .instances
            .into_iter()
            .filter(|i| i.state != InstanceState::ShuttingDown)
            .map(|i| i.id)
            .collect();
        if ids.is_empty() {
            return Ok(ids);
        }
        self.audit.record(
            &self.actor,
            &format!("Terminating instances of {identity}: {}", ids.join(", ")),
        )?;
        self.compute.terminate_instances(&ids).await?;
        info!(identity, count = ids.len(), "terminated instances");
        Ok(ids)
    }

    /// Cancel every open spot request of `identity`. Returns the ids.
    ///
    /// # Errors
    ///
    /// Audit and remote failures propagate.
    pub async fn cancel_spot_requests(&self, identity: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = self
            .active(identity)
            .await?
            .spot_requests
            .into_iter()
            .map(|r| r.id)
            .collect();
        if ids.is_empty() {
            return Ok(ids);
        }
        self.audit.record(
            &self.actor,
            &format!("Cancelling spot requests of {identity}: {}", ids.join(", ")),
        )?;
        self.compute.cancel_spot_requests(&ids).await?;
        info!(identity, count = ids.len(), "cancelled spot requests");
        Ok(ids)
    }
}

/// Audit-safe description of a request; `user_data` is left out.
pub fn summarize(request: &LaunchRequest) -> String {
    let spec = &request.spec;
    let mut summary = format!(
        "{count} x {class} ({kind}) image={image} key={key}",
        count = spec.count,
        class = spec.instance_type,
        kind = if request.use_spot { "spot" } else { "demand" },
        image = spec.image_id,
        key = spec.key_name,
    );
    if !spec.security_groups.is_empty() {
        summary.push_str(&format!(" groups={}", spec.security_groups.join(",")));
    }
    if let Some(zone) = &spec.placement {
        summary.push_str(&format!(" placement={zone}"));
    }
    summary
}
