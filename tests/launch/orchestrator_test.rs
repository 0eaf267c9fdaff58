//! Launch gatekeeping, spot fulfillment polling and resource control.

use std::time::Duration;

use chrono::Utc;
use classcloud::audit::REJECTION_TAG;
use classcloud::error::Error;
use classcloud::launch::{LaunchOutcome, LaunchRequest};
use classcloud::ledger::ReconcileScope;
use classcloud::provider::{
    ComputeProvider, InstanceState, LaunchSpec, ProviderError, SpotRequestState,
};

use crate::support::cloud::SpotBehavior;
use crate::support::{instance, Fixture};

fn request(key: &str, class: &str, count: u32, use_spot: bool) -> LaunchRequest {
    LaunchRequest {
        spec: LaunchSpec {
            image_id: "ami-1234".to_owned(),
            instance_type: class.to_owned(),
            count,
            key_name: key.to_owned(),
            security_groups: Vec::new(),
            user_data: Some("#!/bin/sh\nexport TOKEN=s3cr3t".to_owned()),
            placement: None,
        },
        use_spot,
    }
}

async fn with_key(fx: &Fixture, key: &str) {
    fx.cloud.create_key_pair(key).await.expect("key pair");
}

#[tokio::test]
async fn approved_launch_reaches_provider_and_is_audited() {
    let fx = Fixture::new();
    with_key(&fx, "u1-default").await;
    let orchestrator = fx.orchestrator(60.0).await;

    let outcome = orchestrator
        .launch("u1", &request("u1-default", "m1.large", 2, false))
        .await
        .expect("launch");
    let LaunchOutcome::Instances(ids) = outcome else {
        panic!("expected on-demand instances");
    };
    assert_eq!(ids.len(), 2);

    let log = fx.audit_lines();
    let last = log.last().expect("audit entry");
    assert!(last.contains("Launching for u1: 2 x m1.large (demand)"));
    assert!(!log.join("\n").contains("s3cr3t"));
}

#[tokio::test]
async fn over_budget_launch_is_audited_and_never_launched() {
    let fx = Fixture::new();
    with_key(&fx, "u1-default").await;
    let orchestrator = fx.orchestrator(60.0).await;

    orchestrator
        .launch("u1", &request("u1-default", "m1.large", 2, false))
        .await
        .expect("first launch");
    let result = orchestrator
        .launch("u1", &request("u1-default", "m1.large", 14, false))
        .await;
    assert!(matches!(result, Err(Error::OverBudget { .. })));
    assert_eq!(fx.cloud.calls("run_instances"), 1);

    let log = fx.audit_lines();
    let last = log.last().expect("rejection entry");
    assert!(last.contains(REJECTION_TAG));
    assert!(last.contains(&format!(": {}: ", fx.actor.name())));
    assert!(!last.contains("s3cr3t"));
}

#[tokio::test]
async fn pending_spot_requests_count_against_the_ceiling() {
    let fx = Fixture::new();
    with_key(&fx, "u1-default").await;
    fx.cloud.set_spot_behavior(SpotBehavior {
        invisible_polls: 0,
        fulfill_after_polls: None,
    });
    let orchestrator = fx.orchestrator(60.0).await;

    let outcome = orchestrator
        .launch("u1", &request("u1-default", "m1.large", 14, true))
        .await
        .expect("spot launch");
    let LaunchOutcome::SpotRequests(ids) = outcome else {
        panic!("expected spot requests");
    };
    let bid = fx.cloud.spot_price(&ids[0]).expect("bid recorded");
    assert!((bid - 4.0 * 0.086).abs() < 1e-9);

    let result = orchestrator
        .launch("u1", &request("u1-default", "m1.large", 2, false))
        .await;
    assert!(matches!(result, Err(Error::OverBudget { .. })));
}

#[tokio::test]
async fn borrowed_key_is_refused_without_remote_calls() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator(60.0).await;

    let result = orchestrator
        .launch("u1", &request("u2-default", "m1.small", 1, false))
        .await;
    assert!(matches!(result, Err(Error::IdentityMismatch { .. })));
    assert_eq!(fx.cloud.total_calls(), 0);
    assert!(fx
        .audit_lines()
        .last()
        .is_some_and(|line| line.contains(REJECTION_TAG)));
}

#[tokio::test]
async fn unauditable_launch_is_not_submitted() {
    let fx = Fixture::new();
    with_key(&fx, "u1-default").await;
    let orchestrator = fx.orchestrator(60.0).await;
    // Replace the log file with a directory so appends fail.
    std::fs::create_dir(fx.audit.path()).expect("block audit log");

    let result = orchestrator
        .launch("u1", &request("u1-default", "m1.small", 1, false))
        .await;
    assert!(matches!(result, Err(Error::AuditUnavailable(_))));
    assert_eq!(fx.cloud.calls("run_instances"), 0);
}

#[tokio::test]
async fn concurrent_launches_cannot_share_headroom() {
    let fx = Fixture::new();
    with_key(&fx, "u1-default").await;
    let first = fx.orchestrator(60.0).await;
    let second = fx.orchestrator(60.0).await;
    let eight_large = request("u1-default", "m1.large", 8, false);

    let (a, b) = tokio::join!(
        first.launch("u1", &eight_large),
        second.launch("u1", &eight_large)
    );
    let approved = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(approved, 1, "exactly one launch fits under 60 units");
    assert!(matches!(
        if a.is_ok() { b } else { a },
        Err(Error::OverBudget { .. })
    ));
    assert_eq!(fx.cloud.calls("run_instances"), 1);

    let committed = fx.guard(60.0).await.committed_cost("u1").await.expect("query");
    assert!(committed <= 60.0, "committed {committed} exceeds the ceiling");
}

#[tokio::test]
async fn unlisted_launch_still_counts_against_the_ceiling() {
    let fx = Fixture::new();
    with_key(&fx, "u1-default").await;
    fx.cloud.set_listing_lag(5);
    let orchestrator = fx.orchestrator(60.0).await;

    orchestrator
        .launch("u1", &request("u1-default", "m1.large", 8, false))
        .await
        .expect("first launch");
    let result = orchestrator
        .launch("u1", &request("u1-default", "m1.large", 8, false))
        .await;
    assert!(matches!(result, Err(Error::OverBudget { .. })));
    assert_eq!(fx.cloud.calls("run_instances"), 1);

    let held = fx.ledger().await.reservations("u1").await.expect("query");
    assert_eq!(held.len(), 8);
    assert!(held.iter().all(|(class, id)| class == "m1.large" && id.is_some()));
}

#[tokio::test]
async fn reservation_settles_once_the_provider_lists_the_launch() {
    let fx = Fixture::new();
    with_key(&fx, "u1-default").await;
    fx.cloud.set_listing_lag(1);
    let orchestrator = fx.orchestrator(60.0).await;
    orchestrator
        .launch("u1", &request("u1-default", "m1.large", 2, false))
        .await
        .expect("launch");

    let ledger = fx.ledger().await;
    let scope = ReconcileScope::Identity("u1".to_owned());
    let hidden = ledger
        .reconcile(fx.cloud.as_ref(), &scope, Utc::now())
        .await
        .expect("reconcile");
    assert_eq!(hidden.instances, 0);
    assert_eq!(fx.guard(60.0).await.committed_cost("u1").await.expect("query"), 8.0);

    let listed = ledger
        .reconcile(fx.cloud.as_ref(), &scope, Utc::now())
        .await
        .expect("reconcile");
    assert_eq!(listed.instances, 2);
    assert_eq!(listed.settled_reservations, 2);
    assert!(ledger.reservations("u1").await.expect("query").is_empty());
    // Counted once, from the recorded instances.
    assert_eq!(fx.guard(60.0).await.committed_cost("u1").await.expect("query"), 8.0);
}

#[tokio::test]
async fn refused_launch_releases_its_reservation() {
    let fx = Fixture::new();
    with_key(&fx, "u1-default").await;
    fx.cloud.fail_next(
        "run_instances",
        ProviderError::Rejected("insufficient capacity".to_owned()),
    );
    let orchestrator = fx.orchestrator(60.0).await;

    let result = orchestrator
        .launch("u1", &request("u1-default", "m1.large", 8, false))
        .await;
    assert!(matches!(result, Err(Error::RemoteProvider(_))));
    assert!(fx.ledger().await.reservations("u1").await.expect("query").is_empty());
    assert_eq!(fx.guard(60.0).await.committed_cost("u1").await.expect("query"), 0.0);
}

#[tokio::test]
async fn unauditable_launch_holds_no_reservation() {
    let fx = Fixture::new();
    with_key(&fx, "u1-default").await;
    let orchestrator = fx.orchestrator(60.0).await;
    let ledger = fx.ledger().await;
    std::fs::create_dir(fx.audit.path()).expect("block audit log");

    let result = orchestrator
        .launch("u1", &request("u1-default", "m1.small", 1, false))
        .await;
    assert!(matches!(result, Err(Error::AuditUnavailable(_))));
    assert!(ledger.reservations("u1").await.expect("query").is_empty());
}

#[tokio::test]
async fn fulfillment_tolerates_invisible_requests() {
    let fx = Fixture::new();
    fx.cloud.set_spot_behavior(SpotBehavior {
        invisible_polls: 2,
        fulfill_after_polls: Some(1),
    });
    let orchestrator = fx.orchestrator(60.0).await;
    let ids = fx
        .cloud
        .request_spot_instances(&request("u1-default", "m1.small", 2, true).spec, 0.1)
        .await
        .expect("submit");

    tokio::time::pause();
    let instances = orchestrator
        .await_fulfillment(&ids, Duration::from_secs(1200))
        .await
        .expect("fulfilled");
    assert_eq!(instances.len(), 2);
    for (request_id, instance_id) in ids.iter().zip(&instances) {
        let request = fx.cloud.spot_request(request_id).expect("request");
        assert_eq!(request.state, SpotRequestState::Active);
        assert_eq!(request.instance_id.as_ref(), Some(instance_id));
    }
}

#[tokio::test]
async fn fulfillment_times_out_without_partial_result() {
    let fx = Fixture::new();
    fx.cloud.set_spot_behavior(SpotBehavior {
        invisible_polls: 0,
        fulfill_after_polls: None,
    });
    let orchestrator = fx.orchestrator(60.0).await;
    let ids = fx
        .cloud
        .request_spot_instances(&request("u1-default", "m1.small", 1, true).spec, 0.1)
        .await
        .expect("submit");

    tokio::time::pause();
    let result = orchestrator
        .await_fulfillment(&ids, Duration::from_secs(60))
        .await;
    match result {
        Err(Error::LaunchTimeout { unresolved, waited }) => {
            assert_eq!(unresolved, 1);
            assert!(waited >= Duration::from_secs(60));
        }
        other => panic!("expected LaunchTimeout, got {other:?}"),
    }
    // Polled at 0, 15, 30, 45 and 60 seconds.
    assert_eq!(fx.cloud.calls("describe_spot_requests"), 5);
}

#[tokio::test]
async fn fulfillment_gives_up_after_repeated_transient_errors() {
    let fx = Fixture::new();
    fx.cloud.set_spot_behavior(SpotBehavior {
        invisible_polls: 1000,
        fulfill_after_polls: Some(0),
    });
    let orchestrator = fx.orchestrator(60.0).await;
    let ids = fx
        .cloud
        .request_spot_instances(&request("u1-default", "m1.small", 1, true).spec, 0.1)
        .await
        .expect("submit");

    tokio::time::pause();
    let result = orchestrator
        .await_fulfillment(&ids, Duration::from_secs(1200))
        .await;
    assert!(matches!(result, Err(Error::RemoteProvider(_))));
    // Eight tolerated errors plus the one that is surfaced.
    assert_eq!(fx.cloud.calls("describe_spot_requests"), 9);
}

#[tokio::test]
async fn resource_control_only_touches_own_resources() {
    let fx = Fixture::new();
    fx.cloud
        .insert_instance(instance("i-1", "m1.small", "u1-default", InstanceState::Running));
    fx.cloud
        .insert_instance(instance("i-2", "m1.small", "u10-default", InstanceState::Running));
    fx.cloud
        .insert_instance(instance("i-3", "m1.small", "u1-work", InstanceState::Terminated));
    let orchestrator = fx.orchestrator(60.0).await;

    let active = orchestrator.active("u1").await.expect("active");
    let ids: Vec<&str> = active.instances.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, ["i-1"]);

    let terminated = orchestrator.terminate_all("u1").await.expect("terminate");
    assert_eq!(terminated, ["i-1"]);
    assert_eq!(
        fx.cloud.instance("i-2").map(|i| i.state),
        Some(InstanceState::Running)
    );
    assert!(fx
        .audit_lines()
        .last()
        .is_some_and(|line| line.contains("Terminating instances of u1: i-1")));

    // Nothing left to act on: no audit entry, no remote mutation.
    let before = fx.audit_lines().len();
    assert!(orchestrator.terminate_all("u1").await.expect("terminate").is_empty());
    assert_eq!(fx.audit_lines().len(), before);
}

#[tokio::test]
async fn cancelling_spot_requests_is_audited() {
    let fx = Fixture::new();
    fx.cloud.set_spot_behavior(SpotBehavior {
        invisible_polls: 0,
        fulfill_after_polls: None,
    });
    let ids = fx
        .cloud
        .request_spot_instances(&request("u1-default", "m1.small", 2, true).spec, 0.1)
        .await
        .expect("submit");
    let orchestrator = fx.orchestrator(60.0).await;

    let mut cancelled = orchestrator.cancel_spot_requests("u1").await.expect("cancel");
    cancelled.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(cancelled, expected);
    assert!(orchestrator
        .active("u1")
        .await
        .expect("active")
        .spot_requests
        .is_empty());
    assert!(fx
        .audit_lines()
        .last()
        .is_some_and(|line| line.contains("Cancelling spot requests of u1")));
}
