//! Spend ceiling decisions.

use classcloud::error::Error;
use classcloud::ledger::ReconcileScope;
use classcloud::provider::InstanceState;
use classcloud::spend::ResourceRequest;

use crate::support::{at, instance, open_spot_request, Fixture};

fn large(count: u32, uses_spot: bool) -> ResourceRequest {
    ResourceRequest {
        resource_class: "m1.large".to_owned(),
        count,
        uses_spot,
        key_name: "u1-default".to_owned(),
    }
}

#[tokio::test]
async fn ceiling_scenario_approves_then_rejects() {
    let fx = Fixture::new();
    let guard = fx.guard(60.0).await;

    let approval = guard.authorize("u1", &large(2, false)).await.expect("approved");
    assert!((approval.proposed - 8.0).abs() < 1e-9);
    assert!(approval.current.abs() < 1e-9);

    fx.cloud
        .insert_instance(instance("i-1", "m1.large", "u1-default", InstanceState::Running));
    fx.cloud
        .insert_instance(instance("i-2", "m1.large", "u1-default", InstanceState::Running));
    guard
        .ledger()
        .reconcile(fx.cloud.as_ref(), &ReconcileScope::All, at(9, 0))
        .await
        .expect("reconcile");

    let rejected = guard.authorize("u1", &large(14, false)).await;
    match rejected {
        Err(Error::OverBudget {
            identity,
            current,
            proposed,
            limit,
        }) => {
            assert_eq!(identity, "u1");
            assert!((current - 8.0).abs() < 1e-9);
            assert!((proposed - 56.0).abs() < 1e-9);
            assert!((limit - 60.0).abs() < 1e-9);
        }
        other => panic!("expected OverBudget, got {other:?}"),
    }
}

#[tokio::test]
async fn request_landing_on_the_ceiling_is_approved() {
    let fx = Fixture::new();
    let guard = fx.guard(60.0).await;
    assert!(guard.authorize("u1", &large(15, false)).await.is_ok());
    assert!(matches!(
        guard.authorize("u1", &large(16, false)).await,
        Err(Error::OverBudget { .. })
    ));
}

#[tokio::test]
async fn spot_is_charged_at_full_rate() {
    let fx = Fixture::new();
    let guard = fx.guard(60.0).await;
    let approval = guard.authorize("u1", &large(2, true)).await.expect("approved");
    assert!((approval.proposed - 8.0).abs() < 1e-9);
}

#[tokio::test]
async fn stopped_resources_and_pending_requests_count() {
    let fx = Fixture::new();
    let guard = fx.guard(60.0).await;
    fx.cloud
        .insert_instance(instance("i-1", "m1.xlarge", "u1-default", InstanceState::Stopped));
    fx.cloud
        .insert_instance(instance("i-2", "m1.xlarge", "u1-default", InstanceState::Terminated));
    fx.cloud
        .insert_spot_request(open_spot_request("sir-1", "m1.large", "u1-default"));
    guard
        .ledger()
        .reconcile(fx.cloud.as_ref(), &ReconcileScope::All, at(9, 0))
        .await
        .expect("reconcile");

    let committed = guard.committed_cost("u1").await.expect("query");
    assert!((committed - 12.0).abs() < 1e-9);
}

#[tokio::test]
async fn borrowed_credential_is_rejected() {
    let fx = Fixture::new();
    let guard = fx.guard(60.0).await;
    let request = ResourceRequest {
        key_name: "u2-default".to_owned(),
        ..large(1, false)
    };
    assert!(matches!(
        guard.authorize("u1", &request).await,
        Err(Error::IdentityMismatch { .. })
    ));
}

#[tokio::test]
async fn unknown_class_and_zero_count_are_rejected() {
    let fx = Fixture::new();
    let guard = fx.guard(60.0).await;
    let unknown = ResourceRequest {
        resource_class: "x9.huge".to_owned(),
        ..large(1, false)
    };
    assert!(matches!(
        guard.authorize("u1", &unknown).await,
        Err(Error::UnknownResourceClass(_))
    ));
    assert!(matches!(
        guard.authorize("u1", &large(0, false)).await,
        Err(Error::InvalidRequest(_))
    ));
}
