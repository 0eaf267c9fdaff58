//! Shared fixtures: temp-dir backed stores, an audit log and the in-memory cloud.

#![allow(dead_code)]


use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use self::cloud::InMemoryCloud;

use classcloud::accounts::{AccountStore, SubaccountManager};
use classcloud::audit::{AuditLog, REJECTION_TAG};
use classcloud::config::{AccountsConfig, LaunchConfig};
use classcloud::cost::CostModel;
use classcloud::identity::RealIdentity;
use classcloud::launch::LaunchOrchestrator;
use classcloud::ledger::UsageLedger;
use classcloud::naming::NamingScheme;
use classcloud::provider::{InstanceState, RemoteInstance, RemoteSpotRequest, SpotRequestState};
use classcloud::spend::SpendGuard;

pub struct Fixture {
    pub dir: TempDir,
    pub audit: Arc<AuditLog>,
    pub actor: RealIdentity,
    pub cloud: Arc<InMemoryCloud>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.log")));
        Self {
            dir,
            audit,
            actor: RealIdentity::from_process(),
            cloud: Arc::new(InMemoryCloud::new()),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn audit_lines(&self) -> Vec<String> {
        std::fs::read_to_string(self.audit.path())
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Audit lines carrying the rejection tag.
    pub fn rejections(&self) -> Vec<String> {
        self.audit_lines()
            .into_iter()
            .filter(|line| line.contains(REJECTION_TAG))
            .collect()
    }

    pub async fn store(&self) -> AccountStore {
        AccountStore::open(&self.path("accounts.db"), Arc::clone(&self.audit), self.actor.clone())
            .await
            .expect("open account store")
    }

    pub fn accounts_config() -> AccountsConfig {
        AccountsConfig {
            compound_prefix: None,
            ..AccountsConfig::default()
        }
    }

    pub async fn manager(&self) -> SubaccountManager {
        SubaccountManager::new(
            self.store().await,
            self.cloud.clone(),
            self.cloud.clone(),
            Self::accounts_config(),
        )
    }

    pub async fn ledger(&self) -> UsageLedger {
        UsageLedger::open(&self.path("usage.db"), NamingScheme::new(None))
            .await
            .expect("open usage ledger")
    }

    pub async fn guard(&self, limit: f64) -> SpendGuard {
        SpendGuard::new(self.ledger().await, CostModel::default(), limit)
    }

    pub async fn orchestrator(&self, limit: f64) -> LaunchOrchestrator {
        let settings = LaunchConfig {
            poll_interval_secs: 15,
            fulfillment_timeout_secs: 1200,
            max_transient_retries: 8,
        };
        LaunchOrchestrator::new(
            self.cloud.clone(),
            self.guard(limit).await,
            Arc::clone(&self.audit),
            self.actor.clone(),
            settings,
        )
    }
}

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0)
        .single()
        .expect("valid time")
}

pub fn instance(id: &str, class: &str, key: &str, state: InstanceState) -> RemoteInstance {
    RemoteInstance {
        id: id.to_owned(),
        instance_type: class.to_owned(),
        key_name: Some(key.to_owned()),
        state,
        launch_time: at(8, 0),
        spot_request_id: None,
    }
}

pub fn open_spot_request(id: &str, class: &str, key: &str) -> RemoteSpotRequest {
    RemoteSpotRequest {
        id: id.to_owned(),
        instance_type: class.to_owned(),
        key_name: Some(key.to_owned()),
        state: SpotRequestState::Open,
        create_time: at(8, 0),
        instance_id: None,
    }
}
