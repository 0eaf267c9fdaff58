//! Usage ledger: resource lifecycle records pulled from the remote provider.
//!
//! Reconciliation merges the provider's live view into three tables:
//!
//! - `instances`: one row per resource; `end_time` is set once and never
//!   cleared, and a terminated id is never reopened
//! - `instance_stopped`: stop intervals, closed when the resource resumes or
//!   terminates
//! - `pending_spot_requests`: open spot requests, replaced wholesale on each
//!   pass because the provider alone knows what is still pending
//!
//! A fourth table, `launch_reservations`, holds the cost of launches the
//! provider has not listed yet. A reservation is taken in the same
//! `BEGIN IMMEDIATE` transaction that checks the committed total, so two
//! local launches can never both fit under the same headroom. It is bound
//! to the provider's ids once the launch call returns and settled when a
//! reconciliation pass sees those ids.
//!
//! Each resource is merged in its own `BEGIN IMMEDIATE` transaction, so
//! concurrent reconcilers never observe a half-updated resource.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, ImmediateTx};
use crate::error::Result;
use crate::naming::NamingScheme;
use crate::provider::{ComputeProvider, InstanceState, RemoteInstance, RemoteSpotRequest, SpotRequestState};

pub mod report;

const SCHEMA: &str = include_str!("../../migrations/usage.sql");

/// Reservations older than this stop counting and are purged; a launch
/// whose process died before binding its ids must not hold cost forever.
const RESERVATION_TTL_HOURS: i64 = 1;

/// Which part of the remote state a reconciliation pass covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileScope {
    /// Every resource on the account.
    All,
    /// Resources owned by one identity.
    Identity(String),
}

impl ReconcileScope {
    /// Remote key-name filter for this scope.
    fn key_prefix(&self) -> Option<String> {
        match self {
            Self::All => None,
            Self::Identity(name) => Some(format!("{name}-")),
        }
    }

    fn admits(&self, owner: &str) -> bool {
        match self {
            Self::All => true,
            Self::Identity(name) => name == owner,
        }
    }
}

/// One compute resource as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    /// Instance id.
    pub id: String,
    /// Resource class.
    pub instance_type: String,
    /// Launched from a spot request.
    pub is_spot: bool,
    /// Owner parsed from the launch key name.
    pub username: String,
    /// Launch time reported by the provider.
    pub start_time: DateTime<Utc>,
    /// First time the resource was seen terminated.
    pub end_time: Option<DateTime<Utc>>,
    /// Last reconciliation that saw the resource alive.
    pub last_seen: DateTime<Utc>,
}

/// A period during which a resource was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopInterval {
    /// When the stop was first observed.
    pub stopped_time: DateTime<Utc>,
    /// When the resume (or termination) was first observed.
    pub running_time: Option<DateTime<Utc>>,
}

/// An open spot request as of the last reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Request id.
    pub request_id: String,
    /// Resource class requested.
    pub instance_type: String,
    /// Submission time.
    pub request_time: DateTime<Utc>,
    /// Owner parsed from the launch key name.
    pub username: String,
}

/// Cost held for one launch until reconciliation sees its resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Id shared by every row of the launch.
    pub launch_id: String,
    /// Owning identity.
    pub username: String,
    /// Resource class reserved.
    pub instance_type: String,
    /// Rows held, one per requested resource.
    pub count: u32,
}

impl Reservation {
    fn slot_id(&self, slot: usize) -> String {
        format!("{}:{slot}", self.launch_id)
    }
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Resources merged into the ledger.
    pub instances: usize,
    /// Resources ignored because their key name has no owner in scope.
    pub skipped: usize,
    /// Open spot requests recorded.
    pub pending_requests: usize,
    /// Launch reservations settled or expired.
    pub settled_reservations: usize,
}

type ResourceRow = (String, String, i64, String, String, Option<String>, String);

/// SQLite-backed usage ledger.
#[derive(Debug, Clone)]
pub struct UsageLedger {
    pool: SqlitePool,
    naming: NamingScheme,
}

impl UsageLedger {
    /// Open (creating if missing) the ledger at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`](crate::error::Error::Database) if the file
    /// cannot be opened or migrated.
    pub async fn open(path: &Path, naming: NamingScheme) -> Result<Self> {
        let pool = db::open_pool(path, SCHEMA).await?;
        Ok(Self { pool, naming })
    }

    /// Grammar used to attribute resources to identities.
    pub fn naming(&self) -> &NamingScheme {
        &self.naming
    }

    // ── Reconciliation ──────────────────────────────────────────

    /// Pull live instances and spot requests within `scope` and merge them.
    ///
    /// Running it twice against unchanged remote state adds no rows and
    /// changes no `end_time` or `running_time`.
    ///
    /// # Errors
    ///
    /// Returns the first remote or storage error. Resources merged before
    /// the error stay merged.
    pub async fn reconcile(
        &self,
        compute: &dyn ComputeProvider,
        scope: &ReconcileScope,
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary> {
        let prefix = scope.key_prefix();
        let mut summary = ReconcileSummary::default();

        let instances = compute.list_instances(prefix.as_deref()).await?;
        for instance in &instances {
            match self.owner_in_scope(instance.key_name.as_deref(), scope) {
                Some(owner) => {
                    self.merge_instance(instance, &owner, now).await?;
                    summary.instances = summary.instances.saturating_add(1);
                }
                None => {
                    debug!(instance = %instance.id, key = ?instance.key_name, "no owner in scope");
                    summary.skipped = summary.skipped.saturating_add(1);
                }
            }
        }

        let requests = compute.list_spot_requests(prefix.as_deref()).await?;
        summary.pending_requests = self.replace_pending(&requests, scope).await?;
        summary.settled_reservations = self.settle_reservations(&instances, &requests, now).await?;

        info!(
            scope = ?scope,
            instances = summary.instances,
            skipped = summary.skipped,
            pending = summary.pending_requests,
            settled = summary.settled_reservations,
            "reconciled usage"
        );
        Ok(summary)
    }

    fn owner_in_scope(&self, key_name: Option<&str>, scope: &ReconcileScope) -> Option<String> {
        let owner = self.naming.owner_of(key_name?)?;
        scope.admits(owner).then(|| owner.to_owned())
    }

    /// Merge one live instance under the ledger's transition rules.
    async fn merge_instance(
        &self,
        instance: &RemoteInstance,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now_text = db::format_time(now);
        let mut tx = ImmediateTx::begin(&self.pool).await?;

        let known_end: Option<Option<String>> =
            sqlx::query_scalar("SELECT end_time FROM instances WHERE instance_id = ?")
                .bind(&instance.id)
                .fetch_optional(tx.conn())
                .await?;
        if let Some(Some(_)) = known_end {
            // Terminated ids are final.
            tx.rollback().await?;
            return Ok(());
        }

        let open_stop: Option<String> = sqlx::query_scalar(
            "SELECT stopped_time FROM instance_stopped
             WHERE instance_id = ? AND running_time IS NULL",
        )
        .bind(&instance.id)
        .fetch_optional(tx.conn())
        .await?;

        let end_time = (instance.state == InstanceState::Terminated).then_some(now_text.as_str());
        sqlx::query(
            "INSERT INTO instances
                (instance_id, instance_type, start_time, end_time, last_seen, is_spot, username)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(instance_id) DO UPDATE SET
                end_time = excluded.end_time,
                last_seen = excluded.last_seen",
        )
        .bind(&instance.id)
        .bind(&instance.instance_type)
        .bind(db::format_time(instance.launch_time))
        .bind(end_time)
        .bind(&now_text)
        .bind(instance.is_spot())
        .bind(owner)
        .execute(tx.conn())
        .await?;

        match (instance.state, open_stop) {
            (InstanceState::Stopped, None) => {
                sqlx::query("INSERT INTO instance_stopped (instance_id, stopped_time) VALUES (?, ?)")
                    .bind(&instance.id)
                    .bind(&now_text)
                    .execute(tx.conn())
                    .await?;
            }
            (InstanceState::Stopped, Some(_)) | (_, None) => {}
            (_, Some(stopped_time)) => {
                sqlx::query(
                    "UPDATE instance_stopped SET running_time = ?
                     WHERE instance_id = ? AND stopped_time = ?",
                )
                .bind(&now_text)
                .bind(&instance.id)
                .bind(&stopped_time)
                .execute(tx.conn())
                .await?;
            }
        }

        tx.commit().await?;
        debug!(instance = %instance.id, state = instance.state.as_str(), owner, "merged instance");
        Ok(())
    }

    /// Replace the pending spot requests within `scope` with the open ones
    /// in `requests`. Returns how many were recorded.
    async fn replace_pending(
        &self,
        requests: &[RemoteSpotRequest],
        scope: &ReconcileScope,
    ) -> Result<usize> {
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        match scope {
            ReconcileScope::All => {
                sqlx::query("DELETE FROM pending_spot_requests")
                    .execute(tx.conn())
                    .await?;
            }
            ReconcileScope::Identity(name) => {
                sqlx::query("DELETE FROM pending_spot_requests WHERE username = ?")
                    .bind(name)
                    .execute(tx.conn())
                    .await?;
            }
        }

        let mut recorded = 0usize;
        for request in requests {
            if request.state != SpotRequestState::Open {
                continue;
            }
            let Some(owner) = self.owner_in_scope(request.key_name.as_deref(), scope) else {
                warn!(request = %request.id, "open spot request without owner in scope");
                continue;
            };
            sqlx::query(
                "INSERT OR REPLACE INTO pending_spot_requests
                    (request_id, instance_type, request_time, username)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&request.id)
            .bind(&request.instance_type)
            .bind(db::format_time(request.create_time))
            .bind(&owner)
            .execute(tx.conn())
            .await?;
            recorded = recorded.saturating_add(1);
        }

        tx.commit().await?;
        Ok(recorded)
    }

    /// Drop reservations whose resources the provider now lists, and
    /// expired ones. A fulfilled spot request stays reserved until its
    /// instance is listed too.
    async fn settle_reservations(
        &self,
        instances: &[RemoteInstance],
        requests: &[RemoteSpotRequest],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let listed: BTreeSet<&str> = instances.iter().map(|i| i.id.as_str()).collect();
        let mut seen: BTreeSet<&str> = listed.clone();
        seen.extend(instances.iter().filter_map(|i| i.spot_request_id.as_deref()));
        for request in requests {
            let instance_listed = request
                .instance_id
                .as_deref()
                .is_some_and(|id| listed.contains(id));
            if request.state != SpotRequestState::Active || instance_listed {
                seen.insert(request.id.as_str());
            }
        }

        let mut tx = ImmediateTx::begin(&self.pool).await?;
        let mut settled = 0u64;
        for id in seen {
            settled = settled.saturating_add(
                sqlx::query("DELETE FROM launch_reservations WHERE resource_id = ?")
                    .bind(id)
                    .execute(tx.conn())
                    .await?
                    .rows_affected(),
            );
        }
        settled = settled.saturating_add(
            sqlx::query("DELETE FROM launch_reservations WHERE created_time < ?")
                .bind(reservation_cutoff(now))
                .execute(tx.conn())
                .await?
                .rows_affected(),
        );
        tx.commit().await?;
        Ok(usize::try_from(settled).unwrap_or(usize::MAX))
    }

    // ── Launch reservations ─────────────────────────────────────

    /// Check `identity`'s committed classes with `check` and, if it passes,
    /// reserve `count` resources of `instance_type`, all in one write
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns whatever `check` returns (nothing is reserved then), or
    /// [`Error::Database`](crate::error::Error::Database) on storage failure.
    pub async fn reserve<T, F>(
        &self,
        identity: &str,
        instance_type: &str,
        count: u32,
        check: F,
    ) -> Result<(T, Reservation)>
    where
        F: FnOnce(&[String]) -> Result<T>,
    {
        let now = Utc::now();
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        let classes = committed_classes_on(tx.conn(), identity, now).await?;
        let approved = match check(&classes) {
            Ok(approved) => approved,
            Err(err) => {
                tx.rollback().await?;
                return Err(err);
            }
        };

        let reservation = Reservation {
            launch_id: Uuid::new_v4().to_string(),
            username: identity.to_owned(),
            instance_type: instance_type.to_owned(),
            count,
        };
        let created = db::format_time(now);
        for slot in 0..usize::try_from(count).unwrap_or(usize::MAX) {
            sqlx::query(
                "INSERT INTO launch_reservations
                    (reservation_id, launch_id, username, instance_type, created_time)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(reservation.slot_id(slot))
            .bind(&reservation.launch_id)
            .bind(identity)
            .bind(instance_type)
            .bind(&created)
            .execute(tx.conn())
            .await?;
        }
        tx.commit().await?;
        debug!(identity, launch = %reservation.launch_id, count, "reserved launch");
        Ok((approved, reservation))
    }

    /// Attach the ids the provider returned to `reservation`. Slots the
    /// provider did not fill are released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`](crate::error::Error::Database) on storage failure.
    pub async fn bind_reservation(
        &self,
        reservation: &Reservation,
        resource_ids: &[String],
    ) -> Result<()> {
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        for (slot, id) in resource_ids.iter().enumerate() {
            sqlx::query("UPDATE launch_reservations SET resource_id = ? WHERE reservation_id = ?")
                .bind(id)
                .bind(reservation.slot_id(slot))
                .execute(tx.conn())
                .await?;
        }
        sqlx::query("DELETE FROM launch_reservations WHERE launch_id = ? AND resource_id IS NULL")
            .bind(&reservation.launch_id)
            .execute(tx.conn())
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Give back everything `reservation` holds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`](crate::error::Error::Database) on storage failure.
    pub async fn release_reservation(&self, reservation: &Reservation) -> Result<()> {
        sqlx::query("DELETE FROM launch_reservations WHERE launch_id = ?")
            .bind(&reservation.launch_id)
            .execute(&self.pool)
            .await?;
        debug!(launch = %reservation.launch_id, "released launch reservation");
        Ok(())
    }

    /// Live reservation rows of `identity`, as `(instance_type, resource_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`](crate::error::Error::Database) on storage failure.
    pub async fn reservations(&self, identity: &str) -> Result<Vec<(String, Option<String>)>> {
        Ok(sqlx::query_as(
            "SELECT instance_type, resource_id FROM launch_reservations
             WHERE username = ? AND created_time >= ? ORDER BY reservation_id",
        )
        .bind(identity)
        .bind(reservation_cutoff(Utc::now()))
        .fetch_all(&self.pool)
        .await?)
    }

    // ── Queries ─────────────────────────────────────────────────

    /// One resource by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`](crate::error::Error::Database) on storage failure.
    pub async fn resource(&self, id: &str) -> Result<Option<ResourceRecord>> {
        let row = sqlx::query_as::<_, ResourceRow>(
            "SELECT instance_id, instance_type, is_spot, username, start_time, end_time, last_seen
             FROM instances WHERE instance_id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(resource_from_row).transpose()
    }

    /// Every resource owned by `identity`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`](crate::error::Error::Database) on storage failure.
    pub async fn resources_for(&self, identity: &str) -> Result<Vec<ResourceRecord>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            "SELECT instance_id, instance_type, is_spot, username, start_time, end_time, last_seen
             FROM instances WHERE username = ? ORDER BY start_time, instance_id",
        )
        .bind(identity)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(resource_from_row).collect()
    }

    /// Resources of `identity` with no end time (running or stopped).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`](crate::error::Error::Database) on storage failure.
    pub async fn open_resources(&self, identity: &str) -> Result<Vec<ResourceRecord>> {
        Ok(self
            .resources_for(identity)
            .await?
            .into_iter()
            .filter(|r| r.end_time.is_none())
            .collect())
    }

    /// Stop intervals of a resource, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`](crate::error::Error::Database) on storage failure.
    pub async fn stop_intervals(&self, id: &str) -> Result<Vec<StopInterval>> {
        let rows = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT stopped_time, running_time FROM instance_stopped
             WHERE instance_id = ? ORDER BY stopped_time",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(stopped, running)| {
                Ok(StopInterval {
                    stopped_time: db::parse_time(&stopped)?,
                    running_time: running.as_deref().map(db::parse_time).transpose()?,
                })
            })
            .collect()
    }

    /// Open spot requests of `identity` as of the last reconciliation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`](crate::error::Error::Database) on storage failure.
    pub async fn pending_requests(&self, identity: &str) -> Result<Vec<PendingRequest>> {
        let rows = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT request_id, instance_type, request_time, username
             FROM pending_spot_requests WHERE username = ? ORDER BY request_time, request_id",
        )
        .bind(identity)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(request_id, instance_type, request_time, username)| {
                Ok(PendingRequest {
                    request_id,
                    instance_type,
                    request_time: db::parse_time(&request_time)?,
                    username,
                })
            })
            .collect()
    }

    /// Every owner that has at least one recorded resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`](crate::error::Error::Database) on storage failure.
    pub async fn usernames(&self) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT DISTINCT username FROM instances ORDER BY username")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Resource classes `identity` currently has committed: every open
    /// resource (stopped ones included), every pending spot request, and
    /// every launch reservation not yet reconciled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`](crate::error::Error::Database) on storage failure.
    pub async fn committed_classes(&self, identity: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        committed_classes_on(&mut conn, identity, Utc::now()).await
    }
}

/// Committed classes as seen on `conn`, which may be inside a write
/// transaction. A bound reservation stops counting as soon as its id shows
/// up as a recorded instance or pending request, so nothing counts twice.
async fn committed_classes_on(
    conn: &mut SqliteConnection,
    identity: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    Ok(sqlx::query_scalar(
        "SELECT instance_type FROM instances
         WHERE username = ? AND end_time IS NULL
         UNION ALL
         SELECT instance_type FROM pending_spot_requests
         WHERE username = ?
         UNION ALL
         SELECT instance_type FROM launch_reservations
         WHERE username = ? AND created_time >= ?
           AND (resource_id IS NULL
                OR (resource_id NOT IN (SELECT instance_id FROM instances)
                    AND resource_id NOT IN (SELECT request_id FROM pending_spot_requests)))",
    )
    .bind(identity)
    .bind(identity)
    .bind(identity)
    .bind(reservation_cutoff(now))
    .fetch_all(conn)
    .await?)
}

fn reservation_cutoff(now: DateTime<Utc>) -> String {
    let ttl = TimeDelta::try_hours(RESERVATION_TTL_HOURS).unwrap_or_default();
    db::format_time(now.checked_sub_signed(ttl).unwrap_or(now))
}

fn resource_from_row(
    (id, instance_type, is_spot, username, start_time, end_time, last_seen): ResourceRow,
) -> Result<ResourceRecord> {
    Ok(ResourceRecord {
        id,
        instance_type,
        is_spot: is_spot != 0,
        username,
        start_time: db::parse_time(&start_time)?,
        end_time: end_time.as_deref().map(db::parse_time).transpose()?,
        last_seen: db::parse_time(&last_seen)?,
    })
}
