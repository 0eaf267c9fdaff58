//! Durable record of issued identities and their credentials.
//!
//! Every mutation runs in one `BEGIN IMMEDIATE` transaction and is audited
//! before it commits. If the audit line cannot be written the transaction is
//! rolled back and the mutation fails with
//! [`Error::AuditUnavailable`](crate::error::Error::AuditUnavailable).
//!
//! Callers invoke mutations only after the matching remote call succeeded, so
//! the store never claims a credential the provider does not have.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::audit::AuditLog;
use crate::credentials::Secret;
use crate::db::{self, ImmediateTx};
use crate::error::{Error, Result};
use crate::identity::RealIdentity;

const SCHEMA: &str = include_str!("../../migrations/accounts.sql");

/// A provisioned identity.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    /// Username; namespace root for its credentials and resources.
    pub name: String,
    /// When the identity was created.
    pub create_time: DateTime<Utc>,
    /// Real identity of whoever created it.
    pub create_account: String,
    /// Console login password, if one was set.
    pub login_password: Option<Secret>,
}

/// An access key pair held for an identity.
#[derive(Debug, Clone)]
pub struct AccessKeyCredential {
    /// Public key id; the only part that is ever audited or logged.
    pub access_key_id: String,
    /// Secret key.
    pub secret_access_key: Secret,
}

/// An SSH key pair held for an identity.
#[derive(Debug, Clone)]
pub struct SshKeyMaterial {
    /// Globally unique, identity-namespaced key name.
    pub key_name: String,
    /// PEM-encoded private key.
    pub private_key: Secret,
    /// Public key fingerprint.
    pub fingerprint: String,
}

/// SQLite-backed identity and credential store.
#[derive(Debug, Clone)]
pub struct AccountStore {
    pool: SqlitePool,
    audit: Arc<AuditLog>,
    actor: RealIdentity,
}

impl AccountStore {
    /// Open (creating if missing) the store at `path`. Mutations are audited
    /// as `actor`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the file cannot be opened or migrated.
    pub async fn open(path: &Path, audit: Arc<AuditLog>, actor: RealIdentity) -> Result<Self> {
        let pool = db::open_pool(path, SCHEMA).await?;
        Ok(Self { pool, audit, actor })
    }

    /// Real identity stamped on this store's audit entries.
    pub fn actor(&self) -> &RealIdentity {
        &self.actor
    }

    /// Audit log mutations are recorded in.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Audit a refused request with the rejection tag and hand back `err`.
    /// If the refusal cannot be recorded, that failure is returned instead.
    pub fn refuse(&self, action: &str, err: Error) -> Error {
        match self
            .audit
            .record_rejection(&self.actor, &format!("{action}: {err}"))
        {
            Ok(()) => {
                warn!(action, error = %err, "request refused");
                err
            }
            Err(audit_err) => audit_err.into(),
        }
    }

    /// Record `message` and commit, or roll back if it cannot be recorded.
    async fn commit_audited(&self, tx: ImmediateTx, message: &str) -> Result<()> {
        if let Err(err) = self.audit.record(&self.actor, message) {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback after audit failure failed");
            }
            return Err(err.into());
        }
        tx.commit().await?;
        Ok(())
    }

    // ── Identities ──────────────────────────────────────────────

    /// Whether `name` has been provisioned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on storage failure.
    pub async fn identity_exists(&self, name: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE user_name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Record a new identity created by this store's actor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateIdentity`] if `name` already exists.
    pub async fn create_identity(&self, name: &str, login_password: Option<&Secret>) -> Result<()> {
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        let existing: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE user_name = ?")
            .bind(name)
            .fetch_optional(tx.conn())
            .await?;
        if existing.is_some() {
            tx.rollback().await?;
            return Err(self.refuse(
                &format!("create user {name}"),
                Error::DuplicateIdentity(name.to_owned()),
            ));
        }

        sqlx::query(
            "INSERT INTO users (user_name, create_time, create_account, login_password)
             VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(db::format_time(Utc::now()))
        .bind(self.actor.name())
        .bind(login_password.map(Secret::expose))
        .execute(tx.conn())
        .await?;

        self.commit_audited(tx, &format!("Recorded user {name}")).await?;
        debug!(identity = name, "identity recorded");
        Ok(())
    }

    /// Look up an identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on storage failure.
    pub async fn get_identity(&self, name: &str) -> Result<Option<IdentityRecord>> {
        let row = sqlx::query_as::<_, (String, String, String, Option<String>)>(
            "SELECT user_name, create_time, create_account, login_password
             FROM users WHERE user_name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(name, create_time, create_account, login_password)| {
            Ok::<_, Error>(IdentityRecord {
                name,
                create_time: db::parse_time(&create_time)?,
                create_account,
                login_password: login_password.map(Secret::from),
            })
        })
        .transpose()
    }

    /// Every recorded identity, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on storage failure.
    pub async fn identities(&self) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT user_name FROM users ORDER BY user_name")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Replace the stored login password.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownIdentity`] if `name` is not recorded.
    pub async fn set_password(&self, name: &str, password: &Secret) -> Result<()> {
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        let updated = sqlx::query("UPDATE users SET login_password = ? WHERE user_name = ?")
            .bind(password.expose())
            .bind(name)
            .execute(tx.conn())
            .await?
            .rows_affected();
        if updated == 0 {
            tx.rollback().await?;
            return Err(Error::UnknownIdentity(name.to_owned()));
        }
        self.commit_audited(tx, &format!("Changed login password for {name}"))
            .await
    }

    /// Delete an identity and, by cascade, all of its credentials.
    /// Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] or [`Error::AuditUnavailable`].
    pub async fn delete_identity(&self, name: &str) -> Result<bool> {
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        let removed = sqlx::query("DELETE FROM users WHERE user_name = ?")
            .bind(name)
            .execute(tx.conn())
            .await?
            .rows_affected();
        if removed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        self.commit_audited(tx, &format!("Deleted user {name} and its credentials"))
            .await?;
        Ok(true)
    }

    // ── Access keys ─────────────────────────────────────────────

    /// Store an access key issued remotely for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownIdentity`] if `name` is not recorded.
    pub async fn add_access_key(&self, name: &str, key: &AccessKeyCredential) -> Result<()> {
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        let inserted = sqlx::query(
            "INSERT INTO access_keys (user_name, access_key, secret_access_key)
             SELECT user_name, ?, ? FROM users WHERE user_name = ?",
        )
        .bind(&key.access_key_id)
        .bind(key.secret_access_key.expose())
        .bind(name)
        .execute(tx.conn())
        .await?
        .rows_affected();
        if inserted == 0 {
            tx.rollback().await?;
            return Err(Error::UnknownIdentity(name.to_owned()));
        }
        self.commit_audited(
            tx,
            &format!("Created access key {} for {name}", key.access_key_id),
        )
        .await
    }

    /// Remove one access key. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] or [`Error::AuditUnavailable`].
    pub async fn remove_access_key(&self, name: &str, access_key_id: &str) -> Result<bool> {
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        let removed = sqlx::query("DELETE FROM access_keys WHERE user_name = ? AND access_key = ?")
            .bind(name)
            .bind(access_key_id)
            .execute(tx.conn())
            .await?
            .rows_affected();
        if removed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        self.commit_audited(tx, &format!("Deleted access key {access_key_id} of {name}"))
            .await?;
        Ok(true)
    }

    /// Access keys of `name` in issue order. The first is the primary key
    /// the identity's own scoped session is derived from.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on storage failure.
    pub async fn get_access_keys(&self, name: &str) -> Result<Vec<AccessKeyCredential>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT access_key, secret_access_key FROM access_keys
             WHERE user_name = ? ORDER BY seq",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(access_key_id, secret)| AccessKeyCredential {
                access_key_id,
                secret_access_key: Secret::from(secret),
            })
            .collect())
    }

    // ── SSH keys ────────────────────────────────────────────────

    /// Whether an SSH key with this name exists for any identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on storage failure.
    pub async fn ssh_key_exists(&self, key_name: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM ssh_keys WHERE key_name = ?")
            .bind(key_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Store an SSH key created remotely for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateSshKey`] if the name is taken by any
    /// identity, or [`Error::UnknownIdentity`] if `name` is not recorded.
    pub async fn add_ssh_key(&self, name: &str, key: &SshKeyMaterial) -> Result<()> {
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        let taken: Option<i64> = sqlx::query_scalar("SELECT 1 FROM ssh_keys WHERE key_name = ?")
            .bind(&key.key_name)
            .fetch_optional(tx.conn())
            .await?;
        if taken.is_some() {
            tx.rollback().await?;
            return Err(self.refuse(
                &format!("record SSH key for {name}"),
                Error::DuplicateSshKey(key.key_name.clone()),
            ));
        }
        let inserted = sqlx::query(
            "INSERT INTO ssh_keys (key_name, user_name, private_key, fingerprint)
             SELECT ?, user_name, ?, ? FROM users WHERE user_name = ?",
        )
        .bind(&key.key_name)
        .bind(key.private_key.expose())
        .bind(&key.fingerprint)
        .bind(name)
        .execute(tx.conn())
        .await?
        .rows_affected();
        if inserted == 0 {
            tx.rollback().await?;
            return Err(Error::UnknownIdentity(name.to_owned()));
        }
        self.commit_audited(
            tx,
            &format!("Created SSH keypair {} for {name}", key.key_name),
        )
        .await
    }

    /// Remove one SSH key of `name`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] or [`Error::AuditUnavailable`].
    pub async fn remove_ssh_key(&self, name: &str, key_name: &str) -> Result<bool> {
        let mut tx = ImmediateTx::begin(&self.pool).await?;
        let removed = sqlx::query("DELETE FROM ssh_keys WHERE user_name = ? AND key_name = ?")
            .bind(name)
            .bind(key_name)
            .execute(tx.conn())
            .await?
            .rows_affected();
        if removed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        self.commit_audited(tx, &format!("Deleted SSH key {key_name} of {name}"))
            .await?;
        Ok(true)
    }

    /// SSH keys of `name`, sorted by key name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on storage failure.
    pub async fn get_ssh_keys(&self, name: &str) -> Result<Vec<SshKeyMaterial>> {
        let rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT key_name, private_key, fingerprint FROM ssh_keys
             WHERE user_name = ? ORDER BY key_name",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ssh_key_from_row).collect())
    }

    /// One SSH key of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on storage failure.
    pub async fn get_ssh_key(&self, name: &str, key_name: &str) -> Result<Option<SshKeyMaterial>> {
        let row = sqlx::query_as::<_, (String, String, String)>(
            "SELECT key_name, private_key, fingerprint FROM ssh_keys
             WHERE user_name = ? AND key_name = ?",
        )
        .bind(name)
        .bind(key_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ssh_key_from_row))
    }
}

fn ssh_key_from_row((key_name, private_key, fingerprint): (String, String, String)) -> SshKeyMaterial {
    SshKeyMaterial {
        key_name,
        private_key: Secret::from(private_key),
        fingerprint,
    }
}
