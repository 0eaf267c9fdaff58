//! Sub-account lifecycle against the remote identity provider.
//!
//! Per identity: `absent -> provisioned -> (key-rotated)* -> absent`.
//!
//! Remote calls always come first and local rows are written only after
//! they succeed. The one exception to error propagation is the purge of a
//! stale remote user before (re)creation, which is best-effort.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use super::policy;
use super::store::{AccessKeyCredential, AccountStore, SshKeyMaterial};
use crate::config::AccountsConfig;
use crate::credentials::Secret;
use crate::error::{Error, Result};
use crate::naming::{self, NamingScheme};
use crate::privilege::{PrivilegeBroker, PrivilegeError};
use crate::provider::{ComputeProvider, IdentityProvider, ProviderError};

/// Password characters; `l`, `1` and `I` are left out as easily confused.
pub const PASSWORD_ALPHABET: &str =
    "abcdefghijkmnopqrstuvwxyz023456789ABCDEFGHJKLMNOPQRSTUVWXYZ";

/// Random login password drawn from [`PASSWORD_ALPHABET`] with the OS RNG.
pub fn generate_password(length: usize) -> Secret {
    let alphabet = PASSWORD_ALPHABET.as_bytes();
    let password = (0..length)
        .filter_map(|_| alphabet.choose(&mut OsRng).copied().map(char::from))
        .collect::<String>();
    Secret::new(password)
}

/// Orchestrates identity creation, deletion and credential rotation.
pub struct SubaccountManager {
    store: AccountStore,
    identities: Arc<dyn IdentityProvider>,
    compute: Arc<dyn ComputeProvider>,
    naming: NamingScheme,
    settings: AccountsConfig,
}

impl SubaccountManager {
    /// Assemble a manager.
    pub fn new(
        store: AccountStore,
        identities: Arc<dyn IdentityProvider>,
        compute: Arc<dyn ComputeProvider>,
        settings: AccountsConfig,
    ) -> Self {
        let naming = NamingScheme::new(settings.compound_prefix.clone());
        Self {
            store,
            identities,
            compute,
            naming,
            settings,
        }
    }

    /// Underlying store.
    pub fn store(&self) -> &AccountStore {
        &self.store
    }

    /// Naming grammar in force.
    pub fn naming(&self) -> &NamingScheme {
        &self.naming
    }

    fn audit(&self, message: &str) -> Result<()> {
        self.store
            .audit()
            .record(self.store.actor(), message)
            .map_err(Error::from)
    }

    async fn require_identity(&self, name: &str) -> Result<()> {
        if self.store.identity_exists(name).await? {
            Ok(())
        } else {
            Err(Error::UnknownIdentity(name.to_owned()))
        }
    }

    /// Refuse, audited, a key name outside `name`'s namespace.
    fn require_owned_key(&self, action: &str, name: &str, key_name: &str) -> Result<()> {
        if self.naming.belongs_to(key_name, name) {
            return Ok(());
        }
        Err(self.store.refuse(
            action,
            Error::IdentityMismatch {
                identity: name.to_owned(),
                credential: key_name.to_owned(),
            },
        ))
    }

    fn validate_new_identity(&self, name: &str) -> Result<()> {
        if !self.naming.is_valid_identity(name) {
            return Err(Error::InvalidName(format!(
                "{name:?} cannot own namespaced credentials"
            )));
        }
        if let Some(prefix) = self.settings.required_prefix.as_deref() {
            if !name.starts_with(prefix) {
                return Err(Error::InvalidName(format!(
                    "{name:?} does not start with {prefix:?}"
                )));
            }
        }
        Ok(())
    }

    // ── Provisioning ────────────────────────────────────────────

    /// Provision `name`. Returns `false` if it was already provisioned.
    ///
    /// A stale remote user of the same name (from an earlier partial failure)
    /// is purged first; errors from that purge are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidName`] for names outside the grammar, and
    /// remote, audit or storage errors otherwise. On any error nothing is
    /// recorded locally.
    pub async fn provision(&self, name: &str) -> Result<bool> {
        if self.store.identity_exists(name).await? {
            debug!(identity = name, "already provisioned");
            return Ok(false);
        }
        self.validate_new_identity(name)
            .map_err(|err| self.store.refuse(&format!("create user {name}"), err))?;
        self.audit(&format!("Creating user {name}"))?;

        self.purge_remote_best_effort(name).await;

        self.identities.create_user(name).await?;
        self.identities
            .add_user_to_group(name, &self.settings.group)
            .await?;
        let document = policy::identity_policy(name, &self.settings.storage_bucket);
        self.identities
            .put_user_policy(name, &policy::policy_name(name), &document)
            .await?;
        let password = generate_password(self.settings.password_length);
        self.identities.create_login_profile(name, &password).await?;

        self.store.create_identity(name, Some(&password)).await?;
        info!(identity = name, "identity provisioned");
        Ok(true)
    }

    /// Replace every access key of `name` with exactly one new key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownIdentity`] if `name` is not provisioned, or
    /// the first remote, audit or storage error.
    pub async fn rotate_access_key(&self, name: &str) -> Result<AccessKeyCredential> {
        self.require_identity(name).await?;

        for key in self.store.get_access_keys(name).await? {
            match self
                .identities
                .delete_access_key(name, &key.access_key_id)
                .await
            {
                Ok(()) | Err(ProviderError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
            self.store
                .remove_access_key(name, &key.access_key_id)
                .await?;
        }
        // Keys the provider holds but the store never recorded.
        for key_id in self.identities.list_access_keys(name).await? {
            self.identities.delete_access_key(name, &key_id).await?;
            self.audit(&format!("Deleted unrecorded access key {key_id} of {name}"))?;
        }

        let created = self.identities.create_access_key(name).await?;
        let key = AccessKeyCredential {
            access_key_id: created.access_key_id,
            secret_access_key: created.secret_access_key,
        };
        self.store.add_access_key(name, &key).await?;
        info!(identity = name, key_id = %key.access_key_id, "access key rotated");
        Ok(key)
    }

    /// Primary access key of `name`: the credential its own least-privilege
    /// session is built from. `None` until a key has been issued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on storage failure.
    pub async fn scoped_credentials(&self, name: &str) -> Result<Option<AccessKeyCredential>> {
        Ok(self.store.get_access_keys(name).await?.into_iter().next())
    }

    // ── SSH keys ────────────────────────────────────────────────

    /// Create an SSH key pair named `{name}-{suffix}`.
    ///
    /// Name validity and global uniqueness are checked before the remote
    /// call so a rejected request never leaves an orphaned remote key pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidName`], [`Error::DuplicateSshKey`], or a
    /// remote, audit or storage error.
    pub async fn create_ssh_key(&self, name: &str, suffix: &str) -> Result<SshKeyMaterial> {
        self.require_identity(name).await?;
        let action = format!("create SSH key for {name}");
        let key_name = self
            .naming
            .key_name(name, suffix)
            .map_err(|err| self.store.refuse(&action, err))?;
        if self.store.ssh_key_exists(&key_name).await? {
            return Err(self.store.refuse(&action, Error::DuplicateSshKey(key_name)));
        }

        let created = self.compute.create_key_pair(&key_name).await?;
        let key = SshKeyMaterial {
            key_name: created.key_name,
            private_key: created.private_key,
            fingerprint: created.fingerprint,
        };
        if let Err(err) = self.store.add_ssh_key(name, &key).await {
            // Lost a race with a concurrent creator, or could not audit.
            if let Err(cleanup) = self.compute.delete_key_pair(&key.key_name).await {
                warn!(key = %key.key_name, error = %cleanup, "orphaned remote key pair");
            }
            return Err(err);
        }
        info!(identity = name, key = %key.key_name, "ssh key created");
        Ok(key)
    }

    /// Create `{name}-default` unless it already exists.
    ///
    /// # Errors
    ///
    /// Same as [`SubaccountManager::create_ssh_key`].
    pub async fn ensure_default_ssh_key(&self, name: &str) -> Result<Option<SshKeyMaterial>> {
        let key_name = naming::default_key_name(name);
        if self.store.ssh_key_exists(&key_name).await? {
            return Ok(None);
        }
        self.create_ssh_key(name, naming::DEFAULT_KEY_SUFFIX)
            .await
            .map(Some)
    }

    /// Delete one of `name`'s SSH keys. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdentityMismatch`] if `key_name` is outside `name`'s
    /// namespace, or a remote, audit or storage error.
    pub async fn delete_ssh_key(&self, name: &str, key_name: &str) -> Result<bool> {
        self.require_owned_key(&format!("delete SSH key {key_name}"), name, key_name)?;
        if self.store.get_ssh_key(name, key_name).await?.is_none() {
            return Ok(false);
        }
        self.compute.delete_key_pair(key_name).await?;
        self.store.remove_ssh_key(name, key_name).await
    }

    /// Write `name`'s private key to `{dir}/{key_name}.pem`, created as the
    /// real invoking user with mode 0600, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdentityMismatch`] (audited) for a key outside
    /// `name`'s namespace, [`Error::UnknownSshKey`] if the key is not held,
    /// or [`Error::Filesystem`] if the file cannot be written.
    pub async fn export_ssh_key(
        &self,
        name: &str,
        key_name: &str,
        dir: &Path,
        broker: &PrivilegeBroker,
    ) -> Result<PathBuf> {
        self.require_owned_key(&format!("export SSH key {key_name}"), name, key_name)?;
        let key = self
            .store
            .get_ssh_key(name, key_name)
            .await?
            .ok_or_else(|| Error::UnknownSshKey(key_name.to_owned()))?;

        let path = dir.join(format!("{key_name}.pem"));
        let mut file = broker.write_owned_file(&path, true)?.ok_or_else(|| {
            PrivilegeError::Io {
                op: "create",
                path: path.clone(),
                source: std::io::ErrorKind::AlreadyExists.into(),
            }
        })?;
        file.write_all(key.private_key.expose().as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|source| PrivilegeError::Io {
                op: "write",
                path: path.clone(),
                source,
            })?;

        self.audit(&format!(
            "Exported SSH key {key_name} of {name} to {}",
            path.display()
        ))?;
        Ok(path)
    }

    // ── Passwords ───────────────────────────────────────────────

    /// Stored console password of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownIdentity`] if `name` is not provisioned.
    pub async fn password(&self, name: &str) -> Result<Option<Secret>> {
        self.store
            .get_identity(name)
            .await?
            .map(|record| record.login_password)
            .ok_or_else(|| Error::UnknownIdentity(name.to_owned()))
    }

    /// Change `name`'s console password remotely, then locally.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownIdentity`] if `name` is not provisioned, or a
    /// remote, audit or storage error.
    pub async fn set_password(&self, name: &str, password: &Secret) -> Result<()> {
        self.require_identity(name).await?;
        self.identities.update_login_profile(name, password).await?;
        self.store.set_password(name, password).await
    }

    // ── Deletion ────────────────────────────────────────────────

    /// Remove `name` remotely (best effort) and locally with all its
    /// credentials. Returns whether a local record existed.
    ///
    /// # Errors
    ///
    /// Returns audit or storage errors; remote failures are logged only.
    pub async fn delete_identity(&self, name: &str) -> Result<bool> {
        self.audit(&format!("Deleting user {name}"))?;
        for key in self.store.get_ssh_keys(name).await? {
            if let Err(err) = self.compute.delete_key_pair(&key.key_name).await {
                warn!(key = %key.key_name, error = %err, "could not delete remote key pair");
            }
        }
        self.purge_remote_best_effort(name).await;
        self.store.delete_identity(name).await
    }

    /// Delete every remote user and its local record. Returns the names
    /// processed.
    ///
    /// # Errors
    ///
    /// Returns the error from listing remote users, or the first audit or
    /// storage error.
    pub async fn purge_all(&self) -> Result<Vec<String>> {
        self.audit("Deleting all identities on the account")?;
        let users = self.identities.list_users().await?;
        for user in &users {
            info!(identity = %user, "deleting user");
            self.delete_identity(user).await?;
        }
        Ok(users)
    }

    async fn purge_remote_best_effort(&self, name: &str) {
        if let Err(err) = self.purge_remote(name).await {
            debug!(identity = name, error = %err, "remote purge stopped");
        }
    }

    /// Detach everything from a remote user, then delete it. Credentials go
    /// last-but-one so they cannot mint new ones mid-purge.
    async fn purge_remote(&self, name: &str) -> std::result::Result<(), ProviderError> {
        for policy_name in self.identities.list_user_policies(name).await? {
            self.identities.delete_user_policy(name, &policy_name).await?;
        }
        for group in self.identities.list_groups_for_user(name).await? {
            self.identities.remove_user_from_group(name, &group).await?;
        }
        for certificate in self.identities.list_signing_certificates(name).await? {
            self.identities
                .delete_signing_certificate(name, &certificate)
                .await?;
        }
        for key_id in self.identities.list_access_keys(name).await? {
            self.identities.delete_access_key(name, &key_id).await?;
        }
        match self.identities.delete_login_profile(name).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.identities.delete_user(name).await
    }
}
