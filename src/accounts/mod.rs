//! Identity and credential management.
//!
//! - [`store::AccountStore`]: durable, audited record of identities, access
//!   keys and SSH keys
//! - [`manager::SubaccountManager`]: lifecycle orchestration against the
//!   remote identity provider
//! - [`policy`]: least-privilege policy template

pub mod manager;
pub mod policy;
pub mod store;

pub use manager::SubaccountManager;
pub use store::{AccessKeyCredential, AccountStore, IdentityRecord, SshKeyMaterial};
