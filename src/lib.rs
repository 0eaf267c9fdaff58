//! Classcloud: per-user cloud sub-accounts on a shared root account.
//!
//! Issues scoped credentials (access keys, SSH key pairs) to each identity,
//! refuses launches that would push an identity past its spend ceiling,
//! audits every privileged action, and reconciles live resource state into
//! a local usage ledger for cost reports.
//!
//! See `DESIGN.md` for the component map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod identity;
pub mod logging;
pub mod naming;

pub mod audit;
pub mod privilege;

pub mod provider;

pub mod accounts;
pub mod cost;
pub mod ledger;
pub mod spend;

pub mod launch;
