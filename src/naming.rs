//! Ownership grammar for credential and resource names.
//!
//! There are no foreign keys between the account store and the usage ledger:
//! a resource belongs to whichever identity its launch key name parses to.
//!
//! Grammar:
//!
//! ```text
//! owned-name  = owner "-" suffix
//! owner       = segment                    ; plain identities ("u1")
//!             | segment "-" segment        ; when the name starts with the
//!                                          ; compound prefix ("cs61c-ab")
//! segment     = 1*(ALPHA / DIGIT / "_")
//! suffix      = 1*(ALPHA / DIGIT / "_" / "-")
//! ```
//!
//! `u1-default` is owned by `u1`; with compound prefix `cs`,
//! `cs61c-ab-default` is owned by `cs61c-ab`. Names without a suffix own
//! nothing.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Suffix of the key created at provisioning time.
pub const DEFAULT_KEY_SUFFIX: &str = "default";

/// Parses and builds identity-namespaced names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingScheme {
    compound_prefix: Option<String>,
}

impl NamingScheme {
    /// Scheme where names starting with `compound_prefix` have two-segment
    /// owners. `None` or an empty prefix means every owner is one segment.
    pub fn new(compound_prefix: Option<String>) -> Self {
        Self {
            compound_prefix: compound_prefix.filter(|p| !p.is_empty()),
        }
    }

    /// Owning identity of a key or resource name, if it parses.
    pub fn owner_of<'a>(&self, name: &'a str) -> Option<&'a str> {
        let owner_segments: usize = match &self.compound_prefix {
            Some(prefix) if name.starts_with(prefix.as_str()) => 2,
            _ => 1,
        };
        let (split_at, _) = name.match_indices('-').nth(owner_segments.saturating_sub(1))?;
        let owner = &name[..split_at];
        let suffix = &name[split_at.saturating_add(1)..];
        if suffix.is_empty() || owner.split('-').any(|segment| !is_segment(segment)) {
            return None;
        }
        Some(owner)
    }

    /// Whether `name` parses to exactly `identity`.
    pub fn belongs_to(&self, name: &str, identity: &str) -> bool {
        self.owner_of(name) == Some(identity)
    }

    /// Whether `identity` can own names, i.e. its default key parses back to it.
    pub fn is_valid_identity(&self, identity: &str) -> bool {
        identity.split('-').all(is_segment)
            && self.belongs_to(&default_key_name(identity), identity)
    }

    /// Build the full key name for `identity` from a user-supplied suffix.
    ///
    /// Characters outside `[-A-Za-z0-9_]` are dropped, and a suffix that
    /// already carries the `{identity}-` prefix is not prefixed twice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidName`] when nothing usable remains or the
    /// result would not parse back to `identity`.
    pub fn key_name(&self, identity: &str, suffix: &str) -> Result<String> {
        let cleaned = sanitize(suffix);
        let own_prefix = format!("{identity}-");
        let full = if cleaned.starts_with(&own_prefix) {
            cleaned
        } else if cleaned.is_empty() {
            return Err(Error::InvalidName(format!("empty key name suffix {suffix:?}")));
        } else {
            format!("{own_prefix}{cleaned}")
        };
        if !self.belongs_to(&full, identity) {
            return Err(Error::InvalidName(full));
        }
        Ok(full)
    }
}

/// `{identity}-default`.
pub fn default_key_name(identity: &str) -> String {
    format!("{identity}-{DEFAULT_KEY_SUFFIX}")
}

/// Drop every character outside `[-A-Za-z0-9_]`.
pub fn sanitize(raw: &str) -> String {
    static DISALLOWED: OnceLock<Option<Regex>> = OnceLock::new();
    match DISALLOWED.get_or_init(|| Regex::new(r"[^-a-zA-Z0-9_]").ok()) {
        Some(regex) => regex.replace_all(raw, "").into_owned(),
        None => raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect(),
    }
}

fn is_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
