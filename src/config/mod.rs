//! Configuration loading and management.
//!
//! Loads configuration from `/etc/classcloud/config.toml` (or
//! `$CLASSCLOUD_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::naming::NamingScheme;

/// Config file used when `$CLASSCLOUD_CONFIG_PATH` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/classcloud/config.toml";

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared store and log locations.
    pub paths: PathsConfig,
    /// Spend ceiling and cost table.
    pub spend: SpendConfig,
    /// Spot fulfillment polling.
    pub launch: LaunchConfig,
    /// Sub-account provisioning policy.
    pub accounts: AccountsConfig,
    /// Remote provider gateway.
    pub provider: ProviderConfig,
    /// How the invoking identity is established.
    pub identity: IdentityConfig,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let mut config = Self::load_from(&Self::config_path_with(env))?;
        config.apply_overrides(env);
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    fn load_from(path: &std::path::Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("CLASSCLOUD_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids `set_var` in tests).
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("CLASSCLOUD_AUDIT_LOG") {
            self.paths.audit_log = PathBuf::from(v);
        }
        if let Some(v) = env("CLASSCLOUD_ACCOUNTS_DB") {
            self.paths.accounts_db = PathBuf::from(v);
        }
        if let Some(v) = env("CLASSCLOUD_USAGE_DB") {
            self.paths.usage_db = PathBuf::from(v);
        }
        if let Some(v) = env("CLASSCLOUD_LOG_DIR") {
            self.paths.log_dir = PathBuf::from(v);
        }
        if let Some(v) = env("CLASSCLOUD_SPEND_LIMIT") {
            match v.parse::<f64>() {
                Ok(n) if n.is_finite() && n >= 0.0 => self.spend.limit = n,
                _ => tracing::warn!(
                    var = "CLASSCLOUD_SPEND_LIMIT",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("CLASSCLOUD_PROVIDER_URL") {
            self.provider.base_url = v;
        }
        if let Some(v) = env("CLASSCLOUD_ROOT_CREDENTIALS") {
            self.provider.credentials_file = PathBuf::from(v);
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error when the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Naming grammar configured for this deployment.
    pub fn naming(&self) -> NamingScheme {
        NamingScheme::new(self.accounts.compound_prefix.clone())
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Locations of the shared durable state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Identity and credential store.
    pub accounts_db: PathBuf,
    /// Usage ledger.
    pub usage_db: PathBuf,
    /// Audit log file.
    pub audit_log: PathBuf,
    /// Directory for diagnostic JSON logs (daemon mode only).
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            accounts_db: PathBuf::from("/var/lib/classcloud/accounts.db"),
            usage_db: PathBuf::from("/var/lib/classcloud/usage.db"),
            audit_log: PathBuf::from("/var/log/classcloud/audit.log"),
            log_dir: PathBuf::from("/var/log/classcloud"),
        }
    }
}

// ── Spend config ────────────────────────────────────────────────

/// Spend ceiling and cost table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpendConfig {
    /// Maximum committed unit cost per hour for one identity.
    pub limit: f64,
    /// Currency per unit-hour, for reports.
    pub cost_base: f64,
    /// Discount applied to spot hours in reports.
    pub spot_factor: f64,
    /// Currency per unit-hour offered as the spot bid.
    pub spot_bid_base: f64,
    /// Unit cost per resource class.
    pub unit_costs: BTreeMap<String, f64>,
}

impl Default for SpendConfig {
    fn default() -> Self {
        Self {
            limit: 60.0,
            cost_base: 0.085,
            spot_factor: 0.7,
            spot_bid_base: 0.086,
            unit_costs: default_unit_costs(),
        }
    }
}

fn default_unit_costs() -> BTreeMap<String, f64> {
    [
        ("m1.small", 1.0),
        ("m1.large", 4.0),
        ("m1.xlarge", 8.0),
        ("t1.micro", 0.2),
        ("m2.xlarge", 5.9),
        ("m2.2xlarge", 11.8),
        ("m2.4xlarge", 23.6),
        ("c1.medium", 2.0),
        ("c1.xlarge", 8.0),
        ("cc1.4xlarge", 18.8),
    ]
    .into_iter()
    .map(|(class, cost)| (class.to_owned(), cost))
    .collect()
}

// ── Launch config ───────────────────────────────────────────────

/// Spot fulfillment polling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Seconds between polls.
    pub poll_interval_secs: u64,
    /// Seconds before giving up on unfulfilled requests.
    pub fulfillment_timeout_secs: u64,
    /// Transient provider errors tolerated while polling.
    pub max_transient_retries: u32,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            fulfillment_timeout_secs: 1200,
            max_transient_retries: 8,
        }
    }
}

impl LaunchConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Fulfillment deadline as a [`Duration`].
    pub fn fulfillment_timeout(&self) -> Duration {
        Duration::from_secs(self.fulfillment_timeout_secs)
    }
}

// ── Accounts config ─────────────────────────────────────────────

/// Sub-account provisioning policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Remote group every provisioned identity joins.
    pub group: String,
    /// Storage bucket whose `{identity}*` prefix the identity may use.
    pub storage_bucket: String,
    /// When set, only identities starting with this prefix are provisioned.
    pub required_prefix: Option<String>,
    /// Names starting with this prefix have two-segment owners.
    pub compound_prefix: Option<String>,
    /// Length of generated login passwords.
    pub password_length: usize,
    /// Users allowed to read other identities' usage reports.
    pub staff: Vec<String>,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            group: "students".to_owned(),
            storage_bucket: "cs61c".to_owned(),
            required_prefix: None,
            compound_prefix: Some("cs".to_owned()),
            password_length: 8,
            staff: Vec::new(),
        }
    }
}

// ── Provider config ─────────────────────────────────────────────

/// Remote provider gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Gateway base URL.
    pub base_url: String,
    /// Root credential file (dotenv format, mode 0600).
    pub credentials_file: PathBuf,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8700".to_owned(),
            credentials_file: PathBuf::from("/etc/classcloud/root.env"),
            request_timeout_secs: 30,
        }
    }
}

// ── Identity config ─────────────────────────────────────────────

/// How the invoking identity is established.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Accept `REAL_USERNAME` from the setuid launcher.
    pub trust_wrapper_env: bool,
}

// ── Tests ───────────────────────────────────────────────────────
