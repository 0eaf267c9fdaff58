//! Diagnostic logging.
//!
//! Diagnostic logs are separate from the audit log: they are for operators,
//! may be filtered or dropped, and never carry secrets. Every event of a run
//! is recorded under a [`run_span`] naming the real invoking identity and
//! the subcommand, so interleaved runs from different users can be told
//! apart.
//!
//! - [`init_cli`]: stderr only, default `warn` so stdout stays parseable
//! - [`init_service`]: JSON lines in `{log_dir}/reconcile.log.YYYY-MM-DD`
//!   plus stderr, for unattended reconciliation from cron

use std::path::Path;

use anyhow::Context;
use tracing::Span;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::identity::RealIdentity;

/// File name prefix for rotated service logs.
const SERVICE_LOG_PREFIX: &str = "reconcile.log";

/// Dependencies that chatter at `info`; their warnings still come through.
const QUIET_DEPENDENCIES: &[&str] = &["sqlx=warn", "hyper=warn", "reqwest=warn"];

/// Keeps the service log writer alive. Dropping it flushes pending lines.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// `RUST_LOG` if set, else `default_level` with dependencies quietened.
fn env_filter(default_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(EnvFilter::new(default_level), EnvFilter::add_directive)
}

/// Create the service log directory, private to the service account.
fn create_log_dir(log_dir: &Path) -> anyhow::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))
}

/// Initialise JSON file plus stderr logging for unattended runs.
///
/// Each JSON line carries the fields of the enclosing [`run_span`].
///
/// # Errors
///
/// Returns an error if the log directory cannot be created.
pub fn init_service(log_dir: &Path) -> anyhow::Result<LoggingGuard> {
    create_log_dir(log_dir)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, SERVICE_LOG_PREFIX));
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(json_layer)
        .with(console_layer)
        .init();

    Ok(LoggingGuard { _guard: guard })
}

/// Initialise stderr logging for interactive subcommands.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_writer(std::io::stderr)
        .init();
}

/// Span covering one invocation of `command` by `actor`.
pub fn run_span(actor: &RealIdentity, command: &'static str) -> Span {
    tracing::info_span!("run", actor = %actor.name(), command)
}
