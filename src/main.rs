//! Classcloud CLI entry point.
//!
//! Runs on behalf of the real invoking user (possibly through a setuid
//! wrapper). Every command acts on that user's own identity unless the user
//! is listed as staff.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info, Instrument};

use classcloud::accounts::manager::generate_password;
use classcloud::accounts::{AccountStore, SubaccountManager};
use classcloud::audit::AuditLog;
use classcloud::config::Config;
use classcloud::cost::CostModel;
use classcloud::credentials::{load_root_credentials, Secret};
use classcloud::identity::RealIdentity;
use classcloud::launch::{LaunchOrchestrator, LaunchOutcome, LaunchRequest};
use classcloud::ledger::report::{ReportOptions, ReportWindow};
use classcloud::ledger::{ReconcileScope, UsageLedger};
use classcloud::naming::default_key_name;
use classcloud::privilege::PrivilegeBroker;
use classcloud::provider::http::HttpCloudClient;
use classcloud::provider::ComputeProvider;
use classcloud::spend::SpendGuard;

/// Directory under the user's home where keys are exported by default.
const KEY_DIR: &str = ".classcloud";

/// Classcloud: per-user cloud sub-accounts with spend limits.
#[derive(Parser)]
#[command(name = "classcloud", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Provision your sub-account, access key and default SSH key.
    Init,
    /// Replace your access key with a fresh one.
    Rotate,
    /// Manage SSH key pairs.
    #[command(subcommand)]
    SshKey(SshKeyCommand),
    /// Show or change your console password.
    #[command(subcommand)]
    Password(PasswordCommand),
    /// Delete your sub-account and every credential it holds.
    DeleteAccount {
        /// Delete every sub-account on the root account (staff only).
        #[arg(long)]
        all: bool,
    },
    /// List your access keys and SSH keys.
    List,
    /// Print shell exports for a session under your own sub-account.
    Env,
    /// Launch resources from a JSON request read on stdin.
    Launch {
        /// For spot requests, wait until every request is running.
        #[arg(long)]
        wait: bool,
    },
    /// Wait for spot requests to be fulfilled.
    WaitSpot {
        /// Spot request ids.
        #[arg(required = true)]
        request_ids: Vec<String>,
        /// Give up after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show your running instances and open spot requests.
    Active,
    /// Terminate all your instances.
    TerminateAll,
    /// Cancel all your open spot requests.
    CancelSpot,
    /// Pull live resource state into the usage ledger.
    Reconcile {
        /// Unattended run: JSON file logging, whole-account scope.
        #[arg(long)]
        service: bool,
    },
    /// Print estimated spending.
    Report(ReportArgs),
}

/// SSH key subcommands.
#[derive(Subcommand)]
enum SshKeyCommand {
    /// Create a key pair named `<you>-<suffix>` and export it.
    Create {
        /// Name suffix.
        suffix: String,
        /// Export directory (default `~/.classcloud`).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Delete one of your key pairs.
    Delete {
        /// Full key name.
        key_name: String,
    },
    /// Write one of your private keys to `<dir>/<key_name>.pem`.
    Export {
        /// Full key name.
        key_name: String,
        /// Export directory (default `~/.classcloud`).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

/// Password subcommands.
#[derive(Subcommand)]
enum PasswordCommand {
    /// Print the stored console password.
    Show,
    /// Set a new password read from stdin; an empty line generates one.
    Set,
}

/// Report options.
#[derive(Args)]
struct ReportArgs {
    /// Totals for every identity (staff only).
    #[arg(long, conflicts_with = "identity")]
    all: bool,
    /// Report on another identity (staff only).
    #[arg(long)]
    identity: Option<String>,
    /// Only count usage from this RFC 3339 time on.
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    /// Only count usage before this RFC 3339 time.
    #[arg(long)]
    until: Option<DateTime<Utc>>,
    /// Skip running resources and pending spot requests.
    #[arg(long)]
    finished_only: bool,
    /// Report from the ledger without refreshing live state first.
    #[arg(long)]
    no_refresh: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    let _logging_guard = match &cli.command {
        Command::Reconcile { service: true } => {
            Some(classcloud::logging::init_service(&config.paths.log_dir)?)
        }
        _ => {
            classcloud::logging::init_cli();
            None
        }
    };

    let app = App::new(config);
    let span = classcloud::logging::run_span(&app.actor, cli.command.name());
    dispatch(&app, cli.command).instrument(span).await
}

async fn dispatch(app: &App, command: Command) -> anyhow::Result<()> {
    debug!("resolved invoking identity");
    match command {
        Command::Init => handle_init(app).await,
        Command::Rotate => handle_rotate(app).await,
        Command::SshKey(command) => handle_ssh_key(app, command).await,
        Command::Password(command) => handle_password(app, command).await,
        Command::DeleteAccount { all } => handle_delete_account(app, all).await,
        Command::List => handle_list(app).await,
        Command::Env => handle_env(app).await,
        Command::Launch { wait } => handle_launch(app, wait).await,
        Command::WaitSpot {
            request_ids,
            timeout,
        } => handle_wait_spot(app, &request_ids, timeout).await,
        Command::Active => handle_active(app).await,
        Command::TerminateAll => handle_terminate_all(app).await,
        Command::CancelSpot => handle_cancel_spot(app).await,
        Command::Reconcile { service } => handle_reconcile(app, service).await,
        Command::Report(args) => handle_report(app, args).await,
    }
}

impl Command {
    /// Subcommand name as typed, for log context.
    fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Rotate => "rotate",
            Self::SshKey(_) => "ssh-key",
            Self::Password(_) => "password",
            Self::DeleteAccount { .. } => "delete-account",
            Self::List => "list",
            Self::Env => "env",
            Self::Launch { .. } => "launch",
            Self::WaitSpot { .. } => "wait-spot",
            Self::Active => "active",
            Self::TerminateAll => "terminate-all",
            Self::CancelSpot => "cancel-spot",
            Self::Reconcile { .. } => "reconcile",
            Self::Report(_) => "report",
        }
    }
}

/// Shared wiring for every command.
struct App {
    config: Config,
    actor: RealIdentity,
    audit: Arc<AuditLog>,
}

impl App {
    fn new(config: Config) -> Self {
        let actor = RealIdentity::resolve(config.identity.trust_wrapper_env);
        let audit = Arc::new(AuditLog::new(config.paths.audit_log.clone()));
        Self {
            config,
            actor,
            audit,
        }
    }

    fn me(&self) -> &str {
        self.actor.name()
    }

    fn is_staff(&self) -> bool {
        self.config.accounts.staff.iter().any(|s| s == self.me())
    }

    fn require_staff(&self, what: &str) -> anyhow::Result<()> {
        if !self.is_staff() {
            self.audit
                .record_rejection(&self.actor, &format!("{what} requires staff"))?;
            bail!("{what} is restricted to staff");
        }
        Ok(())
    }

    fn cloud(&self) -> anyhow::Result<Arc<HttpCloudClient>> {
        let path = &self.config.provider.credentials_file;
        let credentials = load_root_credentials(path)
            .with_context(|| format!("failed to load root credentials from {}", path.display()))?;
        Ok(Arc::new(HttpCloudClient::new(&self.config.provider, credentials)?))
    }

    async fn manager(&self) -> anyhow::Result<SubaccountManager> {
        let cloud = self.cloud()?;
        let store = AccountStore::open(
            &self.config.paths.accounts_db,
            Arc::clone(&self.audit),
            self.actor.clone(),
        )
        .await
        .context("failed to open account store")?;
        Ok(SubaccountManager::new(
            store,
            cloud.clone(),
            cloud,
            self.config.accounts.clone(),
        ))
    }

    async fn ledger(&self) -> anyhow::Result<UsageLedger> {
        UsageLedger::open(&self.config.paths.usage_db, self.config.naming())
            .await
            .context("failed to open usage ledger")
    }

    fn cost_model(&self) -> CostModel {
        CostModel::from_config(&self.config.spend)
    }

    async fn orchestrator(&self) -> anyhow::Result<LaunchOrchestrator> {
        let guard = SpendGuard::new(self.ledger().await?, self.cost_model(), self.config.spend.limit);
        Ok(LaunchOrchestrator::new(
            self.cloud()?,
            guard,
            Arc::clone(&self.audit),
            self.actor.clone(),
            self.config.launch.clone(),
        ))
    }

    fn key_dir(&self, dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
        let dir = match dir {
            Some(dir) => dir,
            None => self
                .actor
                .home_dir()
                .context("cannot determine home directory; pass --dir")?
                .join(KEY_DIR),
        };
        PrivilegeBroker::new().ensure_owned_dir(&dir)?;
        Ok(dir)
    }
}

async fn handle_init(app: &App) -> anyhow::Result<()> {
    let manager = app.manager().await?;
    let me = app.me();
    if manager.provision(me).await? {
        println!("Provisioned sub-account {me}");
    } else {
        println!("Sub-account {me} already provisioned");
    }

    let key = match manager.scoped_credentials(me).await? {
        Some(key) => key,
        None => manager.rotate_access_key(me).await?,
    };
    println!("Access key id: {}", key.access_key_id);

    if manager.ensure_default_ssh_key(me).await?.is_some() {
        let dir = app.key_dir(None)?;
        let path = manager
            .export_ssh_key(me, &default_key_name(me), &dir, &PrivilegeBroker::new())
            .await?;
        println!("Default SSH key written to {}", path.display());
    }
    Ok(())
}

async fn handle_env(app: &App) -> anyhow::Result<()> {
    let me = app.me();
    let Some(key) = app.manager().await?.scoped_credentials(me).await? else {
        bail!("no access key for {me}; run `classcloud init` or `classcloud rotate` first");
    };
    println!("export CLASSCLOUD_PROVIDER_URL={}", app.config.provider.base_url);
    println!("export CLASSCLOUD_ACCESS_KEY_ID={}", key.access_key_id);
    println!(
        "export CLASSCLOUD_SECRET_ACCESS_KEY={}",
        key.secret_access_key.expose()
    );
    info!(key_id = %key.access_key_id, "issued session exports");
    Ok(())
}

async fn handle_rotate(app: &App) -> anyhow::Result<()> {
    let key = app.manager().await?.rotate_access_key(app.me()).await?;
    println!("ACCESS_KEY_ID={}", key.access_key_id);
    println!("SECRET_ACCESS_KEY={}", key.secret_access_key.expose());
    Ok(())
}

async fn handle_ssh_key(app: &App, command: SshKeyCommand) -> anyhow::Result<()> {
    let manager = app.manager().await?;
    let me = app.me();
    match command {
        SshKeyCommand::Create { suffix, dir } => {
            let key = manager.create_ssh_key(me, &suffix).await?;
            let dir = app.key_dir(dir)?;
            let path = manager
                .export_ssh_key(me, &key.key_name, &dir, &PrivilegeBroker::new())
                .await?;
            println!("{} ({}) written to {}", key.key_name, key.fingerprint, path.display());
        }
        SshKeyCommand::Delete { key_name } => {
            if manager.delete_ssh_key(me, &key_name).await? {
                println!("Deleted {key_name}");
            } else {
                println!("No key named {key_name}");
            }
        }
        SshKeyCommand::Export { key_name, dir } => {
            let dir = app.key_dir(dir)?;
            let path = manager
                .export_ssh_key(me, &key_name, &dir, &PrivilegeBroker::new())
                .await?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn handle_password(app: &App, command: PasswordCommand) -> anyhow::Result<()> {
    let manager = app.manager().await?;
    let me = app.me();
    match command {
        PasswordCommand::Show => match manager.password(me).await? {
            Some(password) => println!("{}", password.expose()),
            None => println!("(no password set)"),
        },
        PasswordCommand::Set => {
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("failed to read password from stdin")?;
            let entered = line.trim_end_matches(['\r', '\n']);
            let password = if entered.is_empty() {
                generate_password(app.config.accounts.password_length)
            } else {
                Secret::new(entered)
            };
            manager.set_password(me, &password).await?;
            println!("{}", password.expose());
        }
    }
    Ok(())
}

async fn handle_delete_account(app: &App, all: bool) -> anyhow::Result<()> {
    let manager = app.manager().await?;
    if all {
        app.require_staff("deleting every account")?;
        let names = manager.purge_all().await?;
        println!("Deleted {} account(s)", names.len());
        return Ok(());
    }
    if manager.delete_identity(app.me()).await? {
        println!("Deleted sub-account {}", app.me());
    } else {
        println!("No local record for {}; remote cleanup attempted", app.me());
    }
    Ok(())
}

async fn handle_list(app: &App) -> anyhow::Result<()> {
    let manager = app.manager().await?;
    let store = manager.store();
    let me = app.me();
    for key in store.get_access_keys(me).await? {
        println!("access-key {}", key.access_key_id);
    }
    for key in store.get_ssh_keys(me).await? {
        println!("ssh-key    {} {}", key.key_name, key.fingerprint);
    }
    Ok(())
}

async fn handle_launch(app: &App, wait: bool) -> anyhow::Result<()> {
    let request: LaunchRequest = serde_json::from_reader(std::io::stdin().lock())
        .context("failed to parse launch request JSON from stdin")?;
    let orchestrator = app.orchestrator().await?;
    match orchestrator.launch(app.me(), &request).await? {
        LaunchOutcome::Instances(ids) => {
            for id in ids {
                println!("{id}");
            }
        }
        LaunchOutcome::SpotRequests(ids) => {
            if wait {
                for id in orchestrator.await_fulfillment_default(&ids).await? {
                    println!("{id}");
                }
            } else {
                for id in ids {
                    println!("{id}");
                }
            }
        }
    }
    Ok(())
}

async fn handle_wait_spot(
    app: &App,
    request_ids: &[String],
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let orchestrator = app.orchestrator().await?;
    let instances = match timeout {
        Some(secs) => {
            orchestrator
                .await_fulfillment(request_ids, Duration::from_secs(secs))
                .await?
        }
        None => orchestrator.await_fulfillment_default(request_ids).await?,
    };
    for id in instances {
        println!("{id}");
    }
    Ok(())
}

async fn handle_active(app: &App) -> anyhow::Result<()> {
    let active = app.orchestrator().await?.active(app.me()).await?;
    for instance in &active.instances {
        println!(
            "{} {:>10} {:<13} {}",
            instance.id,
            instance.instance_type,
            instance.state.as_str(),
            if instance.is_spot() { "spot" } else { "demand" }
        );
    }
    for request in &active.spot_requests {
        println!("{} {:>10} open", request.id, request.instance_type);
    }
    Ok(())
}

async fn handle_terminate_all(app: &App) -> anyhow::Result<()> {
    let ids = app.orchestrator().await?.terminate_all(app.me()).await?;
    println!("Terminating {} instance(s)", ids.len());
    Ok(())
}

async fn handle_cancel_spot(app: &App) -> anyhow::Result<()> {
    let ids = app.orchestrator().await?.cancel_spot_requests(app.me()).await?;
    println!("Cancelled {} spot request(s)", ids.len());
    Ok(())
}

async fn handle_reconcile(app: &App, service: bool) -> anyhow::Result<()> {
    let scope = if service || app.is_staff() {
        ReconcileScope::All
    } else {
        ReconcileScope::Identity(app.me().to_owned())
    };
    let cloud = app.cloud()?;
    let summary = app
        .ledger()
        .await?
        .reconcile(cloud.as_ref(), &scope, Utc::now())
        .await?;
    info!(?summary, "reconcile finished");
    if !service {
        println!(
            "{} instance(s), {} pending spot request(s)",
            summary.instances, summary.pending_requests
        );
    }
    Ok(())
}

async fn handle_report(app: &App, args: ReportArgs) -> anyhow::Result<()> {
    let ledger = app.ledger().await?;
    let cost = app.cost_model();
    let window = ReportWindow::between(args.since, args.until);
    let now = Utc::now();

    if args.all {
        app.require_staff("aggregate report")?;
        println!("{}", ledger.aggregate_report(&cost, &window, now).await?);
        return Ok(());
    }

    let identity = match args.identity {
        Some(other) if other != app.me() => {
            app.require_staff("report on another identity")?;
            other
        }
        _ => app.me().to_owned(),
    };
    let options = ReportOptions {
        include_pending: !args.finished_only,
        window,
    };
    let cloud = if args.no_refresh {
        None
    } else {
        Some(app.cloud()?)
    };
    let live = cloud.as_deref().map(|c| c as &dyn ComputeProvider);
    let report = ledger
        .user_report(&identity, &cost, &options, live, now)
        .await?;
    println!("{report}");
    Ok(())
}
