//! Verity CLI - inspect and drive the persisted session from a terminal.
//!
//! The session lives in a SQLite-backed store so consecutive invocations
//! behave like reloads of the same tab.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::debug;
use verity_auth::impersonation::{IMPERSONATION_STATE_KEY, ImpersonationState};
use verity_auth::session::{SESSION_KEY, Session};
use verity_auth::{
    AuthCoordinator, AuthSettings, Collaborators, FixedSignal, HttpAuthorizationClient,
    HttpIdentityClient, Navigation, NavigationLog, RolePolicy, VerificationResult,
};
use verity_core::config::{self, Config};
use verity_core::event::{BroadcastEventBus, EventBus, EventSubscription};
use verity_storage::{SharedStorage, TabId, TabStorage};

mod telemetry;

const TAB_NAME: &str = "cli";

/// Verity - session verification and impersonation from the command line
#[derive(Parser)]
#[command(name = "verity")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Session database (default: `storage.path`, then the platform data directory)
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,

    /// Log debug output from every component
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the persisted session without contacting the identity service
    Status,
    /// Verify the session against the identity service
    Verify,
    /// Refresh the session now
    Refresh,
    /// Sign out and clear the persisted session
    SignOut,
    /// Start impersonating another user (administrators only)
    Impersonate {
        /// Target user id or email
        target: String,

        /// Reason recorded in the audit log
        #[arg(short, long)]
        reason: String,
    },
    /// End the active impersonation and clear local state
    EndImpersonation,
    /// Drop cached verification and tab-local state, then verify again
    ClearCaches,
    /// Print the configuration file path
    ConfigPath,
}

type Coordinator = AuthCoordinator<HttpIdentityClient, HttpAuthorizationClient>;

/// Everything one invocation needs.
struct Runtime {
    coordinator: Coordinator,
    navigator: Arc<NavigationLog>,
    events: EventSubscription,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::ConfigPath = cli.command {
        println!("{}", config_path(&cli).display());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => config::load_config_from(path.clone()),
        None => config::load_config(),
    }
    .with_context(|| format!("failed to load {}", config_path(&cli).display()))?;
    telemetry::init(&config.logging.level, cli.verbose);

    let storage_path = storage_path(&cli, &config);
    debug!(path = %storage_path.display(), "opening session store");
    let shared = SharedStorage::open_sqlite(&storage_path)
        .with_context(|| format!("failed to open {}", storage_path.display()))?
        .tab(TabId::named(TAB_NAME));
    let tab_path = storage_path.with_extension("tab.db");
    let local = SharedStorage::open_sqlite(&tab_path)
        .with_context(|| format!("failed to open {}", tab_path.display()))?
        .tab(TabId::named(TAB_NAME));

    match cli.command {
        Commands::Status => run_status(&shared, &local),
        Commands::ConfigPath => Ok(()),
        command => {
            let mut runtime = connect(&config, shared, local)?;
            let outcome = run_command(&config, &runtime.coordinator, command).await;
            report_navigation(&runtime.navigator);
            drain_events(&mut runtime.events);
            outcome
        }
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(config::config_path)
}

fn storage_path(cli: &Cli, config: &Config) -> PathBuf {
    cli.storage
        .clone()
        .or_else(|| config.storage.path.as_ref().map(PathBuf::from))
        .unwrap_or_else(config::default_storage_path)
}

/// Stable per-machine signal used for device binding.
fn host_signal() -> FixedSignal {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string());
    FixedSignal::new(format!(
        "{host}/{}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    ))
}

fn connect(config: &Config, shared: TabStorage, local: TabStorage) -> Result<Runtime> {
    let timeout = Duration::from_secs(config.identity.request_timeout_secs);
    let identity = HttpIdentityClient::new(
        &config.identity.url,
        config.identity.api_key.clone(),
        timeout,
        shared.clone(),
    )
    .context("invalid identity service settings")?;

    let authorization_url = config
        .authorization
        .url
        .clone()
        .unwrap_or_else(|| config.identity.url.clone());
    let authority = HttpAuthorizationClient::new(&authorization_url, timeout)
        .context("invalid authorization endpoint settings")?;

    let event_bus: Arc<dyn EventBus> =
        Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));
    let events = event_bus
        .subscribe("**")
        .context("failed to subscribe to auth events")?;
    let navigator = Arc::new(NavigationLog::new());

    let coordinator = AuthCoordinator::new(
        AuthSettings::from_config(config),
        Collaborators {
            identity: Arc::new(identity),
            authority: Arc::new(authority),
            policy: Arc::new(RolePolicy::new(config.authorization.admin_roles.clone())),
            navigator: navigator.clone(),
            device_signal: Arc::new(host_signal()),
            shared_storage: shared,
            tab_storage: local,
            event_bus: Some(event_bus),
        },
    );

    Ok(Runtime {
        coordinator,
        navigator,
        events,
    })
}

async fn run_command(config: &Config, coordinator: &Coordinator, command: Commands) -> Result<()> {
    match command {
        Commands::Verify => {
            let result = coordinator.verify_session().await?;
            print_verification(&result)?;
        }
        Commands::Refresh => {
            let session = coordinator.verifier().refresh_session().await?;
            println!("Session refreshed for {}.", session.user_id);
            println!("Expires: {}", session.expires_at.to_rfc3339());
        }
        Commands::SignOut => {
            coordinator.sign_out("signed out from the command line").await;
            println!("Signed out.");
        }
        Commands::Impersonate { target, reason } => {
            require_authorization_endpoint(config)?;
            let state = coordinator.start_impersonation(&target, &reason).await?;
            println!(
                "Impersonating {} ({}) as {}.",
                state.target,
                state.target_user_id.as_deref().unwrap_or("unknown id"),
                state.admin.user_id
            );
            println!("Run 'verity end-impersonation' to return to your own account.");
        }
        Commands::EndImpersonation => {
            require_authorization_endpoint(config)?;
            coordinator.end_impersonation().await?;
            println!("Impersonation ended. Sign in again to continue.");
        }
        Commands::ClearCaches => {
            let result = coordinator.clear_caches().await?;
            print_verification(&result)?;
        }
        Commands::Status | Commands::ConfigPath => {}
    }
    Ok(())
}

fn require_authorization_endpoint(config: &Config) -> Result<()> {
    if config.authorization.url.is_none() {
        bail!("authorization.url is not configured; impersonation is unavailable");
    }
    Ok(())
}

fn run_status(shared: &TabStorage, local: &TabStorage) -> Result<()> {
    let session: Option<Session> = shared
        .get_json(SESSION_KEY)
        .context("persisted session is unreadable")?;
    let Some(session) = session else {
        println!("Not signed in.");
        return Ok(());
    };

    println!("User: {}", session.user_id);
    println!("Expires: {}", session.expires_at.to_rfc3339());
    if session.is_expired() {
        println!("The access token has expired; run 'verity refresh' or 'verity verify'.");
    }

    let impersonation: Option<ImpersonationState> = local
        .get_json(IMPERSONATION_STATE_KEY)
        .context("impersonation state is unreadable")?;
    if let Some(state) = impersonation.filter(ImpersonationState::is_complete) {
        println!(
            "Impersonating {} on behalf of {} since {} ({})",
            state.target,
            state.admin.user_id,
            state.started_at.to_rfc3339(),
            state.reason
        );
    }
    Ok(())
}

fn print_verification(result: &VerificationResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

fn report_navigation(navigator: &NavigationLog) {
    for navigation in navigator.entries() {
        match navigation {
            Navigation::Redirect(path) | Navigation::Hard(path) => println!("Next: open {path}"),
            Navigation::Reload => println!("Next: reload"),
        }
    }
}

fn drain_events(events: &mut EventSubscription) {
    while let Some(event) = events.try_recv() {
        debug!(channel = %event.channel, payload = ?event.payload, "auth event");
    }
}
