//! BeeCI server

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use beeci_config::SystemConfig;
use beeci_db::{
    BUILDS_CHANNEL, PgBuildRepo, PgChangeFeed, PgRepoRepo, PgUserRepo, create_pool,
    run_migrations,
};
use beeci_github::{AppCredentials, CredentialService, GitHubClient};
use beeci_scheduler::{SimulatedRunner, Worker};
use beeci_server::{AppState, routes};
use beeci_updater::{ChangeListener, Synchronizer};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "beeci")]
#[command(about = "BeeCI build pipeline", long_about = None)]
struct Cli {
    /// Path to the KDL configuration file
    #[arg(long, env = "BEECI_CONFIG")]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Run the webhook server and build worker
    Serve,
    /// Run the check run updater
    Updater,
    /// Run everything in one process
    All,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = Arc::new(
        SystemConfig::load(cli.config.as_deref()).context("Failed to load configuration")?,
    );
    if config.listener.channel != BUILDS_CHANNEL {
        warn!(
            channel = %config.listener.channel,
            trigger_channel = BUILDS_CHANNEL,
            "Listener channel differs from the channel the builds trigger publishes on"
        );
    }

    info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    info!("Database connected");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutting down");
            cancel.cancel();
        }
    });

    let mut tasks = JoinSet::new();
    if matches!(cli.command, Commands::Serve | Commands::All) {
        tasks.spawn(serve(config.clone(), pool.clone(), cancel.clone()));
    }
    if matches!(cli.command, Commands::Updater | Commands::All) {
        tasks.spawn(update(config.clone(), pool.clone(), cancel.clone()));
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined.context("Task panicked").and_then(|result| result) {
            cancel.cancel();
            return Err(e);
        }
    }
    Ok(())
}

/// Webhook server plus the build worker it schedules onto.
async fn serve(
    config: Arc<SystemConfig>,
    pool: PgPool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let worker = Arc::new(Worker::new(
        Arc::new(PgBuildRepo::new(pool.clone())),
        Arc::new(SimulatedRunner::new(config.worker.run_phase)),
        &config.worker,
        cancel.child_token(),
    ));

    let state = AppState::new(
        worker.clone(),
        Arc::new(PgRepoRepo::new(pool.clone())),
        Arc::new(PgUserRepo::new(pool.clone())),
        config.github.webhook_secret.clone(),
    )
    .with_pool(pool);
    if state.webhook_secret.is_none() {
        warn!("No webhook secret configured; deliveries are not authenticated");
    }

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    info!("Starting server on {}", config.listen_addr);
    let listener = TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    worker.shutdown().await;
    Ok(())
}

/// Change listener feeding the check run synchronizer.
async fn update(
    config: Arc<SystemConfig>,
    pool: PgPool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let pem = config
        .github
        .private_key()
        .context("The updater needs the GitHub App private key")?;
    let app = AppCredentials::from_pem(config.github.app_id, pem)
        .context("Invalid GitHub App private key")?;
    let client = Arc::new(GitHubClient::new(config.github.api_url.clone()));
    let tokens = Arc::new(CredentialService::new(
        app,
        client.clone(),
        config.credentials.refresh_margin,
    ));

    let synchronizer = Arc::new(Synchronizer::new(
        Arc::new(PgBuildRepo::new(pool.clone())),
        Arc::new(PgRepoRepo::new(pool.clone())),
        Arc::new(PgUserRepo::new(pool.clone())),
        tokens,
        client,
        &config.github,
    ));

    let listener = ChangeListener::new(
        Arc::new(PgChangeFeed::new(pool)),
        synchronizer,
        config.listener.clone(),
    );
    listener.run(cancel).await;
    Ok(())
}
