use std::sync::Arc;

use anyhow::{bail, Context};
use chronicle_common::types::UserId;
use chronicle_server::access::{provision_user, StaticAccessPolicy};
use chronicle_server::admission::AdmissionController;
use chronicle_server::api::{build_router, AppState};
use chronicle_server::config::{AccessConfig, ServerConfig};
use chronicle_server::history::{HistoryStore, KeyedApplier};
use chronicle_server::session::SessionCache;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chronicled", about = "Collaborative document history server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the history API (the default)
    Serve,
    /// Read a password from stdin and print an access-file entry for a new user
    AddUser {
        /// Id the user logs in with
        user_id: String,
        /// Display name (defaults to the id)
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Some(Command::AddUser { user_id, name }) => print_user_entry(user_id, name),
        Some(Command::Serve) | None => serve().await,
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let access = match &config.access_file {
        Some(path) => AccessConfig::load_from(path)
            .with_context(|| format!("failed to load access file {}", path.display()))?,
        None => {
            warn!("CHRONICLE_ACCESS_FILE is not set; no user can log in");
            AccessConfig::default()
        }
    };

    let store = Arc::new(
        HistoryStore::open(config.data_root.clone(), config.archive_root.clone()).context("failed to open history store")?,
    );
    for project in &access.projects {
        store
            .ensure_project(&project.id)
            .await
            .with_context(|| format!("failed to initialize project `{}`", project.id))?;
    }

    let sessions = SessionCache::new(config.session_ttl);
    let sweeper = sessions.spawn_sweeper(config.session_sweep_interval);

    let app = build_router(AppState::new(
        store,
        Arc::new(StaticAccessPolicy::from_config(&access)),
        sessions,
        AdmissionController::from_config(&access),
        Arc::new(KeyedApplier),
    ));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, data_root = %config.data_root.display(), "starting chronicle server");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("chronicle server exited unexpectedly");
    sweeper.abort();
    served
}

fn print_user_entry(user_id: String, name: Option<String>) -> anyhow::Result<()> {
    let id = UserId::new(user_id.clone()).with_context(|| format!("invalid user id `{user_id}`"))?;
    let name = name.unwrap_or(user_id);

    let mut password = String::new();
    std::io::stdin().read_line(&mut password).context("failed to read password from stdin")?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("password must not be empty");
    }

    let entry = provision_user(id, name, password)?.to_access_entry()?;
    print!("{entry}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
