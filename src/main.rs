//! Homu - main entry point.
//!
//! Loads the TOML configuration, rehydrates per-repository state from the
//! store, spawns one supervisor per repository and serves the webhook
//! endpoints until a shutdown signal arrives.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use homu::config::Config;
use homu::host::{GithubHost, HostApi};
use homu::server::{AppState, build_router};
use homu::store::Store;
use homu::types::{PullRequest, RepoLabel};
use homu::worker::Dispatcher;

/// Resolves the config file path: first CLI argument, then `HOMU_CONFIG`,
/// then `./cfg.toml`.
fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HOMU_CONFIG").ok())
        .unwrap_or_else(|| "cfg.toml".to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "homu=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path();
    tracing::info!(path = %path, "Loading configuration");
    let config = Config::load(&path)?;

    let store = Arc::new(Store::open(&config.db.path)?);

    // Rehydrate everything persisted, grouped per repository.
    let mut rows_by_repo: HashMap<RepoLabel, Vec<PullRequest>> = HashMap::new();
    for pr in store.load_all()? {
        rows_by_repo.entry(pr.repo.clone()).or_default().push(pr);
    }
    tracing::info!(
        repos = config.repo.len(),
        tracked_prs = rows_by_repo.values().map(Vec::len).sum::<usize>(),
        "State rehydrated"
    );

    let shutdown = CancellationToken::new();
    let mut dispatcher = Dispatcher::new(shutdown.clone());

    for (label, repo_cfg) in &config.repo {
        let label = RepoLabel::new(label.clone());
        let host = GithubHost::from_token(
            config.github.access_token.clone(),
            repo_cfg.owner.clone(),
            repo_cfg.name.clone(),
        )?;
        let rows = rows_by_repo.remove(&label).unwrap_or_default();
        dispatcher.register(
            label,
            repo_cfg.clone(),
            config.bot.trigger.clone(),
            store.clone(),
            Arc::new(host) as Arc<dyn HostApi>,
            rows,
        );
    }

    let dispatcher = Arc::new(dispatcher);
    let listen = config.server.listen;
    let app = build_router(AppState::new(config, dispatcher.clone()));

    tracing::info!(listen = %listen, "Listening");
    let listener = tokio::net::TcpListener::bind(listen).await?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, draining supervisors");
            server_shutdown.cancel();
        })
        .await?;

    // Intake has stopped accepting; let the supervisors drain their queues
    // before the store handle is dropped.
    match Arc::try_unwrap(dispatcher) {
        Ok(dispatcher) => dispatcher.shutdown().await,
        Err(_) => tracing::warn!("Dispatcher still referenced at shutdown"),
    }

    tracing::info!("Stopped cleanly");
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
