mod api;
mod config;
mod feeds;
mod gpodder;
mod jobs;
mod podcasts;
mod radio;
mod scan;
mod settings;
mod state;
mod streaming;
mod utils;

#[cfg(test)]
mod test_support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use api::api_router;
use axum::Router;
use catalog::Catalog;
use config::{config_path_from_env, load_or_create_config, resolve_path};
use jobs::{start_scheduler, start_worker, JobQueue};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use settings::SettingsStore;
use state::AppState;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }
    if config.users.is_empty() {
        warn!("No users configured; every API call except /health will be rejected.");
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let index_path = resolve_path(&config_path, &config.index_path);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let catalog = Catalog::open(&index_path)?;
    let settings = SettingsStore::new(catalog.db());
    if let Err(err) = settings.init_tables() {
        warn!("Failed to create settings table: {}", err);
    }

    let client = Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(Duration::from_secs(config.external_timeout_secs.max(1)))
        .build()?;
    let (jobs, receiver) = JobQueue::new();
    let state = AppState {
        catalog,
        settings,
        config_path,
        config: Arc::new(RwLock::new(config)),
        client,
        jobs,
        downloads: Arc::new(Mutex::new(HashSet::new())),
    };
    start_worker(state.clone(), receiver);
    start_scheduler(state.clone());

    let app = Router::new()
        .nest("/api/v1", api_router(state))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
