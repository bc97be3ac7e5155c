mod adapter;
mod config;
mod error;
mod reaper;
mod routes;
mod store;

use std::{path::Path, sync::Arc};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    adapter::YtDlpFetcher, config::Config, error::ApiError, routes::AppState, store::FileStore,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidvault=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::load_or_create(Path::new("config.json")).await?;
    let store = FileStore::new(&config.downloads_dir).await?;
    let fetcher = Arc::new(YtDlpFetcher::new()?);

    let shutdown = CancellationToken::new();
    let reaper = reaper::spawn(
        store.clone(),
        config.ttl,
        config.sweep_interval,
        shutdown.clone(),
    );

    let addr = config.bind_addr.clone();
    let state = AppState::new(Arc::new(config), store, fetcher);
    let app = routes::build_router(state);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("vidvault ready on http://{addr}");
    info!("endpoints: /api/health /api/info /api/download /downloads/{{name}}");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down");
                shutdown.cancel();
            }
        })
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")));

    shutdown.cancel();
    let _ = reaper.await;

    serve_result
}
