//! SymCache Proxy - Main entry point.
//!
//! This binary runs the HTTP server that answers artifact requests and the
//! background worker pool that transcodes asynchronously-requested keys.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use symcache_proxy::cache::CacheRepository;
use symcache_proxy::config::Config;
use symcache_proxy::queue::TranscodeQueue;
use symcache_proxy::server::{build_router, AppState};
use symcache_proxy::symsrv::SymbolServerClient;
use symcache_proxy::transcode::Transcoder;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "symcache_proxy=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "invalid configuration");
            std::process::exit(1);
        }
    };

    tracing::info!(
        symbol_server = %config.symbol_server,
        cache = %config.symcache_directory.display(),
        transcoder = %config.transcoder_path.display(),
        version = %config.transcoder_version,
        "Starting symcache proxy"
    );

    let cache = CacheRepository::new(&config.symcache_directory);
    if let Err(err) = std::fs::create_dir_all(cache.staging_root()) {
        tracing::error!(%err, "failed to create staging directory");
        std::process::exit(1);
    }

    let symbols = SymbolServerClient::new(config.symbol_server.clone());
    let transcoder = Arc::new(Transcoder::new(
        cache.clone(),
        symbols,
        &config.transcoder_path,
    ));

    let queue = TranscodeQueue::new();
    if let Err(err) = queue
        .start(
            Arc::clone(&transcoder),
            TranscodeQueue::default_worker_count(),
        )
        .await
    {
        tracing::error!(%err, "failed to start transcode queue");
        std::process::exit(1);
    }

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        cache,
        transcoder,
        queue.clone(),
        config.transcoder_version.clone(),
        shutdown.clone(),
    );
    let app = build_router(state);

    tracing::info!("Listening on {}", config.listen_addr);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server failed to start");

    // Abort in-flight synchronous transcodes, then drain the worker pool
    // with its bounded per-worker wait. Transcoder children that ignore
    // termination may outlive the process.
    shutdown.cancel();
    queue.stop().await;
}
