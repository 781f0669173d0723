//! HTTP surface of the symcache proxy.
//!
//! This module wires the cache, the transcode orchestrator, and the
//! background queue into an axum router.
//!
//! # Endpoints
//!
//! - `GET /v{major}.{minor}.{patch}/{name}/{id}[/{age}]` - artifact retrieval
//! - `GET /health` - liveness probe
//! - `GET /status` - background queue observability

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub mod artifact;
pub mod status;

pub use artifact::{artifact_handler, artifact_handler_default_age};
pub use status::{health_handler, status_handler};

use crate::cache::CacheRepository;
use crate::queue::TranscodeQueue;
use crate::symsrv::SymbolSource;
use crate::transcode::Transcoder;
use crate::types::FormatVersion;

/// Shared application state, passed to all handlers via axum's `State`
/// extractor.
pub struct AppState<S> {
    inner: Arc<AppStateInner<S>>,
}

// Manual impl: `#[derive(Clone)]` would needlessly require `S: Clone`.
impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct AppStateInner<S> {
    /// The artifact cache, shared with the orchestrator.
    cache: CacheRepository,

    /// Orchestrator for synchronous request-path transcodes; the same
    /// instance drives the background queue's workers.
    transcoder: Arc<Transcoder<S>>,

    /// Background transcode queue.
    queue: TranscodeQueue,

    /// The format version the transcoder binary emits. Immutable after
    /// startup; every cache key is built with it.
    transcoder_version: FormatVersion,

    /// Server-wide shutdown token, propagated into synchronous transcodes.
    shutdown: CancellationToken,
}

impl<S> AppState<S> {
    /// Creates the application state.
    pub fn new(
        cache: CacheRepository,
        transcoder: Arc<Transcoder<S>>,
        queue: TranscodeQueue,
        transcoder_version: FormatVersion,
        shutdown: CancellationToken,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                cache,
                transcoder,
                queue,
                transcoder_version,
                shutdown,
            }),
        }
    }

    /// Returns the artifact cache.
    pub fn cache(&self) -> &CacheRepository {
        &self.inner.cache
    }

    /// Returns the transcode orchestrator.
    pub fn transcoder(&self) -> &Transcoder<S> {
        &self.inner.transcoder
    }

    /// Returns the background transcode queue.
    pub fn queue(&self) -> &TranscodeQueue {
        &self.inner.queue
    }

    /// Returns the format version the transcoder emits.
    pub fn transcoder_version(&self) -> &FormatVersion {
        &self.inner.transcoder_version
    }

    /// Returns the server-wide shutdown token.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.inner.shutdown
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<S: SymbolSource>(state: AppState<S>) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler::<S>))
        .route("/{version}/{name}/{id}", get(artifact_handler_default_age::<S>))
        .route("/{version}/{name}/{id}/{age}", get(artifact_handler::<S>))
        .with_state(state)
}
