//! Observability endpoints: liveness and background-queue state.
//!
//! Neither endpoint touches the cache or the upstream symbol server; both
//! answer from in-process state only, so a probe can never be slowed down by
//! a transcode in progress.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::symsrv::SymbolSource;

/// Liveness handler.
///
/// 200 here means the HTTP layer is up and dispatching; it says nothing
/// about the upstream symbol server or the transcoder binary, whose
/// failures are per-key conditions reported through the artifact protocol
/// (negative cache entries and 404s), not process health.
pub async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// Snapshot of the background transcode queue.
#[derive(Debug, Serialize)]
pub struct QueueStatus {
    /// Keys waiting in the queue.
    pub queue_depth: usize,

    /// Keys currently being transcoded by background workers.
    pub in_flight: Vec<String>,
}

/// Queue-state handler.
///
/// Returns the queue depth and the keys workers are currently processing.
/// A key that appears here for a long time usually means its transcoder
/// child is still grinding through a large PDB.
pub async fn status_handler<S: SymbolSource>(
    State(state): State<AppState<S>>,
) -> Json<QueueStatus> {
    let queue = state.queue();
    let mut in_flight: Vec<String> = queue
        .in_flight()
        .await
        .iter()
        .map(ToString::to_string)
        .collect();
    in_flight.sort();

    Json(QueueStatus {
        queue_depth: queue.depth().await,
        in_flight,
    })
}
