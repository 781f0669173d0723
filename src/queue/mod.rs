//! Background transcode queue.
//!
//! Requests that opt into (or are forced into) asynchronous transcoding hand
//! their key to this queue and return immediately; a fixed pool of workers
//! drains the queue and runs the orchestrator.
//!
//! # Deduplication
//!
//! A pending set keyed by [`ArtifactKey`] guarantees that no two workers
//! process the same key at the same time: each worker test-and-inserts under
//! one lock before starting and removes the key when done. The set only
//! deduplicates background work against background work; synchronous
//! request-path transcodes never consult it, and any overlap between the two
//! paths is resolved by the orchestrator's atomic publication rename.
//!
//! # Lifecycle
//!
//! `start` spawns the workers once; starting twice is an error. `stop`
//! cancels the shutdown token and joins each worker with a bounded wait.
//! A worker stuck behind a long-running transcoder child may outlive the
//! service, and operators are expected to supervise that.

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transcode::{Cancelled, Transcode};
use crate::types::ArtifactKey;

/// Bounded wait for each worker during shutdown.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors from queue lifecycle operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// `start` was called on an already-started queue.
    #[error("transcode queue already started")]
    AlreadyStarted,
}

/// Multi-producer queue of transcode work, drained by a worker pool.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct TranscodeQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    fifo: Mutex<VecDeque<ArtifactKey>>,
    pending: Mutex<HashSet<ArtifactKey>>,
    item_available: Notify,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl TranscodeQueue {
    /// Creates a stopped, empty queue.
    pub fn new() -> Self {
        TranscodeQueue {
            inner: Arc::new(QueueInner {
                fifo: Mutex::new(VecDeque::new()),
                pending: Mutex::new(HashSet::new()),
                item_available: Notify::new(),
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueues a key for background transcoding and returns immediately.
    ///
    /// Duplicates are allowed here; the pending set sorts them out at
    /// processing time.
    pub async fn enqueue(&self, key: ArtifactKey) {
        self.inner.fifo.lock().await.push_back(key);
        self.inner.item_available.notify_one();
    }

    /// Returns the number of keys waiting in the queue.
    pub async fn depth(&self) -> usize {
        self.inner.fifo.lock().await.len()
    }

    /// Returns the keys currently being processed by workers.
    pub async fn in_flight(&self) -> Vec<ArtifactKey> {
        self.inner.pending.lock().await.iter().cloned().collect()
    }

    /// Spawns `worker_count` workers draining the queue through `transcoder`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AlreadyStarted`] if the queue was started
    /// before, including a queue that has since been stopped.
    pub async fn start<T: Transcode>(
        &self,
        transcoder: Arc<T>,
        worker_count: usize,
    ) -> Result<(), QueueError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyStarted);
        }

        info!(workers = worker_count, "starting transcode queue");
        let mut workers = self.inner.workers.lock().await;
        for worker in 0..worker_count {
            let inner = Arc::clone(&self.inner);
            let transcoder = Arc::clone(&transcoder);
            workers.push(tokio::spawn(worker_loop(worker, inner, transcoder)));
        }
        Ok(())
    }

    /// Signals shutdown and joins each worker with a bounded wait.
    ///
    /// Returns once every worker has either exited or exceeded its wait;
    /// a long-running transcoder child may keep a worker alive past this
    /// point.
    pub async fn stop(&self) {
        info!("stopping transcode queue");
        self.inner.shutdown.cancel();

        let workers: Vec<_> = std::mem::take(&mut *self.inner.workers.lock().await);
        for handle in workers {
            if tokio::time::timeout(WORKER_JOIN_TIMEOUT, handle).await.is_err() {
                warn!(
                    "transcode worker did not stop within {:?}, leaving it behind",
                    WORKER_JOIN_TIMEOUT
                );
            }
        }
    }

    /// Worker-pool size matching the machine: one worker per available core.
    pub fn default_worker_count() -> usize {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }
}

impl Default for TranscodeQueue {
    fn default() -> Self {
        TranscodeQueue::new()
    }
}

async fn worker_loop<T: Transcode>(worker: usize, inner: Arc<QueueInner>, transcoder: Arc<T>) {
    debug!(worker, "transcode worker started");
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.item_available.notified() => drain(&inner, transcoder.as_ref()).await,
        }
    }
    debug!(worker, "transcode worker stopped");
}

/// Drains the queue until it is observed empty.
async fn drain<T: Transcode>(inner: &QueueInner, transcoder: &T) {
    loop {
        let key = {
            let mut fifo = inner.fifo.lock().await;
            let key = fifo.pop_front();
            // Several enqueues may have collapsed into the single wake that
            // got us here; hand the surplus to another worker.
            if key.is_some() && !fifo.is_empty() {
                inner.item_available.notify_one();
            }
            key
        };
        let Some(key) = key else { break };

        if !inner.pending.lock().await.insert(key.clone()) {
            debug!(key = %key, "key already owned by another worker");
            continue;
        }

        match transcoder.try_transcode(&key, &inner.shutdown).await {
            Ok(Some(path)) => {
                debug!(key = %key, path = %path.display(), "background transcode published")
            }
            Ok(None) => debug!(key = %key, "background transcode yielded no artifact"),
            Err(Cancelled) => debug!(key = %key, "background transcode cancelled"),
        }

        inner.pending.lock().await.remove(&key);
    }
}
