use std::sync::Arc;

use common::{Album, Artist, Genre, Song};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::progress::{LogProgress, ProgressReport, ProgressSink, ScanPhase};
use crate::store::Catalog;
use crate::LibraryError;

pub const DEFAULT_BATCH_SIZE: usize = 250;

/// An entity row a song references. Written if absent, never overwritten.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityRow {
    Artist(Artist),
    Album(Album),
    Genre(Genre),
}

#[derive(Clone, Debug)]
pub struct SongUpsert {
    pub song: Song,
    pub entities: Vec<EntityRow>,
}

/// Transactional destination for song batches.
pub trait BatchSink: Send + Sync + 'static {
    fn write_batch(&self, batch: &[SongUpsert]) -> Result<(), LibraryError>;
}

impl BatchSink for Catalog {
    fn write_batch(&self, batch: &[SongUpsert]) -> Result<(), LibraryError> {
        Catalog::write_batch(self, batch)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    /// Record the failure and keep committing later batches.
    #[default]
    Continue,
    /// Record the failure and leave every later batch unattempted.
    Halt,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchFailure {
    /// 1-based position of the batch within the scan.
    pub index: usize,
    pub songs: usize,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub committed_batches: usize,
    pub committed_songs: usize,
    pub unattempted_songs: usize,
    pub failures: Vec<BatchFailure>,
    pub cancelled: bool,
}

/// Buffers song upserts and commits them in bounded, ordered batches.
pub struct BatchCoordinator {
    sink: Arc<dyn BatchSink>,
    batch_size: usize,
    total: usize,
    policy: BatchFailurePolicy,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    pending: Vec<SongUpsert>,
    submitted: usize,
    processed: usize,
    halted: bool,
    summary: BatchSummary,
}

impl BatchCoordinator {
    pub fn new(sink: Arc<dyn BatchSink>, batch_size: usize, total: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sink,
            batch_size,
            total,
            policy: BatchFailurePolicy::default(),
            progress: Arc::new(LogProgress),
            cancel: CancellationToken::new(),
            pending: Vec::with_capacity(batch_size),
            submitted: 0,
            processed: 0,
            halted: false,
            summary: BatchSummary::default(),
        }
    }

    pub fn with_policy(mut self, policy: BatchFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// True once a failure under [`BatchFailurePolicy::Halt`] or a
    /// cancellation has stopped further commits.
    pub fn is_stopped(&self) -> bool {
        self.halted || self.summary.cancelled
    }

    pub fn summary(&self) -> &BatchSummary {
        &self.summary
    }

    pub async fn push(&mut self, upsert: SongUpsert) {
        if self.is_stopped() {
            self.summary.unattempted_songs += 1;
            return;
        }
        self.pending.push(upsert);
        if self.pending.len() >= self.batch_size {
            self.commit_pending().await;
        }
    }

    /// Flushes the trailing partial batch and returns the totals.
    pub async fn finish(mut self) -> BatchSummary {
        self.commit_pending().await;
        self.summary
    }

    /// Drops whatever is buffered without committing it.
    pub fn abandon(mut self) -> BatchSummary {
        self.summary.unattempted_songs += self.pending.len();
        self.pending.clear();
        self.summary
    }

    async fn commit_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if self.is_stopped() {
            self.summary.unattempted_songs += self.pending.len();
            self.pending.clear();
            return;
        }
        if self.cancel.is_cancelled() {
            self.summary.cancelled = true;
            self.summary.unattempted_songs += self.pending.len();
            self.pending.clear();
            return;
        }

        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        self.submitted += 1;
        let index = self.submitted;
        let size = batch.len();
        let sink = Arc::clone(&self.sink);
        let result = match tokio::task::spawn_blocking(move || sink.write_batch(&batch)).await {
            Ok(result) => result,
            Err(err) => Err(LibraryError::Join(err.to_string())),
        };
        self.processed += size;

        let message = match result {
            Ok(()) => {
                self.summary.committed_batches += 1;
                self.summary.committed_songs += size;
                debug!("Committed batch {} ({} songs)", index, size);
                format!("batch {} committed", index)
            }
            Err(err) => {
                warn!("Batch {} ({} songs) rolled back: {}", index, size, err);
                self.summary.failures.push(BatchFailure {
                    index,
                    songs: size,
                    reason: err.to_string(),
                });
                if self.policy == BatchFailurePolicy::Halt {
                    self.halted = true;
                }
                format!("batch {} failed", index)
            }
        };

        self.progress.report(&ProgressReport::new(
            ScanPhase::Persisting,
            self.processed,
            self.total,
            message,
        ));
    }
}
