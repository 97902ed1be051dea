//! Chapter synchronization and incremental assembly engine
//!
//! The orchestrator turns a `(book id, chapter range, options)` request into
//! cache lookups, rate-limited concurrent fetches, content-state
//! classification, and EPUB (re)assembly, while reporting phase-level
//! progress and producing exact statistics. Decomposed by concern:
//! - [`plan`] - per-chapter decision logic (reuse / restore / fetch)
//! - [`run`] - the phase state machine driving one sync run
//!
//! A [`NovelSyncer`] is cheap to clone and safe to use for concurrent runs
//! against *different* books; runs against the same book and temp directory
//! must not overlap (caller responsibility, no cross-run locking).

mod plan;
mod run;

pub use plan::ChapterPlan;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::epub::{Assembler, EpubAssembler};
use crate::source::SourceClient;
use crate::types::{DownloadDetail, SyncPhase, SyncProgress, SyncRequest, SyncResult};

/// The sync engine
///
/// All fields are Arc-wrapped, so cloning is cheap and every clone shares the
/// same progress channel.
#[derive(Clone)]
pub struct NovelSyncer {
    /// Site-specific client performing the actual network work
    pub(crate) source: Arc<dyn SourceClient>,
    /// Book-file serializer (EPUB by default, pluggable for tests)
    pub(crate) assembler: Arc<dyn Assembler>,
    /// Configuration (shared across runs)
    pub(crate) config: Arc<Config>,
    /// Progress broadcast channel sender (multiple subscribers supported)
    pub(crate) progress_tx: tokio::sync::broadcast::Sender<SyncProgress>,
}

impl NovelSyncer {
    /// Create a syncer over a source client with the default EPUB assembler
    pub fn new(source: Arc<dyn SourceClient>, config: Config) -> Self {
        let assembler = Arc::new(EpubAssembler::new(config.epub.clone()));
        // Buffered so a briefly slow subscriber doesn't lose events; emission
        // itself never blocks
        let (progress_tx, _rx) = tokio::sync::broadcast::channel(256);
        Self {
            source,
            assembler,
            config: Arc::new(config),
            progress_tx,
        }
    }

    /// Replace the assembler (e.g., with a capture-only one in tests)
    pub fn with_assembler(mut self, assembler: Arc<dyn Assembler>) -> Self {
        self.assembler = assembler;
        self
    }

    /// Subscribe to progress events
    ///
    /// Multiple subscribers are supported; each receives all events
    /// independently. Events from concurrent runs interleave; partition by
    /// [`SyncProgress::book_id`]. Events are purely observational and never
    /// influence the run.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncProgress> {
        self.progress_tx.subscribe()
    }

    /// Run one sync to completion
    ///
    /// Never returns `Err`: run-fatal conditions are reported through
    /// [`SyncResult::error_message`] with `success = false`.
    pub async fn sync(&self, request: SyncRequest) -> SyncResult {
        self.sync_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Run one sync, abortable through `cancel`
    ///
    /// On cancellation, outstanding fetches stop promptly, the run reports
    /// the `Cancelled` phase, and neither the cache entries written so far
    /// nor any existing output artifact are touched.
    pub async fn sync_with_cancel(
        &self,
        request: SyncRequest,
        cancel: CancellationToken,
    ) -> SyncResult {
        self.run(request, cancel).await
    }
}

/// Run-scoped progress emitter
///
/// Guarantees non-decreasing `total_progress` across a run even when phase
/// sub-progress arrives out of order from concurrent workers. Every event
/// carries the run's book id so subscribers can partition interleaved runs.
/// Sending is fire-and-forget: with no subscribers the event is dropped.
pub(crate) struct ProgressTracker {
    tx: tokio::sync::broadcast::Sender<SyncProgress>,
    book_id: crate::types::BookId,
    floor: AtomicU8,
}

impl ProgressTracker {
    pub(crate) fn new(
        tx: tokio::sync::broadcast::Sender<SyncProgress>,
        book_id: crate::types::BookId,
    ) -> Self {
        Self {
            tx,
            book_id,
            floor: AtomicU8::new(0),
        }
    }

    /// Emit a progress event, clamping `pct` to be non-decreasing
    pub(crate) fn emit(
        &self,
        phase: SyncPhase,
        pct: u8,
        message: impl Into<String>,
        download: Option<DownloadDetail>,
    ) {
        let prev = self.floor.fetch_max(pct, Ordering::SeqCst);
        let total_progress = prev.max(pct);
        // send() errs only when there are no receivers, which is fine
        self.tx
            .send(SyncProgress {
                book_id: self.book_id.clone(),
                phase,
                total_progress,
                message: message.into(),
                download,
            })
            .ok();
    }

    /// Emit a terminal event at the current progress level
    pub(crate) fn emit_terminal(&self, phase: SyncPhase, message: impl Into<String>) {
        let pct = if phase == SyncPhase::Completed {
            100
        } else {
            self.floor.load(Ordering::SeqCst)
        };
        self.emit(phase, pct, message, None);
    }
}
