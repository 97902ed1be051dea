//! Rate-limited fetcher
//!
//! Wraps a [`SourceClient`] with a bounded-concurrency, inter-request-delay
//! dispatch policy and the per-chapter retry budget. Every chapter comes back
//! as a classified [`ChapterOutcome`]; a single chapter's failure never
//! surfaces as `Err`, so the orchestrator can continue with the rest of the
//! batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{FetchConfig, RetryConfig};
use crate::error::Error;
use crate::retry::fetch_with_retry;
use crate::source::SourceClient;
use crate::types::{BookId, ChapterImage, ChapterOrder, ChapterOutcome};

/// One chapter to fetch
#[derive(Clone, Debug)]
pub struct ChapterJob {
    /// Canonical chapter order
    pub order: ChapterOrder,
    /// Source-assigned chapter identifier from the table of contents
    pub chapter_id: String,
}

/// One image to fetch
#[derive(Clone, Debug)]
pub struct ImageJob {
    /// Chapter the image belongs to
    pub order: ChapterOrder,
    /// Byte offset of the image reference inside the chapter HTML
    pub offset: usize,
    /// Remote URL of the image
    pub url: String,
}

/// Result of one image fetch: bytes on success, `None` when degraded
pub type ImageOutcome = (ImageJob, Option<ChapterImage>);

/// Dispatch pacing and concurrency state shared by all workers of a batch
struct DispatchGate {
    semaphore: Semaphore,
    last_dispatch: Mutex<Option<Instant>>,
    fetch: FetchConfig,
}

impl DispatchGate {
    /// Wait until this worker is allowed to start its request
    ///
    /// Enforces the minimum delay between the *starts* of successive
    /// dispatches. The lock is held across the sleep on purpose: dispatch
    /// starts are serialized, completions are not.
    async fn pace(&self) {
        let mut last = self.last_dispatch.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.fetch.request_delay {
                tokio::time::sleep(self.fetch.request_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Bounded-concurrency, rate-limited wrapper around a source client
#[derive(Clone)]
pub struct RateLimitedFetcher {
    client: Arc<dyn SourceClient>,
    gate: Arc<DispatchGate>,
    retry: RetryConfig,
}

impl RateLimitedFetcher {
    /// Create a fetcher over `client` with the given pacing and retry policy
    pub fn new(client: Arc<dyn SourceClient>, fetch: FetchConfig, retry: RetryConfig) -> Self {
        let permits = fetch.max_concurrent_requests.max(1);
        Self {
            client,
            gate: Arc::new(DispatchGate {
                semaphore: Semaphore::new(permits),
                last_dispatch: Mutex::new(None),
                fetch,
            }),
            retry,
        }
    }

    /// Fetch a batch of chapters concurrently, classifying every outcome
    ///
    /// `on_progress(completed, total)` is invoked after each chapter settles,
    /// in completion order (which is unordered). Jobs still pending when
    /// `cancel` fires are dropped; their orders are simply absent from the
    /// returned map.
    pub async fn fetch_chapters(
        &self,
        book_id: &BookId,
        jobs: Vec<ChapterJob>,
        cancel: &CancellationToken,
        on_progress: impl Fn(u64, u64) + Send + Sync + 'static,
    ) -> BTreeMap<ChapterOrder, ChapterOutcome> {
        let total = jobs.len() as u64;
        let completed = Arc::new(AtomicU64::new(0));
        let on_progress = Arc::new(on_progress);
        let mut set: JoinSet<Option<(ChapterOrder, ChapterOutcome)>> = JoinSet::new();

        for job in jobs {
            let client = self.client.clone();
            let gate = self.gate.clone();
            let retry = self.retry.clone();
            let book_id = book_id.clone();
            let cancel = cancel.clone();
            let completed = completed.clone();
            let on_progress = on_progress.clone();

            set.spawn(async move {
                let _permit = tokio::select! {
                    permit = gate.semaphore.acquire() => match permit {
                        Ok(p) => p,
                        // Semaphore is never closed while the fetcher lives
                        Err(_) => return None,
                    },
                    _ = cancel.cancelled() => return None,
                };
                if cancel.is_cancelled() {
                    return None;
                }
                gate.pace().await;

                let outcome = tokio::select! {
                    result = fetch_with_retry(&retry, || {
                        client.chapter_content(&book_id, &job.chapter_id)
                    }) => classify_chapter(job.order, result),
                    _ = cancel.cancelled() => return None,
                };

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                on_progress(done, total);
                Some((job.order, outcome))
            });
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some((order, outcome))) => {
                    outcomes.insert(order, outcome);
                }
                Ok(None) => {} // cancelled before completion
                Err(e) => warn!(error = %e, "Chapter fetch task panicked"),
            }
        }
        outcomes
    }

    /// Fetch a batch of images concurrently under the same dispatch policy
    ///
    /// An image failure degrades to `None` rather than failing its chapter.
    pub async fn fetch_images(
        &self,
        jobs: Vec<ImageJob>,
        cancel: &CancellationToken,
        on_progress: impl Fn(u64, u64) + Send + Sync + 'static,
    ) -> Vec<ImageOutcome> {
        let total = jobs.len() as u64;
        let completed = Arc::new(AtomicU64::new(0));
        let on_progress = Arc::new(on_progress);
        let mut set: JoinSet<Option<ImageOutcome>> = JoinSet::new();

        for job in jobs {
            let client = self.client.clone();
            let gate = self.gate.clone();
            let retry = self.retry.clone();
            let cancel = cancel.clone();
            let completed = completed.clone();
            let on_progress = on_progress.clone();

            set.spawn(async move {
                let _permit = tokio::select! {
                    permit = gate.semaphore.acquire() => match permit {
                        Ok(p) => p,
                        Err(_) => return None,
                    },
                    _ = cancel.cancelled() => return None,
                };
                if cancel.is_cancelled() {
                    return None;
                }
                gate.pace().await;

                // Reject unparseable URLs before hitting the source
                if url::Url::parse(&job.url).is_err() {
                    warn!(url = %job.url, "Skipping image with invalid URL");
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    on_progress(done, total);
                    return Some((job, None));
                }

                let fetched = tokio::select! {
                    result = fetch_with_retry(&retry, || client.image(&job.url)) => result,
                    _ = cancel.cancelled() => return None,
                };

                let image = match fetched {
                    Ok((data, media_type)) => Some(ChapterImage {
                        offset: job.offset,
                        media_type,
                        data,
                    }),
                    Err(e) => {
                        warn!(order = %job.order, url = %job.url, error = %e,
                            "Image fetch failed, chapter will be assembled without it");
                        None
                    }
                };

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                on_progress(done, total);
                Some((job, image))
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Image fetch task panicked"),
            }
        }
        outcomes
    }
}

/// Map a settled fetch result onto its terminal per-chapter outcome
fn classify_chapter(
    order: ChapterOrder,
    result: Result<crate::types::ChapterContent, Error>,
) -> ChapterOutcome {
    match result {
        Ok(content) => {
            debug!(order = %order, images = content.images.len(), "Chapter downloaded");
            ChapterOutcome::Downloaded(content)
        }
        Err(Error::ChapterLocked { .. }) => {
            debug!(order = %order, "Chapter is locked on the source");
            ChapterOutcome::Locked
        }
        Err(e) => {
            warn!(order = %order, error = %e, "Chapter failed after retries");
            ChapterOutcome::Failed(e.to_string())
        }
    }
}
