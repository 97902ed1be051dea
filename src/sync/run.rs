//! The sync run: phase state machine and per-chapter bookkeeping
//!
//! Phases advance strictly forward; `Failed` and `Cancelled` are the only
//! exits from a non-terminal phase. All per-run state is local to the call,
//! so concurrent runs against different books never interfere.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, ChapterCache, slug};
use crate::epub::inspector::EpubInspector;
use crate::epub::{BookChapter, ChapterSource};
use crate::error::{Error, Result};
use crate::fetcher::{ChapterJob, ImageJob, RateLimitedFetcher};
use crate::types::{
    BookId, ChapterContent, ChapterImage, ChapterOrder, ChapterOutcome, ChapterStatus,
    DownloadDetail, ExistingBook, SyncPhase, SyncRequest, SyncResult, SyncStatistics, TocEntry,
};

use super::plan::{self, ChapterPlan};
use super::{NovelSyncer, ProgressTracker};

/// Which statistics bucket a chapter lands in; exactly one per order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Bucket {
    NewlyDownloaded,
    RestoredFromCache,
    Reused,
    Failed,
    Locked,
}

/// The serialized form a resolved chapter will take
#[derive(Clone, Debug)]
enum Body {
    Fresh {
        content: ChapterContent,
        images: Vec<ChapterImage>,
    },
    Verbatim {
        xhtml: String,
        images: Vec<ChapterImage>,
    },
    Placeholder,
}

/// Fully resolved state of one requested chapter order
#[derive(Clone, Debug)]
struct Resolved {
    title: String,
    status: ChapterStatus,
    bucket: Bucket,
    body: Body,
}

impl NovelSyncer {
    /// Drive one run to a terminal phase and fold the result into a [`SyncResult`]
    pub(crate) async fn run(&self, request: SyncRequest, cancel: CancellationToken) -> SyncResult {
        let tracker = Arc::new(ProgressTracker::new(
            self.progress_tx.clone(),
            request.book_id.clone(),
        ));
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            book_id = %request.book_id,
            start = %request.start,
            end = %request.end,
            retry_failed = request.retry_failed_chapters,
            "Starting sync"
        );

        match self
            .run_phases(&request, &cancel, &tracker, started_at)
            .await
        {
            Ok((output_path, mut statistics)) => {
                statistics.duration = start.elapsed();
                tracker.emit_terminal(SyncPhase::Completed, "Sync completed");
                info!(
                    book_id = %request.book_id,
                    newly_downloaded = statistics.newly_downloaded,
                    restored = statistics.restored_from_cache,
                    reused = statistics.reused,
                    failed = statistics.failed,
                    locked = statistics.locked_chapters,
                    duration_ms = statistics.duration.as_millis(),
                    "Sync completed"
                );
                SyncResult {
                    success: true,
                    output_path: Some(output_path),
                    error_message: None,
                    statistics: Some(statistics),
                }
            }
            Err(Error::Cancelled) => {
                tracker.emit_terminal(SyncPhase::Cancelled, "Sync cancelled");
                warn!(book_id = %request.book_id, "Sync cancelled");
                SyncResult {
                    success: false,
                    output_path: None,
                    error_message: Some("sync cancelled".to_string()),
                    statistics: None,
                }
            }
            Err(e) => {
                tracker.emit_terminal(SyncPhase::Failed, e.to_string());
                error!(book_id = %request.book_id, error = %e, "Sync failed");
                SyncResult {
                    success: false,
                    output_path: None,
                    error_message: Some(e.to_string()),
                    statistics: None,
                }
            }
        }
    }

    async fn run_phases(
        &self,
        request: &SyncRequest,
        cancel: &CancellationToken,
        tracker: &Arc<ProgressTracker>,
        started_at: DateTime<Utc>,
    ) -> Result<(PathBuf, SyncStatistics)> {
        let book_id = request.book_id.clone();

        // ----- Analyzing -----
        tracker.emit(SyncPhase::Analyzing, 0, "Validating request", None);
        validate_request(request).await?;
        let existing = self.inspect_existing(request).await?;
        tracker.emit(
            SyncPhase::Analyzing,
            3,
            format!(
                "Existing output holds {} chapter(s)",
                existing.entries.len()
            ),
            None,
        );
        ensure_active(cancel)?;

        // ----- FetchingToc -----
        tracker.emit(SyncPhase::FetchingToc, 5, "Fetching table of contents", None);
        let toc = self.fetch_toc(&book_id).await?;
        tracker.emit(
            SyncPhase::FetchingToc,
            10,
            format!("Table of contents lists {} chapter(s)", toc.len()),
            None,
        );
        ensure_active(cancel)?;

        // ----- CheckingCache -----
        tracker.emit(SyncPhase::CheckingCache, 12, "Resolving chapter plans", None);
        let cache = ChapterCache::new(&request.temp_dir);
        let mut resolved: BTreeMap<ChapterOrder, Resolved> = BTreeMap::new();
        let mut jobs: Vec<ChapterJob> = Vec::new();
        let mut job_titles: BTreeMap<ChapterOrder, String> = BTreeMap::new();

        for order in request.orders() {
            let reuse = existing.entries.get(&order);

            // The cache is only consulted when the existing output doesn't
            // already decide this order (resolution steps 1-3)
            let reuse_decides = reuse.is_some_and(|r| match r.status {
                ChapterStatus::Downloaded => r.xhtml.is_some(),
                ChapterStatus::Locked => true,
                ChapterStatus::Failed => !request.retry_failed_chapters,
            });
            let cached = if reuse_decides {
                None
            } else {
                match cache.get(&book_id, order).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(order = %order, error = %e, "Cache read failed, falling back to fetch");
                        None
                    }
                }
            };

            let plan = plan::resolve(
                reuse,
                cached,
                toc.get(&order),
                request.retry_failed_chapters,
            );
            match plan {
                ChapterPlan::Reuse(entry) => {
                    let xhtml = entry.xhtml.clone().unwrap_or_default();
                    resolved.insert(
                        order,
                        Resolved {
                            title: entry.title,
                            status: ChapterStatus::Downloaded,
                            bucket: Bucket::Reused,
                            body: Body::Verbatim {
                                xhtml,
                                images: entry.images,
                            },
                        },
                    );
                }
                ChapterPlan::ReuseLocked(entry) => {
                    resolved.insert(
                        order,
                        Resolved {
                            title: entry.title,
                            status: ChapterStatus::Locked,
                            bucket: Bucket::Locked,
                            body: Body::Placeholder,
                        },
                    );
                }
                ChapterPlan::ReuseFailed(entry) => {
                    resolved.insert(
                        order,
                        Resolved {
                            title: entry.title,
                            status: ChapterStatus::Failed,
                            bucket: Bucket::Reused,
                            body: Body::Placeholder,
                        },
                    );
                }
                ChapterPlan::Restore(entry) => {
                    debug!(order = %order, "Restoring chapter from cache");
                    resolved.insert(
                        order,
                        Resolved {
                            title: entry.title,
                            status: ChapterStatus::Downloaded,
                            bucket: Bucket::RestoredFromCache,
                            body: Body::Fresh {
                                content: entry.content,
                                images: entry.images,
                            },
                        },
                    );
                }
                ChapterPlan::Locked { title } => {
                    resolved.insert(
                        order,
                        Resolved {
                            title,
                            status: ChapterStatus::Locked,
                            bucket: Bucket::Locked,
                            body: Body::Placeholder,
                        },
                    );
                }
                ChapterPlan::MissingFromToc => {
                    if !request.continue_on_error {
                        return Err(Error::ChapterNotFound { order });
                    }
                    warn!(order = %order, "Chapter missing from table of contents");
                    resolved.insert(
                        order,
                        Resolved {
                            title: format!("Chapter {}", order),
                            status: ChapterStatus::Failed,
                            bucket: Bucket::Failed,
                            body: Body::Placeholder,
                        },
                    );
                }
                ChapterPlan::Fetch { chapter_id, title } => {
                    job_titles.insert(order, title);
                    jobs.push(ChapterJob { order, chapter_id });
                }
            }
        }
        tracker.emit(
            SyncPhase::CheckingCache,
            15,
            format!(
                "{} chapter(s) to fetch, {} satisfied locally",
                jobs.len(),
                resolved.len()
            ),
            None,
        );
        ensure_active(cancel)?;

        // ----- DownloadingChapters -----
        let fetcher = RateLimitedFetcher::new(
            self.source.clone(),
            self.config.fetch.clone(),
            self.config.retry.clone(),
        );
        if !jobs.is_empty() {
            let total = jobs.len() as u64;
            tracker.emit(
                SyncPhase::DownloadingChapters,
                15,
                format!("Downloading {} chapter(s)", total),
                Some(DownloadDetail {
                    completed: 0,
                    total,
                }),
            );

            let progress = tracker.clone();
            let mut outcomes = fetcher
                .fetch_chapters(&book_id, jobs.clone(), cancel, move |done, total| {
                    let pct = 15 + ((55 * done) / total.max(1)) as u8;
                    progress.emit(
                        SyncPhase::DownloadingChapters,
                        pct,
                        format!("Downloaded {} of {} chapter(s)", done, total),
                        Some(DownloadDetail {
                            completed: done,
                            total,
                        }),
                    );
                })
                .await;

            // Settle before honoring a cancellation: outcomes that completed
            // while the batch ran are valid work and must reach the cache
            let cancelled_mid_batch = cancel.is_cancelled();
            let stop_on_failure = !request.continue_on_error && !cancelled_mid_batch;
            for job in &jobs {
                let title = job_titles
                    .get(&job.order)
                    .cloned()
                    .unwrap_or_else(|| format!("Chapter {}", job.order));
                match outcomes.remove(&job.order) {
                    Some(outcome) => {
                        let entry = self
                            .settle_fetch(
                                &book_id,
                                &cache,
                                job.order,
                                title,
                                outcome,
                                stop_on_failure,
                            )
                            .await?;
                        resolved.insert(job.order, entry);
                    }
                    // Still pending when the token fired; the run ends below
                    None if cancelled_mid_batch => {}
                    None => {
                        // The fetch task ended without producing an outcome
                        // (worker panic); a per-chapter failure, not a
                        // cancellation
                        if stop_on_failure {
                            return Err(Error::Source(format!(
                                "chapter {} fetch did not complete",
                                job.order
                            )));
                        }
                        warn!(order = %job.order, "Chapter fetch produced no outcome, marking failed");
                        resolved.insert(
                            job.order,
                            Resolved {
                                title,
                                status: ChapterStatus::Failed,
                                bucket: Bucket::Failed,
                                body: Body::Placeholder,
                            },
                        );
                    }
                }
            }
            ensure_active(cancel)?;
        }

        // ----- DownloadingImages -----
        let image_jobs = pending_image_jobs(&resolved);
        let mut images_downloaded: u32 = 0;
        if !image_jobs.is_empty() {
            let total = image_jobs.len() as u64;
            tracker.emit(
                SyncPhase::DownloadingImages,
                70,
                format!("Downloading {} image(s)", total),
                Some(DownloadDetail {
                    completed: 0,
                    total,
                }),
            );

            let progress = tracker.clone();
            let outcomes = fetcher
                .fetch_images(image_jobs, cancel, move |done, total| {
                    let pct = 70 + ((15 * done) / total.max(1)) as u8;
                    progress.emit(
                        SyncPhase::DownloadingImages,
                        pct,
                        format!("Downloaded {} of {} image(s)", done, total),
                        Some(DownloadDetail {
                            completed: done,
                            total,
                        }),
                    );
                })
                .await;
            ensure_active(cancel)?;

            let mut touched: Vec<ChapterOrder> = Vec::new();
            for (job, image) in outcomes {
                let Some(image) = image else {
                    continue; // degraded: chapter is assembled without it
                };
                if let Some(Resolved {
                    body: Body::Fresh { images, .. },
                    ..
                }) = resolved.get_mut(&job.order)
                {
                    images.push(image);
                    images_downloaded += 1;
                    if !touched.contains(&job.order) {
                        touched.push(job.order);
                    }
                }
            }

            // Write-through so a future run restores the images too
            for order in touched {
                if let Some(Resolved {
                    title,
                    body: Body::Fresh { content, images },
                    ..
                }) = resolved.get(&order)
                {
                    let entry = CacheEntry {
                        title: title.clone(),
                        content: content.clone(),
                        images: images.clone(),
                    };
                    if let Err(e) = cache.put(&book_id, order, &entry).await {
                        warn!(order = %order, error = %e, "Could not cache fetched images");
                    }
                }
            }
        }
        ensure_active(cancel)?;

        // ----- GeneratingEpub -----
        tracker.emit(SyncPhase::GeneratingEpub, 88, "Assembling EPUB", None);
        let book_title = request
            .book_title
            .clone()
            .or_else(|| existing.title.clone())
            .unwrap_or_else(|| format!("Book {}", book_id));
        let chapters = assemble_input(request, &existing, &resolved);
        let output_path = request
            .output_dir
            .join(format!("{}.epub", slug(book_id.as_str())));
        let output_path = self
            .assembler
            .assemble(&book_id, &book_title, chapters, &output_path)
            .await?;

        // ----- CleaningUp -----
        // Only entries now durably embedded in the output are discarded;
        // anything outside the assembled range stays reusable
        tracker.emit(SyncPhase::CleaningUp, 96, "Cleaning up cache entries", None);
        for (order, chapter) in &resolved {
            let embedded = chapter.status == ChapterStatus::Downloaded
                && matches!(
                    chapter.bucket,
                    Bucket::NewlyDownloaded | Bucket::RestoredFromCache
                );
            if embedded {
                if let Err(e) = cache.delete(&book_id, *order).await {
                    warn!(order = %order, error = %e, "Could not remove embedded cache entry");
                }
            }
        }

        let statistics = tally(request, &resolved, images_downloaded, started_at);
        debug_assert!(statistics.is_exact_partition());
        Ok((output_path, statistics))
    }

    /// Classify one fetch outcome into the resolved set, honoring the
    /// write-through-cache and continue-on-error contracts
    async fn settle_fetch(
        &self,
        book_id: &BookId,
        cache: &ChapterCache,
        order: ChapterOrder,
        title: String,
        outcome: ChapterOutcome,
        stop_on_failure: bool,
    ) -> Result<Resolved> {
        match outcome {
            ChapterOutcome::Downloaded(content) => {
                let entry = CacheEntry {
                    title: title.clone(),
                    content: content.clone(),
                    images: Vec::new(),
                };
                // Cached before assembly so a crash never loses the download.
                // Storage trouble degrades the chapter, never the run.
                match cache.put(book_id, order, &entry).await {
                    Ok(()) => Ok(Resolved {
                        title,
                        status: ChapterStatus::Downloaded,
                        bucket: Bucket::NewlyDownloaded,
                        body: Body::Fresh {
                            content,
                            images: Vec::new(),
                        },
                    }),
                    Err(e) => {
                        warn!(order = %order, error = %e, "Cache write failed, marking chapter failed");
                        Ok(Resolved {
                            title,
                            status: ChapterStatus::Failed,
                            bucket: Bucket::Failed,
                            body: Body::Placeholder,
                        })
                    }
                }
            }
            ChapterOutcome::Locked => Ok(Resolved {
                title,
                status: ChapterStatus::Locked,
                bucket: Bucket::Locked,
                body: Body::Placeholder,
            }),
            ChapterOutcome::Failed(reason) => {
                if stop_on_failure {
                    return Err(Error::Source(format!(
                        "chapter {} failed: {}",
                        order, reason
                    )));
                }
                Ok(Resolved {
                    title,
                    status: ChapterStatus::Failed,
                    bucket: Bucket::Failed,
                    body: Body::Placeholder,
                })
            }
        }
    }

    async fn inspect_existing(&self, request: &SyncRequest) -> Result<ExistingBook> {
        let Some(path) = &request.existing_output_path else {
            return Ok(ExistingBook::default());
        };
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            // First run: callers often pass the path the output *will* have
            warn!(path = %path.display(), "Existing output path not found, starting fresh");
            return Ok(ExistingBook::default());
        }
        EpubInspector.inspect(path).await
    }

    async fn fetch_toc(&self, book_id: &BookId) -> Result<BTreeMap<ChapterOrder, TocEntry>> {
        let entries = self
            .source
            .table_of_contents(book_id)
            .await
            .map_err(|e| match e {
                toc @ Error::Toc(_) => toc,
                other => Error::Toc(other.to_string()),
            })?;
        Ok(entries.into_iter().map(|e| (e.order, e)).collect())
    }
}

async fn validate_request(request: &SyncRequest) -> Result<()> {
    if request.start.get() == 0 {
        return Err(Error::Config {
            message: "chapter orders are 1-based; start must be at least 1".to_string(),
            key: Some("start".to_string()),
        });
    }
    if request.start > request.end {
        return Err(Error::Config {
            message: format!(
                "requested range is empty: start {} is after end {}",
                request.start, request.end
            ),
            key: Some("end".to_string()),
        });
    }
    for (dir, key) in [
        (&request.temp_dir, "temp_dir"),
        (&request.output_dir, "output_dir"),
    ] {
        tokio::fs::create_dir_all(dir).await.map_err(|e| Error::Config {
            message: format!("cannot create directory '{}': {}", dir.display(), e),
            key: Some(key.to_string()),
        })?;
    }
    Ok(())
}

fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Image references of fresh chapters whose bytes are not yet held
fn pending_image_jobs(resolved: &BTreeMap<ChapterOrder, Resolved>) -> Vec<ImageJob> {
    let mut jobs = Vec::new();
    for (order, chapter) in resolved {
        let Body::Fresh { content, images } = &chapter.body else {
            continue;
        };
        for reference in &content.images {
            if !images.iter().any(|i| i.offset == reference.offset) {
                jobs.push(ImageJob {
                    order: *order,
                    offset: reference.offset,
                    url: reference.url.clone(),
                });
            }
        }
    }
    jobs
}

/// Merge the resolved range with everything in the existing artifact outside
/// it, sorted by order (the BTreeMap iteration gives ascending keys)
fn assemble_input(
    request: &SyncRequest,
    existing: &ExistingBook,
    resolved: &BTreeMap<ChapterOrder, Resolved>,
) -> Vec<BookChapter> {
    let mut chapters = Vec::with_capacity(existing.entries.len() + resolved.len());

    for (order, entry) in &existing.entries {
        if (request.start..=request.end).contains(order) {
            continue; // the resolved set owns the requested range
        }
        let source = match (&entry.status, &entry.xhtml) {
            (ChapterStatus::Downloaded, Some(xhtml)) => ChapterSource::Verbatim {
                xhtml: xhtml.clone(),
                images: entry.images.clone(),
            },
            _ => ChapterSource::Placeholder,
        };
        chapters.push(BookChapter {
            order: *order,
            title: entry.title.clone(),
            status: entry.status,
            source,
        });
    }

    for (order, chapter) in resolved {
        let source = match &chapter.body {
            Body::Fresh { content, images } => ChapterSource::Fresh {
                html: content.html.clone(),
                images: images.clone(),
            },
            Body::Verbatim { xhtml, images } => ChapterSource::Verbatim {
                xhtml: xhtml.clone(),
                images: images.clone(),
            },
            Body::Placeholder => ChapterSource::Placeholder,
        };
        chapters.push(BookChapter {
            order: *order,
            title: chapter.title.clone(),
            status: chapter.status,
            source,
        });
    }

    chapters.sort_by_key(|c| c.order);
    chapters
}

fn tally(
    request: &SyncRequest,
    resolved: &BTreeMap<ChapterOrder, Resolved>,
    images_downloaded: u32,
    started_at: DateTime<Utc>,
) -> SyncStatistics {
    let mut stats = SyncStatistics {
        newly_downloaded: 0,
        restored_from_cache: 0,
        reused: 0,
        failed: 0,
        locked_chapters: 0,
        images_downloaded,
        total_chapters: request.total_chapters(),
        started_at,
        duration: Duration::ZERO,
    };
    for chapter in resolved.values() {
        match chapter.bucket {
            Bucket::NewlyDownloaded => stats.newly_downloaded += 1,
            Bucket::RestoredFromCache => stats.restored_from_cache += 1,
            Bucket::Reused => stats.reused += 1,
            Bucket::Failed => stats.failed += 1,
            Bucket::Locked => stats.locked_chapters += 1,
        }
    }
    stats
}
