//! Scriptable in-memory source for engine tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::source::SourceClient;
use crate::types::{
    BookId, BookSummary, ChapterContent, ChapterOrder, ImageRef, TocEntry,
};

#[derive(Clone, Debug)]
enum FetchMode {
    Ok,
    Locked,
    AlwaysFail,
    /// Fail with a retryable error this many more times, then succeed
    FailTimes(u32),
    /// Panic inside the fetch (simulates a crashing worker)
    Panic,
}

#[derive(Clone, Debug)]
struct ChapterState {
    toc: TocEntry,
    html: String,
    images: Vec<ImageRef>,
    mode: FetchMode,
    extra_delay: Duration,
}

#[derive(Clone, Debug)]
enum ImageState {
    Ok { data: Vec<u8>, media_type: String },
    Fail,
}

#[derive(Default)]
struct State {
    chapters: BTreeMap<ChapterOrder, ChapterState>,
    images: HashMap<String, ImageState>,
    fail_toc: bool,
}

/// In-memory [`SourceClient`] whose behavior is scripted per chapter/image
/// and which records how it was called
pub(crate) struct MockSource {
    state: std::sync::Mutex<State>,
    response_delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    dispatch_starts: Arc<std::sync::Mutex<Vec<Instant>>>,
    chapter_requests: Arc<std::sync::Mutex<Vec<String>>>,
}

impl MockSource {
    /// A source serving chapters 1..=count, all fetchable
    pub(crate) fn with_chapters(count: u32) -> Self {
        let mut chapters = BTreeMap::new();
        for n in 1..=count {
            let order = ChapterOrder::new(n);
            chapters.insert(
                order,
                ChapterState {
                    toc: TocEntry {
                        order,
                        chapter_id: format!("ch{}", n),
                        title: format!("Chapter {}", n),
                        is_locked: false,
                        needs_payment: false,
                    },
                    html: format!("<p>Chapter {} body</p>", n),
                    images: Vec::new(),
                    mode: FetchMode::Ok,
                    extra_delay: Duration::ZERO,
                },
            );
        }
        Self {
            state: std::sync::Mutex::new(State {
                chapters,
                ..State::default()
            }),
            response_delay: Duration::ZERO,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            dispatch_starts: Arc::new(std::sync::Mutex::new(Vec::new())),
            chapter_requests: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Delay every chapter/image response by `delay`
    pub(crate) fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    fn with_chapter_mut(&self, order: u32, f: impl FnOnce(&mut ChapterState)) {
        let mut state = self.state.lock().unwrap();
        if let Some(chapter) = state.chapters.get_mut(&ChapterOrder::new(order)) {
            f(chapter);
        }
    }

    /// Content fetches for this chapter surface `ChapterLocked`
    pub(crate) fn lock_chapter(&self, order: u32) {
        self.with_chapter_mut(order, |c| c.mode = FetchMode::Locked);
    }

    /// Mark this chapter as gated in the table of contents itself
    pub(crate) fn gate_in_toc(&self, order: u32) {
        self.with_chapter_mut(order, |c| c.toc.is_locked = true);
    }

    /// Content fetches for this chapter always fail permanently
    pub(crate) fn fail_chapter_always(&self, order: u32) {
        self.with_chapter_mut(order, |c| c.mode = FetchMode::AlwaysFail);
    }

    /// Content fetches fail with a retryable error `times` times, then succeed
    pub(crate) fn fail_chapter_times(&self, order: u32, times: u32) {
        self.with_chapter_mut(order, |c| c.mode = FetchMode::FailTimes(times));
    }

    /// Content fetches for this chapter panic mid-request
    pub(crate) fn panic_chapter(&self, order: u32) {
        self.with_chapter_mut(order, |c| c.mode = FetchMode::Panic);
    }

    /// Add an extra response delay to one chapter (for completion-order tests)
    pub(crate) fn delay_chapter(&self, order: u32, delay: Duration) {
        self.with_chapter_mut(order, |c| c.extra_delay = delay);
    }

    /// Attach image references to a chapter's content
    pub(crate) fn set_chapter_images(&self, order: u32, images: Vec<ImageRef>) {
        self.with_chapter_mut(order, |c| c.images = images);
    }

    /// Table-of-contents requests fail
    pub(crate) fn fail_toc(&self) {
        self.state.lock().unwrap().fail_toc = true;
    }

    /// Serve an image at `url`
    pub(crate) fn add_image(&self, url: &str, data: Vec<u8>, media_type: &str) {
        self.state.lock().unwrap().images.insert(
            url.to_string(),
            ImageState::Ok {
                data,
                media_type: media_type.to_string(),
            },
        );
    }

    /// Image requests for `url` fail permanently
    pub(crate) fn fail_image(&self, url: &str) {
        self.state
            .lock()
            .unwrap()
            .images
            .insert(url.to_string(), ImageState::Fail);
    }

    /// Highest number of concurrently in-flight requests observed
    pub(crate) fn max_in_flight_handle(&self) -> Arc<AtomicUsize> {
        self.max_in_flight.clone()
    }

    /// Instants at which chapter requests arrived, in arrival order
    pub(crate) fn dispatch_starts_handle(&self) -> Arc<std::sync::Mutex<Vec<Instant>>> {
        self.dispatch_starts.clone()
    }

    /// Total chapter content requests served so far
    pub(crate) fn chapter_request_count(&self) -> usize {
        self.chapter_requests.lock().unwrap().len()
    }

    fn enter(&self) -> InFlightGuard {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        InFlightGuard {
            in_flight: self.in_flight.clone(),
        }
    }
}

/// Decrements the in-flight counter even when the request future is dropped
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceClient for MockSource {
    async fn search_books(&self, keyword: &str) -> Result<Vec<BookSummary>> {
        Ok(vec![BookSummary {
            id: BookId::new("mock-book"),
            title: format!("Results for {}", keyword),
            author: "Mock Author".to_string(),
            cover_url: None,
        }])
    }

    async fn table_of_contents(&self, _book_id: &BookId) -> Result<Vec<TocEntry>> {
        if self.response_delay > Duration::ZERO {
            tokio::time::sleep(self.response_delay).await;
        }
        let state = self.state.lock().unwrap();
        if state.fail_toc {
            return Err(Error::Toc("mock table of contents failure".to_string()));
        }
        Ok(state.chapters.values().map(|c| c.toc.clone()).collect())
    }

    async fn chapter_content(&self, _book_id: &BookId, chapter_id: &str) -> Result<ChapterContent> {
        self.dispatch_starts.lock().unwrap().push(Instant::now());
        self.chapter_requests
            .lock()
            .unwrap()
            .push(chapter_id.to_string());
        let _guard = self.enter();

        // Panic outside the state lock so it doesn't get poisoned for the
        // chapters that are still being served
        let scripted_panic = {
            let state = self.state.lock().unwrap();
            state
                .chapters
                .values()
                .any(|c| c.toc.chapter_id == chapter_id && matches!(c.mode, FetchMode::Panic))
        };
        if scripted_panic {
            panic!("scripted chapter fetch panic");
        }

        // Decide the response (and consume one scripted failure) before
        // sleeping, so concurrent retries can't double-consume
        let (delay, result) = {
            let mut state = self.state.lock().unwrap();
            let Some(chapter) = state
                .chapters
                .values_mut()
                .find(|c| c.toc.chapter_id == chapter_id)
            else {
                return Err(Error::Source(format!("unknown chapter id {}", chapter_id)));
            };
            let delay = self.response_delay + chapter.extra_delay;
            let result = match &mut chapter.mode {
                FetchMode::Ok => Ok(ChapterContent {
                    html: chapter.html.clone(),
                    images: chapter.images.clone(),
                }),
                FetchMode::Locked => Err(Error::ChapterLocked {
                    order: chapter.toc.order,
                }),
                FetchMode::AlwaysFail => {
                    Err(Error::Source("mock permanent failure".to_string()))
                }
                // Handled above, before the lock
                FetchMode::Panic => unreachable!(),
                FetchMode::FailTimes(remaining) => {
                    if *remaining > 0 {
                        *remaining -= 1;
                        Err(Error::Source("temporary mock glitch".to_string()))
                    } else {
                        Ok(ChapterContent {
                            html: chapter.html.clone(),
                            images: chapter.images.clone(),
                        })
                    }
                }
            };
            (delay, result)
        };

        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn image(&self, url: &str) -> Result<(Vec<u8>, String)> {
        let _guard = self.enter();
        if self.response_delay > Duration::ZERO {
            tokio::time::sleep(self.response_delay).await;
        }
        let state = self.state.lock().unwrap();
        match state.images.get(url) {
            Some(ImageState::Ok { data, media_type }) => Ok((data.clone(), media_type.clone())),
            Some(ImageState::Fail) => {
                Err(Error::Source(format!("mock image failure for {}", url)))
            }
            None => Err(Error::Source(format!("unknown image url {}", url))),
        }
    }
}
