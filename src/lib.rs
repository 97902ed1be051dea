//! # novel-dl
//!
//! Incremental web-novel download and EPUB assembly library.
//!
//! ## Design Philosophy
//!
//! novel-dl is designed to be:
//! - **Incremental** - Re-running a sync downloads only what is missing;
//!   everything already in the output artifact or the on-disk cache is reused
//! - **Crash-safe** - Every downloaded chapter is cached before assembly, so
//!   an interrupted run never loses completed work
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding;
//!   site-specific scraping lives behind the [`SourceClient`] trait
//! - **Event-driven** - Consumers subscribe to progress events, no polling
//!   required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use novel_dl::{Config, NovelSyncer, SyncRequest, BookId, ChapterOrder};
//! # use novel_dl::SourceClient;
//! # fn my_source() -> Arc<dyn SourceClient> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() {
//!     let source = my_source(); // your site-specific SourceClient
//!     let syncer = NovelSyncer::new(source, Config::default());
//!
//!     // Subscribe to progress events
//!     let mut progress = syncer.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = progress.recv().await {
//!             println!("[{:>3}%] {}", event.total_progress, event.message);
//!         }
//!     });
//!
//!     let result = syncer
//!         .sync(SyncRequest {
//!             book_id: BookId::new("12345"),
//!             book_title: Some("My Book".to_string()),
//!             start: ChapterOrder::new(1),
//!             end: ChapterOrder::new(100),
//!             temp_dir: "/tmp/novel-dl".into(),
//!             output_dir: "downloads".into(),
//!             existing_output_path: Some("downloads/12345.epub".into()),
//!             retry_failed_chapters: false,
//!             continue_on_error: true,
//!         })
//!         .await;
//!     println!("success: {}", result.success);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Chapter cache persistence
pub mod cache;
/// Configuration types
pub mod config;
/// EPUB assembly and inspection
pub mod epub;
/// Error types
pub mod error;
/// Rate-limited concurrent fetching
pub mod fetcher;
/// Retry logic with exponential backoff
pub mod retry;
/// Source client trait
pub mod source;
/// Sync orchestration (decomposed into focused submodules)
pub mod sync;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use cache::{CacheEntry, ChapterCache};
pub use config::{Config, EpubConfig, FetchConfig, RetryConfig};
pub use epub::inspector::EpubInspector;
pub use epub::{Assembler, BookChapter, ChapterSource, EpubAssembler};
pub use error::{Error, Result};
pub use fetcher::{ChapterJob, ImageJob, RateLimitedFetcher};
pub use source::SourceClient;
pub use sync::NovelSyncer;
pub use types::{
    BookId, BookSummary, ChapterContent, ChapterImage, ChapterOrder, ChapterOutcome,
    ChapterStatus, DownloadDetail, ExistingBook, ImageRef, ReuseEntry, SyncPhase, SyncProgress,
    SyncRequest, SyncResult, SyncStatistics, TocEntry,
};
