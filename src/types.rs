//! Core types for novel-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Opaque source-assigned identifier for a book
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(pub String);

impl BookId {
    /// Create a new BookId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BookId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for BookId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for BookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1-based position of a chapter in a book's canonical table of contents
///
/// The unit of caching, fetching, and reuse. Always source-assigned, never a
/// synthetic key.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChapterOrder(pub u32);

impl ChapterOrder {
    /// Create a new ChapterOrder
    pub fn new(order: u32) -> Self {
        Self(order)
    }

    /// Get the inner u32 value
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for ChapterOrder {
    fn from(order: u32) -> Self {
        Self(order)
    }
}

impl std::fmt::Display for ChapterOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ChapterOrder {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// One row of a book search result
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BookSummary {
    /// Source-assigned book identifier
    pub id: BookId,
    /// Book title
    pub title: String,
    /// Author name
    pub author: String,
    /// Cover image URL, if the source exposes one
    pub cover_url: Option<String>,
}

/// One entry of a book's canonical table of contents
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TocEntry {
    /// Canonical 1-based position
    pub order: ChapterOrder,
    /// Source-assigned chapter identifier, passed back when fetching content
    pub chapter_id: String,
    /// Chapter title
    pub title: String,
    /// Chapter is gated behind a paywall or VIP flag
    pub is_locked: bool,
    /// Chapter requires payment to access
    pub needs_payment: bool,
}

impl TocEntry {
    /// Whether the source will refuse to serve this chapter's content
    pub fn is_gated(&self) -> bool {
        self.is_locked || self.needs_payment
    }
}

/// A reference to an embedded image inside fetched chapter HTML
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Byte offset in the chapter HTML where the image tag belongs
    pub offset: usize,
    /// Remote URL of the image
    pub url: String,
}

/// A fetched image ready to be embedded in the output artifact
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterImage {
    /// Byte offset in the chapter HTML where the image tag belongs
    pub offset: usize,
    /// Media type of the image data (e.g., "image/jpeg")
    pub media_type: String,
    /// Raw image bytes
    pub data: Vec<u8>,
}

impl ChapterImage {
    /// File extension matching the image's media type
    pub fn extension(&self) -> &'static str {
        match self.media_type.as_str() {
            "image/png" => "png",
            "image/gif" => "gif",
            "image/webp" => "webp",
            "image/svg+xml" => "svg",
            _ => "jpg",
        }
    }
}

/// Raw chapter content as returned by a source client
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChapterContent {
    /// Chapter body HTML
    pub html: String,
    /// References to images embedded in the body
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// Durable per-chapter state, embedded in the output artifact as a marker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChapterStatus {
    /// Real content is present
    Downloaded,
    /// Paywalled/VIP chapter, represented by a permanent placeholder
    Locked,
    /// Fetch failed, represented by a retryable placeholder
    Failed,
}

impl ChapterStatus {
    /// Marker token for this status
    pub fn as_str(&self) -> &'static str {
        match self {
            ChapterStatus::Downloaded => "downloaded",
            ChapterStatus::Locked => "locked",
            ChapterStatus::Failed => "failed",
        }
    }

    /// Parse a marker token back into a status
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "downloaded" => Some(ChapterStatus::Downloaded),
            "locked" => Some(ChapterStatus::Locked),
            "failed" => Some(ChapterStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChapterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified result of fetching one chapter
///
/// Exactly one variant holds per chapter order per run. `Locked` and `Failed`
/// are both terminal for the run; only `Failed` is eligible for retry on a
/// future run.
#[derive(Clone, Debug)]
pub enum ChapterOutcome {
    /// Content fetched successfully
    Downloaded(ChapterContent),
    /// Chapter is paywalled/VIP-gated
    Locked,
    /// Fetch failed after the retry budget was exhausted
    Failed(String),
}

impl ChapterOutcome {
    /// The durable status this outcome maps to
    pub fn status(&self) -> ChapterStatus {
        match self {
            ChapterOutcome::Downloaded(_) => ChapterStatus::Downloaded,
            ChapterOutcome::Locked => ChapterStatus::Locked,
            ChapterOutcome::Failed(_) => ChapterStatus::Failed,
        }
    }
}

/// Phase of a sync run
///
/// Phases advance in declaration order with no back-edges; `Failed` and
/// `Cancelled` are reachable from any non-terminal phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Validating the request and inspecting any existing output
    Analyzing,
    /// Obtaining the canonical chapter list from the source
    FetchingToc,
    /// Resolving a per-chapter plan against the reuse map and cache
    CheckingCache,
    /// Fetching missing chapters from the source
    DownloadingChapters,
    /// Fetching embedded images not yet cached
    DownloadingImages,
    /// Assembling the output EPUB
    GeneratingEpub,
    /// Discarding cache entries now embedded in the output
    CleaningUp,
    /// Run finished successfully
    Completed,
    /// Run failed
    Failed,
    /// Run was cancelled
    Cancelled,
}

impl SyncPhase {
    /// Whether this phase is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncPhase::Completed | SyncPhase::Failed | SyncPhase::Cancelled
        )
    }
}

/// Per-phase download counters attached to progress events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDetail {
    /// Items completed so far in this phase
    pub completed: u64,
    /// Total items in this phase
    pub total: u64,
}

/// One progress event
///
/// Purely observational: emitted zero or more times per run, never awaited by
/// the orchestrator, never influences control flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Book the event belongs to; subscribers watching concurrent runs
    /// partition the stream by this field
    pub book_id: BookId,
    /// Current phase
    pub phase: SyncPhase,
    /// Overall progress, 0-100, non-decreasing across a run
    pub total_progress: u8,
    /// Human-readable description of what is happening
    pub message: String,
    /// Phase-internal counters, when the phase has countable sub-work
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadDetail>,
}

/// Exact accounting of a completed run
///
/// Every requested chapter order contributes to exactly one of
/// `newly_downloaded | restored_from_cache | reused | failed | locked_chapters`,
/// and `total_chapters` equals their sum.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncStatistics {
    /// Chapters fetched from the source this run
    pub newly_downloaded: u32,
    /// Chapters restored from the on-disk cache without network I/O
    pub restored_from_cache: u32,
    /// Chapters re-emitted from the existing output artifact
    pub reused: u32,
    /// Chapters that failed this run
    pub failed: u32,
    /// Chapters whose final status is locked
    pub locked_chapters: u32,
    /// Images fetched from the source this run
    pub images_downloaded: u32,
    /// Total chapters in the requested range
    pub total_chapters: u32,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the run
    #[serde(with = "crate::config::duration_ms_serde")]
    pub duration: Duration,
}

impl SyncStatistics {
    /// Whether the per-chapter buckets partition the requested range exactly
    pub fn is_exact_partition(&self) -> bool {
        self.newly_downloaded
            + self.restored_from_cache
            + self.reused
            + self.failed
            + self.locked_chapters
            == self.total_chapters
    }
}

/// A sync request: which book, which chapters, where to work
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Source-assigned book identifier
    pub book_id: BookId,
    /// Title for the output metadata; falls back to the existing artifact's
    /// title, then a generic one
    #[serde(default)]
    pub book_title: Option<String>,
    /// First chapter order to sync (1-based, inclusive)
    pub start: ChapterOrder,
    /// Last chapter order to sync (inclusive, `start <= end`)
    pub end: ChapterOrder,
    /// Caller-owned scratch directory holding the chapter cache
    pub temp_dir: PathBuf,
    /// Directory the output EPUB is written into
    pub output_dir: PathBuf,
    /// Prior output artifact to merge with and reuse chapters from
    pub existing_output_path: Option<PathBuf>,
    /// Re-attempt chapters the existing output recorded as failed
    pub retry_failed_chapters: bool,
    /// Keep going past per-chapter failures instead of failing the run
    pub continue_on_error: bool,
}

impl SyncRequest {
    /// Number of chapters in the requested range
    pub fn total_chapters(&self) -> u32 {
        self.end.get() - self.start.get() + 1
    }

    /// Iterate the requested chapter orders in ascending order
    pub fn orders(&self) -> impl Iterator<Item = ChapterOrder> + use<> {
        (self.start.get()..=self.end.get()).map(ChapterOrder::new)
    }
}

/// Final result of a sync run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncResult {
    /// True iff the run reached the `Completed` phase
    pub success: bool,
    /// Path of the written artifact, when one was produced
    pub output_path: Option<PathBuf>,
    /// Populated only for run-fatal outcomes
    pub error_message: Option<String>,
    /// Exact accounting, when the run got far enough to produce one
    pub statistics: Option<SyncStatistics>,
}

/// A chapter slot recovered from an existing output artifact
///
/// Read-only input to the orchestrator; never mutated.
#[derive(Clone, Debug)]
pub struct ReuseEntry {
    /// Status the artifact recorded for this chapter
    pub status: ChapterStatus,
    /// Chapter title as serialized in the artifact
    pub title: String,
    /// The chapter's already-serialized XHTML, present when `Downloaded`
    pub xhtml: Option<String>,
    /// Image entries belonging to this chapter
    pub images: Vec<ChapterImage>,
}

/// Everything recovered from inspecting an existing output artifact
#[derive(Clone, Debug, Default)]
pub struct ExistingBook {
    /// Book identifier the artifact's markers carry, when present
    pub book_id: Option<BookId>,
    /// Book title from the artifact's metadata, when present
    pub title: Option<String>,
    /// Chapter slots keyed by order
    pub entries: BTreeMap<ChapterOrder, ReuseEntry>,
}
