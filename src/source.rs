//! Source client trait — the boundary to site-specific scraping code
//!
//! The sync engine knows nothing about any particular novel site. Everything
//! source-specific (search, table-of-contents parsing, chapter markup
//! extraction) lives behind [`SourceClient`]; real implementations are
//! reqwest-backed and live outside this crate.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{BookId, BookSummary, ChapterContent, TocEntry};

/// Contract a site-specific client must fulfil
///
/// Error conventions the engine relies on:
/// - [`table_of_contents`](SourceClient::table_of_contents) failing is
///   run-fatal; implementations should return [`crate::Error::Toc`].
/// - A paywalled chapter must surface as [`crate::Error::ChapterLocked`], not
///   as a generic failure, so the engine can record a permanent placeholder
///   instead of burning its retry budget.
/// - Transient failures should surface as [`crate::Error::Network`] or
///   [`crate::Error::Source`] so retry classification works
///   (see [`crate::retry::IsRetryable`]).
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Search the source for books matching a keyword
    ///
    /// Used by callers before a sync starts; the engine itself never searches.
    async fn search_books(&self, keyword: &str) -> Result<Vec<BookSummary>>;

    /// Fetch the canonical, ordered table of contents for a book
    ///
    /// Must be total: every chapter the source knows about appears exactly
    /// once, in strictly increasing [`crate::types::ChapterOrder`].
    async fn table_of_contents(&self, book_id: &BookId) -> Result<Vec<TocEntry>>;

    /// Fetch one chapter's raw content
    ///
    /// `chapter_id` is the source-assigned identifier from the corresponding
    /// [`TocEntry`]. Returned HTML may reference images by URL; their bytes
    /// are fetched separately via [`image`](SourceClient::image).
    async fn chapter_content(&self, book_id: &BookId, chapter_id: &str) -> Result<ChapterContent>;

    /// Fetch one image's bytes and media type
    async fn image(&self, url: &str) -> Result<(Vec<u8>, String)>;
}
