//! Error types for novel-dl
//!
//! Run-fatal conditions (unusable request, no table of contents, unwritable
//! directories) are the only errors that cross the orchestrator boundary as
//! `Err`. Per-chapter problems are captured as [`crate::types::ChapterOutcome`]
//! values so a batch can continue around them.

use thiserror::Error;

use crate::types::ChapterOrder;

/// Result type alias for novel-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for novel-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid request or configuration, with the offending key when known
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable description of what is invalid
        message: String,
        /// The request/config field that caused the error (e.g., "start")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error from an HTTP-backed source client
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error (cache entries, boundary types)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Table of contents could not be obtained at all (run-fatal)
    #[error("table of contents error: {0}")]
    Toc(String),

    /// Source-side error for a single chapter or image
    #[error("source error: {0}")]
    Source(String),

    /// Chapter is behind a paywall or VIP gate
    #[error("chapter {order} is locked")]
    ChapterLocked {
        /// The locked chapter's canonical order
        order: ChapterOrder,
    },

    /// Chapter order missing from an otherwise valid table of contents
    #[error("chapter {order} not found in table of contents")]
    ChapterNotFound {
        /// The missing chapter's canonical order
        order: ChapterOrder,
    },

    /// Chapter cache storage error
    #[error("cache error: {0}")]
    Cache(String),

    /// EPUB packaging or inspection error
    #[error("epub error: {0}")]
    Epub(String),

    /// ZIP container error while reading or writing an EPUB
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The run was cancelled
    #[error("sync cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}
