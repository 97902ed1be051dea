//! Per-chapter plan resolution
//!
//! Pure decision logic: given what the existing output already holds, what
//! the cache holds, and what the table of contents says, decide how one
//! chapter order is satisfied. Resolution priority, highest first:
//!
//! 1. existing output has real content       -> reuse, no I/O
//! 2. existing output says locked            -> reuse the locked placeholder
//! 3. existing output says failed, no retry  -> reuse the failed placeholder
//! 4. cache entry present                    -> restore, no network I/O
//! 5. otherwise                              -> fetch (or terminal states the
//!    toc already determines: gated or missing)

use crate::cache::CacheEntry;
use crate::types::{ChapterStatus, ReuseEntry, TocEntry};

/// How one requested chapter order will be satisfied
#[derive(Clone, Debug)]
pub enum ChapterPlan {
    /// Re-emit real content from the existing output, no I/O
    Reuse(ReuseEntry),
    /// Keep the existing locked placeholder, no I/O
    ReuseLocked(ReuseEntry),
    /// Keep the existing failed placeholder (retry not requested), no I/O
    ReuseFailed(ReuseEntry),
    /// Restore from the chapter cache, no network I/O
    Restore(CacheEntry),
    /// The toc gates this chapter; record a locked placeholder without fetching
    Locked {
        /// Chapter title from the toc
        title: String,
    },
    /// Dispatch to the rate-limited fetcher
    Fetch {
        /// Source-assigned chapter identifier
        chapter_id: String,
        /// Chapter title from the toc
        title: String,
    },
    /// The order is absent from an otherwise valid toc; a per-chapter failure
    MissingFromToc,
}

impl ChapterPlan {
    /// Whether this plan requires network I/O
    pub fn needs_fetch(&self) -> bool {
        matches!(self, ChapterPlan::Fetch { .. })
    }
}

/// Resolve the plan for one chapter order
pub(crate) fn resolve(
    reuse: Option<&ReuseEntry>,
    cached: Option<CacheEntry>,
    toc: Option<&TocEntry>,
    retry_failed_chapters: bool,
) -> ChapterPlan {
    if let Some(entry) = reuse {
        match entry.status {
            ChapterStatus::Downloaded if entry.xhtml.is_some() => {
                return ChapterPlan::Reuse(entry.clone());
            }
            ChapterStatus::Locked => return ChapterPlan::ReuseLocked(entry.clone()),
            ChapterStatus::Failed if !retry_failed_chapters => {
                return ChapterPlan::ReuseFailed(entry.clone());
            }
            // Failed with retry requested, or a Downloaded slot whose content
            // did not survive inspection: fall through to cache, then fetch
            _ => {}
        }
    }

    if let Some(entry) = cached {
        return ChapterPlan::Restore(entry);
    }

    match toc {
        None => ChapterPlan::MissingFromToc,
        Some(entry) if entry.is_gated() => ChapterPlan::Locked {
            title: entry.title.clone(),
        },
        Some(entry) => ChapterPlan::Fetch {
            chapter_id: entry.chapter_id.clone(),
            title: entry.title.clone(),
        },
    }
}
