//! Machine-readable per-chapter status markers
//!
//! Each chapter XHTML in the output EPUB carries a comment associating it
//! with a book id, chapter order, and [`ChapterStatus`]. The markers are the
//! only durable record of per-chapter state: a later run's inspector
//! classifies every chapter slot from them without re-parsing any business
//! logic.

use regex::Regex;
use std::sync::LazyLock;

use crate::types::{BookId, ChapterOrder, ChapterStatus};

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Field order is fixed by emit(); parsing is strict on purpose so an
    // unmarked or foreign chapter file classifies as "no marker" rather than
    // a half-parsed one.
    #[allow(clippy::expect_used)]
    Regex::new(
        r#"<!--\s*novel-dl:chapter\s+book="([^"]*)"\s+order="(\d+)"\s+status="(\w+)"\s*-->"#,
    )
    .expect("marker regex is valid")
});

/// A parsed or to-be-emitted status marker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Marker {
    /// Book the chapter belongs to
    pub book_id: BookId,
    /// Canonical chapter order
    pub order: ChapterOrder,
    /// Durable chapter status
    pub status: ChapterStatus,
}

impl Marker {
    /// Render the marker as an XHTML comment
    pub fn emit(&self) -> String {
        format!(
            r#"<!-- novel-dl:chapter book="{}" order="{}" status="{}" -->"#,
            escape(self.book_id.as_str()),
            self.order,
            self.status
        )
    }

    /// Find and parse the first marker in a chapter document
    pub fn parse(xhtml: &str) -> Option<Marker> {
        let caps = MARKER_RE.captures(xhtml)?;
        let order: u32 = caps[2].parse().ok()?;
        let status = ChapterStatus::parse(&caps[3])?;
        Some(Marker {
            book_id: BookId::new(unescape(&caps[1])),
            order: ChapterOrder::new(order),
            status,
        })
    }
}

/// Minimal XML attribute escaping for opaque book ids
fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
