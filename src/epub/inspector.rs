//! Existing-output inspector
//!
//! Opens a previously produced EPUB and classifies every chapter slot it
//! contains by the status marker each chapter document carries. Strictly
//! read-only: the artifact is never mutated, only mapped into [`ExistingBook`]
//! so the orchestrator can decide what to reuse.

use regex::Regex;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{ChapterImage, ChapterOrder, ChapterStatus, ExistingBook, ReuseEntry};

use super::marker::Marker;

static CHAPTER_ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^OEBPS/chapter_(\d+)\.xhtml$").expect("chapter entry regex is valid")
});

static IMAGE_ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^OEBPS/images/img_(\d+)_(\d+)\.(\w+)$").expect("image entry regex is valid")
});

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"<title>([^<]*)</title>").expect("title regex is valid")
});

static DC_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"<dc:title>([^<]*)</dc:title>").expect("dc:title regex is valid")
});

/// Reads prior output artifacts into reuse maps
#[derive(Clone, Copy, Debug, Default)]
pub struct EpubInspector;

impl EpubInspector {
    /// Inspect the artifact at `path`
    ///
    /// Chapter documents without a parseable marker are skipped with a
    /// warning rather than failing the inspection; an artifact this crate did
    /// not produce simply yields an empty reuse map.
    pub async fn inspect(&self, path: &Path) -> Result<ExistingBook> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || inspect_blocking(&path))
            .await
            .map_err(|e| Error::Epub(format!("inspection task panicked: {}", e)))?
    }
}

fn inspect_blocking(path: &Path) -> Result<ExistingBook> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Epub(format!("cannot open existing output {}: {}", path.display(), e)))?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut book = ExistingBook::default();
    let mut images: BTreeMap<ChapterOrder, BTreeMap<usize, ChapterImage>> = BTreeMap::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();

        if let Some(caps) = CHAPTER_ENTRY_RE.captures(&name) {
            let Ok(order) = caps[1].parse::<u32>() else {
                continue;
            };
            let order = ChapterOrder::new(order);

            let mut xhtml = String::new();
            if entry.read_to_string(&mut xhtml).is_err() {
                warn!(entry = %name, "Chapter entry is not valid UTF-8, skipping");
                continue;
            }

            let Some(marker) = Marker::parse(&xhtml) else {
                warn!(entry = %name, "Chapter entry carries no status marker, skipping");
                continue;
            };
            if marker.order != order {
                warn!(entry = %name, marker_order = %marker.order,
                    "Marker order disagrees with entry name, skipping");
                continue;
            }
            if book.book_id.is_none() {
                book.book_id = Some(marker.book_id.clone());
            }

            let title = TITLE_RE
                .captures(&xhtml)
                .map(|c| c[1].trim().to_string())
                .unwrap_or_else(|| format!("Chapter {}", order));

            book.entries.insert(
                order,
                ReuseEntry {
                    status: marker.status,
                    title,
                    xhtml: (marker.status == ChapterStatus::Downloaded).then_some(xhtml),
                    images: Vec::new(),
                },
            );
        } else if let Some(caps) = IMAGE_ENTRY_RE.captures(&name) {
            let (Ok(order), Ok(index)) = (caps[1].parse::<u32>(), caps[2].parse::<usize>()) else {
                continue;
            };
            let media_type = media_type_for_extension(&caps[3]);

            let mut data = Vec::new();
            if entry.read_to_end(&mut data).is_err() {
                warn!(entry = %name, "Image entry unreadable, skipping");
                continue;
            }

            images.entry(ChapterOrder::new(order)).or_default().insert(
                index,
                ChapterImage {
                    // Original source offsets are not recorded in the
                    // artifact; index order is what re-emission needs.
                    offset: index,
                    media_type,
                    data,
                },
            );
        } else if name == "OEBPS/content.opf" {
            let mut opf = String::new();
            if entry.read_to_string(&mut opf).is_ok() {
                book.title = DC_TITLE_RE.captures(&opf).map(|c| c[1].trim().to_string());
            }
        }
    }

    // Attach images to their chapters, ascending by index
    for (order, by_index) in images {
        if let Some(reuse) = book.entries.get_mut(&order) {
            reuse.images = by_index.into_values().collect();
        }
    }

    debug!(
        path = %path.display(),
        chapters = book.entries.len(),
        "Existing output inspected"
    );
    Ok(book)
}

fn media_type_for_extension(ext: &str) -> String {
    match ext {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "image/jpeg",
    }
    .to_string()
}
