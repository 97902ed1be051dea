//! EPUB assembly and inspection
//!
//! The assembler turns a resolved, ordered chapter set into a packaged EPUB;
//! the inspector ([`inspector`]) reads a prior artifact back into a reuse map.
//! Both sides share the status-marker format ([`marker`]): per-chapter state
//! lives in the artifact itself, there is no side database.

pub mod inspector;
pub mod marker;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::CompressionMethod;
use zip::write::FileOptions;

use crate::config::EpubConfig;
use crate::error::{Error, Result};
use crate::types::{BookId, ChapterImage, ChapterOrder, ChapterStatus};

use marker::Marker;

/// Where a chapter's serialized form comes from
#[derive(Clone, Debug)]
pub enum ChapterSource {
    /// Raw source HTML plus fetched images; wrapped and marked at write time
    Fresh {
        /// Chapter body HTML as fetched from the source
        html: String,
        /// Fetched images, offsets pointing into `html`
        images: Vec<ChapterImage>,
    },
    /// Already-serialized XHTML from a prior artifact, re-emitted as-is
    Verbatim {
        /// The complete chapter document, marker included
        xhtml: String,
        /// The chapter's image entries, in their original index order
        images: Vec<ChapterImage>,
    },
    /// No content; a placeholder body is generated from the status
    Placeholder,
}

/// One chapter handed to the assembler
#[derive(Clone, Debug)]
pub struct BookChapter {
    /// Canonical chapter order; also the spine position
    pub order: ChapterOrder,
    /// Chapter title
    pub title: String,
    /// Durable status recorded in the chapter's marker
    pub status: ChapterStatus,
    /// Serialized form
    pub source: ChapterSource,
}

/// Book-file serializer contract
///
/// Consumes the fully resolved chapter set (requested range merged with
/// everything from a prior artifact outside that range) and produces the
/// packaged output file. Chapters arrive sorted by order; the spine must
/// preserve that order.
#[async_trait]
pub trait Assembler: Send + Sync {
    /// Write the book to `output_path`, returning the path actually written
    async fn assemble(
        &self,
        book_id: &BookId,
        book_title: &str,
        chapters: Vec<BookChapter>,
        output_path: &Path,
    ) -> Result<PathBuf>;
}

/// EPUB 2 assembler
#[derive(Clone, Debug, Default)]
pub struct EpubAssembler {
    config: EpubConfig,
}

impl EpubAssembler {
    /// Create an assembler with the given output settings
    pub fn new(config: EpubConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Assembler for EpubAssembler {
    async fn assemble(
        &self,
        book_id: &BookId,
        book_title: &str,
        chapters: Vec<BookChapter>,
        output_path: &Path,
    ) -> Result<PathBuf> {
        let book_id = book_id.clone();
        let book_title = book_title.to_string();
        let output_path = output_path.to_path_buf();
        let config = self.config.clone();

        let written = tokio::task::spawn_blocking(move || {
            write_epub(&book_id, &book_title, chapters, &output_path, &config)
        })
        .await
        .map_err(|e| Error::Epub(format!("assembly task panicked: {}", e)))??;

        info!(path = %written.display(), "EPUB written");
        Ok(written)
    }
}

/// Zip entry name of a chapter document
pub(crate) fn chapter_entry_name(order: ChapterOrder) -> String {
    format!("OEBPS/chapter_{:04}.xhtml", order.get())
}

/// Zip entry name of a chapter's n-th image
pub(crate) fn image_entry_name(order: ChapterOrder, index: usize, extension: &str) -> String {
    format!("OEBPS/images/img_{}_{}.{}", order.get(), index, extension)
}

/// Href of an image relative to the chapter documents
fn image_href(order: ChapterOrder, index: usize, extension: &str) -> String {
    format!("images/img_{}_{}.{}", order.get(), index, extension)
}

fn write_epub(
    book_id: &BookId,
    book_title: &str,
    mut chapters: Vec<BookChapter>,
    output_path: &Path,
    config: &EpubConfig,
) -> Result<PathBuf> {
    // Spine order is chapter order, regardless of arrival order
    chapters.sort_by_key(|c| c.order);
    chapters.dedup_by_key(|c| c.order);

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Stage next to the target so the rename is same-filesystem; a prior
    // artifact at output_path stays intact until the new one is complete
    let part_path = output_path.with_extension("epub.part");
    let file = std::fs::File::create(&part_path)?;
    let mut zip = zip::ZipWriter::new(file);

    let stored: FileOptions = FileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated: FileOptions =
        FileOptions::default().compression_method(CompressionMethod::Deflated);

    // mimetype must be first and uncompressed
    zip.start_file("mimetype", stored)?;
    zip.write_all(b"application/epub+zip")?;

    zip.start_file("META-INF/container.xml", deflated)?;
    zip.write_all(CONTAINER_XML.as_bytes())?;

    zip.start_file("OEBPS/content.opf", deflated)?;
    zip.write_all(render_opf(book_id, book_title, &chapters, config).as_bytes())?;

    zip.start_file("OEBPS/toc.ncx", deflated)?;
    zip.write_all(render_ncx(book_id, book_title, &chapters).as_bytes())?;

    for chapter in &chapters {
        zip.start_file(chapter_entry_name(chapter.order), deflated)?;
        zip.write_all(render_chapter(book_id, chapter, config).as_bytes())?;

        for (index, image) in chapter_images(chapter).iter().enumerate() {
            zip.start_file(
                image_entry_name(chapter.order, index, image.extension()),
                deflated,
            )?;
            zip.write_all(&image.data)?;
        }
    }

    zip.finish()?;
    std::fs::rename(&part_path, output_path)?;

    debug!(chapters = chapters.len(), "EPUB package assembled");
    Ok(output_path.to_path_buf())
}

/// Images that will be written for a chapter, in index order
fn chapter_images(chapter: &BookChapter) -> Vec<&ChapterImage> {
    match &chapter.source {
        ChapterSource::Fresh { images, .. } => {
            let mut sorted: Vec<&ChapterImage> = images.iter().collect();
            sorted.sort_by_key(|i| i.offset);
            sorted
        }
        ChapterSource::Verbatim { images, .. } => images.iter().collect(),
        ChapterSource::Placeholder => Vec::new(),
    }
}

fn render_chapter(book_id: &BookId, chapter: &BookChapter, config: &EpubConfig) -> String {
    match &chapter.source {
        // Re-emitted exactly as inspected, marker and all
        ChapterSource::Verbatim { xhtml, .. } => xhtml.clone(),
        ChapterSource::Fresh { html, images } => {
            let body = inject_images(html, images, chapter.order);
            wrap_chapter(book_id, chapter, &body)
        }
        ChapterSource::Placeholder => {
            let text = match chapter.status {
                ChapterStatus::Locked => &config.locked_placeholder,
                _ => &config.failed_placeholder,
            };
            let body = format!("<p>{}</p>", xml_escape(text));
            wrap_chapter(book_id, chapter, &body)
        }
    }
}

/// Insert `<img>` tags for fetched images at their recorded byte offsets
///
/// Offsets are clamped onto char boundaries; an offset past the end appends.
/// Insertion runs back-to-front so earlier offsets stay valid.
fn inject_images(html: &str, images: &[ChapterImage], order: ChapterOrder) -> String {
    let mut sorted: Vec<(usize, &ChapterImage)> = {
        let mut v: Vec<&ChapterImage> = images.iter().collect();
        v.sort_by_key(|i| i.offset);
        v.into_iter().enumerate().collect()
    };
    sorted.reverse();

    let mut out = html.to_string();
    for (index, image) in sorted {
        let mut at = image.offset.min(out.len());
        while at > 0 && !out.is_char_boundary(at) {
            at -= 1;
        }
        let tag = format!(
            r#"<img src="{}" alt="illustration"/>"#,
            image_href(order, index, image.extension())
        );
        out.insert_str(at, &tag);
    }
    out
}

fn wrap_chapter(book_id: &BookId, chapter: &BookChapter, body: &str) -> String {
    let marker = Marker {
        book_id: book_id.clone(),
        order: chapter.order,
        status: chapter.status,
    };
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>{title}</title></head>
<body>
{marker}
<h1>{title}</h1>
{body}
</body>
</html>
"#,
        title = xml_escape(&chapter.title),
        marker = marker.emit(),
        body = body,
    )
}

fn render_opf(
    book_id: &BookId,
    book_title: &str,
    chapters: &[BookChapter],
    config: &EpubConfig,
) -> String {
    let mut manifest = String::from(
        r#"    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
"#,
    );
    let mut spine = String::new();

    for chapter in chapters {
        manifest.push_str(&format!(
            "    <item id=\"chap{order}\" href=\"chapter_{order:04}.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
            order = chapter.order.get(),
        ));
        spine.push_str(&format!(
            "    <itemref idref=\"chap{}\"/>\n",
            chapter.order.get()
        ));
        for (index, image) in chapter_images(chapter).iter().enumerate() {
            manifest.push_str(&format!(
                "    <item id=\"img{}_{}\" href=\"{}\" media-type=\"{}\"/>\n",
                chapter.order.get(),
                index,
                image_href(chapter.order, index, image.extension()),
                xml_escape(&image.media_type),
            ));
        }
    }

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="bookid" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>{title}</dc:title>
    <dc:language>{language}</dc:language>
    <dc:identifier id="bookid">novel-dl:{id}</dc:identifier>
  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine toc="ncx">
{spine}  </spine>
</package>
"#,
        title = xml_escape(book_title),
        language = xml_escape(&config.language),
        id = xml_escape(book_id.as_str()),
        manifest = manifest,
        spine = spine,
    )
}

fn render_ncx(book_id: &BookId, book_title: &str, chapters: &[BookChapter]) -> String {
    let mut nav_points = String::new();
    for (n, chapter) in chapters.iter().enumerate() {
        nav_points.push_str(&format!(
            r#"    <navPoint id="nav{order}" playOrder="{play}">
      <navLabel><text>{title}</text></navLabel>
      <content src="chapter_{order:04}.xhtml"/>
    </navPoint>
"#,
            order = chapter.order.get(),
            play = n + 1,
            title = xml_escape(&chapter.title),
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content="novel-dl:{id}"/>
  </head>
  <docTitle><text>{title}</text></docTitle>
  <navMap>
{nav_points}  </navMap>
</ncx>
"#,
        id = xml_escape(book_id.as_str()),
        title = xml_escape(book_title),
        nav_points = nav_points,
    )
}

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

pub(crate) fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
