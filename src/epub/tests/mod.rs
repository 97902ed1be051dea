use std::io::Read;
use tempfile::tempdir;

use crate::config::EpubConfig;
use crate::epub::inspector::EpubInspector;
use crate::epub::{Assembler, BookChapter, ChapterSource, EpubAssembler};
use crate::types::{BookId, ChapterImage, ChapterOrder, ChapterStatus};

fn fresh_chapter(order: u32, html: &str) -> BookChapter {
    BookChapter {
        order: ChapterOrder::new(order),
        title: format!("Chapter {}", order),
        status: ChapterStatus::Downloaded,
        source: ChapterSource::Fresh {
            html: html.to_string(),
            images: Vec::new(),
        },
    }
}

fn placeholder_chapter(order: u32, status: ChapterStatus) -> BookChapter {
    BookChapter {
        order: ChapterOrder::new(order),
        title: format!("Chapter {}", order),
        status,
        source: ChapterSource::Placeholder,
    }
}

#[tokio::test]
async fn test_assemble_writes_valid_epub_structure() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("book.epub");
    let assembler = EpubAssembler::new(EpubConfig::default());

    let chapters = vec![
        fresh_chapter(1, "<p>one</p>"),
        fresh_chapter(2, "<p>two</p>"),
    ];
    let written = assembler
        .assemble(&BookId::new("b1"), "My Book", chapters, &output)
        .await
        .unwrap();
    assert_eq!(written, output);

    let file = std::fs::File::open(&output).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();

    // mimetype must be the first entry and stored uncompressed
    let first = archive.by_index(0).unwrap();
    assert_eq!(first.name(), "mimetype");
    assert_eq!(first.compression(), zip::CompressionMethod::Stored);
    drop(first);

    for required in [
        "META-INF/container.xml",
        "OEBPS/content.opf",
        "OEBPS/toc.ncx",
        "OEBPS/chapter_0001.xhtml",
        "OEBPS/chapter_0002.xhtml",
    ] {
        assert!(archive.by_name(required).is_ok(), "missing {}", required);
    }

    let mut opf = String::new();
    archive
        .by_name("OEBPS/content.opf")
        .unwrap()
        .read_to_string(&mut opf)
        .unwrap();
    assert!(opf.contains("<dc:title>My Book</dc:title>"));
    assert!(opf.contains("novel-dl:b1"));
}

#[tokio::test]
async fn test_spine_is_ascending_regardless_of_input_order() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("book.epub");
    let assembler = EpubAssembler::new(EpubConfig::default());

    let chapters = vec![
        fresh_chapter(30, "<p>c</p>"),
        fresh_chapter(10, "<p>a</p>"),
        fresh_chapter(20, "<p>b</p>"),
    ];
    assembler
        .assemble(&BookId::new("b1"), "My Book", chapters, &output)
        .await
        .unwrap();

    let file = std::fs::File::open(&output).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut opf = String::new();
    archive
        .by_name("OEBPS/content.opf")
        .unwrap()
        .read_to_string(&mut opf)
        .unwrap();

    let spine_start = opf.find("<spine").unwrap();
    let a = opf[spine_start..].find("idref=\"chap10\"").unwrap();
    let b = opf[spine_start..].find("idref=\"chap20\"").unwrap();
    let c = opf[spine_start..].find("idref=\"chap30\"").unwrap();
    assert!(a < b && b < c, "spine itemrefs are not in chapter order");
}

#[tokio::test]
async fn test_roundtrip_through_inspector() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("book.epub");
    let assembler = EpubAssembler::new(EpubConfig::default());

    let chapters = vec![
        fresh_chapter(1, "<p>real content</p>"),
        placeholder_chapter(2, ChapterStatus::Locked),
        placeholder_chapter(3, ChapterStatus::Failed),
    ];
    assembler
        .assemble(&BookId::new("book-42"), "My Book", chapters, &output)
        .await
        .unwrap();

    let book = EpubInspector.inspect(&output).await.unwrap();
    assert_eq!(book.book_id, Some(BookId::new("book-42")));
    assert_eq!(book.title.as_deref(), Some("My Book"));
    assert_eq!(book.entries.len(), 3);

    let one = &book.entries[&ChapterOrder::new(1)];
    assert_eq!(one.status, ChapterStatus::Downloaded);
    assert_eq!(one.title, "Chapter 1");
    assert!(one.xhtml.as_deref().unwrap().contains("real content"));

    let two = &book.entries[&ChapterOrder::new(2)];
    assert_eq!(two.status, ChapterStatus::Locked);
    assert!(two.xhtml.is_none(), "placeholder content is not reusable");

    let three = &book.entries[&ChapterOrder::new(3)];
    assert_eq!(three.status, ChapterStatus::Failed);
}

#[tokio::test]
async fn test_images_embedded_and_recovered() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("book.epub");
    let assembler = EpubAssembler::new(EpubConfig::default());

    let html = "<p>before</p><p>after</p>";
    let chapters = vec![BookChapter {
        order: ChapterOrder::new(5),
        title: "Chapter 5".to_string(),
        status: ChapterStatus::Downloaded,
        source: ChapterSource::Fresh {
            html: html.to_string(),
            images: vec![ChapterImage {
                offset: 13, // between the two paragraphs
                media_type: "image/png".to_string(),
                data: vec![0x89, 0x50, 0x4E, 0x47],
            }],
        },
    }];
    assembler
        .assemble(&BookId::new("b1"), "My Book", chapters, &output)
        .await
        .unwrap();

    let file = std::fs::File::open(&output).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();

    let mut xhtml = String::new();
    archive
        .by_name("OEBPS/chapter_0005.xhtml")
        .unwrap()
        .read_to_string(&mut xhtml)
        .unwrap();
    assert!(xhtml.contains(r#"<img src="images/img_5_0.png""#));
    let img_pos = xhtml.find("<img").unwrap();
    assert!(img_pos > xhtml.find("before").unwrap());
    assert!(img_pos < xhtml.find("after").unwrap());

    let mut data = Vec::new();
    archive
        .by_name("OEBPS/images/img_5_0.png")
        .unwrap()
        .read_to_end(&mut data)
        .unwrap();
    assert_eq!(data, vec![0x89, 0x50, 0x4E, 0x47]);

    let book = EpubInspector.inspect(&output).await.unwrap();
    let entry = &book.entries[&ChapterOrder::new(5)];
    assert_eq!(entry.images.len(), 1);
    assert_eq!(entry.images[0].media_type, "image/png");
    assert_eq!(entry.images[0].data, vec![0x89, 0x50, 0x4E, 0x47]);
}

#[tokio::test]
async fn test_verbatim_chapters_reemitted_unchanged() {
    let dir = tempdir().unwrap();
    let first = dir.path().join("first.epub");
    let second = dir.path().join("second.epub");
    let assembler = EpubAssembler::new(EpubConfig::default());

    assembler
        .assemble(
            &BookId::new("b1"),
            "My Book",
            vec![fresh_chapter(1, "<p>original</p>")],
            &first,
        )
        .await
        .unwrap();

    let inspected = EpubInspector.inspect(&first).await.unwrap();
    let entry = &inspected.entries[&ChapterOrder::new(1)];
    let original_xhtml = entry.xhtml.clone().unwrap();

    assembler
        .assemble(
            &BookId::new("b1"),
            "My Book",
            vec![BookChapter {
                order: ChapterOrder::new(1),
                title: entry.title.clone(),
                status: entry.status,
                source: ChapterSource::Verbatim {
                    xhtml: original_xhtml.clone(),
                    images: entry.images.clone(),
                },
            }],
            &second,
        )
        .await
        .unwrap();

    let file = std::fs::File::open(&second).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut xhtml = String::new();
    archive
        .by_name("OEBPS/chapter_0001.xhtml")
        .unwrap()
        .read_to_string(&mut xhtml)
        .unwrap();
    assert_eq!(xhtml, original_xhtml);
}

#[tokio::test]
async fn test_assemble_replaces_existing_output_atomically() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("book.epub");
    let assembler = EpubAssembler::new(EpubConfig::default());

    assembler
        .assemble(
            &BookId::new("b1"),
            "My Book",
            vec![fresh_chapter(1, "<p>v1</p>")],
            &output,
        )
        .await
        .unwrap();
    assembler
        .assemble(
            &BookId::new("b1"),
            "My Book",
            vec![fresh_chapter(1, "<p>v2</p>"), fresh_chapter(2, "<p>new</p>")],
            &output,
        )
        .await
        .unwrap();

    let book = EpubInspector.inspect(&output).await.unwrap();
    assert_eq!(book.entries.len(), 2);
    assert!(
        book.entries[&ChapterOrder::new(1)]
            .xhtml
            .as_deref()
            .unwrap()
            .contains("v2")
    );
    assert!(
        !output.with_extension("epub.part").exists(),
        "staging file left behind"
    );
}

#[tokio::test]
async fn test_inspect_missing_file_is_error() {
    let dir = tempdir().unwrap();
    let result = EpubInspector.inspect(&dir.path().join("missing.epub")).await;
    assert!(result.is_err());
}
