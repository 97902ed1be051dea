//! On-disk chapter cache
//!
//! A content-addressed store keyed by `(book id, chapter order)`, living under
//! the caller-supplied temp directory. Pure storage: no network awareness, no
//! staleness or TTL — correctness of reuse is the orchestrator's call.
//!
//! Layout: `<root>/<book-slug>/<order>/entry.json` plus sibling `img_<n>.bin`
//! files. `entry.json` is written last inside a staging directory which is
//! then renamed over the target, so a directory containing an `entry.json` is
//! always a complete entry and `put` is last-write-wins.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{BookId, ChapterContent, ChapterImage, ChapterOrder, ImageRef};

/// A cached chapter: text, image references, and any fetched image bytes
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Chapter title from the table of contents
    pub title: String,
    /// Chapter HTML and its image references
    pub content: ChapterContent,
    /// Images whose bytes have been fetched, matched to refs by offset
    pub images: Vec<ChapterImage>,
}

/// On-disk manifest of a cache entry
#[derive(Serialize, Deserialize)]
struct EntryManifest {
    title: String,
    html: String,
    images: Vec<ImageManifest>,
}

#[derive(Serialize, Deserialize)]
struct ImageManifest {
    offset: usize,
    url: String,
    /// Media type, known once the image was fetched
    media_type: Option<String>,
    /// Sibling file holding the bytes, present once the image was fetched
    file: Option<String>,
}

/// File-backed chapter cache rooted at a caller-owned directory
#[derive(Clone, Debug)]
pub struct ChapterCache {
    root: PathBuf,
}

impl ChapterCache {
    /// Create a cache rooted at `root` (created lazily on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding all entries for one book
    pub fn book_dir(&self, book_id: &BookId) -> PathBuf {
        self.root.join(slug(book_id.as_str()))
    }

    fn entry_dir(&self, book_id: &BookId, order: ChapterOrder) -> PathBuf {
        self.book_dir(book_id).join(order.get().to_string())
    }

    /// Whether a complete entry exists for `(book_id, order)`
    pub async fn contains(&self, book_id: &BookId, order: ChapterOrder) -> bool {
        tokio::fs::try_exists(self.entry_dir(book_id, order).join("entry.json"))
            .await
            .unwrap_or(false)
    }

    /// Read the entry for `(book_id, order)`, if one exists
    ///
    /// A corrupt or half-written entry reads as a miss (logged), so the
    /// orchestrator falls back to fetching instead of failing the chapter.
    pub async fn get(&self, book_id: &BookId, order: ChapterOrder) -> Result<Option<CacheEntry>> {
        let dir = self.entry_dir(book_id, order);
        let manifest_path = dir.join("entry.json");

        let raw = match tokio::fs::read(&manifest_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Cache(format!("failed to read cache entry: {}", e))),
        };

        let manifest: EntryManifest = match serde_json::from_slice(&raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(book_id = %book_id, order = %order, error = %e,
                    "Corrupt cache entry, treating as miss");
                return Ok(None);
            }
        };

        let mut refs = Vec::with_capacity(manifest.images.len());
        let mut images = Vec::new();
        for img in &manifest.images {
            refs.push(ImageRef {
                offset: img.offset,
                url: img.url.clone(),
            });
            if let (Some(file), Some(media_type)) = (&img.file, &img.media_type) {
                match tokio::fs::read(dir.join(file)).await {
                    Ok(data) => images.push(ChapterImage {
                        offset: img.offset,
                        media_type: media_type.clone(),
                        data,
                    }),
                    Err(e) => {
                        // Entry stays usable without the image; the image
                        // phase will re-fetch it.
                        warn!(book_id = %book_id, order = %order, file = %file, error = %e,
                            "Cached image unreadable, dropping from entry");
                    }
                }
            }
        }

        debug!(book_id = %book_id, order = %order, images = images.len(), "Cache hit");
        Ok(Some(CacheEntry {
            title: manifest.title,
            content: ChapterContent {
                html: manifest.html,
                images: refs,
            },
            images,
        }))
    }

    /// Write the entry for `(book_id, order)`, replacing any previous one
    ///
    /// Idempotent and last-write-wins: the entry is staged next to its target
    /// directory and renamed into place once complete.
    pub async fn put(&self, book_id: &BookId, order: ChapterOrder, entry: &CacheEntry) -> Result<()> {
        let book_dir = self.book_dir(book_id);
        let target = self.entry_dir(book_id, order);
        let staging = book_dir.join(format!(".staging-{}", order.get()));

        tokio::fs::create_dir_all(&book_dir)
            .await
            .map_err(|e| Error::Cache(format!("failed to create cache directory: {}", e)))?;

        // A leftover staging dir from a crashed run is stale; replace it
        if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(|e| Error::Cache(format!("failed to clear staging: {}", e)))?;
        }
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| Error::Cache(format!("failed to create staging: {}", e)))?;

        let mut manifest_images = Vec::with_capacity(entry.content.images.len());
        for (n, reference) in entry.content.images.iter().enumerate() {
            let fetched = entry.images.iter().find(|i| i.offset == reference.offset);
            let file = match fetched {
                Some(image) => {
                    let name = format!("img_{}.bin", n);
                    tokio::fs::write(staging.join(&name), &image.data)
                        .await
                        .map_err(|e| Error::Cache(format!("failed to write image: {}", e)))?;
                    Some(name)
                }
                None => None,
            };
            manifest_images.push(ImageManifest {
                offset: reference.offset,
                url: reference.url.clone(),
                media_type: fetched.map(|i| i.media_type.clone()),
                file,
            });
        }

        let manifest = EntryManifest {
            title: entry.title.clone(),
            html: entry.content.html.clone(),
            images: manifest_images,
        };
        let raw = serde_json::to_vec_pretty(&manifest)?;
        // Written last: its presence marks the entry complete
        tokio::fs::write(staging.join("entry.json"), raw)
            .await
            .map_err(|e| Error::Cache(format!("failed to write cache entry: {}", e)))?;

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&target)
                .await
                .map_err(|e| Error::Cache(format!("failed to replace cache entry: {}", e)))?;
        }
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| Error::Cache(format!("failed to commit cache entry: {}", e)))?;

        debug!(book_id = %book_id, order = %order, "Cache entry written");
        Ok(())
    }

    /// Remove the entry for `(book_id, order)`, if present
    pub async fn delete(&self, book_id: &BookId, order: ChapterOrder) -> Result<()> {
        let dir = self.entry_dir(book_id, order);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(book_id = %book_id, order = %order, "Cache entry deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Cache(format!("failed to delete cache entry: {}", e))),
        }
    }

    /// Remove all entries for a book
    pub async fn delete_all(&self, book_id: &BookId) -> Result<()> {
        let dir = self.book_dir(book_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Cache(format!("failed to clear book cache: {}", e))),
        }
    }
}

/// Filesystem-safe directory name for an opaque book id
pub(crate) fn slug(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entry(html: &str) -> CacheEntry {
        CacheEntry {
            title: "Chapter One".to_string(),
            content: ChapterContent {
                html: html.to_string(),
                images: vec![ImageRef {
                    offset: 4,
                    url: "https://example.com/a.jpg".to_string(),
                }],
            },
            images: vec![ChapterImage {
                offset: 4,
                media_type: "image/jpeg".to_string(),
                data: vec![0xFF, 0xD8, 0xFF],
            }],
        }
    }

    #[tokio::test]
    async fn test_put_and_get_roundtrip() {
        let dir = tempdir().unwrap();
        let cache = ChapterCache::new(dir.path());
        let book = BookId::new("book-1");
        let order = ChapterOrder::new(3);

        cache.put(&book, order, &sample_entry("<p>hi</p>")).await.unwrap();

        let entry = cache.get(&book, order).await.unwrap().unwrap();
        assert_eq!(entry.title, "Chapter One");
        assert_eq!(entry.content.html, "<p>hi</p>");
        assert_eq!(entry.content.images.len(), 1);
        assert_eq!(entry.images.len(), 1);
        assert_eq!(entry.images[0].data, vec![0xFF, 0xD8, 0xFF]);
        assert_eq!(entry.images[0].media_type, "image/jpeg");
        assert!(cache.contains(&book, order).await);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let dir = tempdir().unwrap();
        let cache = ChapterCache::new(dir.path());
        let book = BookId::new("book-1");

        let entry = cache.get(&book, ChapterOrder::new(1)).await.unwrap();
        assert!(entry.is_none());
        assert!(!cache.contains(&book, ChapterOrder::new(1)).await);
    }

    #[tokio::test]
    async fn test_put_is_last_write_wins() {
        let dir = tempdir().unwrap();
        let cache = ChapterCache::new(dir.path());
        let book = BookId::new("book-1");
        let order = ChapterOrder::new(9);

        cache.put(&book, order, &sample_entry("<p>old</p>")).await.unwrap();
        cache.put(&book, order, &sample_entry("<p>new</p>")).await.unwrap();

        let entry = cache.get(&book, order).await.unwrap().unwrap();
        assert_eq!(entry.content.html, "<p>new</p>");
    }

    #[tokio::test]
    async fn test_entry_without_fetched_images_keeps_refs() {
        let dir = tempdir().unwrap();
        let cache = ChapterCache::new(dir.path());
        let book = BookId::new("book-1");
        let order = ChapterOrder::new(2);

        let mut entry = sample_entry("<p>text</p>");
        entry.images.clear(); // refs known, bytes not yet fetched
        cache.put(&book, order, &entry).await.unwrap();

        let back = cache.get(&book, order).await.unwrap().unwrap();
        assert_eq!(back.content.images.len(), 1);
        assert!(back.images.is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_delete_all() {
        let dir = tempdir().unwrap();
        let cache = ChapterCache::new(dir.path());
        let book = BookId::new("book-1");

        cache.put(&book, ChapterOrder::new(1), &sample_entry("<p>1</p>")).await.unwrap();
        cache.put(&book, ChapterOrder::new(2), &sample_entry("<p>2</p>")).await.unwrap();

        cache.delete(&book, ChapterOrder::new(1)).await.unwrap();
        assert!(cache.get(&book, ChapterOrder::new(1)).await.unwrap().is_none());
        assert!(cache.get(&book, ChapterOrder::new(2)).await.unwrap().is_some());

        cache.delete_all(&book).await.unwrap();
        assert!(cache.get(&book, ChapterOrder::new(2)).await.unwrap().is_none());

        // Deleting what's already gone is fine
        cache.delete(&book, ChapterOrder::new(5)).await.unwrap();
        cache.delete_all(&book).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_entry_reads_as_miss() {
        let dir = tempdir().unwrap();
        let cache = ChapterCache::new(dir.path());
        let book = BookId::new("book-1");
        let order = ChapterOrder::new(4);

        let entry_dir = cache.book_dir(&book).join("4");
        tokio::fs::create_dir_all(&entry_dir).await.unwrap();
        tokio::fs::write(entry_dir.join("entry.json"), b"not json")
            .await
            .unwrap();

        assert!(cache.get(&book, order).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_distinct_books_do_not_collide() {
        let dir = tempdir().unwrap();
        let cache = ChapterCache::new(dir.path());
        let order = ChapterOrder::new(1);

        cache
            .put(&BookId::new("alpha"), order, &sample_entry("<p>a</p>"))
            .await
            .unwrap();
        cache
            .put(&BookId::new("beta/../alpha"), order, &sample_entry("<p>b</p>"))
            .await
            .unwrap();

        let a = cache.get(&BookId::new("alpha"), order).await.unwrap().unwrap();
        assert_eq!(a.content.html, "<p>a</p>");
    }
}
