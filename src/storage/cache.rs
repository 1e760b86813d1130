use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};

use super::types::{derive_guid, CacheError, CacheMetadata, CacheSnapshot, FeedItem};
use crate::util::write_atomic;

const ITEMS_SUFFIX: &str = ".json";
const METADATA_SUFFIX: &str = ".meta.json";
/// Length of a hex SHA-256 cache key.
const KEY_LEN: usize = 64;

/// On-disk cache of parsed items, one JSON file per feed URL.
///
/// Each feed gets `<sha256(url)>.json` holding the item array and a
/// `<sha256(url)>.meta.json` sidecar with the HTTP validators and the time of
/// the last write. Both files are replaced atomically.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File stem shared by a feed's items and metadata files.
    pub fn cache_key(url: &str) -> String {
        format!("{:x}", Sha256::digest(url.as_bytes()))
    }

    pub fn items_path(&self, url: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", Self::cache_key(url), ITEMS_SUFFIX))
    }

    pub fn metadata_path(&self, url: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", Self::cache_key(url), METADATA_SUFFIX))
    }

    /// Write the full item list for `url` and stamp the metadata's update time.
    ///
    /// Validators already stored for the feed are kept.
    pub fn save(&self, url: &str, items: &[FeedItem]) -> Result<(), CacheError> {
        self.ensure_dir()?;

        let path = self.items_path(url);
        let json = serde_json::to_vec_pretty(items).map_err(|source| CacheError::Malformed {
            path: path.display().to_string(),
            source,
        })?;
        write_atomic(&path, &json).map_err(|source| io_error(&path, source))?;

        let mut metadata = self.load_metadata(url).unwrap_or_else(|e| {
            tracing::warn!(url = %url, error = %e, "Discarding unreadable cache metadata");
            CacheMetadata::default()
        });
        metadata.last_cache_update = Some(Utc::now());
        self.save_metadata(url, &metadata)?;

        tracing::debug!(url = %url, items = items.len(), "Feed cache written");
        Ok(())
    }

    /// Read back the cached items for `url`.
    ///
    /// Returns `Ok(None)` when nothing was ever cached. Entries without a title
    /// or link are dropped; entries without a guid get the derived one.
    pub fn load(&self, url: &str) -> Result<Option<CacheSnapshot>, CacheError> {
        let path = self.items_path(url);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(&path, source)),
        };

        let items: Vec<FeedItem> =
            serde_json::from_slice(&bytes).map_err(|source| CacheError::Malformed {
                path: path.display().to_string(),
                source,
            })?;
        let items = items
            .into_iter()
            .filter(FeedItem::is_valid)
            .map(|mut item| {
                if item.guid.trim().is_empty() {
                    item.guid = derive_guid(&item.link, &item.title);
                }
                item
            })
            .collect();

        let metadata = self.load_metadata(url).unwrap_or_else(|e| {
            tracing::warn!(url = %url, error = %e, "Ignoring unreadable cache metadata");
            CacheMetadata::default()
        });

        Ok(Some(CacheSnapshot { items, metadata }))
    }

    /// Metadata for `url`; empty when the sidecar does not exist.
    pub fn load_metadata(&self, url: &str) -> Result<CacheMetadata, CacheError> {
        let path = self.metadata_path(url);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| CacheError::Malformed {
                path: path.display().to_string(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CacheMetadata::default()),
            Err(source) => Err(io_error(&path, source)),
        }
    }

    pub fn save_metadata(&self, url: &str, metadata: &CacheMetadata) -> Result<(), CacheError> {
        self.ensure_dir()?;

        let path = self.metadata_path(url);
        let json = serde_json::to_vec_pretty(metadata).map_err(|source| CacheError::Malformed {
            path: path.display().to_string(),
            source,
        })?;
        write_atomic(&path, &json).map_err(|source| io_error(&path, source))
    }

    /// Delete every cache file, sidecars included. Returns how many were removed.
    ///
    /// Only files named like the ones this store writes are touched; anything
    /// else sharing the directory is left alone.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(io_error(&self.dir, source)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|source| io_error(&self.dir, source))?;
            let path = entry.path();
            let owned = entry.file_name().to_str().is_some_and(is_cache_file);
            if !owned || !path.is_file() {
                continue;
            }
            std::fs::remove_file(&path).map_err(|source| io_error(&path, source))?;
            removed += 1;
        }

        tracing::info!(dir = %self.dir.display(), removed, "Feed cache cleared");
        Ok(removed)
    }

    fn ensure_dir(&self) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| io_error(&self.dir, source))
    }
}

/// `<key>.json`, `<key>.meta.json`, or a temp file `write_atomic` left behind
/// for either of them.
fn is_cache_file(name: &str) -> bool {
    let (Some(key), Some(rest)) = (name.get(..KEY_LEN), name.get(KEY_LEN..)) else {
        return false;
    };
    key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        && (rest == ITEMS_SUFFIX
            || rest == METADATA_SUFFIX
            || rest.starts_with(".tmp.")
            || rest.starts_with(".meta.tmp."))
}

fn io_error(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const URL: &str = "https://www.motorsport.com/rss/f1/news/";

    fn item(guid: &str) -> FeedItem {
        FeedItem {
            title: format!("Story {guid}"),
            link: format!("https://example.com/{guid}"),
            description: String::new(),
            pub_date: String::new(),
            image_url: None,
            category: Some("Formula 1".to_string()),
            guid: guid.to_string(),
            is_read: false,
            fetch_time: Utc::now(),
        }
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        assert!(cache.load(URL).unwrap().is_none());
        assert_eq!(cache.load_metadata(URL).unwrap(), CacheMetadata::default());
    }

    #[test]
    fn test_save_then_load_keeps_read_state() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("feeds"));

        let mut read = item("a");
        read.is_read = true;
        cache.save(URL, &[read.clone(), item("b")]).unwrap();

        let snapshot = cache.load(URL).unwrap().unwrap();
        assert_eq!(snapshot.items[0], read);
        assert_eq!(snapshot.items[1].guid, "b");
        assert!(!snapshot.items[1].is_read);
        assert!(snapshot.metadata.last_cache_update.is_some());
    }

    #[test]
    fn test_file_name_is_url_hash() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let key = CacheStore::cache_key(URL);

        assert_eq!(key.len(), 64);
        assert_eq!(cache.items_path(URL), dir.path().join(format!("{key}.json")));
        assert_eq!(
            cache.metadata_path(URL),
            dir.path().join(format!("{key}.meta.json"))
        );
        assert_ne!(key, CacheStore::cache_key("https://www.autosport.com/rss/feed/all"));
    }

    #[test]
    fn test_save_preserves_validators() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        cache
            .save_metadata(
                URL,
                &CacheMetadata {
                    etag: Some("\"v1\"".to_string()),
                    last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
                    last_cache_update: None,
                },
            )
            .unwrap();

        cache.save(URL, &[item("a")]).unwrap();

        let metadata = cache.load_metadata(URL).unwrap();
        assert_eq!(metadata.etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            metadata.last_modified.as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
        assert!(metadata.last_cache_update.is_some());
    }

    #[test]
    fn test_load_drops_invalid_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        let mut broken = item("broken");
        broken.link.clear();
        cache.save(URL, &[broken, item("ok")]).unwrap();

        let snapshot = cache.load(URL).unwrap().unwrap();
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].guid, "ok");
    }

    #[test]
    fn test_items_without_guid_get_derived_guids() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            cache.items_path(URL),
            br#"[
  {"title": "Qualifying", "link": "https://example.com/q", "isRead": true},
  {"title": "Race", "link": "https://example.com/r", "guid": ""}
]"#,
        )
        .unwrap();

        let snapshot = cache.load(URL).unwrap().unwrap();
        let guids: Vec<_> = snapshot.items.iter().map(|i| i.guid.clone()).collect();
        assert_eq!(
            guids,
            vec![
                derive_guid("https://example.com/q", "Qualifying"),
                derive_guid("https://example.com/r", "Race"),
            ]
        );

        let mut store = crate::feed::ItemStore::new();
        store.load_snapshot(snapshot.items);
        assert_eq!(store.len(), 2);
        assert!(store.items()[0].is_read);
    }

    #[test]
    fn test_malformed_cache_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        std::fs::write(cache.items_path(URL), b"{ not json").unwrap();

        assert!(matches!(
            cache.load(URL),
            Err(CacheError::Malformed { .. })
        ));
    }

    #[test]
    fn test_clear_removes_items_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        cache.save(URL, &[item("a")]).unwrap();
        cache
            .save("https://www.motorsport.com/rss/wec/news/", &[item("b")])
            .unwrap();

        assert_eq!(cache.clear().unwrap(), 4);
        assert!(cache.load(URL).unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_leaves_unrelated_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        cache.save(URL, &[item("a")]).unwrap();

        let key = CacheStore::cache_key(URL);
        let stray_temp = dir.path().join(format!("{key}.tmp.00000000deadbeef"));
        std::fs::write(&stray_temp, b"partial").unwrap();
        let notes = dir.path().join("notes.json");
        std::fs::write(&notes, b"{}").unwrap();
        std::fs::create_dir(dir.path().join("photos")).unwrap();

        assert_eq!(cache.clear().unwrap(), 3);
        assert!(!stray_temp.exists());
        assert!(notes.exists());
        assert!(dir.path().join("photos").is_dir());
    }

    #[test]
    fn test_cache_file_names() {
        let key = CacheStore::cache_key(URL);
        assert!(is_cache_file(&format!("{key}.json")));
        assert!(is_cache_file(&format!("{key}.meta.json")));
        assert!(is_cache_file(&format!("{key}.meta.tmp.0123456789abcdef")));
        assert!(!is_cache_file(&format!("{key}.txt")));
        assert!(!is_cache_file("feeds.json"));
        assert!(!is_cache_file(""));
    }

    #[test]
    fn test_clear_missing_directory_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path().join("never-created"));
        assert_eq!(cache.clear().unwrap(), 0);
    }
}
