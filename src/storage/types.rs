use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while reading or writing the per-feed cache.
///
/// Callers treat every variant as a cache miss: a broken cache file never
/// stops a fetch from going to the network.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed cache file {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by the feed registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to access feed registry: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed feed registry: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] crate::util::UrlValidationError),
}

// ============================================================================
// Data Structures
// ============================================================================

/// One syndicated article.
///
/// Serialized field names match the on-disk cache schema
/// (`pubDate`, `imageUrl`, `isRead`, `fetchTime`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    /// Raw HTML fragment from `description`, `summary` or `content`.
    #[serde(default)]
    pub description: String,
    /// Date string exactly as the feed published it.
    #[serde(default)]
    pub pub_date: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub is_read: bool,
    /// When this article was first observed.
    #[serde(default = "Utc::now")]
    pub fetch_time: DateTime<Utc>,
}

impl FeedItem {
    /// An item needs both a title and a link to be shown.
    pub fn is_valid(&self) -> bool {
        !self.title.trim().is_empty() && !self.link.trim().is_empty()
    }
}

/// Derive a stable identifier for an item that carries none.
///
/// SHA-256 of `link` immediately followed by `title`, hex encoded. The same
/// article always hashes to the same guid, across runs and across caches.
pub fn derive_guid(link: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(link.as_bytes());
    hasher.update(title.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// A named subscription in the feed registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub category: String,
}

/// Out-of-band state kept next to a feed's cached items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    /// `ETag` from the last successful response, sent back as `If-None-Match`.
    #[serde(default)]
    pub etag: Option<String>,
    /// `Last-Modified` from the last successful response, sent back as `If-Modified-Since`.
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub last_cache_update: Option<DateTime<Utc>>,
}

impl CacheMetadata {
    /// Whether the cached items were written more than `max_age` ago.
    ///
    /// A cache with no recorded write time is never stale.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        self.last_cache_update
            .is_some_and(|written| now.signed_duration_since(written) > max_age)
    }
}

/// Items and metadata read back from disk for one feed.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub items: Vec<FeedItem>,
    pub metadata: CacheMetadata,
}
