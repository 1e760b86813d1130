use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::types::{FeedSource, RegistryError};
use crate::util::{validate_url, write_atomic};

/// Synthetic category that matches every feed.
pub const ALL_CATEGORY: &str = "All";

const DEFAULT_FEEDS: &[(&str, &str, &str)] = &[
    ("Motorsport.com", "https://www.motorsport.com/rss/all/", "All"),
    ("Autosport", "https://www.autosport.com/rss/feed/all", "All"),
    ("F1 News", "https://www.motorsport.com/rss/f1/news/", "Formula 1"),
    ("MotoGP News", "https://www.motorsport.com/rss/motogp/news/", "MotoGP"),
    ("NASCAR News", "https://www.motorsport.com/rss/nascar/news/", "NASCAR"),
    ("WRC News", "https://www.motorsport.com/rss/wrc/news/", "WRC"),
    ("Formula E News", "https://www.motorsport.com/rss/formula-e/news/", "Formula E"),
    ("WEC News", "https://www.motorsport.com/rss/wec/news/", "WEC"),
    ("IMSA News", "https://www.motorsport.com/rss/imsa/news/", "IMSA"),
    ("IndyCar News", "https://www.motorsport.com/rss/indycar/news/", "IndyCar"),
    ("Super Formula News", "https://www.motorsport.com/rss/superformula/news/", "Super Formula"),
];

/// The motorsport feeds a fresh installation starts with.
pub fn default_feeds() -> Vec<FeedSource> {
    DEFAULT_FEEDS
        .iter()
        .map(|(name, url, category)| FeedSource {
            name: (*name).to_string(),
            url: (*url).to_string(),
            category: (*category).to_string(),
        })
        .collect()
}

/// Ordered `name -> (url, category)` subscriptions, persisted as a JSON array.
///
/// Every mutation is written through to disk before it returns.
#[derive(Debug, Clone)]
pub struct FeedRegistry {
    path: PathBuf,
    feeds: Vec<FeedSource>,
}

impl FeedRegistry {
    /// Open the registry at `path`, seeding the default feeds when the file is
    /// missing or holds an empty list.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let feeds: Vec<FeedSource> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut registry = Self { path, feeds };
        if registry.feeds.is_empty() {
            tracing::info!(path = %registry.path.display(), "Seeding default feeds");
            registry.feeds = default_feeds();
            registry.persist()?;
        }
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn feeds(&self) -> &[FeedSource] {
        &self.feeds
    }

    /// Add a feed, or update the url/category of an existing name in place.
    ///
    /// Empty names or urls are ignored.
    pub fn add_feed(&mut self, name: &str, url: &str, category: &str) -> Result<(), RegistryError> {
        let (name, url, category) = (name.trim(), url.trim(), category.trim());
        if name.is_empty() || url.is_empty() {
            return Ok(());
        }
        let url = validate_url(url)?.to_string();

        match self.feeds.iter_mut().find(|feed| feed.name == name) {
            Some(existing) => {
                existing.url = url;
                existing.category = category.to_string();
            }
            None => self.feeds.push(FeedSource {
                name: name.to_string(),
                url,
                category: category.to_string(),
            }),
        }

        tracing::debug!(name = %name, "Feed registered");
        self.persist()
    }

    /// Remove a feed by name. Returns whether anything was removed.
    pub fn remove_feed(&mut self, name: &str) -> Result<bool, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(false);
        }

        let before = self.feeds.len();
        self.feeds.retain(|feed| feed.name != name);
        if self.feeds.len() == before {
            return Ok(false);
        }

        tracing::debug!(name = %name, "Feed removed");
        self.persist()?;
        Ok(true)
    }

    pub fn url_for(&self, name: &str) -> Option<&str> {
        self.feeds
            .iter()
            .find(|feed| feed.name == name)
            .map(|feed| feed.url.as_str())
    }

    /// Distinct feed categories plus "All", sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: BTreeSet<String> = self
            .feeds
            .iter()
            .map(|feed| feed.category.clone())
            .filter(|category| !category.is_empty())
            .collect();
        categories.insert(ALL_CATEGORY.to_string());
        categories.into_iter().collect()
    }

    fn persist(&self) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&self.feeds)?;
        write_atomic(&self.path, &json)?;
        Ok(())
    }
}
