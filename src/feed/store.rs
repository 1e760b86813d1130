use std::collections::HashSet;

use crate::storage::{FeedItem, ALL_CATEGORY};

/// In-memory items for one feed plus the index of guids already seen.
///
/// Items keep their insertion order. A guid enters the index the first time
/// it is loaded or merged, and an item with a known guid is never replaced,
/// so read state survives every reload.
#[derive(Debug, Clone, Default)]
pub struct ItemStore {
    items: Vec<FeedItem>,
    seen: HashSet<String>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[FeedItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, guid: &str) -> bool {
        self.seen.contains(guid)
    }

    /// Make a cache snapshot the baseline.
    ///
    /// Replaces the item list and rebuilds the guid index from it. Repeated
    /// guids in the snapshot keep their first occurrence.
    pub fn load_snapshot(&mut self, items: Vec<FeedItem>) {
        self.items.clear();
        self.seen.clear();
        self.merge(items);
    }

    /// Append items whose guid has not been seen yet. Returns how many were added.
    pub fn merge(&mut self, incoming: Vec<FeedItem>) -> usize {
        let before = self.items.len();
        for item in incoming {
            if self.seen.insert(item.guid.clone()) {
                self.items.push(item);
            }
        }
        self.items.len() - before
    }

    /// Mark one item read. Returns `false` when the guid is unknown or the
    /// item was already read.
    pub fn mark_read(&mut self, guid: &str) -> bool {
        match self.items.iter_mut().find(|item| item.guid == guid) {
            Some(item) if !item.is_read => {
                item.is_read = true;
                true
            }
            _ => false,
        }
    }

    /// Mark every item read. Returns how many changed.
    pub fn mark_all_read(&mut self) -> usize {
        let mut changed = 0;
        for item in self.items.iter_mut().filter(|item| !item.is_read) {
            item.is_read = true;
            changed += 1;
        }
        changed
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|item| !item.is_read).count()
    }

    /// Drop every item and forget every guid.
    pub fn clear(&mut self) {
        self.items.clear();
        self.seen.clear();
    }

    /// Items matching `filter`, in store order.
    pub fn filtered<'a>(&'a self, filter: &'a FeedFilter) -> impl Iterator<Item = &'a FeedItem> + 'a {
        self.items.iter().filter(move |item| filter.matches(item))
    }
}

/// Item selection used by listings.
///
/// All text comparisons are case-insensitive. A category of "All" (or none)
/// matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedFilter {
    pub category: Option<String>,
    pub unread_only: bool,
    pub search: Option<String>,
}

impl FeedFilter {
    pub fn matches(&self, item: &FeedItem) -> bool {
        if self.unread_only && item.is_read {
            return false;
        }

        if let Some(category) = self.category.as_deref().map(str::trim) {
            if !category.is_empty() && !category.eq_ignore_ascii_case(ALL_CATEGORY) {
                let wanted = category.to_lowercase();
                let matched = item
                    .category
                    .as_deref()
                    .is_some_and(|c| c.to_lowercase().contains(&wanted));
                if !matched {
                    return false;
                }
            }
        }

        if let Some(query) = self.search.as_deref().map(str::trim) {
            if !query.is_empty() {
                let query = query.to_lowercase();
                let hit = item.title.to_lowercase().contains(&query)
                    || item.description.to_lowercase().contains(&query)
                    || item
                        .category
                        .as_deref()
                        .is_some_and(|c| c.to_lowercase().contains(&query));
                if !hit {
                    return false;
                }
            }
        }

        true
    }
}
