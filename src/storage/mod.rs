mod cache;
mod registry;
mod types;

pub use cache::CacheStore;
pub use registry::{default_feeds, FeedRegistry, ALL_CATEGORY};
pub use types::{
    derive_guid, CacheError, CacheMetadata, CacheSnapshot, FeedItem, FeedSource, RegistryError,
};
