//! Feed retrieval and interpretation.
//!
//! - [`parser`] - RSS/Atom token-stream parsing with a `feed-rs` fallback
//! - [`fetcher`] - the HTTP transport seam and its `reqwest` implementation
//! - [`store`] - per-feed item collection with guid dedup and read state
//!
//! Retries, timeouts and caching live in [`crate::engine`]; nothing here keeps
//! state between calls except [`ItemStore`].

mod fetcher;
mod parser;
mod store;

pub use fetcher::{FeedTransport, FetchError, FetchResponse, HttpTransport, Payload, Validators};
pub use parser::{detect_format, extract_inline_image, parse_feed, FeedFormat, ParseError, ParsedFeed};
pub use store::{FeedFilter, ItemStore};
