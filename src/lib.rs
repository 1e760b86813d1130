//! Motorsport feed ingestion: conditional RSS/Atom fetching with retry and
//! backoff, guid deduplication, read-state merging and a per-feed JSON cache.
//!
//! The [`engine::FeedEngine`] ties the pieces together; the binary in
//! `main.rs` is one collaborator of it.

pub mod config;
pub mod engine;
pub mod feed;
pub mod storage;
pub mod util;
