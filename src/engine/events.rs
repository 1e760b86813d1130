use std::fmt;

/// Notifications the engine sends to its collaborators.
///
/// For one feed the order is: cache-load status, fetch status, then one outcome
/// per attempt (`FeedUpdated`/`NewItemsAvailable`/status on success, `Error`
/// plus a retry or give-up status on failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// The in-memory items for `url` changed (cache load or merge).
    FeedUpdated { url: String },
    /// A recoverable failure or warning. Never fatal.
    Error { url: String, message: String },
    /// A merge appended `count` items not seen before.
    NewItemsAvailable { url: String, count: usize },
    /// Progress text. `url` is `None` for engine-wide actions such as a cache clear.
    StatusMessage { url: Option<String>, message: String },
}

impl FeedEvent {
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::FeedUpdated { url }
            | Self::Error { url, .. }
            | Self::NewItemsAvailable { url, .. } => Some(url),
            Self::StatusMessage { url, .. } => url.as_deref(),
        }
    }
}

impl fmt::Display for FeedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FeedUpdated { url } => write!(f, "[{url}] updated"),
            Self::Error { url, message } => write!(f, "[{url}] error: {message}"),
            Self::NewItemsAvailable { url, count } => {
                write!(f, "[{url}] {count} new item{}", if *count == 1 { "" } else { "s" })
            }
            Self::StatusMessage { url: Some(url), message } => write!(f, "[{url}] {message}"),
            Self::StatusMessage { url: None, message } => f.write_str(message),
        }
    }
}
