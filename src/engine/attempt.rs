use std::time::Duration;

use tokio::time::Instant;

use crate::config::Config;
use crate::feed::{FeedTransport, FetchError, FetchResponse, Validators};

/// One network attempt for a feed.
///
/// `generation` ties the attempt to the `fetch_feed` call that started it;
/// the engine drops completions from older generations.
#[derive(Debug, Clone)]
pub struct FetchAttempt {
    pub url: String,
    pub generation: u64,
    /// 0 for the first try, `n` for the n-th retry.
    pub retry_count: u32,
    pub deadline: Instant,
    pub validators: Validators,
}

impl FetchAttempt {
    /// Run the exchange, turning an expired deadline into `FetchError::Timeout`.
    pub async fn run<T: FeedTransport>(&self, transport: &T) -> Result<FetchResponse, FetchError> {
        match tokio::time::timeout_at(self.deadline, transport.fetch(&self.url, &self.validators)).await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }
}

/// Linear backoff: retry `n` waits `n * base_delay`, at most `max_attempts` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            base_delay: config.retry_base_delay(),
        }
    }

    /// The retry number to schedule after a failure, or `None` when exhausted.
    pub fn next_retry(&self, retry_count: u32) -> Option<u32> {
        (retry_count < self.max_attempts).then_some(retry_count + 1)
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry)
    }
}

/// Result of an attempt, reported back to the engine task.
#[derive(Debug)]
pub(crate) struct AttemptCompletion {
    pub url: String,
    pub generation: u64,
    pub retry_count: u32,
    pub outcome: Result<FetchResponse, FetchError>,
}
