#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use paddock::config::Config;
use paddock::engine::{FeedEngine, FeedEvent};
use paddock::feed::{FeedTransport, FetchError, FetchResponse, Payload, Validators};
use paddock::storage::{CacheStore, FeedRegistry};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const FEED_URL: &str = "https://www.motorsport.com/rss/f1/news/";

/// One request seen by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct Call {
    pub at: Instant,
    pub url: String,
    pub validators: Validators,
}

struct Step {
    delay: Duration,
    outcome: Result<FetchResponse, FetchError>,
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    calls: Vec<Call>,
}

/// Transport that replays queued outcomes in order.
///
/// Once the queue is empty every request fails with HTTP 503.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn push(&self, outcome: Result<FetchResponse, FetchError>) {
        self.push_delayed(Duration::ZERO, outcome);
    }

    pub fn push_delayed(&self, delay: Duration, outcome: Result<FetchResponse, FetchError>) {
        self.script
            .lock()
            .unwrap()
            .steps
            .push_back(Step { delay, outcome });
    }

    pub fn push_body(&self, body: &str) {
        self.push(Ok(FetchResponse::body(body)));
    }

    pub fn push_body_with_etag(&self, body: &str, etag: &str) {
        self.push(Ok(FetchResponse {
            payload: Payload::Body {
                bytes: body.as_bytes().to_vec(),
                etag: Some(etag.to_string()),
                last_modified: None,
            },
            tls_warning: None,
        }));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }
}

impl FeedTransport for ScriptedTransport {
    async fn fetch(&self, url: &str, validators: &Validators) -> Result<FetchResponse, FetchError> {
        let step = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(Call {
                at: Instant::now(),
                url: url.to_string(),
                validators: validators.clone(),
            });
            script.steps.pop_front()
        };

        match step {
            Some(Step { delay, outcome }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                outcome
            }
            None => Err(FetchError::HttpStatus(503)),
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub transport: ScriptedTransport,
    pub engine: FeedEngine<ScriptedTransport>,
    pub events: mpsc::UnboundedReceiver<FeedEvent>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::default();
        let (engine, events) = engine_in(&dir, config, transport.clone());
        Self {
            dir,
            transport,
            engine,
            events,
        }
    }

    pub fn cache(&self) -> CacheStore {
        CacheStore::new(self.dir.path().join("cache"))
    }

    /// Every event emitted so far.
    pub fn drain(&mut self) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Engine over the cache and registry inside `dir`.
pub fn engine_in<T: FeedTransport>(
    dir: &TempDir,
    config: Config,
    transport: T,
) -> (FeedEngine<T>, mpsc::UnboundedReceiver<FeedEvent>) {
    let registry = FeedRegistry::load(dir.path().join("feeds.json")).unwrap();
    let cache = CacheStore::new(dir.path().join("cache"));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let engine = FeedEngine::with_transport(config, transport, cache, registry, events_tx);
    (engine, events_rx)
}

pub fn statuses(events: &[FeedEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            FeedEvent::StatusMessage { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn errors(events: &[FeedEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            FeedEvent::Error { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn new_item_counts(events: &[FeedEvent]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|event| match event {
            FeedEvent::NewItemsAvailable { count, .. } => Some(*count),
            _ => None,
        })
        .collect()
}

/// RSS 2.0 document with one `<item>` per `(guid, title)`.
pub fn rss(items: &[(&str, &str)]) -> String {
    let mut body = String::from(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Test</title>"#);
    for (guid, title) in items {
        body.push_str(&format!(
            "<item><title>{title}</title><link>https://example.com/{guid}</link><guid>{guid}</guid><category>Formula 1</category></item>"
        ));
    }
    body.push_str("</channel></rss>");
    body
}

/// Config with test-friendly retry settings.
pub fn config_with_retries(max_retry_attempts: u32, retry_base_delay_ms: u64) -> Config {
    Config {
        max_retry_attempts,
        retry_base_delay_ms,
        refresh_interval_minutes: 0,
        ..Config::default()
    }
}
