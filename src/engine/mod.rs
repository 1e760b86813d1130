//! The feed engine: fetch, retry, parse, merge and cache, driven from one task.
//!
//! [`FeedEngine`] owns every item store, the cache directory and the feed
//! registry. Network attempts and retry delays run on spawned tasks that only
//! do I/O and report a completion back over a channel; all state changes
//! happen when the engine processes that completion.
//!
//! Drive it directly (`fetch_feed` then `settle`) or hand it to
//! [`FeedEngine::spawn`] and talk to it through an [`EngineHandle`].

mod attempt;
mod events;
mod handle;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::feed::{
    parse_feed, FeedFilter, FeedTransport, FetchError, FetchResponse, HttpTransport, ItemStore,
    ParsedFeed, Payload, Validators,
};
use crate::storage::{CacheMetadata, CacheStore, FeedItem, FeedRegistry, RegistryError};

use attempt::AttemptCompletion;
pub use attempt::{FetchAttempt, RetryPolicy};
pub use events::FeedEvent;
pub use handle::{EngineClosed, EngineCommand, EngineHandle};

const STATUS_FROM_CACHE: &str = "Loaded from cache, fetching updates...";
const STATUS_FETCHING: &str = "Fetching feed...";
const STATUS_NOT_MODIFIED: &str = "Feed has not changed since last update";
const STATUS_UPDATED: &str = "Feed successfully updated";
const STATUS_CACHE_CLEARED: &str = "Cache cleared successfully";

/// The attempt currently owning a URL.
#[derive(Debug)]
struct InFlight {
    generation: u64,
    task: JoinHandle<()>,
}

/// Fetch/retry state machine plus the data it maintains.
///
/// Per URL: `Idle -> Fetching -> {Success, Retrying -> Fetching, Exhausted}`.
/// Calling [`fetch_feed`](Self::fetch_feed) again for a URL that is still in
/// flight aborts the old attempt and starts over with a fresh retry budget.
pub struct FeedEngine<T: FeedTransport = HttpTransport> {
    config: Config,
    retry: RetryPolicy,
    transport: T,
    cache: CacheStore,
    registry: FeedRegistry,
    stores: HashMap<String, ItemStore>,
    in_flight: HashMap<String, InFlight>,
    next_generation: u64,
    completions_tx: mpsc::UnboundedSender<AttemptCompletion>,
    completions_rx: mpsc::UnboundedReceiver<AttemptCompletion>,
    events: mpsc::UnboundedSender<FeedEvent>,
}

impl FeedEngine<HttpTransport> {
    /// Engine backed by the `reqwest` transport.
    pub fn new(
        config: Config,
        cache: CacheStore,
        registry: FeedRegistry,
        events: mpsc::UnboundedSender<FeedEvent>,
    ) -> Result<Self, FetchError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(config, transport, cache, registry, events))
    }
}

impl<T: FeedTransport> FeedEngine<T> {
    pub fn with_transport(
        config: Config,
        transport: T,
        cache: CacheStore,
        registry: FeedRegistry,
        events: mpsc::UnboundedSender<FeedEvent>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            retry: RetryPolicy::from_config(&config),
            config,
            transport,
            cache,
            registry,
            stores: HashMap::new(),
            in_flight: HashMap::new(),
            next_generation: 0,
            completions_tx,
            completions_rx,
            events,
        }
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    /// Start (or restart) fetching `url`.
    ///
    /// Shows any cached items first, then issues a conditional GET. Outcomes
    /// arrive as events once the completion is processed by [`settle`](Self::settle)
    /// or [`run`](Self::run).
    pub fn fetch_feed(&mut self, url: &str) {
        let url = url.trim().to_string();
        if url.is_empty() {
            return;
        }

        if let Some(previous) = self.in_flight.remove(&url) {
            previous.task.abort();
            tracing::debug!(url = %url, generation = previous.generation, "Superseding in-flight fetch");
        }

        self.next_generation += 1;
        let generation = self.next_generation;

        let status = if self.load_from_cache(&url) {
            STATUS_FROM_CACHE
        } else {
            STATUS_FETCHING
        };
        self.emit_status(&url, status);

        self.spawn_attempt(url, generation, 0, Duration::ZERO);
    }

    /// Fetch every feed in the registry.
    pub fn fetch_all(&mut self) {
        let urls: Vec<String> = self.registry.feeds().iter().map(|f| f.url.clone()).collect();
        tracing::debug!(feeds = urls.len(), "Refreshing all feeds");
        for url in urls {
            self.fetch_feed(&url);
        }
    }

    /// Whether any attempt or retry delay is outstanding.
    pub fn is_busy(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Process completions until nothing is in flight.
    pub async fn settle(&mut self) {
        while self.is_busy() {
            match self.completions_rx.recv().await {
                Some(completion) => self.handle_completion(completion),
                None => break,
            }
        }
    }

    fn spawn_attempt(&mut self, url: String, generation: u64, retry_count: u32, delay: Duration) {
        let validators = match self.cache.load_metadata(&url) {
            Ok(metadata) => Validators::from(&metadata),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "No usable validators, sending unconditional GET");
                Validators::default()
            }
        };

        let transport = self.transport.clone();
        let completions = self.completions_tx.clone();
        let timeout = self.config.request_timeout();
        let task_url = url.clone();

        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let attempt = FetchAttempt {
                url: task_url,
                generation,
                retry_count,
                deadline: Instant::now() + timeout,
                validators,
            };
            tracing::debug!(url = %attempt.url, retry = retry_count, "Requesting feed");
            let outcome = attempt.run(&transport).await;

            // The receiver lives as long as the engine
            let _ = completions.send(AttemptCompletion {
                url: attempt.url,
                generation,
                retry_count,
                outcome,
            });
        });

        self.in_flight.insert(url, InFlight { generation, task });
    }

    fn handle_completion(&mut self, completion: AttemptCompletion) {
        let AttemptCompletion {
            url,
            generation,
            retry_count,
            outcome,
        } = completion;

        match self.in_flight.get(&url) {
            Some(current) if current.generation == generation => {
                self.in_flight.remove(&url);
            }
            _ => {
                tracing::debug!(url = %url, generation, "Discarding superseded fetch result");
                return;
            }
        }

        let response = match outcome {
            Ok(response) => response,
            Err(e) => return self.handle_failure(url, generation, retry_count, e),
        };

        let FetchResponse {
            payload,
            tls_warning,
        } = response;
        if let Some(warning) = tls_warning {
            self.emit(FeedEvent::Error {
                url: url.clone(),
                message: format!("TLS warning: {warning}"),
            });
        }

        match payload {
            Payload::NotModified => {
                tracing::debug!(url = %url, "Feed not modified");
                self.emit_status(&url, STATUS_NOT_MODIFIED);
            }
            Payload::Body {
                bytes,
                etag,
                last_modified,
            } => match parse_feed(&bytes) {
                Ok(parsed) => self.apply_parsed(&url, parsed, etag, last_modified),
                Err(e) => self.handle_failure(url, generation, retry_count, e.into()),
            },
        }
    }

    fn apply_parsed(
        &mut self,
        url: &str,
        parsed: ParsedFeed,
        etag: Option<String>,
        last_modified: Option<String>,
    ) {
        if etag.is_some() || last_modified.is_some() {
            let mut metadata = self.cache.load_metadata(url).unwrap_or_default();
            if etag.is_some() {
                metadata.etag = etag;
            }
            if last_modified.is_some() {
                metadata.last_modified = last_modified;
            }
            if let Err(e) = self.cache.save_metadata(url, &metadata) {
                tracing::warn!(url = %url, error = %e, "Failed to store feed validators");
            }
        }

        let parsed_count = parsed.items.len();
        let store = self.stores.entry(url.to_string()).or_default();
        let new_items = store.merge(parsed.items);
        let total = store.len();
        self.persist(url);

        tracing::info!(
            url = %url,
            format = ?parsed.format,
            parsed = parsed_count,
            new_items,
            total,
            "Feed refreshed"
        );

        self.emit(FeedEvent::FeedUpdated {
            url: url.to_string(),
        });
        if new_items > 0 {
            self.emit(FeedEvent::NewItemsAvailable {
                url: url.to_string(),
                count: new_items,
            });
        }
        self.emit_status(url, STATUS_UPDATED);
    }

    fn handle_failure(&mut self, url: String, generation: u64, retry_count: u32, error: FetchError) {
        tracing::warn!(url = %url, error = %error, attempt = retry_count + 1, "Feed fetch failed");
        self.emit(FeedEvent::Error {
            url: url.clone(),
            message: error.to_string(),
        });

        match self.retry.next_retry(retry_count) {
            Some(retry) => {
                let delay = self.retry.delay_for(retry);
                self.emit_status(
                    &url,
                    &format!(
                        "Retrying in {} seconds (attempt {}/{})...",
                        delay.as_secs(),
                        retry,
                        self.retry.max_attempts
                    ),
                );
                self.spawn_attempt(url, generation, retry, delay);
            }
            None => {
                self.emit_status(
                    &url,
                    &format!(
                        "Failed after {} attempts. Using cached data if available.",
                        self.retry.max_attempts
                    ),
                );
                if self.stores.get(&url).map_or(true, ItemStore::is_empty) {
                    self.load_from_cache(&url);
                }
            }
        }
    }

    // ========================================================================
    // Cache
    // ========================================================================

    /// Make the cached snapshot for `url` the in-memory baseline.
    ///
    /// Returns whether any cached items were found.
    fn load_from_cache(&mut self, url: &str) -> bool {
        let snapshot = match self.cache.load(url) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Ignoring unreadable feed cache");
                return false;
            }
        };

        if snapshot.metadata.is_stale(Utc::now(), self.config.cache_stale_after()) {
            tracing::info!(
                url = %url,
                last_update = ?snapshot.metadata.last_cache_update,
                "Cached feed is stale, refresh pending"
            );
        }

        if snapshot.items.is_empty() {
            return false;
        }

        let count = snapshot.items.len();
        self.stores
            .entry(url.to_string())
            .or_default()
            .load_snapshot(snapshot.items);
        tracing::debug!(url = %url, items = count, "Loaded feed from cache");

        self.emit(FeedEvent::FeedUpdated {
            url: url.to_string(),
        });
        true
    }

    fn persist(&self, url: &str) {
        let Some(store) = self.stores.get(url) else {
            return;
        };
        if let Err(e) = self.cache.save(url, store.items()) {
            tracing::warn!(url = %url, error = %e, "Failed to write feed cache");
        }
    }

    /// Drop every cached file and every in-memory item, aborting in-flight fetches.
    pub fn clear_cache(&mut self) {
        for (url, in_flight) in self.in_flight.drain() {
            in_flight.task.abort();
            tracing::debug!(url = %url, "Aborted fetch for cache clear");
        }

        for store in self.stores.values_mut() {
            store.clear();
        }

        let message = match self.cache.clear() {
            Ok(_) => STATUS_CACHE_CLEARED.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to clear feed cache");
                format!("Failed to clear cache: {e}")
            }
        };
        self.emit(FeedEvent::StatusMessage { url: None, message });
    }

    /// Stored metadata for `url`, if any was ever written.
    pub fn cache_metadata(&self, url: &str) -> CacheMetadata {
        self.cache.load_metadata(url).unwrap_or_default()
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Current items for `url`, in merge order.
    pub fn items(&self, url: &str) -> &[FeedItem] {
        match self.stores.get(url) {
            Some(store) => store.items(),
            None => &[],
        }
    }

    pub fn filtered_items(&self, url: &str, filter: &FeedFilter) -> Vec<FeedItem> {
        self.stores
            .get(url)
            .map(|store| store.filtered(filter).cloned().collect())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, url: &str) -> usize {
        self.stores.get(url).map_or(0, ItemStore::unread_count)
    }

    /// Load the cache for `url` without touching the network.
    ///
    /// Used by listings that only want what is on disk.
    pub fn load_cached(&mut self, url: &str) -> bool {
        self.load_from_cache(url)
    }

    /// Mark one item read and persist the feed. Returns whether it changed.
    pub fn mark_read(&mut self, url: &str, guid: &str) -> bool {
        let changed = self
            .stores
            .get_mut(url)
            .is_some_and(|store| store.mark_read(guid));
        if changed {
            self.persist(url);
        }
        changed
    }

    /// Mark every item of `url` read and persist once. Returns how many changed.
    pub fn mark_all_read(&mut self, url: &str) -> usize {
        let changed = self
            .stores
            .get_mut(url)
            .map_or(0, ItemStore::mark_all_read);
        if changed > 0 {
            self.persist(url);
        }
        changed
    }

    // ========================================================================
    // Registry
    // ========================================================================

    pub fn registry(&self) -> &FeedRegistry {
        &self.registry
    }

    pub fn add_feed(&mut self, name: &str, url: &str, category: &str) -> Result<(), RegistryError> {
        self.registry.add_feed(name, url, category)
    }

    pub fn remove_feed(&mut self, name: &str) -> Result<bool, RegistryError> {
        self.registry.remove_feed(name)
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn emit(&self, event: FeedEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Event receiver dropped");
        }
    }

    fn emit_status(&self, url: &str, message: &str) {
        self.emit(FeedEvent::StatusMessage {
            url: Some(url.to_string()),
            message: message.to_string(),
        });
    }

    // ========================================================================
    // Actor loop
    // ========================================================================

    /// Run on a dedicated task and return the handle that talks to it.
    pub fn spawn(self) -> (EngineHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let task = tokio::spawn(self.run(commands_rx));
        (EngineHandle::new(commands_tx), task)
    }

    /// Serve commands, attempt completions and auto-refresh until shutdown.
    ///
    /// The loop ends on [`EngineCommand::Shutdown`] or when every command
    /// sender is dropped; outstanding attempts are aborted.
    pub async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        let mut refresh = self.config.refresh_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            let step = tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Shutdown,
                },
                Some(completion) = self.completions_rx.recv() => Step::Completion(completion),
                () = next_tick(&mut refresh) => Step::Refresh,
            };

            match step {
                Step::Command(EngineCommand::Shutdown) | Step::Shutdown => break,
                Step::Command(command) => self.handle_command(command),
                Step::Completion(completion) => self.handle_completion(completion),
                Step::Refresh => {
                    tracing::info!("Auto-refreshing feeds");
                    self.fetch_all();
                }
            }
        }

        for (_, in_flight) in self.in_flight.drain() {
            in_flight.task.abort();
        }
        tracing::debug!("Feed engine stopped");
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Fetch(url) => self.fetch_feed(&url),
            EngineCommand::FetchAll => self.fetch_all(),
            EngineCommand::MarkRead { url, guid } => {
                self.mark_read(&url, &guid);
            }
            EngineCommand::MarkAllRead(url) => {
                self.mark_all_read(&url);
            }
            EngineCommand::ClearCache => self.clear_cache(),
            EngineCommand::AddFeed { source, reply } => {
                let _ = reply.send(self.add_feed(&source.name, &source.url, &source.category));
            }
            EngineCommand::RemoveFeed { name, reply } => {
                let _ = reply.send(self.remove_feed(&name));
            }
            EngineCommand::Items { url, filter, reply } => {
                if !self.stores.contains_key(&url) {
                    self.load_from_cache(&url);
                }
                let _ = reply.send(self.filtered_items(&url, &filter));
            }
            EngineCommand::Feeds { reply } => {
                let _ = reply.send(self.registry.feeds().to_vec());
            }
            EngineCommand::Categories { reply } => {
                let _ = reply.send(self.registry.categories());
            }
            EngineCommand::Shutdown => {}
        }
    }
}

enum Step {
    Command(EngineCommand),
    Completion(AttemptCompletion),
    Refresh,
    Shutdown,
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl<T: FeedTransport> std::fmt::Debug for FeedEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedEngine")
            .field("cache_dir", &self.cache.dir())
            .field("feeds", &self.registry.feeds().len())
            .field("stores", &self.stores.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

