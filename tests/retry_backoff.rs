//! Retry/backoff state machine, driven with paused tokio time.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{config_with_retries, errors, rss, statuses, Harness, FEED_URL};
use paddock::config::Config;
use paddock::engine::FeedEvent;
use paddock::feed::{FetchError, FetchResponse, Payload};
use paddock::storage::FeedItem;
use pretty_assertions::assert_eq;

fn cached_item(guid: &str) -> FeedItem {
    FeedItem {
        title: format!("Cached {guid}"),
        link: format!("https://example.com/{guid}"),
        description: String::new(),
        pub_date: String::new(),
        image_url: None,
        category: None,
        guid: guid.to_string(),
        is_read: true,
        fetch_time: Utc::now(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_three_failures_back_off_linearly_without_a_fourth_retry() {
    let mut h = Harness::new(Config::default());

    h.engine.fetch_feed(FEED_URL);
    h.engine.settle().await;

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 4, "initial attempt plus three retries");
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].at - w[0].at).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(1000),
            Duration::from_millis(2000),
            Duration::from_millis(3000),
        ]
    );

    let events = h.drain();
    assert_eq!(
        statuses(&events),
        vec![
            "Fetching feed...",
            "Retrying in 1 seconds (attempt 1/3)...",
            "Retrying in 2 seconds (attempt 2/3)...",
            "Retrying in 3 seconds (attempt 3/3)...",
            "Failed after 3 attempts. Using cached data if available.",
        ]
    );
    assert_eq!(errors(&events), vec!["HTTP error: status 503"; 4]);
    assert!(!h.engine.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fall_back_to_cache_when_nothing_is_loaded() {
    let mut h = Harness::new(Config::default());

    h.engine.fetch_feed(FEED_URL);
    // Written after the optimistic load, so only the fallback can pick it up.
    h.cache().save(FEED_URL, &[cached_item("c1")]).unwrap();
    h.engine.settle().await;

    let items = h.engine.items(FEED_URL);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].guid, "c1");
    assert!(items[0].is_read);

    let events = h.drain();
    assert_eq!(
        events.last(),
        Some(&FeedEvent::FeedUpdated {
            url: FEED_URL.to_string()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_keep_items_already_in_memory() {
    let mut h = Harness::new(Config::default());
    h.cache().save(FEED_URL, &[cached_item("c1")]).unwrap();

    h.engine.fetch_feed(FEED_URL);
    h.engine.settle().await;

    let events = h.drain();
    assert_eq!(
        statuses(&events).first().map(String::as_str),
        Some("Loaded from cache, fetching updates...")
    );
    let updates = events
        .iter()
        .filter(|e| matches!(e, FeedEvent::FeedUpdated { .. }))
        .count();
    assert_eq!(updates, 1, "only the optimistic cache load updates the feed");
    assert_eq!(h.engine.items(FEED_URL).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_after_parse_failure() {
    let mut h = Harness::new(Config::default());
    h.transport.push_body("<not valid xml");
    h.transport.push_body(&rss(&[("a", "Grid penalty for Sainz")]));

    h.engine.fetch_feed(FEED_URL);
    h.engine.settle().await;

    let events = h.drain();
    let errors = errors(&events);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Parse error"), "got {}", errors[0]);
    assert_eq!(
        statuses(&events),
        vec![
            "Fetching feed...",
            "Retrying in 1 seconds (attempt 1/3)...",
            "Feed successfully updated",
        ]
    );
    assert_eq!(h.engine.items(FEED_URL).len(), 1);
    assert_eq!(h.transport.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_response_times_out_and_is_retried() {
    let mut h = Harness::new(Config::default());
    h.transport
        .push_delayed(Duration::from_secs(60), Ok(FetchResponse::body(rss(&[("late", "Late")]))));
    h.transport.push_body(&rss(&[("a", "On time")]));

    h.engine.fetch_feed(FEED_URL);
    h.engine.settle().await;

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1].at - calls[0].at,
        Duration::from_secs(15) + Duration::from_millis(1000)
    );

    let events = h.drain();
    assert_eq!(errors(&events), vec!["Request timed out"]);
    let titles: Vec<_> = h
        .engine
        .items(FEED_URL)
        .iter()
        .map(|i| i.title.clone())
        .collect();
    assert_eq!(titles, vec!["On time"]);
}

#[tokio::test(start_paused = true)]
async fn test_validators_are_only_committed_after_a_successful_parse() {
    let mut h = Harness::new(config_with_retries(0, 1000));
    h.transport.push_body_with_etag("<rss><channel></channel></rss>", "\"empty\"");

    h.engine.fetch_feed(FEED_URL);
    h.engine.settle().await;
    assert_eq!(h.engine.cache_metadata(FEED_URL).etag, None);

    h.transport
        .push_body_with_etag(&rss(&[("a", "Qualifying")]), "\"v2\"");
    h.engine.fetch_feed(FEED_URL);
    h.engine.settle().await;
    assert_eq!(
        h.engine.cache_metadata(FEED_URL).etag.as_deref(),
        Some("\"v2\"")
    );

    // Next attempt sends the stored validator.
    h.transport.push(Ok(FetchResponse::not_modified()));
    h.engine.fetch_feed(FEED_URL);
    h.engine.settle().await;
    let calls = h.transport.calls();
    assert_eq!(
        calls.last().unwrap().validators.etag.as_deref(),
        Some("\"v2\"")
    );
}

#[tokio::test(start_paused = true)]
async fn test_refetch_discards_superseded_completion() {
    let mut h = Harness::new(Config::default());
    h.transport.push_body(&rss(&[("old", "Superseded story")]));
    h.transport.push_body(&rss(&[("new", "Current story")]));

    h.engine.fetch_feed(FEED_URL);
    // Let the first attempt finish; its completion stays queued.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.transport.calls().len(), 1);

    h.engine.fetch_feed(FEED_URL);
    h.engine.settle().await;

    let guids: Vec<_> = h
        .engine
        .items(FEED_URL)
        .iter()
        .map(|i| i.guid.clone())
        .collect();
    assert_eq!(guids, vec!["new"]);

    let events = h.drain();
    let successes = statuses(&events)
        .into_iter()
        .filter(|s| s == "Feed successfully updated")
        .count();
    assert_eq!(successes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_retry_budget_gives_up_immediately() {
    let mut h = Harness::new(config_with_retries(0, 1000));
    h.transport.push(Err(FetchError::Timeout));

    h.engine.fetch_feed(FEED_URL);
    h.engine.settle().await;

    assert_eq!(h.transport.calls().len(), 1);
    let events = h.drain();
    assert_eq!(
        statuses(&events),
        vec![
            "Fetching feed...",
            "Failed after 0 attempts. Using cached data if available.",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_tls_warning_is_reported_and_items_still_merge() {
    let mut h = Harness::new(Config::default());
    h.transport.push(Ok(FetchResponse {
        payload: Payload::Body {
            bytes: rss(&[("a", "Safety car restart")]).into_bytes(),
            etag: None,
            last_modified: None,
        },
        tls_warning: Some("certificate for host could not be verified".to_string()),
    }));

    h.engine.fetch_feed(FEED_URL);
    h.engine.settle().await;

    let events = h.drain();
    assert_eq!(
        errors(&events),
        vec!["TLS warning: certificate for host could not be verified"]
    );
    assert_eq!(
        statuses(&events).last().map(String::as_str),
        Some("Feed successfully updated")
    );
    assert_eq!(h.engine.items(FEED_URL).len(), 1);
    assert_eq!(h.transport.calls().len(), 1);
}
