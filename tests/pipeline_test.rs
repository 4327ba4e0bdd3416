//! Integration tests for the channel worker and dispatcher
//!
//! The network is replaced by a scripted fetcher; storage runs on SQLite.

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use common::*;
use feedwatch::crawler::{CycleOutcome, Dispatcher, DispatcherConfig};
use feedwatch::error::FetchError;
use feedwatch::metrics::{JsonFileSink, ProgressReporter, ProgressSnapshot};
use feedwatch::models::HttpClass;
use tempfile::TempDir;
use tokio::sync::watch;

fn fast_config(concurrency: usize) -> DispatcherConfig {
    DispatcherConfig {
        concurrency,
        batch_size: 10,
        tick: StdDuration::from_millis(50),
        reservation_lease: StdDuration::from_secs(3600),
    }
}

#[tokio::test]
async fn test_new_item_schedules_active_recheck() {
    let (registry, items) = setup();
    registry.register(CHANNEL_ID).unwrap();

    let fetcher = ScriptedFetcher::new();
    let published = Utc::now() - Duration::hours(1);
    fetcher.push(ok_response(atom_feed(&[("vid1", published)]), "\"v1\""));
    let worker = worker(&registry, &items, fetcher.clone());

    let outcome = worker.run_cycle(&reserve_one(&registry)).await;
    assert_eq!(outcome, CycleOutcome::Success { new_items: 1 });

    let channel = registry.get(CHANNEL_ID).unwrap().unwrap();
    let delay = scheduled_delay(&channel);
    assert!((300..=900).contains(&delay), "active recheck delay was {delay}");
    assert_eq!(channel.failures, 0);
    assert!(!channel.inflight);
    assert_eq!(channel.freshness_token.as_deref(), Some("\"v1\""));
    assert_eq!(channel.last_seen_item_id.as_deref(), Some("vid1"));
    assert_eq!(channel.last_http_class, Some(HttpClass::Success));
    assert_eq!(items.discovery_count().unwrap(), 1);

    // Same payload again: nothing new, hour-old watermark keeps the 15 minute tier
    fetcher.push(ok_response(atom_feed(&[("vid1", published)]), "\"v1\""));
    let outcome = worker.run_cycle(&reserve_one(&registry)).await;
    assert_eq!(outcome, CycleOutcome::Success { new_items: 0 });
    assert_jittered(scheduled_delay(&registry.get(CHANNEL_ID).unwrap().unwrap()), 900);

    let calls = fetcher.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].token, None);
    assert_eq!(calls[1].token.as_deref(), Some("\"v1\""));
    assert_eq!(items.discovery_count().unwrap(), 1);
}

#[tokio::test]
async fn test_not_modified_follows_activity_tier() {
    let (registry, items) = setup();
    registry.register(CHANNEL_ID).unwrap();

    let fetcher = ScriptedFetcher::new();
    let published = Utc::now() - Duration::days(10);
    fetcher.push(ok_response(atom_feed(&[("old", published)]), "\"v1\""));
    let worker = worker(&registry, &items, fetcher.clone());
    worker.run_cycle(&reserve_one(&registry)).await;

    for _ in 0..5 {
        let outcome = worker.run_cycle(&reserve_one(&registry)).await;
        assert_eq!(outcome, CycleOutcome::NotModified);

        let channel = registry.get(CHANNEL_ID).unwrap().unwrap();
        assert_jittered(scheduled_delay(&channel), 7200);
        assert_eq!(channel.failures, 0);
        assert_eq!(channel.freshness_token.as_deref(), Some("\"v1\""));
        assert_eq!(channel.last_seen_item_id.as_deref(), Some("old"));
    }

    let calls = fetcher.calls();
    assert_eq!(calls.len(), 6);
    assert!(calls[1..].iter().all(|c| c.token.as_deref() == Some("\"v1\"")));
}

#[tokio::test]
async fn test_failures_back_off_then_reset() {
    let (registry, items) = setup();
    registry.register(CHANNEL_ID).unwrap();

    let fetcher = ScriptedFetcher::new();
    let published = Utc::now() - Duration::days(2);
    fetcher.push(ok_response(atom_feed(&[("vid1", published)]), "\"v1\""));
    let worker = worker(&registry, &items, fetcher.clone());
    worker.run_cycle(&reserve_one(&registry)).await;

    for (expected_failures, nominal) in [(1, 570), (2, 1083), (3, 2057)] {
        fetcher.push_status(500);
        let outcome = worker.run_cycle(&reserve_one(&registry)).await;
        assert_eq!(
            outcome,
            CycleOutcome::Failed {
                class: HttpClass::ServerError
            }
        );

        let channel = registry.get(CHANNEL_ID).unwrap().unwrap();
        assert_eq!(channel.failures, expected_failures);
        assert_jittered(scheduled_delay(&channel), nominal);
        assert_eq!(channel.last_http_status, Some(500));
        assert_eq!(channel.freshness_token.as_deref(), Some("\"v1\""));
        assert_eq!(channel.last_seen_item_id.as_deref(), Some("vid1"));
    }

    let outcome = worker.run_cycle(&reserve_one(&registry)).await;
    assert_eq!(outcome, CycleOutcome::NotModified);

    let channel = registry.get(CHANNEL_ID).unwrap().unwrap();
    assert_eq!(channel.failures, 0);
    assert_jittered(scheduled_delay(&channel), 1800);
}

#[tokio::test]
async fn test_rate_limited_does_not_count_as_failure() {
    let (registry, items) = setup();
    registry.register(CHANNEL_ID).unwrap();

    let fetcher = ScriptedFetcher::new();
    fetcher.push_status(429);
    let worker = worker(&registry, &items, fetcher);

    let outcome = worker.run_cycle(&reserve_one(&registry)).await;
    assert_eq!(outcome, CycleOutcome::RateLimited);

    let channel = registry.get(CHANNEL_ID).unwrap().unwrap();
    assert_eq!(channel.failures, 0);
    assert_eq!(channel.last_http_class, Some(HttpClass::RateLimited));
    assert_jittered(scheduled_delay(&channel), 900);
    assert!(!channel.inflight);
}

#[tokio::test]
async fn test_gone_backs_off_one_day() {
    let (registry, items) = setup();
    registry.register(CHANNEL_ID).unwrap();

    let fetcher = ScriptedFetcher::new();
    fetcher.push_status(404);
    let worker = worker(&registry, &items, fetcher);

    let outcome = worker.run_cycle(&reserve_one(&registry)).await;
    assert_eq!(outcome, CycleOutcome::Gone);

    let channel = registry.get(CHANNEL_ID).unwrap().unwrap();
    assert_eq!(channel.failures, 1);
    assert_eq!(channel.last_http_status, Some(404));
    assert_eq!(scheduled_delay(&channel), 86_400);
}

#[tokio::test]
async fn test_transport_error_is_recorded() {
    let (registry, items) = setup();
    registry.register(CHANNEL_ID).unwrap();

    let fetcher = ScriptedFetcher::new();
    fetcher.push_error(FetchError::Timeout);
    let worker = worker(&registry, &items, fetcher);

    let outcome = worker.run_cycle(&reserve_one(&registry)).await;
    assert_eq!(
        outcome,
        CycleOutcome::Failed {
            class: HttpClass::TransportError
        }
    );

    let channel = registry.get(CHANNEL_ID).unwrap().unwrap();
    assert_eq!(channel.failures, 1);
    assert_eq!(channel.last_http_status, None);
    assert_eq!(channel.last_http_class, Some(HttpClass::TransportError));
    assert_jittered(scheduled_delay(&channel), 570);
    assert!(!channel.inflight);
}

#[tokio::test]
async fn test_malformed_payload_is_an_empty_success() {
    let (registry, items) = setup();
    registry.register(CHANNEL_ID).unwrap();

    let fetcher = ScriptedFetcher::new();
    fetcher.push(ok_response("<html>not a feed</html>".to_string(), "\"x\""));
    let worker = worker(&registry, &items, fetcher);

    let outcome = worker.run_cycle(&reserve_one(&registry)).await;
    assert_eq!(outcome, CycleOutcome::Success { new_items: 0 });

    let channel = registry.get(CHANNEL_ID).unwrap().unwrap();
    assert_eq!(channel.failures, 0);
    assert_eq!(channel.last_seen_item_id, None);
    assert_eq!(items.item_count().unwrap(), 0);
}

#[tokio::test]
async fn test_shared_item_is_discovered_once() {
    let (registry, items) = setup();
    let past = Utc::now() - Duration::minutes(1);
    registry.register_at("feed-a", past).unwrap();
    registry.register_at("feed-b", past).unwrap();

    let fetcher = ScriptedFetcher::new();
    let body = atom_feed(&[("shared", Utc::now() - Duration::hours(3))]);
    fetcher.push(ok_response(body.clone(), "\"a\""));
    fetcher.push(ok_response(body, "\"b\""));
    let worker = worker(&registry, &items, fetcher);

    let due = registry.reserve_due(10).unwrap();
    assert_eq!(due.len(), 2);

    let mut new_items = 0;
    for channel in &due {
        if let CycleOutcome::Success { new_items: n } = worker.run_cycle(channel).await {
            new_items += n;
        }
    }

    assert_eq!(new_items, 1);
    assert_eq!(items.item_count().unwrap(), 1);
    assert_eq!(items.discovery_count().unwrap(), 1);

    let discovery = items.get_discovery("shared").unwrap().unwrap();
    assert_eq!(discovery.feed_id, due[0].feed_id);
}

#[tokio::test]
async fn test_bounded_run_processes_reserved_channels() {
    let (registry, items) = setup();
    let past = Utc::now() - Duration::minutes(1);
    for i in 0..5 {
        registry.register_at(&format!("feed-{i}"), past).unwrap();
    }

    let fetcher = ScriptedFetcher::new();
    let dispatcher = Dispatcher::new(
        fast_config(2),
        registry.clone(),
        worker(&registry, &items, fetcher.clone()),
    );

    let counts = dispatcher.run_bounded(3).await.unwrap();
    assert_eq!(counts.not_modified, 3);
    assert_eq!(counts.cycles(), 3);
    assert_eq!(fetcher.calls().len(), 3);

    let counts = dispatcher.run_bounded(10).await.unwrap();
    assert_eq!(counts.not_modified, 2);

    for i in 0..5 {
        let channel = registry.get(&format!("feed-{i}")).unwrap().unwrap();
        assert!(!channel.inflight);
        assert!(channel.last_checked_at.is_some());
        assert!(channel.next_poll_at > Utc::now());
    }
    assert_eq!(registry.due_count_at(Utc::now()).unwrap(), 0);
}

#[tokio::test]
async fn test_bounded_run_recovers_expired_reservations() {
    let (registry, items) = setup();
    let now = Utc::now();
    registry
        .register_at(CHANNEL_ID, now - Duration::hours(3))
        .unwrap();

    // Reservation left behind by a run that crashed two hours ago
    let stale = registry.reserve_due_at(1, now - Duration::hours(2)).unwrap();
    assert_eq!(stale.len(), 1);

    let dispatcher = Dispatcher::new(
        fast_config(1),
        registry.clone(),
        worker(&registry, &items, ScriptedFetcher::new()),
    );
    let counts = dispatcher.run_bounded(10).await.unwrap();
    assert_eq!(counts.not_modified, 1);
    assert!(!registry.get(CHANNEL_ID).unwrap().unwrap().inflight);
}

#[tokio::test]
async fn test_second_dispatcher_leaves_live_reservations_alone() {
    let (registry, items) = setup();
    registry
        .register_at(CHANNEL_ID, Utc::now() - Duration::minutes(1))
        .unwrap();

    let fetcher = ScriptedFetcher::slow(StdDuration::from_millis(500));
    let first = Dispatcher::new(
        fast_config(1),
        registry.clone(),
        worker(&registry, &items, Arc::clone(&fetcher)),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { first.run_continuous(stop_rx).await });

    // The first dispatcher is now mid-fetch on the only channel
    tokio::time::sleep(StdDuration::from_millis(150)).await;
    assert!(registry.get(CHANNEL_ID).unwrap().unwrap().inflight);

    let second = Dispatcher::new(
        fast_config(1),
        registry.clone(),
        worker(&registry, &items, Arc::clone(&fetcher)),
    );
    let counts = second.run_bounded(10).await.unwrap();
    assert_eq!(counts.cycles(), 0);
    assert!(registry.get(CHANNEL_ID).unwrap().unwrap().inflight);

    tokio::time::sleep(StdDuration::from_millis(500)).await;
    stop_tx.send(true).unwrap();
    let total = handle.await.unwrap().unwrap();

    assert_eq!(total.cycles(), 1);
    assert_eq!(fetcher.calls().len(), 1);
    assert_eq!(fetcher.max_overlap(), 1);
    assert!(!registry.get(CHANNEL_ID).unwrap().unwrap().inflight);
}

#[tokio::test]
async fn test_continuous_run_releases_queue_on_stop() {
    let (registry, items) = setup();
    let past = Utc::now() - Duration::minutes(1);
    let ids: Vec<String> = (0..10).map(|i| format!("feed-{i}")).collect();
    for id in &ids {
        registry.register_at(id, past).unwrap();
    }

    let dir = TempDir::new().unwrap();
    let progress_path = dir.path().join("progress.json");
    let reporter = ProgressReporter::new(registry.clone(), items.clone())
        .with_sink(JsonFileSink::new(&progress_path));

    let fetcher = ScriptedFetcher::slow(StdDuration::from_millis(300));
    let dispatcher = Dispatcher::new(
        fast_config(1),
        registry.clone(),
        worker(&registry, &items, fetcher),
    )
    .with_reporter(reporter);

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { dispatcher.run_continuous(stop_rx).await });

    tokio::time::sleep(StdDuration::from_millis(100)).await;
    stop_tx.send(true).unwrap();
    let total = handle.await.unwrap().unwrap();

    assert!(total.cycles() >= 1);
    assert!(total.cycles() < 10, "queued channels should not be fetched");

    let mut checked = 0;
    for id in &ids {
        let channel = registry.get(id).unwrap().unwrap();
        assert!(!channel.inflight, "{id} still reserved");
        if channel.last_checked_at.is_some() {
            checked += 1;
        }
    }
    assert_eq!(checked, total.cycles());
    assert_eq!(registry.due_count_at(Utc::now()).unwrap(), 10 - checked);

    let snapshot: ProgressSnapshot =
        serde_json::from_str(&std::fs::read_to_string(&progress_path).unwrap()).unwrap();
    assert_eq!(snapshot.total_channels, Some(10));
    assert_eq!(snapshot.tick_failures, 0);
}

#[tokio::test]
async fn test_continuous_run_drains_due_channels() {
    let (registry, items) = setup();
    let past = Utc::now() - Duration::minutes(1);
    for i in 0..3 {
        registry.register_at(&format!("feed-{i}"), past).unwrap();
    }

    let fetcher = ScriptedFetcher::new();
    let dispatcher = Dispatcher::new(
        fast_config(2),
        registry.clone(),
        worker(&registry, &items, Arc::clone(&fetcher)),
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { dispatcher.run_continuous(stop_rx).await });

    tokio::time::sleep(StdDuration::from_millis(300)).await;
    stop_tx.send(true).unwrap();
    let total = handle.await.unwrap().unwrap();

    assert_eq!(total.not_modified, 3);
    assert_eq!(fetcher.calls().len(), 3);
    assert_eq!(registry.due_count_at(Utc::now()).unwrap(), 0);
}
