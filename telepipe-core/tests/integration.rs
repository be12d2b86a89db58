//! Integration tests for the telemetry pipeline
//!
//! These tests run the channel, staging store and sender against a mockito
//! collector to verify batching, retry and restart behaviour end to end.

use std::sync::Arc;
use std::time::Duration;

use mockito::{Matcher, Server};
use tempfile::TempDir;
use telepipe_core::sender::{HttpTransport, StatusClassifier};
use telepipe_core::{
    Channel, ContextTags, CustomEvent, Pipeline, PipelineConfig, SendOutcome, Sender,
    SenderConfig, StagingStore,
};
use tokio::runtime::Handle;

fn pipeline_config(dir: &TempDir, url: &str) -> PipelineConfig {
    PipelineConfig {
        staging_dir: Some(dir.path().join("telemetry")),
        batch_threshold: 1,
        flush_interval_secs: 0,
        retry_interval_secs: 0,
        gzip: false,
        ..PipelineConfig::for_endpoint(format!("{}/v2/track", url))
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("timed out waiting for condition");
}

// ============================================
// Batching
// ============================================

#[test]
fn test_batch_of_n_events_is_one_unit() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StagingStore::new(dir.path().join("telemetry"), 50));
    let channel = Channel::new(Arc::clone(&store), 5);

    for n in 0..5 {
        channel.log(
            &CustomEvent::new(format!("event-{}", n)),
            ContextTags::new(),
        );
    }

    assert_eq!(store.staged_count(), 1);
    let unit = store.next_available().unwrap();
    let names: Vec<String> = store
        .load(&unit)
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["data"]["baseData"]["name"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(
        names,
        vec!["event-0", "event-1", "event-2", "event-3", "event-4"]
    );
}

#[test]
fn test_backpressure_stops_disk_writes() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StagingStore::new(dir.path().join("telemetry"), 3));
    let channel = Channel::new(Arc::clone(&store), 1);

    for n in 0..10 {
        channel.enqueue(format!("{{\"n\":{}}}", n));
    }

    assert_eq!(store.staged_count(), 3);
    let files = std::fs::read_dir(store.dir()).unwrap().count();
    assert_eq!(files, 3);
}

// ============================================
// Delivery
// ============================================

#[tokio::test]
async fn test_retry_after_server_error() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = pipeline_config(&dir, &server.url());

    let store = Arc::new(StagingStore::new(config.staging_dir(), 50));
    let channel = Channel::new(Arc::clone(&store), 1);
    let sender = Sender::new(
        Arc::clone(&store),
        Arc::new(HttpTransport::new(&config).unwrap()),
        SenderConfig {
            max_in_flight: 10,
            classifier: StatusClassifier::from_config(&config),
        },
        Handle::current(),
    );

    channel.enqueue("eventA".to_string());
    assert_eq!(store.staged_count(), 1);
    let unit = store.next_available().unwrap();
    assert_eq!(store.load(&unit), "eventA");
    store.release(&unit);

    let failing = server
        .mock("POST", "/v2/track")
        .match_header("content-type", "application/x-json-stream")
        .match_body("eventA")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    assert_eq!(
        sender.send_once().await,
        Some(SendOutcome::Released { status: 500 })
    );
    failing.assert_async().await;
    assert_eq!(store.staged_count(), 1);
    assert!(!store.is_served(&unit));
    failing.remove_async().await;

    let accepting = server
        .mock("POST", "/v2/track")
        .match_body("eventA")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    assert_eq!(sender.send_once().await, Some(SendOutcome::Delivered));
    accepting.assert_async().await;
    assert_eq!(store.staged_count(), 0);
    assert!(!unit.path().exists());
}

#[tokio::test]
async fn test_pipeline_retries_released_unit_on_trigger() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let failing = server
        .mock("POST", "/v2/track")
        .with_status(503)
        .expect(1)
        .create_async()
        .await;

    let pipeline = Pipeline::start(&pipeline_config(&dir, &server.url())).unwrap();
    pipeline.log(&CustomEvent::new("checkout"), ContextTags::new());

    wait_until(|| failing.matched() && pipeline.in_flight() == 0).await;
    assert_eq!(pipeline.staged_count(), 1);
    assert_eq!(pipeline.stats().units_released, 1);
    failing.remove_async().await;

    let accepting = server
        .mock("POST", "/v2/track")
        .match_body(Matcher::Regex("checkout".to_string()))
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    assert!(pipeline.trigger_send());
    wait_until(|| pipeline.staged_count() == 0 && pipeline.in_flight() == 0).await;
    accepting.assert_async().await;
    assert_eq!(pipeline.stats().units_delivered, 1);
}

#[tokio::test]
async fn test_rejected_unit_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let rejecting = server
        .mock("POST", "/v2/track")
        .with_status(400)
        .with_body("malformed envelope")
        .expect(1)
        .create_async()
        .await;

    let pipeline = Pipeline::start(&pipeline_config(&dir, &server.url())).unwrap();
    pipeline.log(&CustomEvent::new("bad"), ContextTags::new());

    wait_until(|| pipeline.stats().units_rejected == 1 && pipeline.in_flight() == 0).await;
    assert_eq!(pipeline.staged_count(), 0);

    // Nothing left to send, so another trigger makes no request
    pipeline.trigger_send();
    tokio::time::sleep(Duration::from_millis(100)).await;
    rejecting.assert_async().await;
}

#[tokio::test]
async fn test_gzip_body_accepted() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v2/track")
        .match_header("content-encoding", "gzip")
        .match_header("content-type", "application/x-json-stream")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = PipelineConfig {
        gzip: true,
        ..pipeline_config(&dir, &server.url())
    };
    let pipeline = Pipeline::start(&config).unwrap();
    pipeline.log(&CustomEvent::new("compressed"), ContextTags::new());

    wait_until(|| pipeline.staged_count() == 0 && pipeline.in_flight() == 0).await;
    mock.assert_async().await;
}

// ============================================
// Restart recovery
// ============================================

#[tokio::test]
async fn test_units_claimed_before_restart_are_delivered() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = pipeline_config(&dir, &server.url());

    // A previous process staged two units and died mid-send on one of them
    {
        let store = StagingStore::new(config.staging_dir(), 50);
        store.persist(&["{\"before\":1}".to_string()]);
        store.persist(&["{\"before\":2}".to_string()]);
        let claimed = store.next_available().unwrap();
        assert!(store.is_served(&claimed));
    }

    let mock = server
        .mock("POST", "/v2/track")
        .match_body(Matcher::Regex("before".to_string()))
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let pipeline = Pipeline::start(&config).unwrap();
    wait_until(|| pipeline.staged_count() == 0 && pipeline.in_flight() == 0).await;
    mock.assert_async().await;
}
