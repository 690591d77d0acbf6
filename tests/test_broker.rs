//! End-to-end scenarios against a real Redis server at `localhost:6379`.
//! These exercise the consumer/fleet state machine and are `#[ignore]`d by
//! default; run them explicitly with `cargo test -- --ignored`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redfleet::prelude::*;
use redis::Commands;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn test_client() -> redis::Client {
    ClientArgs::new(None, "localhost", 6379, 0)
        .build()
        .expect("redis client for localhost:6379")
}

fn unique_key(prefix: &str) -> String {
    // Tests run against a real server with no teardown between runs; scope
    // every key to a random-ish suffix derived from the process id and an
    // in-process counter so repeated `cargo test -- --ignored` invocations
    // don't collide with leftover state from a previous run.
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{n}", std::process::id())
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Demo {
    n: u32,
}

struct RecordingHandler {
    seen: Arc<std::sync::Mutex<Vec<u32>>>,
}

#[async_trait]
impl MessageHandler<Demo> for RecordingHandler {
    async fn handle(&self, value: &Demo) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.seen.lock().unwrap().push(value.n);
        Ok(())
    }
}

#[tokio::test]
#[ignore]
async fn single_producer_single_consumer_roundtrip() {
    let msg_key = unique_key("demo");
    let group_key = unique_key("billing");

    let client = test_client();
    let mut conn = client.get_connection().unwrap();

    let producer = Producer::new(ProducerConfig::new(&msg_key, 0, true));
    let outcome = producer.send(&mut conn, &Demo { n: 42 }).unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let handler = Arc::new(RecordingHandler { seen: seen.clone() });

    let fleet = FleetConfig::new(&msg_key, &group_key, 1).unwrap();
    let manager = FleetManager::new(client.clone(), fleet, handler);

    let token = CancellationToken::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { manager.start(run_token).await });

    sleep(Duration::from_millis(300)).await;
    token.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![42]);

    sleep(Duration::from_millis(100)).await;
    let overview = conn
        .pending_overview(&stream_name(&msg_key), &group_name(&group_key))
        .unwrap();
    assert_eq!(overview.count, 0);
    assert_eq!(outcome.stream, stream_name(&msg_key));
}

#[tokio::test]
#[ignore]
async fn fleet_scale_up_creates_missing_consumers() {
    let msg_key = unique_key("demo");
    let group_key = unique_key("fleet");

    let client = test_client();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let handler = Arc::new(RecordingHandler { seen: seen.clone() });

    let fleet_one = FleetConfig::new(&msg_key, &group_key, 1).unwrap();
    let manager_one = FleetManager::new(client.clone(), fleet_one, handler.clone());

    let token = CancellationToken::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { manager_one.start(run_token).await });
    sleep(Duration::from_millis(200)).await;
    token.cancel();
    handle.await.unwrap().unwrap();

    let fleet_three = FleetConfig::new(&msg_key, &group_key, 3).unwrap();
    let manager_three = FleetManager::new(client.clone(), fleet_three, handler);

    let token = CancellationToken::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { manager_three.start(run_token).await });
    sleep(Duration::from_millis(200)).await;
    token.cancel();
    handle.await.unwrap().unwrap();

    let mut conn = client.get_connection().unwrap();
    let consumers = conn
        .consumers_info(&stream_name(&msg_key), &group_name(&group_key))
        .unwrap();
    assert_eq!(consumers.len(), 3);
}

#[tokio::test]
#[ignore]
async fn malformed_payload_is_acked_without_invoking_handler() {
    let msg_key = unique_key("demo");
    let group_key = unique_key("billing");

    let client = test_client();
    let mut conn = client.get_connection().unwrap();

    let stream = stream_name(&msg_key);
    let _: String = conn.xadd(&stream, "*", &[("not-msg-key", "oops")]).unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let handler = Arc::new(RecordingHandler { seen: seen.clone() });

    let fleet = FleetConfig::new(&msg_key, &group_key, 1).unwrap();
    let manager = FleetManager::new(client.clone(), fleet, handler);

    let token = CancellationToken::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { manager.start(run_token).await });
    sleep(Duration::from_millis(300)).await;
    token.cancel();
    handle.await.unwrap().unwrap();

    assert!(seen.lock().unwrap().is_empty());

    let overview = conn
        .pending_overview(&stream, &group_name(&group_key))
        .unwrap();
    assert_eq!(overview.count, 0);
}

#[tokio::test]
#[ignore]
async fn max_length_trim_retains_only_newest_entries() {
    let msg_key = unique_key("demo");
    let client = test_client();
    let mut conn = client.get_connection().unwrap();

    let producer = Producer::new(ProducerConfig::new(&msg_key, 5, false));
    for i in 0..10 {
        producer.send(&mut conn, &Demo { n: i }).unwrap();
    }

    let len: i64 = conn.xlen(stream_name(&msg_key)).unwrap();
    assert_eq!(len, 5);
}

#[tokio::test]
#[ignore]
async fn pending_counter_increments_and_decrements_atomically() {
    let stream = unique_key("counter-stream");
    let group = unique_key("counter-group");

    let client = test_client();
    let mut conn = client.get_connection().unwrap();

    let after_first = conn.incr_pending_counter(&stream, &group, 1).unwrap();
    assert_eq!(after_first, 1);

    let after_second = conn.incr_pending_counter(&stream, &group, 1).unwrap();
    assert_eq!(after_second, 2);

    let after_decrement = conn.incr_pending_counter(&stream, &group, -1).unwrap();
    assert_eq!(after_decrement, 1);
}
