//! End-to-end scenarios against a fake Klaviyo server: a single stream
//! driven through `SyncDriver`, the same path `read` uses in production.

mod common;

use std::sync::Arc;

use chrono::Duration;
use source_base::driver::{DriverConfig, SyncDriver};
use source_base::message::Message;
use source_base::stream::Stream;
use source_klaviyo::streams::events::EventsStream;
use tokio_util::sync::CancellationToken;

use common::{event, state_with_recent_cutoff, FakeKlaviyo};

fn driver_config() -> DriverConfig {
    DriverConfig {
        max_stream_failures: -1,
        max_slice_failures: -1,
        backfill: false,
        initialize: false,
    }
}

/// S1 — empty stream, incremental: no records, one STATE, a SUCCESS status.
#[tokio::test]
async fn empty_event_stream_emits_no_records_and_one_success_status() {
    let fake = FakeKlaviyo::new().await;
    fake.mount_empty("/events/").await;

    let stream: Arc<dyn Stream> = Arc::new(EventsStream::new(fake.client(), false));
    let driver = SyncDriver::new(vec![stream], driver_config());

    let mut messages = Vec::new();
    let result = driver
        .run(
            &["events".to_string()],
            state_with_recent_cutoff("events"),
            CancellationToken::new(),
            &mut |m| messages.push(m),
        )
        .await;

    assert!(result.is_ok());
    assert!(!messages.iter().any(|m| matches!(m, Message::Record { .. })));
    assert!(messages.iter().any(|m| matches!(m, Message::State { .. })));
    assert!(messages.iter().any(|m| matches!(m, Message::Status(s) if s.status == source_base::message::RunStatus::Success)));
}

/// S2 — single shard, several records: emitted in ascending order and the
/// final watermark reflects the latest one.
#[tokio::test]
async fn records_are_emitted_in_ascending_order_with_a_final_watermark() {
    let fake = FakeKlaviyo::new().await;
    let now = chrono::Utc::now();
    let t1 = now - Duration::minutes(20);
    let t2 = now - Duration::minutes(10);
    let t3 = now - Duration::minutes(1);
    fake.mount_page(
        "/events/",
        vec![
            event("1", &t1.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            event("2", &t2.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            event("3", &t3.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        ],
    )
    .await;

    let stream: Arc<dyn Stream> = Arc::new(EventsStream::new(fake.client(), false));
    let driver = SyncDriver::new(vec![stream], driver_config());

    let mut messages = Vec::new();
    let result = driver
        .run(
            &["events".to_string()],
            state_with_recent_cutoff("events"),
            CancellationToken::new(),
            &mut |m| messages.push(m),
        )
        .await;
    assert!(result.is_ok());

    let ids: Vec<String> = messages
        .iter()
        .filter_map(|m| match m {
            Message::Record { record } => record.data.get("id").and_then(|v| v.as_str()).map(str::to_string),
            _ => None,
        })
        .collect();
    assert_eq!(ids, vec!["1", "2", "3"]);

    let final_state = messages
        .iter()
        .rev()
        .find_map(|m| match m {
            Message::State { state } => Some(state.data.clone()),
            _ => None,
        })
        .expect("a final STATE message");
    assert_eq!(final_state["events"]["cutoff"], t3.timestamp_millis());
}

/// S5 — transient failure: two 500s then a 200 produce the same records as
/// the no-failure run, with no duplicate STATE from the retries themselves.
#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_without_duplicating_records() {
    let fake = FakeKlaviyo::new().await;
    let now = chrono::Utc::now();
    let t1 = now - Duration::minutes(5);
    fake.mount_flaky("/events/", &[500, 500], vec![event("1", &t1.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))])
        .await;

    let stream: Arc<dyn Stream> = Arc::new(EventsStream::new(fake.client(), false));
    let driver = SyncDriver::new(vec![stream], driver_config());

    let mut messages = Vec::new();
    let result = driver
        .run(
            &["events".to_string()],
            state_with_recent_cutoff("events"),
            CancellationToken::new(),
            &mut |m| messages.push(m),
        )
        .await;
    assert!(result.is_ok());

    let records: Vec<_> = messages.iter().filter(|m| matches!(m, Message::Record { .. })).collect();
    assert_eq!(records.len(), 1);
}
