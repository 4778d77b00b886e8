//! Per-record fan-out: Campaigns joins each campaign with its messages and
//! tags via separate sub-requests before the record is emitted.

mod common;

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use source_base::driver::{DriverConfig, SyncDriver};
use source_base::message::Message;
use source_base::stream::Stream;
use source_klaviyo::streams::campaigns::CampaignsStream;
use tokio_util::sync::CancellationToken;

use common::{state_with_recent_cutoff, FakeKlaviyo};

#[tokio::test]
async fn campaign_records_carry_their_joined_messages_and_tags() {
    let fake = FakeKlaviyo::new().await;
    let now = chrono::Utc::now();
    let updated = (now - Duration::minutes(5)).to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    fake.mount_page("/campaigns/", vec![json!({"id": "camp_1", "attributes": {"updated_at": updated}})]).await;
    fake.mount_page(
        "/campaign-messages/",
        vec![json!({"id": "msg_1", "attributes": {"channel": "email"}})],
    )
    .await;
    fake.mount_page("/tags/", vec![json!({"id": "tag_1", "attributes": {"name": "promo"}})]).await;

    let stream: Arc<dyn Stream> = Arc::new(CampaignsStream::new(fake.client(), false));
    let driver = SyncDriver::new(
        vec![stream],
        DriverConfig {
            max_stream_failures: -1,
            max_slice_failures: -1,
            backfill: false,
            initialize: false,
        },
    );

    let mut messages = Vec::new();
    let result = driver
        .run(
            &["campaigns".to_string()],
            state_with_recent_cutoff("campaigns"),
            CancellationToken::new(),
            &mut |m| messages.push(m),
        )
        .await;
    assert!(result.is_ok());

    let record = messages
        .iter()
        .find_map(|m| match m {
            Message::Record { record } if record.stream == "campaigns" => Some(record.data.clone()),
            _ => None,
        })
        .expect("one campaign record");

    assert_eq!(record["campaign_messages"][0]["id"], "msg_1");
    assert_eq!(record["tags"][0]["id"], "tag_1");
}
