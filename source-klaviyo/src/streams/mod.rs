//! The six concrete streams (§4.7).

pub mod campaigns;
pub mod events;
pub mod flows;
pub mod metrics;
pub mod profiles;
pub mod templates;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use source_base::error::SourceError;
use source_base::shard::{Shard, ShardPlan};
use source_base::stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::client::KlaviyoClient;
use crate::config::Config;

/// The earliest moment any stream will seed from absent a prior watermark
/// and a usable peek (§4.7 "Initial cutoff").
pub const EPOCH_SEED: &str = "2000-01-01T00:00:00Z";

pub fn epoch_seed() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(EPOCH_SEED).unwrap().with_timezone(&Utc)
}

/// Hourly shards with the overlaps §4.7 specifies for Events/Profiles.
pub fn hourly_shards(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Shard> {
    ShardPlan {
        from,
        to,
        step: chrono::Duration::hours(1),
        step_overlap: chrono::Duration::seconds(5),
        start_overlap: chrono::Duration::minutes(1),
    }
    .generate()
}

/// Flatten a Klaviyo JSON:API resource object (`{id, type, attributes,
/// relationships}`) into a flat record carrying `id` and every attribute
/// at the top level, so `record[primaryKey]`/`record[cursorField]` are
/// directly addressable per §3's Record entity.
pub fn normalize(resource: &Value) -> Value {
    let mut out = serde_json::Map::new();
    if let Some(id) = resource.get("id") {
        out.insert("id".to_string(), id.clone());
    }
    if let Some(attrs) = resource.get("attributes").and_then(Value::as_object) {
        for (k, v) in attrs {
            out.insert(k.clone(), v.clone());
        }
    }
    Value::Object(out)
}

/// `greater-or-equal(FIELD,ISO8601Z)`, the filter expression format §6
/// specifies, comma-joined with any additional clauses by the caller.
pub fn gte_filter(field: &str, since: DateTime<Utc>) -> String {
    format!(
        "greater-or-equal({field},{})",
        since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )
}

/// `less-than(FIELD,ISO8601Z)`.
pub fn lt_filter(field: &str, before: DateTime<Utc>) -> String {
    format!(
        "less-than({field},{})",
        before.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )
}

/// The comma-joined `[from,to)` range filter a sharded stream sends for
/// one shard.
pub fn shard_range_filter(field: &str, shard: &Shard) -> String {
    format!("{},{}", gte_filter(field, shard.from), lt_filter(field, shard.to))
}

/// `equals(FIELD,"VALUE")`, used by the unsharded streams' per-record
/// fan-out sub-requests (Campaigns' messages/tags, Flows' actions/
/// messages/templates).
pub fn eq_filter(field: &str, value: &str) -> String {
    format!("equals({field},\"{value}\")")
}

/// Fetch every page of a fan-out sub-request for one parent record and
/// normalize each result, used by Campaigns and Flows to join related
/// resources before emitting a composed record (§4.7).
pub async fn fetch_related(
    client: &KlaviyoClient,
    endpoint_key: &'static str,
    path: &'static str,
    filter_field: &str,
    parent_id: &str,
    cancel: &CancellationToken,
) -> Result<Vec<Value>, SourceError> {
    use futures_util::StreamExt;

    let filter = eq_filter(filter_field, parent_id);
    let mut pages = client.paginate_records(endpoint_key, path, Some(filter), cancel.clone());
    let mut out = Vec::new();
    while let Some(page) = pages.next().await {
        out.extend(page?.iter().map(normalize));
    }
    Ok(out)
}

/// Fetch one ascending-sorted page and return the first record's cursor
/// value, used to seed a watermark when no prior state exists (§4.7).
pub async fn peek_earliest_cursor(
    client: &KlaviyoClient,
    endpoint_key: &'static str,
    path: &'static str,
    sort_field: &str,
    cancel: &CancellationToken,
) -> Result<Option<DateTime<Utc>>, SourceError> {
    let query = vec![
        ("sort".to_string(), sort_field.to_string()),
        ("page[size]".to_string(), "1".to_string()),
    ];
    let body = client.get_json(endpoint_key, path, &query, cancel).await?;
    let first = body.get("data").and_then(Value::as_array).and_then(|a| a.first());
    let Some(resource) = first else { return Ok(None) };
    let record = normalize(resource);
    Ok(source_base::stream::epoch_ms_of(&record, sort_field)
        .and_then(|ms| DateTime::from_timestamp_millis(ms)))
}

/// Construct every stream this connector offers, gated by `names`
/// (the catalog's requested list).
pub fn build(client: KlaviyoClient, config: &Config, names: &[String]) -> Vec<Arc<dyn Stream>> {
    let mut streams: Vec<Arc<dyn Stream>> = Vec::new();
    let initialize = config.initialize;

    for name in names {
        let stream: Arc<dyn Stream> = match name.as_str() {
            "events" => Arc::new(events::EventsStream::new(client.clone(), initialize)),
            "profiles" => Arc::new(profiles::ProfilesStream::new(client.clone(), initialize)),
            "campaigns" => Arc::new(campaigns::CampaignsStream::new(client.clone(), initialize)),
            "flows" => Arc::new(flows::FlowsStream::new(client.clone(), initialize)),
            "templates" => Arc::new(templates::TemplatesStream::new(client.clone())),
            "metrics" => Arc::new(metrics::MetricsStream::new(client.clone())),
            _ => continue,
        };
        streams.push(stream);
    }
    streams
}

pub const ALL_STREAM_NAMES: &[&str] = &["events", "profiles", "campaigns", "flows", "templates", "metrics"];
