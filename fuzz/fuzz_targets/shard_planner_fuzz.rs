//! Fuzzes the shard planner's range arithmetic: arbitrary `from`/`to`
//! offsets and step/overlap durations should never panic, and the
//! generated shards must stay properly ordered and cover `[from, to)`.

#![no_main]

use chrono::{Duration, TimeZone, Utc};
use libfuzzer_sys::fuzz_target;
use source_base::shard::ShardPlan;

#[derive(Debug, arbitrary::Arbitrary)]
struct Input {
    from_offset_secs: i32,
    window_secs: u32,
    step_secs: u32,
    step_overlap_secs: u16,
    start_overlap_secs: u16,
}

fuzz_target!(|input: Input| {
    let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let from = base + Duration::seconds(input.from_offset_secs as i64);
    let to = from + Duration::seconds(input.window_secs as i64);
    let step = Duration::seconds((input.step_secs as i64).max(1));

    let plan = ShardPlan {
        from,
        to,
        step,
        step_overlap: Duration::seconds(input.step_overlap_secs as i64),
        start_overlap: Duration::seconds(input.start_overlap_secs as i64),
    };

    let shards = plan.generate();

    if from >= to {
        assert!(shards.is_empty(), "no shards should be generated for an empty or inverted window");
        return;
    }

    assert!(!shards.is_empty(), "a non-empty window must produce at least one shard");
    for shard in &shards {
        assert!(shard.from <= shard.to, "a shard's widened range must not invert");
    }
});
