//! Property-based tests using proptest.
//!
//! Tests invariants of the shard planner and the spool's line-reassembly
//! logic — the two pieces of pure range/byte arithmetic in the engine.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use source_base::shard::ShardPlan;
use source_base::spool::split_one_line;

fn arb_duration_secs(max: i64) -> impl Strategy<Value = Duration> {
    (0i64..=max).prop_map(Duration::seconds)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Shards fully cover `[from, to)`: the first shard starts at or before
    /// `from` (widened by `start_overlap`) and the last ends at or after `to`.
    #[test]
    fn shard_plan_covers_the_requested_window(
        window_secs in 1i64..200_000,
        step_secs in 1i64..10_000,
        step_overlap_secs in arb_duration_secs(600),
        start_overlap_secs in arb_duration_secs(600),
    ) {
        let from = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let to = from + Duration::seconds(window_secs);
        let plan = ShardPlan {
            from,
            to,
            step: Duration::seconds(step_secs),
            step_overlap: step_overlap_secs,
            start_overlap: start_overlap_secs,
        };
        let shards = plan.generate();

        prop_assert!(!shards.is_empty());
        prop_assert!(shards.first().unwrap().from <= from);
        prop_assert!(shards.last().unwrap().to >= to);
    }

    /// Consecutive shards' unwidened boundaries are contiguous: dropping
    /// `step_overlap`'s error-widening leaves no gap between shard i's
    /// unwidened end and shard i+1's unwidened start.
    #[test]
    fn shard_plan_has_no_gaps_between_unwidened_boundaries(
        window_secs in 1i64..200_000,
        step_secs in 1i64..10_000,
    ) {
        let from = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let to = from + Duration::seconds(window_secs);
        let plan = ShardPlan {
            from,
            to,
            step: Duration::seconds(step_secs),
            step_overlap: Duration::zero(),
            start_overlap: Duration::zero(),
        };
        let shards = plan.generate();
        for pair in shards.windows(2) {
            prop_assert_eq!(pair[0].to, pair[1].from);
        }
    }

    /// Splitting arbitrary bytes into arbitrary chunks and feeding them
    /// through `split_one_line` reassembles exactly the original input.
    #[test]
    fn spool_reassembly_round_trips(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        chunk_sizes in prop::collection::vec(1usize..64, 1..64),
    ) {
        let mut buf = Vec::new();
        let mut partial = Vec::new();
        let mut reassembled = Vec::new();

        let mut offset = 0;
        let mut size_idx = 0;
        while offset < data.len() {
            let size = chunk_sizes[size_idx % chunk_sizes.len()];
            size_idx += 1;
            let end = (offset + size).min(data.len());
            buf.extend_from_slice(&data[offset..end]);
            offset = end;

            while let Some(line) = split_one_line(&mut buf, &mut partial) {
                reassembled.extend_from_slice(&line);
                reassembled.push(b'\n');
            }
        }
        if !partial.is_empty() {
            reassembled.extend_from_slice(&partial);
        }

        prop_assert_eq!(reassembled, data);
    }
}
