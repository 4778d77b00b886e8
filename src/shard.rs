//! Shard Planner: breaks an unbounded time window into overlapping
//! half-open ranges (§4.4).

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// A half-open time range `[from, to)`, already widened by its overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Parameters for generating a shard sequence from a watermark.
#[derive(Debug, Clone, Copy)]
pub struct ShardPlan {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub step: ChronoDuration,
    /// Overlap applied to every shard after the first.
    pub step_overlap: ChronoDuration,
    /// Overlap applied only to the first shard, in addition to `step_overlap`
    /// being absent there. Defaults to zero if unset.
    pub start_overlap: ChronoDuration,
}

impl ShardPlan {
    /// Generate the full sequence of overlap-widened shards.
    ///
    /// Unwidened boundaries advance as `a = previous_end`, `b = a + step`,
    /// continuing while `a < to`. Each boundary pair is then widened to
    /// `[a - overlap, b + step_overlap)` where `overlap` is `start_overlap`
    /// for the first shard and `step_overlap` for all others.
    pub fn generate(&self) -> Vec<Shard> {
        let mut shards = Vec::new();
        let mut a = self.from;
        let mut first = true;

        while a < self.to {
            let b = (a + self.step).min(self.to);
            let overlap = if first { self.start_overlap } else { self.step_overlap };
            shards.push(Shard {
                from: a - overlap,
                to: b + self.step_overlap,
            });
            a = b;
            first = false;
        }

        shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(s: &str) -> DateTime<Utc> {
        Utc.datetime_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn generates_consecutive_hourly_shards() {
        let plan = ShardPlan {
            from: dt("2026-01-01 09:00:00"),
            to: dt("2026-01-01 11:00:00"),
            step: ChronoDuration::hours(1),
            step_overlap: ChronoDuration::seconds(5),
            start_overlap: ChronoDuration::minutes(1),
        };
        let shards = plan.generate();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].from, dt("2026-01-01 08:59:00"));
        assert_eq!(shards[0].to, dt("2026-01-01 10:00:05"));
        assert_eq!(shards[1].from, dt("2026-01-01 09:59:55"));
        assert_eq!(shards[1].to, dt("2026-01-01 11:00:05"));
    }

    #[test]
    fn single_shard_when_window_smaller_than_step() {
        let plan = ShardPlan {
            from: dt("2026-01-01 09:00:00"),
            to: dt("2026-01-01 09:30:00"),
            step: ChronoDuration::hours(1),
            step_overlap: ChronoDuration::zero(),
            start_overlap: ChronoDuration::zero(),
        };
        let shards = plan.generate();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].from, dt("2026-01-01 09:00:00"));
        assert_eq!(shards[0].to, dt("2026-01-01 09:30:00"));
    }

    #[test]
    fn empty_window_produces_no_shards() {
        let plan = ShardPlan {
            from: dt("2026-01-01 09:00:00"),
            to: dt("2026-01-01 09:00:00"),
            step: ChronoDuration::hours(1),
            step_overlap: ChronoDuration::zero(),
            start_overlap: ChronoDuration::zero(),
        };
        assert!(plan.generate().is_empty());
    }
}
