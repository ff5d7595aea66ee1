//! Queue-ordering policies.
//!
//! A policy assigns each waiting or running group a priority; the
//! scheduler serves higher priorities first and keeps the sort stable so
//! equal priorities preserve arrival order. Policies are injected into
//! the scheduler at construction, so tests and embedders can swap them
//! without global state.

use std::time::{Duration, Instant};

use crate::core::group::SequenceGroup;

/// Priority order for scheduling queues. Larger values are served first.
pub trait SchedulingPolicy: std::fmt::Debug + Send {
    /// Priority of `group` at time `now`.
    fn priority(&self, now: Instant, group: &SequenceGroup) -> Duration;
}

/// First-come-first-served: priority is time spent in the system, so the
/// oldest request wins.
#[derive(Debug, Default)]
pub struct Fcfs;

impl SchedulingPolicy for Fcfs {
    fn priority(&self, now: Instant, group: &SequenceGroup) -> Duration {
        now.saturating_duration_since(group.metrics().arrival_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sequence::Sequence;
    use crate::engine::sampling::GreedySampling;
    use crate::engine::stop::StopConditions;
    use std::sync::Arc;

    fn group_at(request_id: &str, arrival_time: Instant) -> SequenceGroup {
        SequenceGroup::new(
            request_id,
            Sequence::new(0, None, vec![1]),
            Arc::new(GreedySampling),
            Arc::new(StopConditions::default()),
            arrival_time,
        )
    }

    #[test]
    fn test_fcfs_prefers_older_request() {
        let t0 = Instant::now();
        let older = group_at("a", t0);
        let newer = group_at("b", t0 + Duration::from_millis(10));
        let now = t0 + Duration::from_millis(20);

        let policy = Fcfs;
        assert!(policy.priority(now, &older) > policy.priority(now, &newer));
    }

    #[test]
    fn test_fcfs_saturates_on_future_arrival() {
        let t0 = Instant::now();
        let group = group_at("a", t0 + Duration::from_secs(1));

        // A clock that has not caught up with the arrival stamp yields
        // zero priority, not a panic.
        assert_eq!(Fcfs.priority(t0, &group), Duration::ZERO);
    }
}
