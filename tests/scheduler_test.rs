//! Integration tests for the continuous-batching scheduler.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Instant;

use nanobatch::{
    AllocStatus, Fcfs, GreedySampling, KvCacheManager, NoopKvCacheManager, Result, Scheduler,
    SchedulerConfig, Sequence, SequenceGroup, SequenceId, SequenceStatus, StopConditions,
};

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        max_num_batched_tokens: 64,
        max_num_seqs: 4,
        max_seq_len: 64,
        enable_chunked_prefill: false,
        delay_factor: 0.0,
    }
}

fn make_group(request_id: &str, seq_id: SequenceId, prompt_len: usize) -> SequenceGroup {
    let seq = Sequence::new(seq_id, None, (0..prompt_len as u32).collect());
    SequenceGroup::new(
        request_id,
        seq,
        Arc::new(GreedySampling),
        Arc::new(StopConditions::default()),
        Instant::now(),
    )
}

fn make_scheduler(config: SchedulerConfig) -> Scheduler {
    Scheduler::new(config, Box::new(Fcfs), Box::new(NoopKvCacheManager)).unwrap()
}

/// Stand in for the engine: mark `chunk` tokens computed and append the
/// sampled token.
fn advance(
    scheduler: &mut Scheduler,
    request_id: &str,
    seq_id: SequenceId,
    chunk: usize,
    token: u32,
) {
    let group = scheduler.get_group_mut(request_id).unwrap();
    group.update_num_computed_tokens(chunk).unwrap();
    group.seq_mut(seq_id).unwrap().append_token(token);
}

#[test]
fn test_new_scheduler_is_idle() {
    let mut scheduler = make_scheduler(test_config());

    assert_eq!(scheduler.num_waiting(), 0);
    assert_eq!(scheduler.num_running(), 0);
    assert_eq!(scheduler.num_swapped(), 0);
    assert!(!scheduler.has_unfinished_seqs());

    // An empty pass is a no-op, not an error.
    let (batch, outputs) = scheduler.schedule().unwrap();
    assert!(batch.is_empty());
    assert!(outputs.is_empty());
}

#[test]
fn test_prefill_admission_in_arrival_order() {
    let mut scheduler = make_scheduler(test_config());
    scheduler.add_seq_group(make_group("a", 0, 4)).unwrap();
    scheduler.add_seq_group(make_group("b", 1, 6)).unwrap();

    let (batch, outputs) = scheduler.schedule().unwrap();

    assert_eq!(outputs.num_prefill_groups, 2);
    assert_eq!(outputs.scheduled_seq_groups[0].request_id, "a");
    assert_eq!(outputs.scheduled_seq_groups[0].token_chunk_size, 4);
    assert_eq!(outputs.scheduled_seq_groups[1].request_id, "b");
    assert_eq!(outputs.scheduled_seq_groups[1].token_chunk_size, 6);
    assert_eq!(outputs.num_batched_tokens, 10);

    assert!(batch[0].is_prompt);
    assert!(batch[1].is_prompt);
    assert_eq!(batch[0].seq_data.len(), 1);

    assert_eq!(scheduler.num_waiting(), 0);
    assert_eq!(scheduler.num_running(), 2);
    let group = scheduler.get_group("a").unwrap();
    assert_eq!(group.first_seq().status(), SequenceStatus::Running);
    assert!(group.metrics().first_scheduled_time.is_some());
    assert!(group.metrics().time_in_queue.is_some());
}

#[test]
fn test_token_budget_bounds_prefill() {
    let mut config = test_config();
    config.max_num_batched_tokens = 10;
    config.max_seq_len = 10;
    let mut scheduler = make_scheduler(config);

    scheduler.add_seq_group(make_group("a", 0, 8)).unwrap();
    scheduler.add_seq_group(make_group("b", 1, 8)).unwrap();

    // 8 fits, 8 + 8 does not.
    let (_, outputs) = scheduler.schedule().unwrap();
    assert_eq!(outputs.scheduled_seq_groups.len(), 1);
    assert_eq!(outputs.scheduled_seq_groups[0].request_id, "a");
    assert_eq!(outputs.num_batched_tokens, 8);
    assert_eq!(scheduler.num_waiting(), 1);
    assert_eq!(scheduler.num_running(), 1);

    // The held-back group is admitted on the next pass.
    let (_, outputs) = scheduler.schedule().unwrap();
    assert_eq!(outputs.scheduled_seq_groups.len(), 1);
    assert_eq!(outputs.scheduled_seq_groups[0].request_id, "b");
}

#[test]
fn test_seq_budget_bounds_admission() {
    let mut config = test_config();
    config.max_num_seqs = 2;
    let mut scheduler = make_scheduler(config);

    for (i, id) in ["a", "b", "c"].iter().enumerate() {
        scheduler
            .add_seq_group(make_group(id, i as SequenceId, 2))
            .unwrap();
    }

    let (_, outputs) = scheduler.schedule().unwrap();
    assert_eq!(outputs.scheduled_seq_groups.len(), 2);
    assert_eq!(scheduler.num_running(), 2);
    assert_eq!(scheduler.num_waiting(), 1);
}

#[test]
fn test_oversized_prompt_is_rejected_terminally() {
    let mut config = test_config();
    config.max_num_batched_tokens = 8;
    config.max_seq_len = 8;
    let mut scheduler = make_scheduler(config);

    scheduler.add_seq_group(make_group("big", 0, 12)).unwrap();
    scheduler.add_seq_group(make_group("ok", 1, 4)).unwrap();

    let (_, outputs) = scheduler.schedule().unwrap();

    // Rejection does not block the queue behind it.
    assert_eq!(outputs.scheduled_seq_groups.len(), 1);
    assert_eq!(outputs.scheduled_seq_groups[0].request_id, "ok");

    assert_eq!(outputs.ignored_seq_groups.len(), 1);
    let ignored = &outputs.ignored_seq_groups[0];
    assert_eq!(ignored.request_id(), "big");
    assert!(ignored.is_finished());
    assert_eq!(
        ignored.first_seq().status(),
        SequenceStatus::FinishedIgnored
    );
    assert_eq!(ignored.first_seq().status().finished_reason(), Some("length"));

    // The group is out of the scheduler entirely.
    assert!(scheduler.get_group("big").is_none());
    assert_eq!(scheduler.num_waiting(), 0);
}

#[test]
fn test_decode_follows_completed_prefill() {
    let mut scheduler = make_scheduler(test_config());
    scheduler.add_seq_group(make_group("a", 0, 4)).unwrap();
    let _ = scheduler.schedule().unwrap();

    advance(&mut scheduler, "a", 0, 4, 99);

    let (batch, outputs) = scheduler.schedule().unwrap();
    assert_eq!(outputs.num_prefill_groups, 0);
    assert_eq!(outputs.scheduled_seq_groups.len(), 1);
    assert_eq!(outputs.scheduled_seq_groups[0].token_chunk_size, 1);
    assert_eq!(outputs.num_batched_tokens, 1);

    assert!(!batch[0].is_prompt);
    let data = &batch[0].seq_data[&0];
    assert_eq!(data.last_token_id(), Some(99));
    assert_eq!(data.total_len(), 5);
}

#[test]
fn test_prefill_pass_defers_decodes() {
    let mut scheduler = make_scheduler(test_config());
    scheduler.add_seq_group(make_group("a", 0, 4)).unwrap();
    let _ = scheduler.schedule().unwrap();
    advance(&mut scheduler, "a", 0, 4, 7);

    // A newcomer turns the next pass into a prefill-only pass.
    scheduler.add_seq_group(make_group("b", 1, 4)).unwrap();
    let (_, outputs) = scheduler.schedule().unwrap();
    assert_eq!(outputs.num_prefill_groups, 1);
    assert_eq!(outputs.scheduled_seq_groups.len(), 1);
    assert_eq!(outputs.scheduled_seq_groups[0].request_id, "b");

    advance(&mut scheduler, "b", 1, 4, 8);

    // With nothing waiting, both groups decode, oldest first.
    let (_, outputs) = scheduler.schedule().unwrap();
    assert_eq!(outputs.num_prefill_groups, 0);
    assert_eq!(outputs.scheduled_seq_groups.len(), 2);
    assert_eq!(outputs.scheduled_seq_groups[0].request_id, "a");
    assert_eq!(outputs.scheduled_seq_groups[1].request_id, "b");
    assert_eq!(outputs.num_batched_tokens, 2);
}

#[test]
fn test_abort_clears_group() {
    let mut scheduler = make_scheduler(test_config());
    scheduler.add_seq_group(make_group("a", 0, 4)).unwrap();
    scheduler.add_seq_group(make_group("b", 1, 4)).unwrap();
    let _ = scheduler.schedule().unwrap();

    scheduler.abort_seq_groups(&["a".to_string(), "ghost".to_string()]);

    assert!(scheduler.get_group("a").is_none());
    assert!(scheduler.get_group("b").is_some());
    assert_eq!(scheduler.num_running(), 1);
    assert!(scheduler.has_unfinished_seqs());
}

#[test]
fn test_finished_group_is_retired() {
    let mut scheduler = make_scheduler(test_config());
    scheduler.add_seq_group(make_group("a", 0, 2)).unwrap();
    let _ = scheduler.schedule().unwrap();
    advance(&mut scheduler, "a", 0, 2, 5);

    scheduler
        .get_group_mut("a")
        .unwrap()
        .seq_mut(0)
        .unwrap()
        .finish(SequenceStatus::FinishedStopped)
        .unwrap();
    scheduler.free_finished_seq_groups();

    assert!(scheduler.get_group("a").is_none());
    assert_eq!(scheduler.num_running(), 0);
    assert!(!scheduler.has_unfinished_seqs());
}

/// Cache stub that denies decode slots for a fixed number of calls.
#[derive(Debug, Default)]
struct TightCache {
    deny_appends: Cell<usize>,
}

impl KvCacheManager for TightCache {
    fn can_allocate(&self, _group: &SequenceGroup) -> AllocStatus {
        AllocStatus::Ok
    }

    fn allocate(&mut self, _group: &SequenceGroup) -> Result<()> {
        Ok(())
    }

    fn can_append_slots(&self, _group: &SequenceGroup) -> bool {
        let deny = self.deny_appends.get();
        if deny > 0 {
            self.deny_appends.set(deny - 1);
            false
        } else {
            true
        }
    }

    fn append_slots(&mut self, _group: &SequenceGroup) -> Result<()> {
        Ok(())
    }

    fn free(&mut self, _seq_id: SequenceId) {}
}

#[test]
fn test_preemption_recomputes_youngest() {
    let cache = TightCache {
        deny_appends: Cell::new(1),
    };
    let mut scheduler = Scheduler::new(test_config(), Box::new(Fcfs), Box::new(cache)).unwrap();

    scheduler.add_seq_group(make_group("old", 0, 2)).unwrap();
    scheduler.add_seq_group(make_group("young", 1, 2)).unwrap();
    let _ = scheduler.schedule().unwrap();
    advance(&mut scheduler, "old", 0, 2, 10);
    advance(&mut scheduler, "young", 1, 2, 11);

    // No decode slot for the oldest group: the youngest is evicted to
    // make room.
    let (_, outputs) = scheduler.schedule().unwrap();
    assert_eq!(outputs.scheduled_seq_groups.len(), 1);
    assert_eq!(outputs.scheduled_seq_groups[0].request_id, "old");
    assert_eq!(scheduler.num_running(), 1);
    assert_eq!(scheduler.num_waiting(), 1);

    let victim = scheduler.get_group("young").unwrap();
    let seq = victim.first_seq();
    assert_eq!(seq.status(), SequenceStatus::Waiting);
    assert_eq!(seq.data().num_computed_tokens(), 0);
    // Generated tokens survive eviction; only the cache is lost.
    assert_eq!(seq.data().output_token_ids(), &[11]);

    // Readmission replays prompt plus generated output as one prefill.
    let (_, outputs) = scheduler.schedule().unwrap();
    assert_eq!(outputs.num_prefill_groups, 1);
    assert_eq!(outputs.scheduled_seq_groups[0].request_id, "young");
    assert_eq!(outputs.scheduled_seq_groups[0].token_chunk_size, 3);
}

/// Cache stub with a fixed admission verdict.
#[derive(Debug)]
struct StaticCache {
    verdict: AllocStatus,
}

impl KvCacheManager for StaticCache {
    fn can_allocate(&self, _group: &SequenceGroup) -> AllocStatus {
        self.verdict
    }

    fn allocate(&mut self, _group: &SequenceGroup) -> Result<()> {
        Ok(())
    }

    fn can_append_slots(&self, _group: &SequenceGroup) -> bool {
        true
    }

    fn append_slots(&mut self, _group: &SequenceGroup) -> Result<()> {
        Ok(())
    }

    fn free(&mut self, _seq_id: SequenceId) {}
}

#[test]
fn test_cache_back_pressure_holds_queue() {
    let cache = StaticCache {
        verdict: AllocStatus::Later,
    };
    let mut scheduler = Scheduler::new(test_config(), Box::new(Fcfs), Box::new(cache)).unwrap();
    scheduler.add_seq_group(make_group("a", 0, 4)).unwrap();

    let (batch, outputs) = scheduler.schedule().unwrap();

    // "Later" stalls admission without rejecting anything.
    assert!(batch.is_empty());
    assert!(outputs.ignored_seq_groups.is_empty());
    assert_eq!(scheduler.num_waiting(), 1);
    assert!(scheduler.get_group("a").is_some());
}

#[test]
fn test_cache_never_fits_rejects_terminally() {
    let cache = StaticCache {
        verdict: AllocStatus::Never,
    };
    let mut scheduler = Scheduler::new(test_config(), Box::new(Fcfs), Box::new(cache)).unwrap();
    scheduler.add_seq_group(make_group("a", 0, 4)).unwrap();

    let (_, outputs) = scheduler.schedule().unwrap();

    assert_eq!(outputs.ignored_seq_groups.len(), 1);
    assert_eq!(
        outputs.ignored_seq_groups[0].first_seq().status(),
        SequenceStatus::FinishedIgnored
    );
    assert!(scheduler.get_group("a").is_none());
    assert_eq!(scheduler.num_waiting(), 0);
}

#[test]
fn test_queue_conservation_across_passes() {
    let mut config = test_config();
    config.max_num_seqs = 3;
    let mut scheduler = make_scheduler(config);

    for i in 0..5 {
        scheduler
            .add_seq_group(make_group(&format!("req-{i}"), i, 2))
            .unwrap();
    }

    let _ = scheduler.schedule().unwrap();
    assert_eq!(scheduler.num_running(), 3);
    assert_eq!(scheduler.num_waiting(), 2);
    assert_eq!(scheduler.num_unfinished_seq_groups(), 5);

    // Decode-readiness for the admitted groups, then another pass.
    for (i, id) in ["req-0", "req-1", "req-2"].iter().enumerate() {
        advance(&mut scheduler, id, i as SequenceId, 2, 42);
    }
    let _ = scheduler.schedule().unwrap();
    assert_eq!(
        scheduler.num_running() + scheduler.num_waiting(),
        5,
        "every group is accounted for in exactly one queue"
    );
}
