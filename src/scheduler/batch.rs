//! Continuous batching scheduler.
//!
//! The scheduler owns every in-flight request and decides, once per engine
//! step, which groups enter the next model batch and in which phase.
//! Prefill and decode never mix within one pass: a pass either admits
//! waiting prompts or advances running groups by one token each.
//!
//! ## Scheduling Flow
//!
//! ```text
//!   add_seq_group()                    schedule()
//!        │                                │
//!        ▼                                ▼
//!   ┌─────────┐    prefill admission    ┌─────────┐
//!   │ Waiting │ ──────────────────────► │ Running │ ──► decode, one
//!   │  queue  │   (budget + cache fit)  │  queue  │     token per seq
//!   └─────────┘                         └─────────┘
//!        ▲                                │
//!        │      preempt (recompute)       │
//!        └────────────────────────────────┘
//!                (cache pressure)
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Instant;
//! use nanobatch::core::group::SequenceGroup;
//! use nanobatch::core::kv_cache::NoopKvCacheManager;
//! use nanobatch::core::sequence::Sequence;
//! use nanobatch::engine::sampling::GreedySampling;
//! use nanobatch::engine::stop::StopConditions;
//! use nanobatch::scheduler::batch::Scheduler;
//! use nanobatch::scheduler::policy::Fcfs;
//! use nanobatch::SchedulerConfig;
//!
//! # fn main() -> nanobatch::error::Result<()> {
//! let mut scheduler = Scheduler::new(
//!     SchedulerConfig::default(),
//!     Box::new(Fcfs),
//!     Box::new(NoopKvCacheManager),
//! )?;
//!
//! let seq = Sequence::new(1, None, vec![1, 2, 3, 4]);
//! let group = SequenceGroup::new(
//!     "req-1",
//!     seq,
//!     Arc::new(GreedySampling),
//!     Arc::new(StopConditions::default()),
//!     Instant::now(),
//! );
//! scheduler.add_seq_group(group)?;
//!
//! // The whole prompt is admitted as one prefill chunk.
//! let (batch, outputs) = scheduler.schedule()?;
//! assert_eq!(batch.len(), 1);
//! assert!(batch[0].is_prompt);
//! assert_eq!(outputs.num_batched_tokens, 4);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::core::group::{ScheduledSequenceGroup, SequenceGroup, SequenceGroupMetadata};
use crate::core::kv_cache::{AllocStatus, KvCacheManager};
use crate::core::sequence::{SequenceId, SequenceStatus};
use crate::error::{Error, Result};
use crate::scheduler::budget::SchedulingBudget;
use crate::scheduler::policy::SchedulingPolicy;

/// How a running group is evicted under cache pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionMode {
    /// Move the group's KV cache to host memory and bring it back later.
    Swap,
    /// Drop the group's KV cache and reprocess the whole stream on its
    /// next admission.
    Recompute,
}

/// Result of one scheduling pass.
///
/// Scheduled groups are ordered with prefill entries first, then decode
/// entries. Ignored groups are moved out of the scheduler entirely; the
/// engine reports them to the caller as terminally rejected.
#[derive(Debug)]
pub struct SchedulerOutputs {
    /// Groups in this batch, prefills before decodes.
    pub scheduled_seq_groups: Vec<ScheduledSequenceGroup>,
    /// How many entries at the head of `scheduled_seq_groups` are prefills.
    pub num_prefill_groups: usize,
    /// Total tokens charged to this batch.
    pub num_batched_tokens: usize,
    /// Groups rejected outright this pass.
    pub ignored_seq_groups: Vec<SequenceGroup>,
}

impl SchedulerOutputs {
    /// Check if the pass produced neither work nor rejections.
    pub fn is_empty(&self) -> bool {
        self.scheduled_seq_groups.is_empty() && self.ignored_seq_groups.is_empty()
    }
}

/// Prefill-pass result: admitted groups and terminally rejected ids.
#[derive(Debug, Default)]
struct SchedulerPrefillOutputs {
    seq_groups: Vec<ScheduledSequenceGroup>,
    ignored: Vec<String>,
}

/// Decode-pass result: groups that kept their slot and evicted ids.
#[derive(Debug, Default)]
struct SchedulerRunningOutputs {
    decode_seq_groups: Vec<ScheduledSequenceGroup>,
    preempted: Vec<String>,
}

/// Continuous batching scheduler.
///
/// Owns all in-flight [`SequenceGroup`]s and tracks them through three
/// queues of request ids:
/// - Waiting: admitted to the engine, not yet given cache space
/// - Running: holding cache space, advancing every decode pass
/// - Swapped: evicted to host memory (swap-in is not implemented)
pub struct Scheduler {
    /// Configuration.
    config: SchedulerConfig,
    /// Queue-ordering policy.
    policy: Box<dyn SchedulingPolicy>,
    /// Cache-space accounting.
    kv_cache: Box<dyn KvCacheManager>,
    /// All in-flight groups, keyed by request id.
    groups: HashMap<String, SequenceGroup>,
    /// Request ids waiting for admission.
    waiting: VecDeque<String>,
    /// Request ids holding cache space.
    running: VecDeque<String>,
    /// Request ids evicted to host memory.
    swapped: VecDeque<String>,
    /// When the previous scheduling pass ran.
    prev_time: Option<Instant>,
    /// Whether the previous pass admitted prefills.
    prev_was_prompt: bool,
    /// Duration of the most recent prompt-admitting pass interval.
    last_prompt_latency: Duration,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration limits are inconsistent.
    pub fn new(
        config: SchedulerConfig,
        policy: Box<dyn SchedulingPolicy>,
        kv_cache: Box<dyn KvCacheManager>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            policy,
            kv_cache,
            groups: HashMap::new(),
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            swapped: VecDeque::new(),
            prev_time: None,
            prev_was_prompt: false,
            last_prompt_latency: Duration::ZERO,
        })
    }

    /// Add a new group to the back of the waiting queue.
    ///
    /// # Errors
    ///
    /// Returns error if a group with the same request id is already
    /// in flight.
    pub fn add_seq_group(&mut self, group: SequenceGroup) -> Result<()> {
        let request_id = group.request_id().to_string();
        if self.groups.contains_key(&request_id) {
            return Err(Error::DuplicateRequest(request_id));
        }
        self.waiting.push_back(request_id.clone());
        self.groups.insert(request_id, group);
        Ok(())
    }

    /// Abort groups by request id, wherever they currently are.
    ///
    /// Unknown ids are skipped. Every unfinished sequence of an aborted
    /// group is marked aborted and its cache space released.
    pub fn abort_seq_groups(&mut self, request_ids: &[String]) {
        let abort: HashSet<&String> = request_ids.iter().collect();
        self.waiting.retain(|id| !abort.contains(id));
        self.running.retain(|id| !abort.contains(id));
        self.swapped.retain(|id| !abort.contains(id));

        for request_id in request_ids {
            if let Some(mut group) = self.groups.remove(request_id) {
                let mut freed: Vec<SequenceId> = Vec::new();
                for seq in group.seqs_mut() {
                    if !seq.is_finished() {
                        let _ = seq.finish(SequenceStatus::FinishedAborted);
                        freed.push(seq.seq_id());
                    }
                }
                for seq_id in freed {
                    self.kv_cache.free(seq_id);
                }
                debug!(request_id, "aborted request");
            }
        }
    }

    /// Run one scheduling pass.
    ///
    /// Returns the per-group metadata the model runner consumes, in batch
    /// order, paired with the pass summary.
    ///
    /// # Errors
    ///
    /// Returns a not-implemented error for chunked prefill and for
    /// swap-in of previously swapped groups; budget violations and
    /// inconsistent queue state are internal errors.
    pub fn schedule(&mut self) -> Result<(Vec<SequenceGroupMetadata>, SchedulerOutputs)> {
        if self.config.enable_chunked_prefill {
            return Err(Error::NotImplemented("chunked prefill"));
        }
        if !self.swapped.is_empty() {
            return Err(Error::NotImplemented("swap-in scheduling"));
        }

        let now = Instant::now();
        let mut budget =
            SchedulingBudget::new(self.config.max_num_batched_tokens, self.config.max_num_seqs);
        // Running groups hold their sequence quota for the whole pass, so
        // prefill admission cannot overcommit the sequence budget.
        for request_id in &self.running {
            if let Some(group) = self.groups.get(request_id) {
                budget.add_num_seqs(request_id, group.max_num_running_seqs());
            }
        }

        let prefills = self.schedule_prefills(&mut budget, now)?;
        let running_scheduled = if prefills.seq_groups.is_empty() {
            self.schedule_running(&mut budget, now)?
        } else {
            SchedulerRunningOutputs::default()
        };

        // Queue updates: admitted prefills join the front of the running
        // queue, groups that kept their slot rejoin at the back, and
        // preempted groups re-enter the waiting queue at the front in
        // their eviction order.
        for scheduled in prefills.seq_groups.iter().rev() {
            self.running.push_front(scheduled.request_id.clone());
        }
        for scheduled in &running_scheduled.decode_seq_groups {
            self.running.push_back(scheduled.request_id.clone());
        }
        for request_id in running_scheduled.preempted.iter().rev() {
            self.waiting.push_front(request_id.clone());
        }

        let num_prefill_groups = prefills.seq_groups.len();
        let mut scheduled_seq_groups = prefills.seq_groups;
        scheduled_seq_groups.extend(running_scheduled.decode_seq_groups);

        let num_batched_tokens = budget.num_batched_tokens();
        if num_batched_tokens > self.config.max_num_batched_tokens {
            return Err(Error::TokenBudgetExceeded {
                scheduled: num_batched_tokens,
                limit: self.config.max_num_batched_tokens,
            });
        }
        if budget.num_curr_seqs() > self.config.max_num_seqs {
            return Err(Error::SeqBudgetExceeded {
                scheduled: budget.num_curr_seqs(),
                limit: self.config.max_num_seqs,
            });
        }

        let mut ignored_seq_groups = Vec::with_capacity(prefills.ignored.len());
        for request_id in &prefills.ignored {
            if let Some(group) = self.groups.remove(request_id) {
                ignored_seq_groups.push(group);
            }
        }

        let mut batch = Vec::with_capacity(scheduled_seq_groups.len());
        for (idx, scheduled) in scheduled_seq_groups.iter().enumerate() {
            let group = self
                .groups
                .get_mut(&scheduled.request_id)
                .ok_or_else(|| Error::RequestNotFound(scheduled.request_id.clone()))?;
            group.maybe_set_first_scheduled_time(now);

            let mut seq_data = HashMap::new();
            for seq in group.seqs_with_status(SequenceStatus::Running) {
                seq_data.insert(seq.seq_id(), seq.data().clone());
            }
            batch.push(SequenceGroupMetadata {
                request_id: scheduled.request_id.clone(),
                is_prompt: idx < num_prefill_groups,
                seq_data,
                sampling: group.sampling().clone(),
                stopping: group.stopping().clone(),
                token_chunk_size: scheduled.token_chunk_size,
            });
        }

        debug!(
            num_prefill_groups,
            num_decode_groups = scheduled_seq_groups.len() - num_prefill_groups,
            num_batched_tokens,
            num_ignored = ignored_seq_groups.len(),
            "scheduling pass complete"
        );

        Ok((
            batch,
            SchedulerOutputs {
                scheduled_seq_groups,
                num_prefill_groups,
                num_batched_tokens,
                ignored_seq_groups,
            },
        ))
    }

    /// Admit waiting groups in queue order until the budget, the cache,
    /// or the delay gate stops admission.
    fn schedule_prefills(
        &mut self,
        budget: &mut SchedulingBudget,
        now: Instant,
    ) -> Result<SchedulerPrefillOutputs> {
        let mut seq_groups: Vec<ScheduledSequenceGroup> = Vec::new();
        let mut ignored: Vec<String> = Vec::new();
        let prompt_limit = self.prompt_limit();

        while self.passed_delay(now) {
            let Some(request_id) = self.waiting.front().cloned() else {
                break;
            };

            let (num_waiting_seqs, num_new_tokens, num_new_seqs, alloc) = {
                let group = self
                    .groups
                    .get(&request_id)
                    .ok_or_else(|| Error::RequestNotFound(request_id.clone()))?;
                (
                    group.num_seqs_with_status(SequenceStatus::Waiting),
                    group.num_new_tokens(SequenceStatus::Waiting),
                    group.max_num_running_seqs(),
                    self.kv_cache.can_allocate(group),
                )
            };

            // Fan-out happens only after prefill, so a waiting group
            // always carries exactly one prompt sequence.
            if num_waiting_seqs != 1 {
                return Err(Error::InvalidWaitingGroup {
                    request_id,
                    num_seqs: num_waiting_seqs,
                });
            }

            if num_new_tokens > prompt_limit {
                warn!(
                    request_id,
                    num_tokens = num_new_tokens,
                    limit = prompt_limit,
                    "prompt exceeds the length limit; ignoring request"
                );
                self.mark_ignored(&request_id);
                self.waiting.pop_front();
                ignored.push(request_id);
                continue;
            }

            match alloc {
                AllocStatus::Later => break,
                AllocStatus::Never => {
                    warn!(
                        request_id,
                        "prompt cannot fit the cache even when empty; ignoring request"
                    );
                    self.mark_ignored(&request_id);
                    self.waiting.pop_front();
                    ignored.push(request_id);
                    continue;
                }
                AllocStatus::Ok => {}
            }

            if num_new_tokens == 0 || !budget.can_schedule(num_new_tokens, num_new_seqs) {
                break;
            }

            self.waiting.pop_front();
            self.allocate_and_set_running(&request_id)?;
            budget.add_num_batched_tokens(&request_id, num_new_tokens);
            budget.add_num_seqs(&request_id, num_new_seqs);
            seq_groups.push(ScheduledSequenceGroup {
                request_id,
                token_chunk_size: num_new_tokens,
            });
        }

        if !seq_groups.is_empty() {
            self.prev_was_prompt = true;
        }

        Ok(SchedulerPrefillOutputs {
            seq_groups,
            ignored,
        })
    }

    /// Advance running groups by one token each, evicting from the back
    /// of the priority order when decode slots run out.
    fn schedule_running(
        &mut self,
        budget: &mut SchedulingBudget,
        now: Instant,
    ) -> Result<SchedulerRunningOutputs> {
        let mut queue: VecDeque<String> = {
            let mut ids: Vec<String> = self.running.drain(..).collect();
            let groups = &self.groups;
            let policy = &*self.policy;
            // Stable sort keeps arrival order for equal priorities.
            ids.sort_by(|a, b| {
                let pa = groups
                    .get(a)
                    .map(|g| policy.priority(now, g))
                    .unwrap_or(Duration::ZERO);
                let pb = groups
                    .get(b)
                    .map(|g| policy.priority(now, g))
                    .unwrap_or(Duration::ZERO);
                pb.cmp(&pa)
            });
            ids.into()
        };

        let mut decode_seq_groups: Vec<ScheduledSequenceGroup> = Vec::new();
        let mut preempted: Vec<String> = Vec::new();

        while let Some(request_id) = queue.pop_front() {
            let num_running_tokens = {
                let group = self
                    .groups
                    .get(&request_id)
                    .ok_or_else(|| Error::RequestNotFound(request_id.clone()))?;
                group.num_new_tokens(SequenceStatus::Running)
            };
            if num_running_tokens == 0 {
                queue.push_front(request_id);
                break;
            }

            let mut scheduled_current = true;
            loop {
                let can_append = {
                    let group = self
                        .groups
                        .get(&request_id)
                        .ok_or_else(|| Error::RequestNotFound(request_id.clone()))?;
                    self.kv_cache.can_append_slots(group)
                };
                if can_append {
                    break;
                }

                // Refund this group's charges while we make room for it.
                budget.subtract_num_batched_tokens(&request_id, num_running_tokens);
                let num_running_seqs = self
                    .groups
                    .get(&request_id)
                    .map(|g| g.max_num_running_seqs())
                    .unwrap_or(0);
                budget.subtract_num_seqs(&request_id, num_running_seqs);

                if let Some(victim_id) = queue.pop_back() {
                    self.preempt(&victim_id)?;
                    preempted.push(victim_id);
                } else {
                    // Nothing left to evict but this group itself.
                    self.preempt(&request_id)?;
                    preempted.push(request_id.clone());
                    scheduled_current = false;
                    break;
                }
            }

            if scheduled_current {
                let group = self
                    .groups
                    .get(&request_id)
                    .ok_or_else(|| Error::RequestNotFound(request_id.clone()))?;
                self.kv_cache.append_slots(group)?;
                budget.add_num_batched_tokens(&request_id, num_running_tokens);
                decode_seq_groups.push(ScheduledSequenceGroup {
                    request_id,
                    token_chunk_size: 1,
                });
            }
        }

        // Groups never reached this pass keep their queue position.
        self.running = queue;

        Ok(SchedulerRunningOutputs {
            decode_seq_groups,
            preempted,
        })
    }

    /// Evict one running group.
    ///
    /// Single-sequence groups are cheap to recompute, so they are freed
    /// and sent back to the waiting queue. Multi-sequence groups would
    /// lose forked state and must be swapped out instead.
    fn preempt(&mut self, request_id: &str) -> Result<PreemptionMode> {
        let mode = {
            let group = self
                .groups
                .get(request_id)
                .ok_or_else(|| Error::RequestNotFound(request_id.to_string()))?;
            if group.max_num_running_seqs() == 1 {
                PreemptionMode::Recompute
            } else {
                PreemptionMode::Swap
            }
        };
        match mode {
            PreemptionMode::Recompute => {
                warn!(
                    request_id,
                    "preempting by recompute to relieve cache pressure"
                );
                self.preempt_by_recompute(request_id)?;
                Ok(PreemptionMode::Recompute)
            }
            PreemptionMode::Swap => Err(Error::NotImplemented("swap-out preemption")),
        }
    }

    /// Free a group's cache and return its sequence to the waiting state
    /// with all computation progress discarded.
    fn preempt_by_recompute(&mut self, request_id: &str) -> Result<()> {
        let freed: Vec<SequenceId> = {
            let group = self
                .groups
                .get_mut(request_id)
                .ok_or_else(|| Error::RequestNotFound(request_id.to_string()))?;
            let mut freed = Vec::new();
            for seq in group.seqs_mut() {
                if seq.status() == SequenceStatus::Running {
                    seq.set_waiting()?;
                    seq.data_mut().reset_for_recompute();
                    freed.push(seq.seq_id());
                }
            }
            freed
        };
        for seq_id in freed {
            self.kv_cache.free(seq_id);
        }
        Ok(())
    }

    /// Mark every unfinished sequence of a group terminally ignored.
    fn mark_ignored(&mut self, request_id: &str) {
        if let Some(group) = self.groups.get_mut(request_id) {
            for seq in group.seqs_mut() {
                if !seq.is_finished() {
                    let _ = seq.finish(SequenceStatus::FinishedIgnored);
                }
            }
        }
    }

    /// Reserve cache space for a waiting group and move its sequences to
    /// the running state.
    fn allocate_and_set_running(&mut self, request_id: &str) -> Result<()> {
        {
            let group = self
                .groups
                .get(request_id)
                .ok_or_else(|| Error::RequestNotFound(request_id.to_string()))?;
            self.kv_cache.allocate(group)?;
        }
        let group = self
            .groups
            .get_mut(request_id)
            .ok_or_else(|| Error::RequestNotFound(request_id.to_string()))?;
        for seq in group.seqs_mut() {
            if seq.status() == SequenceStatus::Waiting {
                seq.set_running()?;
            }
        }
        Ok(())
    }

    /// Longest admissible prompt, in tokens.
    fn prompt_limit(&self) -> usize {
        if self.config.enable_chunked_prefill {
            // Chunked prompts are split across passes, so only the
            // sequence-length cap applies.
            self.config.max_seq_len
        } else {
            self.config
                .max_seq_len
                .min(self.config.max_num_batched_tokens)
        }
    }

    /// Delay gate for prompt admission.
    ///
    /// With a non-zero delay factor, new prompts wait until the oldest
    /// waiting request has queued for `delay_factor` times the latency of
    /// the previous prompt pass. Letting the waiting queue fill up makes
    /// the next prefill batch larger.
    fn passed_delay(&mut self, now: Instant) -> bool {
        if self.prev_was_prompt {
            let prev = self.prev_time.unwrap_or(now);
            self.last_prompt_latency = now.saturating_duration_since(prev);
        }
        self.prev_time = Some(now);
        self.prev_was_prompt = false;

        if self.config.delay_factor > 0.0 && !self.waiting.is_empty() {
            let earliest_arrival = self
                .waiting
                .iter()
                .filter_map(|id| self.groups.get(id))
                .map(|g| g.metrics().arrival_time)
                .min();
            match earliest_arrival {
                Some(arrival) => {
                    now.saturating_duration_since(arrival)
                        > self.last_prompt_latency.mul_f32(self.config.delay_factor)
                        || self.running.is_empty()
                }
                None => true,
            }
        } else {
            true
        }
    }

    // ========== Cleanup ==========

    /// Release cache space held by one sequence.
    pub fn free_seq(&mut self, seq_id: SequenceId) {
        self.kv_cache.free(seq_id);
    }

    /// Drop groups whose sequences have all finished.
    ///
    /// Sequence-level cache space is released as each sequence finishes;
    /// this only retires the bookkeeping.
    pub fn free_finished_seq_groups(&mut self) {
        let groups = &self.groups;
        self.running
            .retain(|id| groups.get(id).map_or(false, |g| !g.is_finished()));
        self.groups.retain(|_, g| !g.is_finished());
    }

    // ========== Getters ==========

    /// Get the configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Look up an in-flight group by request id.
    pub fn get_group(&self, request_id: &str) -> Option<&SequenceGroup> {
        self.groups.get(request_id)
    }

    /// Look up an in-flight group mutably by request id.
    pub fn get_group_mut(&mut self, request_id: &str) -> Option<&mut SequenceGroup> {
        self.groups.get_mut(request_id)
    }

    /// Number of groups waiting for admission.
    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Number of groups holding cache space.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Number of groups swapped out to host memory.
    pub fn num_swapped(&self) -> usize {
        self.swapped.len()
    }

    /// Number of groups anywhere in the scheduler.
    pub fn num_unfinished_seq_groups(&self) -> usize {
        self.waiting.len() + self.running.len() + self.swapped.len()
    }

    /// Check if any group still needs engine steps.
    pub fn has_unfinished_seqs(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty() || !self.swapped.is_empty()
    }
}
