//! Request-level grouping of sequences.
//!
//! A request enters the engine as a [`SequenceGroup`] holding one sequence.
//! Parallel sampling forks it into several sequences that share the prompt
//! prefix and diverge during decoding. The group is the unit the scheduler
//! admits, preempts, and finishes; sequences are the unit the model runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::sequence::{Sequence, SequenceData, SequenceId, SequenceStatus};
use crate::engine::sampling::SamplingStrategy;
use crate::engine::stop::StoppingCriteria;
use crate::error::{Error, Result};

/// Per-request timing marks, stamped by the scheduler and the engine.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// When the request was added to the engine.
    pub arrival_time: Instant,
    /// When the scheduler first put the request in a batch.
    pub first_scheduled_time: Option<Instant>,
    /// When the first generated token arrived.
    pub first_token_time: Option<Instant>,
    /// When the most recent token arrived.
    pub last_token_time: Option<Instant>,
    /// When every sequence of the request finished.
    pub finished_time: Option<Instant>,
    /// Time spent waiting before the first schedule.
    pub time_in_queue: Option<Duration>,
}

impl RequestMetrics {
    fn new(arrival_time: Instant) -> Self {
        Self {
            arrival_time,
            first_scheduled_time: None,
            first_token_time: None,
            last_token_time: None,
            finished_time: None,
            time_in_queue: None,
        }
    }
}

/// A group of sequences generated from the same prompt.
pub struct SequenceGroup {
    /// Request identifier, unique within the engine.
    request_id: String,
    /// Member sequences, in creation order.
    seqs: Vec<Sequence>,
    /// How many parallel completions the request wants.
    sampling: Arc<dyn SamplingStrategy>,
    /// When member sequences stop generating.
    stopping: Arc<dyn StoppingCriteria>,
    /// Timing marks.
    metrics: RequestMetrics,
}

impl SequenceGroup {
    /// Create a group from its first (and so far only) sequence.
    pub fn new(
        request_id: impl Into<String>,
        seq: Sequence,
        sampling: Arc<dyn SamplingStrategy>,
        stopping: Arc<dyn StoppingCriteria>,
        arrival_time: Instant,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            seqs: vec![seq],
            sampling,
            stopping,
            metrics: RequestMetrics::new(arrival_time),
        }
    }

    // ========== Getters ==========

    /// Get the request ID.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Get all member sequences.
    pub fn seqs(&self) -> &[Sequence] {
        &self.seqs
    }

    /// Iterate mutably over member sequences.
    pub fn seqs_mut(&mut self) -> impl Iterator<Item = &mut Sequence> {
        self.seqs.iter_mut()
    }

    /// Get the first sequence. Every group has at least one.
    pub fn first_seq(&self) -> &Sequence {
        &self.seqs[0]
    }

    /// Look up a member sequence by id.
    pub fn seq(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.seqs.iter().find(|s| s.seq_id() == seq_id)
    }

    /// Look up a member sequence mutably by id.
    pub fn seq_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        self.seqs.iter_mut().find(|s| s.seq_id() == seq_id)
    }

    /// Member sequences currently in `status`.
    pub fn seqs_with_status(&self, status: SequenceStatus) -> impl Iterator<Item = &Sequence> {
        self.seqs.iter().filter(move |s| s.status() == status)
    }

    /// Get the sampling strategy.
    pub fn sampling(&self) -> &Arc<dyn SamplingStrategy> {
        &self.sampling
    }

    /// Get the stopping criteria.
    pub fn stopping(&self) -> &Arc<dyn StoppingCriteria> {
        &self.stopping
    }

    /// Get the timing marks.
    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    /// Get the prompt text, shared by all member sequences.
    pub fn prompt(&self) -> Option<&str> {
        self.first_seq().prompt()
    }

    /// Get the prompt token IDs, shared by all member sequences.
    pub fn prompt_token_ids(&self) -> &[u32] {
        self.first_seq().data().prompt_token_ids()
    }

    // ========== Counting ==========

    /// Total number of member sequences.
    pub fn num_seqs(&self) -> usize {
        self.seqs.len()
    }

    /// Number of member sequences not yet finished.
    pub fn num_unfinished_seqs(&self) -> usize {
        self.seqs.iter().filter(|s| !s.is_finished()).count()
    }

    /// Number of member sequences currently in `status`.
    pub fn num_seqs_with_status(&self, status: SequenceStatus) -> usize {
        self.seqs_with_status(status).count()
    }

    /// Check if every member sequence is finished.
    pub fn is_finished(&self) -> bool {
        self.seqs.iter().all(|s| s.is_finished())
    }

    /// Check if the group is still in its prefill stage.
    ///
    /// Sequences fork only after prefill, so the first sequence speaks
    /// for the whole group.
    pub fn is_prefill(&self) -> bool {
        self.first_seq().is_prefill()
    }

    /// Upper bound on sequences this group can have running at once.
    ///
    /// The scheduler charges this against its sequence budget before the
    /// fan-out actually happens.
    pub fn max_num_running_seqs(&self) -> usize {
        self.sampling
            .max_num_running_seqs(self.num_unfinished_seqs(), self.num_seqs())
    }

    /// Sum of new tokens the next step would compute for member
    /// sequences in `status`.
    pub fn num_new_tokens(&self, status: SequenceStatus) -> usize {
        self.seqs_with_status(status)
            .map(|s| s.num_new_tokens())
            .sum()
    }

    // ========== Mutations ==========

    /// Add a forked sequence to the group.
    ///
    /// # Errors
    ///
    /// Returns error if a sequence with the same id is already a member.
    pub fn add(&mut self, seq: Sequence) -> Result<()> {
        if self.seqs.iter().any(|s| s.seq_id() == seq.seq_id()) {
            return Err(Error::DuplicateSequence {
                request_id: self.request_id.clone(),
                seq_id: seq.seq_id(),
            });
        }
        self.seqs.push(seq);
        Ok(())
    }

    /// Remove a member sequence by id.
    ///
    /// # Errors
    ///
    /// Returns error if no member has that id.
    pub fn remove(&mut self, seq_id: SequenceId) -> Result<Sequence> {
        let idx = self
            .seqs
            .iter()
            .position(|s| s.seq_id() == seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        Ok(self.seqs.remove(idx))
    }

    /// Advance the computed-token counter of every unfinished sequence
    /// after a model step.
    pub fn update_num_computed_tokens(&mut self, num_tokens: usize) -> Result<()> {
        for seq in self.seqs.iter_mut().filter(|s| !s.is_finished()) {
            seq.data_mut().update_num_computed_tokens(num_tokens)?;
        }
        Ok(())
    }

    // ========== Timing ==========

    /// Stamp the first-scheduled time once.
    pub fn maybe_set_first_scheduled_time(&mut self, now: Instant) {
        if self.metrics.first_scheduled_time.is_none() {
            self.metrics.first_scheduled_time = Some(now);
            self.metrics.time_in_queue = Some(now - self.metrics.arrival_time);
        }
    }

    /// Stamp the first-token time once.
    pub fn maybe_set_first_token_time(&mut self, now: Instant) {
        if self.metrics.first_token_time.is_none() {
            self.metrics.first_token_time = Some(now);
        }
    }

    /// Stamp the most recent token time.
    pub fn set_last_token_time(&mut self, now: Instant) {
        self.metrics.last_token_time = Some(now);
    }

    /// Stamp the finished time.
    pub fn set_finished_time(&mut self, now: Instant) {
        self.metrics.finished_time = Some(now);
    }
}

impl std::fmt::Debug for SequenceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceGroup")
            .field("request_id", &self.request_id)
            .field("num_seqs", &self.num_seqs())
            .field("is_prefill", &self.is_prefill())
            .field("is_finished", &self.is_finished())
            .finish()
    }
}

/// A group the scheduler picked for the next step, with the number of
/// tokens each member sequence advances by.
#[derive(Debug, Clone)]
pub struct ScheduledSequenceGroup {
    /// Request identifier of the scheduled group.
    pub request_id: String,
    /// Tokens each member sequence computes this step: the whole prompt
    /// remainder during prefill, one during decode.
    pub token_chunk_size: usize,
}

/// Immutable snapshot of a scheduled group, handed to the model runner.
#[derive(Debug, Clone)]
pub struct SequenceGroupMetadata {
    /// Request identifier.
    pub request_id: String,
    /// True while the group is computing its prompt.
    pub is_prompt: bool,
    /// Token state of each running member sequence.
    pub seq_data: HashMap<SequenceId, SequenceData>,
    /// How many parallel completions the request wants.
    pub sampling: Arc<dyn SamplingStrategy>,
    /// When member sequences stop generating.
    pub stopping: Arc<dyn StoppingCriteria>,
    /// Tokens each member sequence computes this step.
    pub token_chunk_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sampling::{GreedySampling, ParallelSampling};
    use crate::engine::stop::StopConditions;

    fn test_group(n_prompt: usize) -> SequenceGroup {
        let seq = Sequence::new(0, None, (0..n_prompt as u32).collect());
        SequenceGroup::new(
            "req-0",
            seq,
            Arc::new(GreedySampling),
            Arc::new(StopConditions::default()),
            Instant::now(),
        )
    }

    #[test]
    fn test_group_creation() {
        let group = test_group(4);
        assert_eq!(group.request_id(), "req-0");
        assert_eq!(group.num_seqs(), 1);
        assert_eq!(group.num_unfinished_seqs(), 1);
        assert!(group.is_prefill());
        assert!(!group.is_finished());
        assert_eq!(group.prompt_token_ids(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_add_and_remove() {
        let mut group = test_group(2);
        let forked = group.first_seq().fork(1);

        group.add(forked).unwrap();
        assert_eq!(group.num_seqs(), 2);

        // Same id again is rejected.
        let dup = group.first_seq().fork(1);
        assert!(group.add(dup).is_err());

        let removed = group.remove(1).unwrap();
        assert_eq!(removed.seq_id(), 1);
        assert_eq!(group.num_seqs(), 1);
        assert!(group.remove(99).is_err());
    }

    #[test]
    fn test_finished_when_all_seqs_finish() {
        let mut group = test_group(2);
        let forked = group.first_seq().fork(1);
        group.add(forked).unwrap();

        group
            .seq_mut(0)
            .unwrap()
            .finish(SequenceStatus::FinishedStopped)
            .unwrap();
        assert!(!group.is_finished());
        assert_eq!(group.num_unfinished_seqs(), 1);

        group
            .seq_mut(1)
            .unwrap()
            .finish(SequenceStatus::FinishedLengthCapped)
            .unwrap();
        assert!(group.is_finished());
    }

    #[test]
    fn test_max_num_running_seqs_fan_out() {
        let seq = Sequence::new(0, None, vec![1, 2, 3]);
        let group = SequenceGroup::new(
            "req-0",
            seq,
            Arc::new(ParallelSampling::new(4)),
            Arc::new(StopConditions::default()),
            Instant::now(),
        );

        // Before the fork: the fan-out is still ahead.
        assert_eq!(group.max_num_running_seqs(), 4);
    }

    #[test]
    fn test_num_new_tokens_by_status() {
        let mut group = test_group(5);
        assert_eq!(group.num_new_tokens(SequenceStatus::Waiting), 5);
        assert_eq!(group.num_new_tokens(SequenceStatus::Running), 0);

        group.seq_mut(0).unwrap().set_running().unwrap();
        group.update_num_computed_tokens(5).unwrap();
        group.seq_mut(0).unwrap().append_token(9);
        assert_eq!(group.num_new_tokens(SequenceStatus::Running), 1);
    }

    #[test]
    fn test_timing_marks_set_once() {
        let mut group = test_group(2);
        let t1 = Instant::now();
        group.maybe_set_first_scheduled_time(t1);
        let queued = group.metrics().time_in_queue;
        assert!(queued.is_some());

        let t2 = t1 + Duration::from_millis(50);
        group.maybe_set_first_scheduled_time(t2);
        assert_eq!(group.metrics().first_scheduled_time, Some(t1));
        assert_eq!(group.metrics().time_in_queue, queued);

        group.maybe_set_first_token_time(t2);
        group.maybe_set_first_token_time(t1);
        assert_eq!(group.metrics().first_token_time, Some(t2));
    }
}
