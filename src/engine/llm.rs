//! LLM inference engine.
//!
//! The LLMEngine drives one accept → schedule → execute → integrate cycle
//! per `step()` call:
//! - Scheduler decides the batch
//! - ModelRunner executes it and samples tokens
//! - The engine folds samples back into sequences, detokenizes, and
//!   applies stopping criteria
//!
//! ## Engine Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LLMEngine                              │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!           add_request()    │    step() / generate()
//!                ▼           │           ▼
//!         ┌──────────┐       │    ┌──────────────┐
//!         │ Tokenize │       │    │  Scheduler   │
//!         │  prompt  │       │    │  schedule()  │
//!         └──────────┘       │    └──────────────┘
//!                │           │           │
//!                ▼           │           ▼
//!         ┌──────────┐       │    ┌──────────────┐
//!         │ Scheduler│       │    │ ModelRunner  │
//!         │   add    │       │    │execute_model │
//!         └──────────┘       │    └──────────────┘
//!                            │           │
//!                            │           ▼
//!                            │    ┌──────────────┐
//!                            │    │ Fold samples │
//!                            │    │ detok + stop │
//!                            │    └──────────────┘
//! ```

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::core::group::SequenceGroup;
use crate::core::kv_cache::NoopKvCacheManager;
use crate::core::sequence::{Sequence, SequenceId, SequenceStatus};
use crate::engine::outputs::{RequestOutput, SequenceGroupOutput};
use crate::engine::runner::ModelRunner;
use crate::engine::sampling::{GreedySampling, SamplingStrategy};
use crate::engine::stop::{StopConditions, StoppingCriteria};
use crate::engine::tokenizer::{decode_sequence_incrementally, Tokenizer};
use crate::error::{Error, Result};
use crate::scheduler::batch::Scheduler;
use crate::scheduler::policy::Fcfs;

/// Request for text generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Unique request ID (auto-assigned if None).
    pub request_id: Option<String>,
    /// Input prompt text.
    pub prompt: Option<String>,
    /// Pre-tokenized prompt, used instead of tokenizing `prompt`.
    pub prompt_token_ids: Option<Vec<u32>>,
    /// Sampling strategy for this request.
    pub sampling: Arc<dyn SamplingStrategy>,
    /// Stopping criteria for this request.
    pub stopping: Arc<dyn StoppingCriteria>,
    /// Arrival stamp (defaults to the time the request is added).
    pub arrival_time: Option<Instant>,
}

impl GenerationRequest {
    /// Create a request from prompt text with default settings.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            request_id: None,
            prompt: Some(prompt.into()),
            prompt_token_ids: None,
            sampling: Arc::new(GreedySampling),
            stopping: Arc::new(StopConditions::default()),
            arrival_time: None,
        }
    }

    /// Create a request from pre-tokenized input.
    pub fn from_token_ids(token_ids: Vec<u32>) -> Self {
        Self {
            request_id: None,
            prompt: None,
            prompt_token_ids: Some(token_ids),
            sampling: Arc::new(GreedySampling),
            stopping: Arc::new(StopConditions::default()),
            arrival_time: None,
        }
    }

    /// Set an explicit request ID.
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Set the sampling strategy.
    pub fn sampling(mut self, sampling: Arc<dyn SamplingStrategy>) -> Self {
        self.sampling = sampling;
        self
    }

    /// Set the stopping criteria.
    pub fn stopping(mut self, stopping: Arc<dyn StoppingCriteria>) -> Self {
        self.stopping = stopping;
        self
    }

    /// Set an explicit arrival stamp.
    pub fn arrival_time(mut self, arrival_time: Instant) -> Self {
        self.arrival_time = Some(arrival_time);
        self
    }
}

/// LLM inference engine.
///
/// Orchestrates the scheduler, model runner, and tokenizer for
/// continuous-batching text generation.
pub struct LLMEngine {
    /// Request scheduler.
    scheduler: Scheduler,
    /// Executes scheduled batches.
    runner: Box<dyn ModelRunner>,
    /// Tokenizer for encoding/decoding text.
    tokenizer: Box<dyn Tokenizer>,
    /// Counter for sequence ids, shared across all requests.
    seq_counter: SequenceId,
    /// Counter for auto-assigned request ids.
    request_counter: u64,
}

/// How one step's samples continue a single running sequence.
#[derive(Debug)]
enum SeqUpdate {
    /// No sample named the sequence; it is finished and dropped.
    Abandon,
    /// One sample extends the sequence in place.
    Continue(u32),
    /// Extra samples fork a sibling each; the last sample stays in
    /// place.
    Fork { children: Vec<u32>, last: u32 },
}

impl SeqUpdate {
    /// Classify the samples attributed to one parent sequence.
    fn from_samples(mut tokens: Vec<u32>) -> Self {
        match tokens.pop() {
            None => SeqUpdate::Abandon,
            Some(last) if tokens.is_empty() => SeqUpdate::Continue(last),
            Some(last) => SeqUpdate::Fork {
                children: tokens,
                last,
            },
        }
    }

    fn num_children(&self) -> usize {
        match self {
            SeqUpdate::Fork { children, .. } => children.len(),
            _ => 0,
        }
    }

    fn appends_token(&self) -> bool {
        !matches!(self, SeqUpdate::Abandon)
    }
}

impl LLMEngine {
    /// Create an engine with the default FCFS policy and unbounded
    /// cache accounting.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration limits are inconsistent.
    pub fn new(
        config: SchedulerConfig,
        runner: Box<dyn ModelRunner>,
        tokenizer: Box<dyn Tokenizer>,
    ) -> Result<Self> {
        let scheduler = Scheduler::new(config, Box::new(Fcfs), Box::new(NoopKvCacheManager))?;
        Ok(Self::with_scheduler(scheduler, runner, tokenizer))
    }

    /// Create an engine around a pre-wired scheduler, for custom
    /// policies or cache managers.
    pub fn with_scheduler(
        scheduler: Scheduler,
        runner: Box<dyn ModelRunner>,
        tokenizer: Box<dyn Tokenizer>,
    ) -> Self {
        Self {
            scheduler,
            runner,
            tokenizer,
            seq_counter: 0,
            request_counter: 0,
        }
    }

    /// Add a generation request to the engine.
    ///
    /// Returns the request ID, assigning one if the request carries
    /// none.
    ///
    /// # Errors
    ///
    /// Returns error if the prompt tokenizes to nothing or the request
    /// id is already in flight.
    pub fn add_request(&mut self, request: GenerationRequest) -> Result<String> {
        let GenerationRequest {
            request_id,
            prompt,
            prompt_token_ids,
            sampling,
            stopping,
            arrival_time,
        } = request;

        let request_id = match request_id {
            Some(id) => id,
            None => {
                let id = self.request_counter.to_string();
                self.request_counter += 1;
                id
            }
        };
        let arrival_time = arrival_time.unwrap_or_else(Instant::now);

        let token_ids = match prompt_token_ids {
            Some(ids) => {
                if prompt.is_some() {
                    warn!(
                        request_id,
                        "request carries both prompt text and token ids; using the token ids"
                    );
                }
                ids
            }
            None => self.tokenizer.tokenize(prompt.as_deref().unwrap_or(""))?,
        };
        if token_ids.is_empty() {
            return Err(Error::Tokenization("empty prompt".to_string()));
        }

        let seq = Sequence::new(self.next_seq_id(), prompt, token_ids);
        let group = SequenceGroup::new(request_id.clone(), seq, sampling, stopping, arrival_time);
        self.scheduler.add_seq_group(group)?;
        debug!(request_id, "request added");
        Ok(request_id)
    }

    /// Abort requests by id, wherever they currently are.
    pub fn abort_request(&mut self, request_ids: &[String]) {
        self.scheduler.abort_seq_groups(request_ids);
    }

    /// Run a single engine step.
    ///
    /// Returns one output per scheduled group (finished or not) plus
    /// one per group terminally rejected this pass.
    pub fn step(&mut self) -> Result<Vec<RequestOutput>> {
        let (batch, mut scheduler_outputs) = self.scheduler.schedule()?;

        // Nothing scheduled: skip the runner rather than hand it an
        // empty batch.
        let model_outputs = if batch.is_empty() {
            Vec::new()
        } else {
            self.runner.execute_model(&batch)?
        };
        if model_outputs.len() != batch.len() {
            return Err(Error::OutputCountMismatch {
                expected: batch.len(),
                actual: model_outputs.len(),
            });
        }

        let now = Instant::now();
        for (scheduled, group_output) in scheduler_outputs
            .scheduled_seq_groups
            .iter()
            .zip(&model_outputs)
        {
            self.process_group_output(
                &scheduled.request_id,
                scheduled.token_chunk_size,
                group_output,
                now,
            )?;
        }

        let mut outputs = Vec::with_capacity(
            scheduler_outputs.scheduled_seq_groups.len()
                + scheduler_outputs.ignored_seq_groups.len(),
        );
        for scheduled in &scheduler_outputs.scheduled_seq_groups {
            let group = self
                .scheduler
                .get_group_mut(&scheduled.request_id)
                .ok_or_else(|| Error::RequestNotFound(scheduled.request_id.clone()))?;
            if group.is_finished() {
                group.set_finished_time(now);
            }
            outputs.push(RequestOutput::from_seq_group(group));
        }
        for group in &mut scheduler_outputs.ignored_seq_groups {
            group.set_finished_time(now);
            outputs.push(RequestOutput::from_seq_group(group));
        }

        self.scheduler.free_finished_seq_groups();
        Ok(outputs)
    }

    /// Fold one group's sampling output back into its sequences.
    ///
    /// Parents with no samples are abandoned; parents with several
    /// samples fork a sibling per extra sample and keep the last one
    /// in place. Every touched sequence is then detokenized and checked
    /// against the stopping criteria.
    fn process_group_output(
        &mut self,
        request_id: &str,
        token_chunk_size: usize,
        output: &SequenceGroupOutput,
        now: Instant,
    ) -> Result<()> {
        let (updates, stopping, skip_special) = {
            let group = self
                .scheduler
                .get_group(request_id)
                .ok_or_else(|| Error::RequestNotFound(request_id.to_string()))?;
            let updates: Vec<(SequenceId, SeqUpdate)> = group
                .seqs_with_status(SequenceStatus::Running)
                .map(|seq| {
                    let tokens: Vec<u32> = output
                        .samples_for(seq.seq_id())
                        .map(|s| s.output_token_id)
                        .collect();
                    (seq.seq_id(), SeqUpdate::from_samples(tokens))
                })
                .collect();
            (
                updates,
                group.stopping().clone(),
                group.sampling().skip_special_tokens(),
            )
        };

        let appended_any = updates.iter().any(|(_, update)| update.appends_token());
        let num_forks: usize = updates.iter().map(|(_, update)| update.num_children()).sum();
        let fork_ids: Vec<SequenceId> = (0..num_forks).map(|_| self.next_seq_id()).collect();

        let mut freed: Vec<SequenceId> = Vec::new();
        {
            let group = self
                .scheduler
                .get_group_mut(request_id)
                .ok_or_else(|| Error::RequestNotFound(request_id.to_string()))?;
            group.update_num_computed_tokens(token_chunk_size)?;

            let mut fork_ids = fork_ids.into_iter();
            let mut forked: Vec<Sequence> = Vec::new();
            let mut extended: Vec<SequenceId> = Vec::new();

            for (parent_id, update) in updates {
                let last = match update {
                    SeqUpdate::Abandon => {
                        if let Some(seq) = group.seq_mut(parent_id) {
                            seq.finish(SequenceStatus::FinishedAborted)?;
                        }
                        group.remove(parent_id)?;
                        freed.push(parent_id);
                        continue;
                    }
                    SeqUpdate::Continue(token_id) => token_id,
                    SeqUpdate::Fork { children, last } => {
                        for token_id in children {
                            let new_id = fork_ids.next().ok_or_else(|| {
                                Error::Invariant("fork id pool exhausted".to_string())
                            })?;
                            let parent = group
                                .seq(parent_id)
                                .ok_or(Error::SequenceNotFound(parent_id))?;
                            let mut child = parent.fork(new_id);
                            child.append_token(token_id);
                            forked.push(child);
                        }
                        last
                    }
                };

                let seq = group
                    .seq_mut(parent_id)
                    .ok_or(Error::SequenceNotFound(parent_id))?;
                seq.append_token(last);
                extended.push(parent_id);
            }

            for child in &mut forked {
                decode_sequence_incrementally(child, self.tokenizer.as_ref(), skip_special)?;
                Self::apply_stop(child, stopping.as_ref())?;
            }
            for child in forked {
                group.add(child)?;
            }

            for parent_id in extended {
                let seq = group
                    .seq_mut(parent_id)
                    .ok_or(Error::SequenceNotFound(parent_id))?;
                decode_sequence_incrementally(seq, self.tokenizer.as_ref(), skip_special)?;
                Self::apply_stop(seq, stopping.as_ref())?;
                // In-place-continued parents release their cache space as
                // soon as they finish; forks are still pending insertion
                // and never held any.
                if seq.is_finished() {
                    freed.push(parent_id);
                }
            }

            if appended_any {
                group.maybe_set_first_token_time(now);
                group.set_last_token_time(now);
            }
        }

        for seq_id in freed {
            self.scheduler.free_seq(seq_id);
        }
        Ok(())
    }

    /// Apply a stop verdict to a sequence.
    fn apply_stop(seq: &mut Sequence, stopping: &dyn StoppingCriteria) -> Result<()> {
        let decision = stopping.check_stop(seq);
        if decision.status.is_finished() {
            seq.set_stop(decision.stop_token_id, decision.stop_string);
            seq.finish(decision.status)?;
        }
        Ok(())
    }

    /// Run all given requests to completion.
    ///
    /// Returns one finished output per request, sorted by request id
    /// (requests can finish out of submission order).
    pub fn generate(&mut self, requests: Vec<GenerationRequest>) -> Result<Vec<RequestOutput>> {
        self.generate_with_progress(requests, |_, _| {})
    }

    /// Like [`generate`](Self::generate), invoking `progress` with
    /// `(finished, total)` after each request completes.
    pub fn generate_with_progress<F>(
        &mut self,
        requests: Vec<GenerationRequest>,
        mut progress: F,
    ) -> Result<Vec<RequestOutput>>
    where
        F: FnMut(usize, usize),
    {
        let total = requests.len();
        for request in requests {
            self.add_request(request)?;
        }

        let mut finished: Vec<RequestOutput> = Vec::with_capacity(total);
        while self.scheduler.has_unfinished_seqs() {
            for output in self.step()? {
                if output.finished {
                    finished.push(output);
                    progress(finished.len(), total);
                }
            }
        }

        finished.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        Ok(finished)
    }

    // ========== Getters ==========

    /// Get the scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Check if any request still needs engine steps.
    pub fn has_unfinished_requests(&self) -> bool {
        self.scheduler.has_unfinished_seqs()
    }

    /// Number of requests anywhere in the engine.
    pub fn num_unfinished_requests(&self) -> usize {
        self.scheduler.num_unfinished_seq_groups()
    }

    fn next_seq_id(&mut self) -> SequenceId {
        let id = self.seq_counter;
        self.seq_counter += 1;
        id
    }
}
