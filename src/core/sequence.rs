//! Sequence tracking for inference requests.
//!
//! A sequence is one token stream: the immutable prompt prefix plus the
//! append-only generated suffix, together with its scheduling status and
//! the incremental-detokenization cursor.

use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Status of a sequence in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting in queue to be scheduled.
    Waiting,
    /// Currently running (prefill or decode).
    Running,
    /// Swapped out to CPU memory (preempted).
    Swapped,
    /// Finished by a stopping criterion (stop token or stop string).
    FinishedStopped,
    /// Finished by reaching the generation length limit.
    FinishedLengthCapped,
    /// Aborted by the caller or abandoned by the sampler.
    FinishedAborted,
    /// Rejected before ever running (prompt too long, allocation never
    /// possible).
    FinishedIgnored,
}

impl SequenceStatus {
    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::FinishedStopped
                | Self::FinishedLengthCapped
                | Self::FinishedAborted
                | Self::FinishedIgnored
        )
    }

    /// The finish reason reported to callers, if any.
    ///
    /// Ignored requests report `"length"` like length-capped ones: from the
    /// caller's point of view both mean the request was too long to serve.
    pub fn finished_reason(&self) -> Option<&'static str> {
        match self {
            Self::FinishedStopped => Some("stop"),
            Self::FinishedLengthCapped => Some("length"),
            Self::FinishedAborted => Some("abort"),
            Self::FinishedIgnored => Some("length"),
            _ => None,
        }
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Swapped => "Swapped",
            Self::FinishedStopped => "FinishedStopped",
            Self::FinishedLengthCapped => "FinishedLengthCapped",
            Self::FinishedAborted => "FinishedAborted",
            Self::FinishedIgnored => "FinishedIgnored",
        }
    }
}

/// Processing stage of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStage {
    /// Prompt tokens are still being computed.
    Prefill,
    /// The prompt is computed; generation advances one token per step.
    Decode,
}

/// Token-level state of a sequence.
///
/// Tracks the prompt/output split and how far the model has computed into
/// the stream. The stage flips from `Prefill` to `Decode` once every token
/// so far has been computed.
#[derive(Debug, Clone)]
pub struct SequenceData {
    /// Prompt token IDs.
    prompt_token_ids: Vec<u32>,
    /// Generated output token IDs.
    output_token_ids: Vec<u32>,
    /// Number of tokens already computed by the model.
    num_computed_tokens: usize,
    /// Current processing stage.
    stage: SequenceStage,
}

impl SequenceData {
    /// Create token data for a fresh prompt.
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_token_ids,
            output_token_ids: Vec::new(),
            num_computed_tokens: 0,
            stage: SequenceStage::Prefill,
        }
    }

    // ========== Getters ==========

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    /// Get the output token IDs.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Get all token IDs (prompt + output).
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Get the output length.
    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Get the total length (prompt + output).
    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Get the last token ID, if any token exists.
    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    /// Get the current processing stage.
    pub fn stage(&self) -> SequenceStage {
        self.stage
    }

    /// Number of tokens already computed by the model.
    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    /// Number of tokens not yet computed by the model.
    pub fn num_uncomputed_tokens(&self) -> usize {
        self.total_len() - self.num_computed_tokens
    }

    // ========== Mutations ==========

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
    }

    /// Advance the computed-token counter after a model step.
    ///
    /// Flips the stage to `Decode` once the whole stream is computed.
    ///
    /// # Errors
    ///
    /// Returns an invariant error if the counter would run past the
    /// current token count.
    pub fn update_num_computed_tokens(&mut self, num_tokens: usize) -> Result<()> {
        let advanced = self.num_computed_tokens + num_tokens;
        if advanced > self.total_len() {
            return Err(Error::Invariant(format!(
                "computed {} tokens of a {}-token sequence",
                advanced,
                self.total_len()
            )));
        }
        self.num_computed_tokens = advanced;
        if self.num_uncomputed_tokens() == 0 {
            self.stage = SequenceStage::Decode;
        }
        Ok(())
    }

    /// Discard computation progress so the stream is reprocessed from the
    /// start (recompute preemption).
    pub fn reset_for_recompute(&mut self) {
        self.num_computed_tokens = 0;
        self.stage = SequenceStage::Prefill;
    }
}

/// A sequence represents a single token stream of a request.
///
/// # Example
///
/// ```
/// use nanobatch::core::sequence::{Sequence, SequenceStatus};
///
/// let mut seq = Sequence::new(1, None, vec![1, 2, 3, 4]);
/// assert_eq!(seq.status(), SequenceStatus::Waiting);
/// assert_eq!(seq.prompt_len(), 4);
/// assert_eq!(seq.num_new_tokens(), 4); // whole prompt still uncomputed
///
/// seq.append_token(5);
/// assert_eq!(seq.output_len(), 1);
/// assert_eq!(seq.total_len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Unique sequence identifier.
    seq_id: SequenceId,
    /// Original prompt text, if the request came in as text.
    prompt: Option<String>,
    /// Token-level state.
    data: SequenceData,
    /// Current status.
    status: SequenceStatus,
    /// Text decoded so far.
    output_text: String,
    /// Index of the first token not yet converted to text.
    detok_offset: usize,
    /// Token that triggered a stop, if any.
    stop_token_id: Option<u32>,
    /// String that triggered a stop, if any.
    stop_string: Option<String>,
}

impl Sequence {
    /// Create a new sequence with the given prompt tokens.
    pub fn new(seq_id: SequenceId, prompt: Option<String>, prompt_token_ids: Vec<u32>) -> Self {
        let detok_offset = prompt_token_ids.len();
        Self {
            seq_id,
            prompt,
            data: SequenceData::new(prompt_token_ids),
            status: SequenceStatus::Waiting,
            output_text: String::new(),
            detok_offset,
            stop_token_id: None,
            stop_string: None,
        }
    }

    /// Fork this sequence into a sibling with a fresh id.
    ///
    /// The token history, status, and detokenization state to this point
    /// are value-copied; the siblings diverge afterwards.
    pub fn fork(&self, new_seq_id: SequenceId) -> Sequence {
        let mut forked = self.clone();
        forked.seq_id = new_seq_id;
        forked
    }

    // ========== Getters ==========

    /// Get the sequence ID.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the original prompt text, if any.
    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    /// Get the token-level state.
    pub fn data(&self) -> &SequenceData {
        &self.data
    }

    /// Get mutable access to the token-level state.
    pub fn data_mut(&mut self) -> &mut SequenceData {
        &mut self.data
    }

    /// Get the current status.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Get the text decoded so far.
    pub fn output_text(&self) -> &str {
        &self.output_text
    }

    /// Index of the first token not yet converted to text.
    pub fn detok_offset(&self) -> usize {
        self.detok_offset
    }

    /// Token that triggered a stop, if any.
    pub fn stop_token_id(&self) -> Option<u32> {
        self.stop_token_id
    }

    /// String that triggered a stop, if any.
    pub fn stop_string(&self) -> Option<&str> {
        self.stop_string.as_deref()
    }

    // ========== Length queries ==========

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.data.prompt_len()
    }

    /// Get the output length.
    pub fn output_len(&self) -> usize {
        self.data.output_len()
    }

    /// Get the total length (prompt + output).
    pub fn total_len(&self) -> usize {
        self.data.total_len()
    }

    /// Check if the sequence is still in its prefill stage.
    pub fn is_prefill(&self) -> bool {
        self.data.stage() == SequenceStage::Prefill
    }

    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Number of new tokens this sequence contributes to the next step:
    /// one in decode stage, the uncomputed remainder during prefill.
    pub fn num_new_tokens(&self) -> usize {
        if self.data.stage() == SequenceStage::Decode {
            1
        } else {
            self.data.num_uncomputed_tokens()
        }
    }

    // ========== Token operations ==========

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.data.append_token(token_id);
    }

    /// Advance the detokenization cursor and accumulate decoded text.
    pub fn advance_detok(&mut self, consumed: usize, text: &str) {
        self.detok_offset += consumed;
        self.output_text.push_str(text);
    }

    /// Record what triggered a stop.
    pub fn set_stop(&mut self, token_id: Option<u32>, string: Option<String>) {
        self.stop_token_id = token_id;
        self.stop_string = string;
    }

    // ========== State transitions ==========

    /// Transition to running state.
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting | SequenceStatus::Swapped => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition back to waiting state (recompute preemption).
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_waiting(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Waiting;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Waiting",
            }),
        }
    }

    /// Transition to swapped state (swap-out preemption).
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_swapped(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Swapped;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Swapped",
            }),
        }
    }

    /// Mark the sequence finished with one of the `Finished*` statuses.
    ///
    /// # Errors
    ///
    /// Returns error if `status` is not a finished variant or the
    /// sequence is already finished.
    pub fn finish(&mut self, status: SequenceStatus) -> Result<()> {
        if !status.is_finished() || self.status.is_finished() {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: status.as_str(),
            });
        }
        self.status = status;
        Ok(())
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for Sequence {}

impl std::hash::Hash for Sequence {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.seq_id.hash(state);
    }
}
