//! Model outputs and caller-facing request results.

use crate::core::group::{RequestMetrics, SequenceGroup};
use crate::core::sequence::{Sequence, SequenceId};

/// One sampled token, attributed to the sequence it extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceOutput {
    /// The running sequence this sample extends. Several samples may
    /// name the same parent; the engine forks the extras.
    pub parent_seq_id: SequenceId,
    /// The sampled token.
    pub output_token_id: u32,
}

/// Sampling result for one scheduled group in one step.
#[derive(Debug, Clone, Default)]
pub struct SequenceGroupOutput {
    /// Sampled tokens, in fan-out order per parent.
    pub samples: Vec<SequenceOutput>,
}

impl SequenceGroupOutput {
    /// Wrap a list of samples.
    pub fn new(samples: Vec<SequenceOutput>) -> Self {
        Self { samples }
    }

    /// Samples attributed to one parent sequence, in order.
    pub fn samples_for(&self, parent_seq_id: SequenceId) -> impl Iterator<Item = &SequenceOutput> {
        self.samples
            .iter()
            .filter(move |s| s.parent_seq_id == parent_seq_id)
    }
}

/// One completion of a request.
#[derive(Debug, Clone)]
pub struct CompletionOutput {
    /// Position of this completion within the request.
    pub index: usize,
    /// Generated text decoded so far.
    pub text: String,
    /// Generated token ids.
    pub token_ids: Vec<u32>,
    /// Why generation ended, if it has: `"stop"`, `"length"`, or
    /// `"abort"`.
    pub finish_reason: Option<&'static str>,
    /// Token that triggered a stop, if any.
    pub stop_token_id: Option<u32>,
    /// String that triggered a stop, if any.
    pub stop_string: Option<String>,
}

impl CompletionOutput {
    /// Check if this completion has finished generating.
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Caller-facing snapshot of a request after an engine step.
///
/// Emitted for every scheduled group each step; `finished` flips once
/// on the step where the last sequence stops.
#[derive(Debug, Clone)]
pub struct RequestOutput {
    /// Request identifier.
    pub request_id: String,
    /// Original prompt text, if the request came in as text.
    pub prompt: Option<String>,
    /// Prompt token ids.
    pub prompt_token_ids: Vec<u32>,
    /// Completions, ordered by sequence id for determinism.
    pub outputs: Vec<CompletionOutput>,
    /// True once every sequence of the request has finished.
    pub finished: bool,
    /// Per-request timing marks.
    pub metrics: RequestMetrics,
}

impl RequestOutput {
    /// Project a group's current state into a caller-facing output.
    pub fn from_seq_group(group: &SequenceGroup) -> Self {
        let mut seqs: Vec<&Sequence> = group.seqs().iter().collect();
        seqs.sort_by_key(|s| s.seq_id());

        let outputs = seqs
            .iter()
            .enumerate()
            .map(|(index, seq)| CompletionOutput {
                index,
                text: seq.output_text().to_string(),
                token_ids: seq.data().output_token_ids().to_vec(),
                finish_reason: seq.status().finished_reason(),
                stop_token_id: seq.stop_token_id(),
                stop_string: seq.stop_string().map(|s| s.to_string()),
            })
            .collect();

        // A group whose every parent was abandoned has no sequences left.
        let first = seqs.first();
        Self {
            request_id: group.request_id().to_string(),
            prompt: first.and_then(|s| s.prompt()).map(|s| s.to_string()),
            prompt_token_ids: first
                .map(|s| s.data().prompt_token_ids().to_vec())
                .unwrap_or_default(),
            outputs,
            finished: group.is_finished(),
            metrics: group.metrics().clone(),
        }
    }
}
