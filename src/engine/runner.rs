//! Model-runner seam and batch input preparation.
//!
//! The engine never touches model weights; it hands the scheduled batch
//! to a [`ModelRunner`] and folds the sampled tokens back. [`BatchInput`]
//! flattens a batch into the token/position layout runners typically
//! feed a model, so implementations do not each re-derive it.

use std::collections::HashMap;

use crate::core::group::SequenceGroupMetadata;
use crate::core::sequence::{SequenceData, SequenceId};
use crate::engine::outputs::SequenceGroupOutput;
use crate::error::{Error, Result};

/// Executes one scheduled batch and samples the next tokens.
///
/// Implementations must return exactly one output per scheduled group,
/// in batch order, with one or more samples per running sequence.
pub trait ModelRunner: Send {
    /// Run the model over `batch` and sample next tokens.
    fn execute_model(
        &mut self,
        batch: &[SequenceGroupMetadata],
    ) -> Result<Vec<SequenceGroupOutput>>;
}

/// Flattened token layout of one scheduled batch.
///
/// Prefill batches carry each sequence's uncomputed prompt span; decode
/// batches carry one token per sequence. `seq_ids` lists the sequences
/// in batch order; `subquery_lens` maps spans of `token_ids` back to
/// them during prefill (decode spans are always one token).
#[derive(Debug, Clone, Default)]
pub struct BatchInput {
    /// Tokens to feed, all sequences concatenated.
    pub token_ids: Vec<u32>,
    /// Position of each fed token within its sequence.
    pub positions: Vec<usize>,
    /// Sequences in batch order, sorted by id within each group.
    pub seq_ids: Vec<SequenceId>,
    /// True where the token's logits are sampled: the last fed token of
    /// each sequence.
    pub logits_mask: Vec<bool>,
    /// Prompt length per sequence. Empty for decode batches.
    pub prompt_lens: Vec<usize>,
    /// Fed-token count per sequence. Empty for decode batches.
    pub subquery_lens: Vec<usize>,
}

impl BatchInput {
    /// Flatten a scheduled batch.
    ///
    /// # Errors
    ///
    /// Returns an invariant error if the batch mixes prefill and decode
    /// groups or a sequence's computed counter is out of range.
    pub fn prepare(batch: &[SequenceGroupMetadata]) -> Result<BatchInput> {
        let mut input = BatchInput::default();
        let Some(first) = batch.first() else {
            return Ok(input);
        };
        let is_prompt = first.is_prompt;

        for metadata in batch {
            if metadata.is_prompt != is_prompt {
                return Err(Error::Invariant(
                    "mixed prefill and decode groups in one batch".to_string(),
                ));
            }
            for (seq_id, data) in sorted_seq_data(&metadata.seq_data) {
                if is_prompt {
                    prepare_prompt_seq(&mut input, seq_id, data, metadata.token_chunk_size)?;
                } else {
                    prepare_decode_seq(&mut input, seq_id, data)?;
                }
            }
        }
        Ok(input)
    }
}

/// Metadata sequence entries in id order, so batch layout is stable.
fn sorted_seq_data(
    seq_data: &HashMap<SequenceId, SequenceData>,
) -> Vec<(SequenceId, &SequenceData)> {
    let mut entries: Vec<(SequenceId, &SequenceData)> =
        seq_data.iter().map(|(&id, data)| (id, data)).collect();
    entries.sort_by_key(|(id, _)| *id);
    entries
}

fn prepare_prompt_seq(
    input: &mut BatchInput,
    seq_id: SequenceId,
    data: &SequenceData,
    chunk: usize,
) -> Result<()> {
    let all_tokens = data.all_token_ids();
    let start = data.num_computed_tokens();
    let span = all_tokens
        .get(start..start + chunk)
        .ok_or_else(|| {
            Error::Invariant(format!(
                "prefill chunk {}..{} out of range for a {}-token sequence",
                start,
                start + chunk,
                all_tokens.len()
            ))
        })?;

    input.token_ids.extend_from_slice(span);
    input.positions.extend(start..start + chunk);
    for offset in 0..chunk {
        input.logits_mask.push(offset + 1 == chunk);
    }
    input.seq_ids.push(seq_id);
    input.prompt_lens.push(data.prompt_len());
    input.subquery_lens.push(chunk);
    Ok(())
}

fn prepare_decode_seq(
    input: &mut BatchInput,
    seq_id: SequenceId,
    data: &SequenceData,
) -> Result<()> {
    let last = data
        .last_token_id()
        .ok_or_else(|| Error::Invariant("decode sequence has no tokens".to_string()))?;

    input.token_ids.push(last);
    input.positions.push(data.total_len() - 1);
    input.logits_mask.push(true);
    input.seq_ids.push(seq_id);
    Ok(())
}
