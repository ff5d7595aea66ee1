//! Tokenizer seam and incremental detokenization.
//!
//! Generated tokens become text incrementally: after each step the engine
//! offers a sequence's not-yet-decoded tokens to the tokenizer, which
//! reports how many it consumed and the text they produced. A tokenizer
//! may consume fewer tokens than offered when the tail does not yet form
//! complete text.

use crate::core::sequence::Sequence;
use crate::error::{Error, Result};

/// Text-to-token conversion used by the engine.
pub trait Tokenizer: Send {
    /// Convert prompt text into token ids.
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    /// Convert token ids into text, returning how many of the given ids
    /// were consumed alongside the decoded text.
    fn ids_to_text(&self, ids: &[u32], skip_special: bool) -> Result<(usize, String)>;
}

/// Decode a sequence's pending tokens and advance its cursor.
pub fn decode_sequence_incrementally(
    seq: &mut Sequence,
    tokenizer: &dyn Tokenizer,
    skip_special: bool,
) -> Result<()> {
    let all_tokens = seq.data().all_token_ids();
    let pending = &all_tokens[seq.detok_offset()..];
    if pending.is_empty() {
        return Ok(());
    }
    let (consumed, text) = tokenizer.ids_to_text(pending, skip_special)?;
    seq.advance_detok(consumed, &text);
    Ok(())
}

/// Tokenizer backed by a HuggingFace `tokenizer.json` file.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Look up the id of a named token, such as an end-of-sequence
    /// marker.
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

impl Tokenizer for HfTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn ids_to_text(&self, ids: &[u32], skip_special: bool) -> Result<(usize, String)> {
        let text = self
            .inner
            .decode(ids, skip_special)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok((ids.len(), text))
    }
}
