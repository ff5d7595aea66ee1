//! Stopping criteria.
//!
//! After every appended token the engine asks the request's stopping
//! criteria whether the sequence is done. The check runs after
//! incremental detokenization so stop strings can match decoded text.

use crate::core::sequence::{Sequence, SequenceStatus};

/// Verdict of one stop check.
#[derive(Debug, Clone)]
pub struct StopDecision {
    /// The status the sequence should take. Unchanged if no criterion
    /// fired.
    pub status: SequenceStatus,
    /// Token that triggered the stop, if a stop token fired.
    pub stop_token_id: Option<u32>,
    /// String that triggered the stop, if a stop string fired.
    pub stop_string: Option<String>,
}

/// When a sequence stops generating.
pub trait StoppingCriteria: std::fmt::Debug + Send + Sync {
    /// Check `seq` against the criteria, in precedence order: stop
    /// token, then stop string, then length cap.
    fn check_stop(&self, seq: &Sequence) -> StopDecision;
}

/// Standard stop conditions: token-id stops, text stops, and a cap on
/// generated length.
#[derive(Debug, Clone)]
pub struct StopConditions {
    /// Maximum number of generated tokens.
    pub max_new_tokens: usize,
    /// Token ids that end generation when sampled.
    pub stop_token_ids: Vec<u32>,
    /// Strings that end generation when the decoded text ends with them.
    pub stop_strings: Vec<String>,
}

impl Default for StopConditions {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            stop_token_ids: Vec::new(),
            stop_strings: Vec::new(),
        }
    }
}

impl StopConditions {
    /// Cap generated length at `max_new_tokens`, with no token or string
    /// stops.
    pub fn with_max_new_tokens(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            ..Self::default()
        }
    }
}

impl StoppingCriteria for StopConditions {
    fn check_stop(&self, seq: &Sequence) -> StopDecision {
        if let Some(&last) = seq.data().output_token_ids().last() {
            if self.stop_token_ids.contains(&last) {
                return StopDecision {
                    status: SequenceStatus::FinishedStopped,
                    stop_token_id: Some(last),
                    stop_string: None,
                };
            }
        }

        for stop in &self.stop_strings {
            if !stop.is_empty() && seq.output_text().ends_with(stop.as_str()) {
                return StopDecision {
                    status: SequenceStatus::FinishedStopped,
                    stop_token_id: None,
                    stop_string: Some(stop.clone()),
                };
            }
        }

        if seq.output_len() >= self.max_new_tokens {
            return StopDecision {
                status: SequenceStatus::FinishedLengthCapped,
                stop_token_id: None,
                stop_string: None,
            };
        }

        StopDecision {
            status: seq.status(),
            stop_token_id: None,
            stop_string: None,
        }
    }
}
