//! Configuration types for nanobatch.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Scheduler configuration.
///
/// Bounds one scheduling pass: how many tokens and sequences a single
/// batch may carry, and how long a prompt may be before it is rejected
/// outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tokens batched into one iteration.
    pub max_num_batched_tokens: usize,
    /// Maximum number of sequences scheduled per iteration.
    pub max_num_seqs: usize,
    /// Maximum sequence length (prompt plus generated tokens).
    pub max_seq_len: usize,
    /// Enable chunked prefill for long prompts (declared, unimplemented).
    pub enable_chunked_prefill: bool,
    /// Prefill delay factor, in units of the last observed prompt latency.
    /// Zero disables the delay gate.
    pub delay_factor: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: 4096,
            max_num_seqs: 256,
            max_seq_len: 4096,
            enable_chunked_prefill: false,
            delay_factor: 0.0,
        }
    }
}

impl SchedulerConfig {
    /// Check that the configured limits are mutually consistent.
    ///
    /// Without chunked prefill a prompt must fit into one batch, so the
    /// token budget has to cover `max_seq_len`. The token budget must also
    /// cover `max_num_seqs`, which guarantees a full decode step (one
    /// token per sequence) never overruns it.
    pub fn validate(&self) -> Result<()> {
        if self.max_num_batched_tokens == 0 || self.max_num_seqs == 0 || self.max_seq_len == 0 {
            return Err(Error::Config(
                "scheduler limits must be non-zero".to_string(),
            ));
        }
        if self.max_num_batched_tokens < self.max_seq_len && !self.enable_chunked_prefill {
            return Err(Error::Config(format!(
                "max_num_batched_tokens ({}) is smaller than max_seq_len ({}); \
                 a full-length prompt could never be scheduled",
                self.max_num_batched_tokens, self.max_seq_len
            )));
        }
        if self.max_num_batched_tokens < self.max_num_seqs {
            return Err(Error::Config(format!(
                "max_num_batched_tokens ({}) must be at least max_num_seqs ({})",
                self.max_num_batched_tokens, self.max_num_seqs
            )));
        }
        if self.delay_factor < 0.0 {
            return Err(Error::Config(format!(
                "delay_factor must be non-negative, got {}",
                self.delay_factor
            )));
        }
        Ok(())
    }

    /// Load a configuration from a JSON file.
    ///
    /// Missing fields fall back to their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }
}
