//! Per-pass scheduling budget.
//!
//! One budget is created per `schedule()` call and threaded through the
//! decode and prefill passes. Charges are keyed by request id and
//! idempotent, so a group examined twice in one pass is only counted
//! once.

use std::collections::HashSet;

/// Token and sequence headroom for one scheduling pass.
#[derive(Debug)]
pub struct SchedulingBudget {
    /// Maximum tokens the batch may contain.
    token_budget: usize,
    /// Maximum concurrent sequences the batch may contain.
    max_num_seqs: usize,
    /// Request ids already charged for tokens.
    request_ids_num_batched_tokens: HashSet<String>,
    /// Request ids already charged for sequences.
    request_ids_num_curr_seqs: HashSet<String>,
    /// Tokens charged so far.
    num_batched_tokens: usize,
    /// Sequences charged so far.
    num_curr_seqs: usize,
}

impl SchedulingBudget {
    /// Create a fresh budget for one scheduling pass.
    pub fn new(token_budget: usize, max_num_seqs: usize) -> Self {
        Self {
            token_budget,
            max_num_seqs,
            request_ids_num_batched_tokens: HashSet::new(),
            request_ids_num_curr_seqs: HashSet::new(),
            num_batched_tokens: 0,
            num_curr_seqs: 0,
        }
    }

    /// Check whether `num_new_tokens` tokens and `num_new_seqs` sequences
    /// both fit in the remaining headroom.
    pub fn can_schedule(&self, num_new_tokens: usize, num_new_seqs: usize) -> bool {
        self.num_batched_tokens + num_new_tokens <= self.token_budget
            && self.num_curr_seqs + num_new_seqs <= self.max_num_seqs
    }

    /// Tokens still available this pass.
    pub fn remaining_token_budget(&self) -> usize {
        self.token_budget - self.num_batched_tokens
    }

    /// Charge tokens for a request. Charging the same request id again
    /// is a no-op.
    pub fn add_num_batched_tokens(&mut self, request_id: &str, num_tokens: usize) {
        if self.request_ids_num_batched_tokens.contains(request_id) {
            return;
        }
        self.request_ids_num_batched_tokens
            .insert(request_id.to_string());
        self.num_batched_tokens += num_tokens;
    }

    /// Refund tokens charged for a request, if it was charged.
    pub fn subtract_num_batched_tokens(&mut self, request_id: &str, num_tokens: usize) {
        if self.request_ids_num_batched_tokens.remove(request_id) {
            self.num_batched_tokens -= num_tokens;
        }
    }

    /// Charge sequences for a request. Charging the same request id
    /// again is a no-op.
    pub fn add_num_seqs(&mut self, request_id: &str, num_seqs: usize) {
        if self.request_ids_num_curr_seqs.contains(request_id) {
            return;
        }
        self.request_ids_num_curr_seqs
            .insert(request_id.to_string());
        self.num_curr_seqs += num_seqs;
    }

    /// Refund sequences charged for a request, if it was charged.
    pub fn subtract_num_seqs(&mut self, request_id: &str, num_seqs: usize) {
        if self.request_ids_num_curr_seqs.remove(request_id) {
            self.num_curr_seqs -= num_seqs;
        }
    }

    // ========== Getters ==========

    /// Tokens charged so far.
    pub fn num_batched_tokens(&self) -> usize {
        self.num_batched_tokens
    }

    /// Sequences charged so far.
    pub fn num_curr_seqs(&self) -> usize {
        self.num_curr_seqs
    }

    /// Maximum tokens the batch may contain.
    pub fn token_budget(&self) -> usize {
        self.token_budget
    }
}
