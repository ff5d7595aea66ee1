//! Sampling strategies.
//!
//! The scheduler does not sample tokens; it only needs to know how many
//! sequences a request may fan out into, so it can charge the sequence
//! budget before the fork happens. The model runner owns the actual
//! token choice.

/// How a request's sampling shapes its sequence count.
pub trait SamplingStrategy: std::fmt::Debug + Send + Sync {
    /// Upper bound on sequences the group can have running at once, given
    /// its current unfinished and total sequence counts.
    fn max_num_running_seqs(&self, num_unfinished: usize, num_total: usize) -> usize;

    /// Whether incremental detokenization drops special tokens.
    fn skip_special_tokens(&self) -> bool {
        true
    }
}

/// One completion per request, no fan-out.
#[derive(Debug, Default)]
pub struct GreedySampling;

impl SamplingStrategy for GreedySampling {
    fn max_num_running_seqs(&self, num_unfinished: usize, _num_total: usize) -> usize {
        num_unfinished
    }
}

/// Beam-style fan-out into a fixed number of branches after prefill.
#[derive(Debug)]
pub struct ParallelSampling {
    /// Number of branches each request forks into.
    num_branches: usize,
}

impl ParallelSampling {
    /// Create a strategy that forks into `num_branches` sequences.
    pub fn new(num_branches: usize) -> Self {
        Self { num_branches }
    }

    /// Number of branches each request forks into.
    pub fn num_branches(&self) -> usize {
        self.num_branches
    }
}

impl SamplingStrategy for ParallelSampling {
    fn max_num_running_seqs(&self, num_unfinished: usize, num_total: usize) -> usize {
        // Before the fork the group still has a single sequence; charge
        // for the full fan-out it is about to become.
        if self.num_branches > num_total {
            self.num_branches
        } else {
            num_unfinished
        }
    }
}
