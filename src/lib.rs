//! nanobatch: a continuous-batching request scheduler for LLM inference.
//!
//! This crate implements the serving-side half of an inference engine:
//! - Continuous batching with FCFS scheduling and token/seq budgets
//! - Recompute preemption under cache pressure
//! - Parallel sampling with sequence forking
//! - Incremental detokenization and stop-condition handling
//!
//! The model itself sits behind the [`ModelRunner`] trait; the crate
//! ships a scheduler, an engine loop, and the bookkeeping in between.

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use crate::core::group::{ScheduledSequenceGroup, SequenceGroup, SequenceGroupMetadata};
pub use crate::core::kv_cache::{AllocStatus, KvCacheManager, NoopKvCacheManager};
pub use crate::core::sequence::{Sequence, SequenceId, SequenceStage, SequenceStatus};
pub use engine::{
    BatchInput, CompletionOutput, GenerationRequest, GreedySampling, HfTokenizer, LLMEngine,
    ModelRunner, ParallelSampling, RequestOutput, SamplingStrategy, SequenceGroupOutput,
    SequenceOutput, StopConditions, StopDecision, StoppingCriteria, Tokenizer,
};
pub use error::{Error, Result};
pub use scheduler::{Fcfs, Scheduler, SchedulerOutputs, SchedulingBudget, SchedulingPolicy};
