//! Inference engine.
//!
//! This module contains:
//! - LLMEngine for orchestrating inference
//! - ModelRunner and Tokenizer seams toward the model
//! - Sampling strategies, stopping criteria, and request outputs

pub mod llm;
pub mod outputs;
pub mod runner;
pub mod sampling;
pub mod stop;
pub mod tokenizer;

pub use llm::{GenerationRequest, LLMEngine};
pub use outputs::{CompletionOutput, RequestOutput, SequenceGroupOutput, SequenceOutput};
pub use runner::{BatchInput, ModelRunner};
pub use sampling::{GreedySampling, ParallelSampling, SamplingStrategy};
pub use stop::{StopConditions, StopDecision, StoppingCriteria};
pub use tokenizer::{decode_sequence_incrementally, HfTokenizer, Tokenizer};
