//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - Per-pass token and sequence budgets
//! - Policy-ordered admission and decode scheduling
//! - Recompute preemption under cache pressure

pub mod batch;
pub mod budget;
pub mod policy;

pub use batch::{PreemptionMode, Scheduler, SchedulerOutputs};
pub use budget::SchedulingBudget;
pub use policy::{Fcfs, SchedulingPolicy};
