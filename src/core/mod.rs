//! Core request model.
//!
//! This module contains the fundamental building blocks:
//! - Sequence for token-stream tracking
//! - SequenceGroup for request-level grouping
//! - KvCacheManager for cache-space accounting

pub mod group;
pub mod kv_cache;
pub mod sequence;
