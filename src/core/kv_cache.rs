//! KV-cache accounting seam.
//!
//! The scheduler never touches cache blocks itself; it asks a
//! [`KvCacheManager`] whether a group fits before admitting it and tells
//! the manager when sequences are freed. The default engine wiring uses
//! [`NoopKvCacheManager`], which never runs out of space, so scheduling
//! is bounded by the token and sequence budgets alone.

use crate::core::group::SequenceGroup;
use crate::core::sequence::SequenceId;
use crate::error::Result;

/// Answer to "can this group's KV cache be allocated right now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStatus {
    /// The group fits now.
    Ok,
    /// The group does not fit now but will once running sequences free
    /// their blocks.
    Later,
    /// The group can never fit, even against an empty cache.
    Never,
}

/// Block-space accounting for sequence KV caches.
///
/// `can_*` methods are pure queries; the scheduler may call them any
/// number of times before committing with `allocate`/`append_slots`.
pub trait KvCacheManager: std::fmt::Debug + Send {
    /// Check whether the prompt KV cache of `group` fits.
    fn can_allocate(&self, group: &SequenceGroup) -> AllocStatus;

    /// Reserve the prompt KV cache of `group`.
    fn allocate(&mut self, group: &SequenceGroup) -> Result<()>;

    /// Check whether every running sequence of `group` can grow by one
    /// decode slot.
    fn can_append_slots(&self, group: &SequenceGroup) -> bool;

    /// Reserve one decode slot for every running sequence of `group`.
    fn append_slots(&mut self, group: &SequenceGroup) -> Result<()>;

    /// Release everything held for a sequence.
    fn free(&mut self, seq_id: SequenceId);
}

/// Cache manager with unbounded space.
#[derive(Debug, Default)]
pub struct NoopKvCacheManager;

impl KvCacheManager for NoopKvCacheManager {
    fn can_allocate(&self, _group: &SequenceGroup) -> AllocStatus {
        AllocStatus::Ok
    }

    fn allocate(&mut self, _group: &SequenceGroup) -> Result<()> {
        Ok(())
    }

    fn can_append_slots(&self, _group: &SequenceGroup) -> bool {
        true
    }

    fn append_slots(&mut self, _group: &SequenceGroup) -> Result<()> {
        Ok(())
    }

    fn free(&mut self, _seq_id: SequenceId) {}
}
