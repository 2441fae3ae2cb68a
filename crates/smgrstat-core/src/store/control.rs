use std::sync::atomic::{AtomicU64, Ordering};

use super::relfile_queue::RelfileEventQueue;

/// Shared control state next to the entry table.
pub struct ControlBlock {
    bucket_id: AtomicU64,
    pub relfile_queue: RelfileEventQueue,
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBlock {
    pub fn new() -> Self {
        Self {
            bucket_id: AtomicU64::new(1),
            relfile_queue: RelfileEventQueue::new(),
        }
    }

    /// Bucket currently accumulating.
    pub fn current_bucket(&self) -> u64 {
        self.bucket_id.load(Ordering::Acquire)
    }

    /// Closes the current bucket and returns its id.
    pub(crate) fn advance_bucket(&self) -> u64 {
        self.bucket_id.fetch_add(1, Ordering::AcqRel)
    }
}
