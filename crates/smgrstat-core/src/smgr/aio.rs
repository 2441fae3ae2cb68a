//! Per-backend staging for asynchronous reads.
//!
//! State is staged at submission into a fixed array indexed by
//! `handle_id % io_max_concurrency`, so the completion callback needs no
//! allocation or lookup. Two in-flight reads mapping to the same slot
//! alias; the later submission wins.

use std::time::Instant;

use crate::seq::{BlockNumber, SeqResult};
use crate::store::ObjectKey;

/// Submitted asynchronous read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AioHandle {
    pub id: u64,
    pub nblocks: BlockNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioResult {
    Ok,
    /// Fewer blocks than requested were read.
    Partial(BlockNumber),
    Failed,
}

impl AioResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, AioResult::Ok)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AioSlot {
    pub start: Option<Instant>,
    pub seq_result: SeqResult,
    pub tracking_key: Option<ObjectKey>,
    pub should_track: bool,
}

#[derive(Debug)]
pub struct AioSlots {
    capacity: usize,
    slots: Vec<AioSlot>,
}

impl AioSlots {
    pub fn new(io_max_concurrency: usize) -> Self {
        Self {
            capacity: io_max_concurrency.max(1),
            slots: Vec::new(),
        }
    }

    fn index(&self, handle_id: u64) -> usize {
        (handle_id % self.capacity as u64) as usize
    }

    /// Slot for a submission. Allocates the array on first use.
    pub fn stage(&mut self, handle_id: u64) -> &mut AioSlot {
        if self.slots.is_empty() {
            self.slots = vec![AioSlot::default(); self.capacity];
        }
        let idx = self.index(handle_id);
        &mut self.slots[idx]
    }

    /// Slot for a completion. `None` before any submission.
    pub fn get(&self, handle_id: u64) -> Option<&AioSlot> {
        self.slots.get(self.index(handle_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_alias_by_modulo() {
        let mut slots = AioSlots::new(4);
        assert!(slots.get(1).is_none());

        slots.stage(1).should_track = true;
        assert!(slots.get(1).unwrap().should_track);
        assert!(slots.get(5).unwrap().should_track);
        assert!(!slots.get(2).unwrap().should_track);

        slots.stage(5).should_track = false;
        assert!(!slots.get(1).unwrap().should_track);
    }

    #[test]
    fn test_result_is_ok() {
        assert!(AioResult::Ok.is_ok());
        assert!(!AioResult::Partial(1).is_ok());
        assert!(!AioResult::Failed.is_ok());
    }
}
