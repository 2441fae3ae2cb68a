//! Per-backend sequential access detection.
//!
//! An access is sequential when it starts right after the last block touched
//! in the same direction on the same key. A non-contiguous access closes the
//! current run and reports its length so the caller can record it.

use std::collections::HashMap;

use crate::store::{ObjectKey, StatsStore};

/// Block number within a fork.
pub type BlockNumber = u32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqResult {
    pub is_sequential: bool,
    /// Length in blocks of the run this access closed, 0 if none.
    pub completed_run: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Direction {
    last_block: Option<BlockNumber>,
    current_run: u64,
}

impl Direction {
    fn check(&mut self, block: BlockNumber, nblocks: BlockNumber) -> SeqResult {
        let mut result = SeqResult::default();
        let contiguous = self
            .last_block
            .is_some_and(|last| last.checked_add(1) == Some(block));
        if contiguous {
            result.is_sequential = true;
            self.current_run += u64::from(nblocks);
        } else {
            result.completed_run = self.current_run;
            self.current_run = u64::from(nblocks);
        }
        self.last_block = Some(block.wrapping_add(nblocks).wrapping_sub(1));
        result
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LocalPattern {
    read: Direction,
    write: Direction,
    /// Entry the open runs are flushed into when it differs from the key.
    account_key: Option<ObjectKey>,
}

#[derive(Debug, Default)]
pub struct SequentialRunDetector {
    patterns: HashMap<ObjectKey, LocalPattern>,
}

impl SequentialRunDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies one access of `nblocks` blocks starting at `block`.
    pub fn check(
        &mut self,
        key: &ObjectKey,
        block: BlockNumber,
        nblocks: BlockNumber,
        is_read: bool,
    ) -> SeqResult {
        let pattern = self.patterns.entry(*key).or_default();
        if is_read {
            pattern.read.check(block, nblocks)
        } else {
            pattern.write.check(block, nblocks)
        }
    }

    /// Routes the open runs of `key` into `target` at flush time. Used when
    /// several keys are accounted under one aggregate entry.
    pub fn account_under(&mut self, key: &ObjectKey, target: ObjectKey) {
        if let Some(pattern) = self.patterns.get_mut(key) {
            pattern.account_key = Some(target);
        }
    }

    /// Number of keys with cached state.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Records every open run into its entry's run-length stats and clears the
    /// cache. Keys without an entry are skipped. Returns the number of runs
    /// recorded.
    pub fn flush_runs(&mut self, store: &StatsStore) -> usize {
        let mut flushed = 0;
        for (key, pattern) in self.patterns.drain() {
            let read_run = pattern.read.current_run;
            let write_run = pattern.write.current_run;
            if read_run == 0 && write_run == 0 {
                continue;
            }
            let target = pattern.account_key.unwrap_or(key);
            let Some(mut entry) = store.find(&target) else {
                continue;
            };
            if read_run > 0 {
                entry.read_runs.record(read_run as f64);
                flushed += 1;
            }
            if write_run > 0 {
                entry.write_runs.record(write_run as f64);
                flushed += 1;
            }
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ForkNumber, RelFileLocator};

    fn key(rel: u32) -> ObjectKey {
        ObjectKey::new(RelFileLocator::new(1663, 5, rel), ForkNumber::Main)
    }

    #[test]
    fn test_contiguous_blocks_form_one_run() {
        let mut d = SequentialRunDetector::new();
        let k = key(1);

        let r0 = d.check(&k, 0, 1, true);
        assert!(!r0.is_sequential);
        assert_eq!(r0.completed_run, 0);

        let r1 = d.check(&k, 1, 1, true);
        let r2 = d.check(&k, 2, 1, true);
        assert!(r1.is_sequential && r2.is_sequential);
        assert_eq!(r1.completed_run, 0);
        assert_eq!(r2.completed_run, 0);

        let r3 = d.check(&k, 100, 1, true);
        assert!(!r3.is_sequential);
        assert_eq!(r3.completed_run, 3);
    }

    #[test]
    fn test_multi_block_accesses() {
        let mut d = SequentialRunDetector::new();
        let k = key(1);
        d.check(&k, 10, 4, false);
        // 10..=13 written, next contiguous start is 14.
        let r = d.check(&k, 14, 2, false);
        assert!(r.is_sequential);
        let r = d.check(&k, 0, 1, false);
        assert_eq!(r.completed_run, 6);
    }

    #[test]
    fn test_directions_and_keys_are_independent() {
        let mut d = SequentialRunDetector::new();
        d.check(&key(1), 0, 1, true);
        assert!(!d.check(&key(1), 1, 1, false).is_sequential);
        assert!(!d.check(&key(2), 1, 1, true).is_sequential);
        assert!(d.check(&key(1), 1, 1, true).is_sequential);
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_repeated_block_is_random() {
        let mut d = SequentialRunDetector::new();
        let k = key(1);
        d.check(&k, 5, 1, true);
        let r = d.check(&k, 5, 1, true);
        assert!(!r.is_sequential);
        assert_eq!(r.completed_run, 1);
    }

    #[test]
    fn test_flush_records_open_runs() {
        let store = StatsStore::new();
        let mut d = SequentialRunDetector::new();
        let k = key(1);
        drop(store.get_or_create(&k));

        d.check(&k, 0, 1, true);
        d.check(&k, 1, 1, true);
        d.check(&k, 7, 3, false);
        // No entry for this one: skipped.
        d.check(&key(9), 0, 1, true);

        assert_eq!(d.flush_runs(&store), 2);
        assert!(d.is_empty());

        let e = store.find(&k).unwrap();
        assert_eq!(e.read_runs.count, 1);
        assert_eq!(e.read_runs.mean, 2.0);
        assert_eq!(e.write_runs.count, 1);
        assert_eq!(e.write_runs.mean, 3.0);
    }

    #[test]
    fn test_flush_routes_runs_to_account_key() {
        let store = StatsStore::new();
        let mut d = SequentialRunDetector::new();
        let agg = ObjectKey::temp_aggregate(5);
        drop(store.get_or_create(&agg));

        d.check(&key(1), 0, 2, true);
        d.check(&key(2), 0, 1, true);
        d.check(&key(2), 1, 1, true);
        d.account_under(&key(1), agg);
        d.account_under(&key(2), agg);
        // Unknown keys are ignored.
        d.account_under(&key(3), agg);

        assert_eq!(d.flush_runs(&store), 2);
        assert!(store.find(&key(1)).is_none());
        let e = store.find(&agg).unwrap();
        assert_eq!(e.read_runs.count, 2);
        assert_eq!(e.read_runs.mean, 2.0);
    }
}
