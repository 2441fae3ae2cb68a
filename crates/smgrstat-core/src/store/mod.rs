//! Shared statistics store.
//!
//! One entry per [`ObjectKey`], each behind its own lock. The table is split
//! into partitions by key hash so inserts of unrelated keys don't contend:
//!
//! ```text
//! StatsStore
//!   ├── partitions[128]: RwLock<HashMap<ObjectKey, Arc<Mutex<StatsEntry>>>>
//!   ├── iteration: RwLock<()>      shared = copy, exclusive = copy + reset
//!   └── control: ControlBlock      bucket counter + relfile event queue
//! ```
//!
//! Callers hold at most one [`EntryGuard`] at a time and never across real
//! I/O or catalog access.

mod control;
mod entry;
mod key;
pub mod relfile_queue;

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use xxhash_rust::xxh3::xxh3_64;

pub use control::ControlBlock;
pub use entry::{Burstiness, EntryMetadata, RelKind, StatsEntry};
pub use key::{
    ForkNumber, INVALID_OID, ObjectKey, Oid, RelFileLocator, TEMP_AGGREGATE_REL_NUMBER,
};
pub use relfile_queue::{RELFILE_QUEUE_CAPACITY, RelfileAssoc, RelfileEvent, RelfileEventQueue};

const PARTITIONS: usize = 128;

type Slot = Arc<Mutex<StatsEntry>>;

/// Exclusively locked entry. The lock is released on drop.
pub struct EntryGuard {
    guard: ArcMutexGuard<RawMutex, StatsEntry>,
}

impl EntryGuard {
    fn lock(slot: Slot) -> Self {
        Self {
            guard: slot.lock_arc(),
        }
    }

    /// Releases the entry lock.
    pub fn release(self) {}
}

impl Deref for EntryGuard {
    type Target = StatsEntry;

    fn deref(&self) -> &StatsEntry {
        &self.guard
    }
}

impl DerefMut for EntryGuard {
    fn deref_mut(&mut self) -> &mut StatsEntry {
        &mut self.guard
    }
}

/// Result of [`StatsStore::snapshot`].
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    /// In-progress bucket for a plain snapshot, the just-closed bucket for a
    /// destructive one.
    pub bucket_id: u64,
    /// Entries with activity in the period. Order is unspecified.
    pub entries: Vec<StatsEntry>,
}

/// Concurrent keyed table of [`StatsEntry`].
pub struct StatsStore {
    partitions: Box<[RwLock<HashMap<ObjectKey, Slot>>]>,
    iteration: RwLock<()>,
    control: ControlBlock,
}

impl Default for StatsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsStore {
    pub fn new() -> Self {
        let partitions = (0..PARTITIONS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            partitions,
            iteration: RwLock::new(()),
            control: ControlBlock::new(),
        }
    }

    fn partition(&self, key: &ObjectKey) -> &RwLock<HashMap<ObjectKey, Slot>> {
        let hash = xxh3_64(&key.to_bytes());
        &self.partitions[(hash as usize) & (PARTITIONS - 1)]
    }

    pub fn control(&self) -> &ControlBlock {
        &self.control
    }

    pub fn relfile_queue(&self) -> &RelfileEventQueue {
        &self.control.relfile_queue
    }

    /// Returns the locked entry for `key`, creating it zeroed if absent.
    /// The flag is true when this call created the entry.
    pub fn get_or_create(&self, key: &ObjectKey) -> (EntryGuard, bool) {
        let part = self.partition(key);

        let existing = part.read().get(key).cloned();
        if let Some(slot) = existing {
            return (EntryGuard::lock(slot), false);
        }

        let mut created = false;
        let slot = {
            let mut map = part.write();
            map.entry(*key)
                .or_insert_with(|| {
                    created = true;
                    Arc::new(Mutex::new(StatsEntry::new(*key)))
                })
                .clone()
        };
        (EntryGuard::lock(slot), created)
    }

    /// Locked lookup without insertion.
    pub fn find(&self, key: &ObjectKey) -> Option<EntryGuard> {
        let slot = self.partition(key).read().get(key).cloned()?;
        Some(EntryGuard::lock(slot))
    }

    pub fn release(&self, guard: EntryGuard) {
        guard.release();
    }

    /// Number of entries ever created (entries are never removed).
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies every active entry. A destructive snapshot also resets each
    /// entry in place and closes the current bucket.
    pub fn snapshot(&self, destructive: bool) -> StoreSnapshot {
        if destructive {
            let _iter = self.iteration.write();
            let bucket_id = self.control.advance_bucket();
            let entries = self.collect(true);
            StoreSnapshot { bucket_id, entries }
        } else {
            let _iter = self.iteration.read();
            let bucket_id = self.control.current_bucket();
            let entries = self.collect(false);
            StoreSnapshot { bucket_id, entries }
        }
    }

    fn collect(&self, reset: bool) -> Vec<StatsEntry> {
        let mut result = Vec::with_capacity(64);
        for part in self.partitions.iter() {
            // Clone the slot handles so the partition lock isn't held while
            // waiting on entry locks.
            let slots: Vec<Slot> = part.read().values().cloned().collect();
            for slot in slots {
                let mut entry = slot.lock();
                if !entry.has_activity() {
                    continue;
                }
                result.push(entry.clone());
                if reset {
                    entry.reset();
                }
            }
        }
        result
    }
}
