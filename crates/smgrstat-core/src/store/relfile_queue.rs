//! Multi-producer, single-consumer ring of relfile association events.
//!
//! Head and tail are monotonic counters; the slot index is `pos & MASK`.
//! Each slot carries a publication stamp (`pos + 1`) written after the
//! event, so the consumer stops at a slot that was claimed but not yet
//! filled and picks it up on the next drain. One slot is always kept free,
//! so the ring holds at most `RELFILE_QUEUE_CAPACITY - 1` events.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::entry::EntryMetadata;
use super::key::{ForkNumber, RelFileLocator};

/// Ring size. Must stay a power of two.
pub const RELFILE_QUEUE_CAPACITY: usize = 1024;

const MASK: u64 = RELFILE_QUEUE_CAPACITY as u64 - 1;

const _: () = assert!(RELFILE_QUEUE_CAPACITY.is_power_of_two());

/// Raw event as stored in the ring. No catalog identity: producers run on
/// the storage hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelfileEvent {
    pub old: RelFileLocator,
    pub new: RelFileLocator,
    pub fork: ForkNumber,
    pub is_redo: bool,
}

/// Relation storage moved from `old` to `new` (rewrite, truncate-by-swap,
/// cluster and friends).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelfileAssoc {
    pub old: RelFileLocator,
    pub new: RelFileLocator,
    pub fork: ForkNumber,
    pub is_redo: bool,
    /// Never filled by the queue; left for downstream consumers.
    pub identity: Option<EntryMetadata>,
}

impl From<RelfileEvent> for RelfileAssoc {
    fn from(ev: RelfileEvent) -> Self {
        Self {
            old: ev.old,
            new: ev.new,
            fork: ev.fork,
            is_redo: ev.is_redo,
            identity: None,
        }
    }
}

struct Slot {
    stamp: AtomicU64,
    event: UnsafeCell<MaybeUninit<RelfileEvent>>,
}

pub struct RelfileEventQueue {
    head: AtomicU64,
    tail: AtomicU64,
    dropped: AtomicU64,
    consumer: Mutex<()>,
    slots: Box<[Slot]>,
}

// Slot contents are written only by the producer that claimed the position
// and read only by the consumer after observing the stamp.
unsafe impl Sync for RelfileEventQueue {}

impl Default for RelfileEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RelfileEventQueue {
    pub fn new() -> Self {
        let slots = (0..RELFILE_QUEUE_CAPACITY)
            .map(|_| Slot {
                stamp: AtomicU64::new(0),
                event: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            consumer: Mutex::new(()),
            slots,
        }
    }

    /// Appends an event. Returns false (and drops it) when the ring is full.
    /// Never blocks.
    pub fn enqueue(&self, event: RelfileEvent) -> bool {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) >= MASK {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    old = %event.old,
                    new = %event.new,
                    fork = event.fork.name(),
                    "relfile association queue full, dropping entry"
                );
                return false;
            }
            match self.head.compare_exchange_weak(
                head,
                head + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        let slot = &self.slots[(head & MASK) as usize];
        // SAFETY: position `head` is owned by this producer until the stamp
        // is published; the previous occupant was consumed before tail
        // passed it, which the fullness check above observed.
        unsafe {
            (*slot.event.get()).write(event);
        }
        slot.stamp.store(head + 1, Ordering::Release);
        true
    }

    /// Removes every published event, oldest first.
    pub fn drain(&self) -> Vec<RelfileAssoc> {
        let _consumer = self.consumer.lock();
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);

        let mut out = Vec::with_capacity(head.wrapping_sub(tail) as usize);
        let mut pos = tail;
        while pos < head {
            let slot = &self.slots[(pos & MASK) as usize];
            if slot.stamp.load(Ordering::Acquire) != pos + 1 {
                break;
            }
            // SAFETY: the stamp was published after the write completed.
            let event = unsafe { (*slot.event.get()).assume_init_read() };
            out.push(event.into());
            pos += 1;
        }

        self.tail.store(pos, Ordering::Release);
        out
    }

    /// Events currently claimed but not yet drained.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events discarded because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
