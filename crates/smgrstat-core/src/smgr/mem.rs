//! In-memory terminal storage manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    AioHandle, BLOCK_SIZE, Next, Page, SmgrError, SmgrLink, SmgrRelation, SmgrResult,
};
use crate::backend::BackendContext;
use crate::seq::BlockNumber;
use crate::store::{ForkNumber, RelFileLocator};

type ForkId = (RelFileLocator, ForkNumber);

/// Block storage shared by every backend's [`MemSmgr`].
#[derive(Debug, Default)]
pub struct MemStorage {
    forks: Mutex<HashMap<ForkId, Vec<Page>>>,
    /// Added to every read and write to give histograms something to show.
    latency: Duration,
}

impl MemStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Self::default()
        })
    }

    pub fn exists(&self, locator: RelFileLocator, fork: ForkNumber) -> bool {
        self.forks.lock().contains_key(&(locator, fork))
    }

    pub fn nblocks(&self, locator: RelFileLocator, fork: ForkNumber) -> Option<BlockNumber> {
        self.forks
            .lock()
            .get(&(locator, fork))
            .map(|pages| pages.len() as BlockNumber)
    }

    fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
    }

    fn with_fork<T>(
        &self,
        locator: RelFileLocator,
        fork: ForkNumber,
        f: impl FnOnce(&mut Vec<Page>) -> SmgrResult<T>,
    ) -> SmgrResult<T> {
        let mut forks = self.forks.lock();
        let pages = forks
            .get_mut(&(locator, fork))
            .ok_or(SmgrError::RelationNotFound { locator, fork })?;
        f(pages)
    }

    fn check_range(
        pages: &[Page],
        locator: RelFileLocator,
        fork: ForkNumber,
        block: BlockNumber,
        count: usize,
    ) -> SmgrResult<()> {
        let end = block as usize + count;
        if end > pages.len() {
            return Err(SmgrError::BeyondEof {
                locator,
                fork,
                block: block + count.saturating_sub(1) as BlockNumber,
                nblocks: pages.len() as BlockNumber,
            });
        }
        Ok(())
    }
}

/// Terminal link performing I/O against a [`MemStorage`].
pub struct MemSmgr {
    storage: Arc<MemStorage>,
}

impl MemSmgr {
    pub fn new(storage: Arc<MemStorage>) -> Self {
        Self { storage }
    }
}

impl SmgrLink for MemSmgr {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn open(
        &mut self,
        _cx: &mut BackendContext,
        _next: Next<'_>,
        _rel: &SmgrRelation,
    ) -> SmgrResult<()> {
        Ok(())
    }

    fn create(
        &mut self,
        _cx: &mut BackendContext,
        _next: Next<'_>,
        _old: RelFileLocator,
        rel: &SmgrRelation,
        fork: ForkNumber,
        _is_redo: bool,
    ) -> SmgrResult<()> {
        self.storage
            .forks
            .lock()
            .entry((rel.locator, fork))
            .or_default();
        Ok(())
    }

    fn readv(
        &mut self,
        _cx: &mut BackendContext,
        _next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffers: &mut [Page],
    ) -> SmgrResult<()> {
        self.storage.simulate_latency();
        self.storage.with_fork(rel.locator, fork, |pages| {
            MemStorage::check_range(pages, rel.locator, fork, block, buffers.len())?;
            let start = block as usize;
            buffers.copy_from_slice(&pages[start..start + buffers.len()]);
            Ok(())
        })
    }

    fn start_readv(
        &mut self,
        _cx: &mut BackendContext,
        _next: Next<'_>,
        handle: &AioHandle,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
    ) -> SmgrResult<()> {
        self.storage.with_fork(rel.locator, fork, |pages| {
            MemStorage::check_range(pages, rel.locator, fork, block, handle.nblocks as usize)
        })
    }

    fn writev(
        &mut self,
        _cx: &mut BackendContext,
        _next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffers: &[Page],
        _skip_fsync: bool,
    ) -> SmgrResult<()> {
        self.storage.simulate_latency();
        self.storage.with_fork(rel.locator, fork, |pages| {
            MemStorage::check_range(pages, rel.locator, fork, block, buffers.len())?;
            let start = block as usize;
            pages[start..start + buffers.len()].copy_from_slice(buffers);
            Ok(())
        })
    }

    fn extend(
        &mut self,
        _cx: &mut BackendContext,
        _next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &Page,
        _skip_fsync: bool,
    ) -> SmgrResult<()> {
        self.storage.with_fork(rel.locator, fork, |pages| {
            let idx = block as usize;
            if pages.len() <= idx {
                pages.resize(idx + 1, [0u8; BLOCK_SIZE]);
            }
            pages[idx] = *buffer;
            Ok(())
        })
    }

    fn zero_extend(
        &mut self,
        _cx: &mut BackendContext,
        _next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        nblocks: BlockNumber,
        _skip_fsync: bool,
    ) -> SmgrResult<()> {
        self.storage.with_fork(rel.locator, fork, |pages| {
            let end = block as usize + nblocks as usize;
            if pages.len() < end {
                pages.resize(end, [0u8; BLOCK_SIZE]);
            }
            Ok(())
        })
    }

    fn truncate(
        &mut self,
        _cx: &mut BackendContext,
        _next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        _old_nblocks: BlockNumber,
        nblocks: BlockNumber,
    ) -> SmgrResult<()> {
        self.storage.with_fork(rel.locator, fork, |pages| {
            pages.truncate(nblocks as usize);
            Ok(())
        })
    }

    fn immedsync(
        &mut self,
        _cx: &mut BackendContext,
        _next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
    ) -> SmgrResult<()> {
        self.storage.with_fork(rel.locator, fork, |_| Ok(()))
    }
}
