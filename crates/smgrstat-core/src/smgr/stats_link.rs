//! Statistics-collecting link.
//!
//! Every handler forwards first and accounts afterwards, so failed I/O is
//! propagated unchanged and never counted. Latency is measured around the
//! forwarded call; the entry lock is taken only once it has returned.

use std::time::Instant;

use super::{AioHandle, AioResult, AioSlot, Next, Page, SmgrLink, SmgrRelation, SmgrResult};
use crate::backend::BackendContext;
use crate::seq::{BlockNumber, SeqResult};
use crate::store::{ForkNumber, INVALID_OID, ObjectKey, RelFileLocator, RelfileEvent, StatsEntry};

#[inline]
fn elapsed_micros(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

fn account_read(entry: &mut StatsEntry, nblocks: u64, elapsed_us: u64, seq: SeqResult, now: i64) {
    entry.reads += 1;
    entry.read_blocks += nblocks;
    if seq.is_sequential {
        entry.sequential_reads += 1;
    } else {
        entry.random_reads += 1;
    }
    if seq.completed_run > 0 {
        entry.read_runs.record(seq.completed_run as f64);
    }
    entry.read_timing.record(elapsed_us);
    entry.read_burst.record(now);
    entry.touch(now);
}

fn account_write(entry: &mut StatsEntry, nblocks: u64, elapsed_us: u64, seq: SeqResult, now: i64) {
    entry.writes += 1;
    entry.write_blocks += nblocks;
    if seq.is_sequential {
        entry.sequential_writes += 1;
    } else {
        entry.random_writes += 1;
    }
    if seq.completed_run > 0 {
        entry.write_runs.record(seq.completed_run as f64);
    }
    entry.write_timing.record(elapsed_us);
    entry.write_burst.record(now);
    entry.touch(now);
}

/// Link that accounts every storage call into the shared store.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatsLink;

impl StatsLink {
    pub fn new() -> Self {
        Self
    }

    /// Ensures the entry exists without recording anything.
    fn register(cx: &mut BackendContext, rel: &SmgrRelation, fork: ForkNumber) {
        if let Some(key) = cx.tracking_key(rel, fork) {
            cx.entry_for(&key).release();
        }
    }

    fn bump(
        cx: &mut BackendContext,
        rel: &SmgrRelation,
        fork: ForkNumber,
        update: impl FnOnce(&mut StatsEntry),
    ) {
        let Some(key) = cx.tracking_key(rel, fork) else {
            return;
        };
        let now = cx.shared.now_micros();
        let mut entry = cx.entry_for(&key);
        update(&mut *entry);
        entry.touch(now);
    }
}

impl SmgrLink for StatsLink {
    fn name(&self) -> &'static str {
        "smgr_stats"
    }

    fn open(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
    ) -> SmgrResult<()> {
        next.open(cx, rel)?;
        Self::register(cx, rel, ForkNumber::Main);
        Ok(())
    }

    fn create(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        old: RelFileLocator,
        rel: &SmgrRelation,
        fork: ForkNumber,
        is_redo: bool,
    ) -> SmgrResult<()> {
        next.create(cx, old, rel, fork, is_redo)?;

        if !rel.is_temp
            && old.rel_number != INVALID_OID
            && old.rel_number != rel.locator.rel_number
        {
            cx.shared.store.relfile_queue().enqueue(RelfileEvent {
                old,
                new: rel.locator,
                fork,
                is_redo,
            });
        }

        Self::register(cx, rel, fork);
        Ok(())
    }

    fn readv(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffers: &mut [Page],
    ) -> SmgrResult<()> {
        let start = Instant::now();
        next.readv(cx, rel, fork, block, buffers)?;

        let Some(key) = cx.tracking_key(rel, fork) else {
            return Ok(());
        };
        let elapsed_us = elapsed_micros(start);

        // Detection runs on the real key even when accounting is aggregated.
        let real = ObjectKey::new(rel.locator, fork);
        let nblocks = buffers.len() as BlockNumber;
        let seq = cx.seq.check(&real, block, nblocks, true);
        if key != real {
            cx.seq.account_under(&real, key);
        }

        let now = cx.shared.now_micros();
        let mut entry = cx.entry_for(&key);
        account_read(&mut entry, u64::from(nblocks), elapsed_us, seq, now);
        Ok(())
    }

    fn start_readv(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        handle: &AioHandle,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
    ) -> SmgrResult<()> {
        let Some(key) = cx.tracking_key(rel, fork) else {
            cx.aio.stage(handle.id).should_track = false;
            return next.start_readv(cx, handle, rel, fork, block);
        };

        // The completion callback may not allocate: create the entry now.
        cx.entry_for(&key).release();

        let real = ObjectKey::new(rel.locator, fork);
        let seq_result = cx.seq.check(&real, block, handle.nblocks, true);
        if key != real {
            cx.seq.account_under(&real, key);
        }
        *cx.aio.stage(handle.id) = AioSlot {
            start: Some(Instant::now()),
            seq_result,
            tracking_key: Some(key),
            should_track: true,
        };

        next.start_readv(cx, handle, rel, fork, block)
    }

    fn complete_readv(
        &mut self,
        cx: &mut BackendContext,
        handle: &AioHandle,
        prior: AioResult,
    ) -> AioResult {
        let Some(slot) = cx.aio.get(handle.id).copied() else {
            return prior;
        };
        let (true, Some(key)) = (slot.should_track, slot.tracking_key) else {
            return prior;
        };
        if !prior.is_ok() {
            // The failed read is not counted, but the run it closed at
            // submission is already gone from the detector.
            if slot.seq_result.completed_run > 0
                && let Some(mut entry) = cx.shared.store.find(&key)
            {
                entry.read_runs.record(slot.seq_result.completed_run as f64);
            }
            return prior;
        }

        let elapsed_us = slot.start.map_or(0, elapsed_micros);
        let now = cx.shared.now_micros();
        if let Some(mut entry) = cx.shared.store.find(&key) {
            account_read(
                &mut entry,
                u64::from(handle.nblocks),
                elapsed_us,
                slot.seq_result,
                now,
            );
        }
        prior
    }

    fn writev(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffers: &[Page],
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        let start = Instant::now();
        next.writev(cx, rel, fork, block, buffers, skip_fsync)?;

        let Some(key) = cx.tracking_key(rel, fork) else {
            return Ok(());
        };
        let elapsed_us = elapsed_micros(start);

        let real = ObjectKey::new(rel.locator, fork);
        let nblocks = buffers.len() as BlockNumber;
        let seq = cx.seq.check(&real, block, nblocks, false);
        if key != real {
            cx.seq.account_under(&real, key);
        }

        let now = cx.shared.now_micros();
        let mut entry = cx.entry_for(&key);
        account_write(&mut entry, u64::from(nblocks), elapsed_us, seq, now);
        Ok(())
    }

    fn extend(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &Page,
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        next.extend(cx, rel, fork, block, buffer, skip_fsync)?;
        Self::bump(cx, rel, fork, |e| {
            e.extends += 1;
            e.extend_blocks += 1;
        });
        Ok(())
    }

    fn zero_extend(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        block: BlockNumber,
        nblocks: BlockNumber,
        skip_fsync: bool,
    ) -> SmgrResult<()> {
        next.zero_extend(cx, rel, fork, block, nblocks, skip_fsync)?;
        Self::bump(cx, rel, fork, |e| {
            e.extends += 1;
            e.extend_blocks += u64::from(nblocks);
        });
        Ok(())
    }

    fn truncate(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
        old_nblocks: BlockNumber,
        nblocks: BlockNumber,
    ) -> SmgrResult<()> {
        next.truncate(cx, rel, fork, old_nblocks, nblocks)?;
        Self::bump(cx, rel, fork, |e| e.truncates += 1);
        Ok(())
    }

    fn immedsync(
        &mut self,
        cx: &mut BackendContext,
        next: Next<'_>,
        rel: &SmgrRelation,
        fork: ForkNumber,
    ) -> SmgrResult<()> {
        next.immedsync(cx, rel, fork)?;
        Self::bump(cx, rel, fork, |e| e.fsyncs += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Settings, TempTracking};
    use crate::metadata::{SessionState, StaticCatalog};
    use crate::shared::SharedStats;
    use crate::smgr::{BLOCK_SIZE, MemSmgr, MemStorage, SmgrChain, SmgrError};
    use std::sync::Arc;

    const DB: u32 = 5;

    fn setup(temp: TempTracking) -> (SmgrChain, BackendContext, Arc<ManualClock>) {
        let settings = Settings {
            track_temp_tables: temp,
            io_max_concurrency: 8,
            ..Settings::default()
        };
        let clock = Arc::new(ManualClock::new(1_700_000_000_000_000));
        let shared = SharedStats::with_clock(&settings, clock.clone());
        let cx = BackendContext::new(
            shared,
            SessionState::new(DB, 1663),
            Box::new(StaticCatalog::new()),
            settings.io_max_concurrency,
        );
        let chain = SmgrChain::new()
            .with(StatsLink::new())
            .with(MemSmgr::new(MemStorage::new()));
        (chain, cx, clock)
    }

    fn rel(n: u32) -> SmgrRelation {
        SmgrRelation::new(RelFileLocator::new(1663, DB, n))
    }

    fn pages(n: usize) -> Vec<Page> {
        vec![[0u8; BLOCK_SIZE]; n]
    }

    fn key(r: &SmgrRelation, fork: ForkNumber) -> ObjectKey {
        ObjectKey::new(r.locator, fork)
    }

    #[test]
    fn test_read_write_accounting() {
        let (mut chain, mut cx, clock) = setup(TempTracking::Aggregate);
        let r = rel(16384);
        let no_old = RelFileLocator::new(0, 0, 0);
        chain.create(&mut cx, no_old, &r, ForkNumber::Main, false).unwrap();
        chain
            .zero_extend(&mut cx, &r, ForkNumber::Main, 0, 8, false)
            .unwrap();

        chain
            .writev(&mut cx, &r, ForkNumber::Main, 0, &pages(2), false)
            .unwrap();
        clock.advance(2_000_000);
        let mut buf = pages(3);
        chain
            .readv(&mut cx, &r, ForkNumber::Main, 2, &mut buf)
            .unwrap();
        chain.immedsync(&mut cx, &r, ForkNumber::Main).unwrap();

        let e = cx.shared.store.find(&key(&r, ForkNumber::Main)).unwrap();
        assert_eq!(e.writes, 1);
        assert_eq!(e.write_blocks, 2);
        assert_eq!(e.reads, 1);
        assert_eq!(e.read_blocks, 3);
        assert_eq!(e.extends, 1);
        assert_eq!(e.extend_blocks, 8);
        assert_eq!(e.fsyncs, 1);
        assert_eq!(e.read_timing.count, 1);
        assert_eq!(e.write_timing.count, 1);
        assert_eq!(e.active_seconds, 2);
        assert!(e.last_access > e.first_access);
    }

    #[test]
    fn test_failed_io_is_propagated_and_not_counted() {
        let (mut chain, mut cx, _) = setup(TempTracking::Aggregate);
        let r = rel(16384);
        let mut buf = pages(1);
        let err = chain
            .readv(&mut cx, &r, ForkNumber::Main, 0, &mut buf)
            .unwrap_err();
        assert!(matches!(err, SmgrError::RelationNotFound { .. }));
        assert!(cx.shared.store.is_empty());
        assert!(cx.resolver.pending().is_empty());
    }

    #[test]
    fn test_new_entries_are_queued_for_metadata() {
        let (mut chain, mut cx, _) = setup(TempTracking::Aggregate);
        let r = rel(16384);
        chain.open(&mut cx, &r).unwrap();
        chain.open(&mut cx, &r).unwrap();
        assert_eq!(cx.resolver.pending(), &[key(&r, ForkNumber::Main)]);
        // Opening alone is not activity.
        assert!(cx.shared.store.snapshot(false).entries.is_empty());
    }

    #[test]
    fn test_create_enqueues_relfile_association() {
        let (mut chain, mut cx, _) = setup(TempTracking::Aggregate);
        let old = RelFileLocator::new(1663, DB, 16384);
        let r = rel(16400);
        chain.create(&mut cx, old, &r, ForkNumber::Main, false).unwrap();
        // Same relation number: no association.
        chain
            .create(&mut cx, r.locator, &r, ForkNumber::Fsm, false)
            .unwrap();
        // Temporary relations are skipped.
        let t = SmgrRelation::temp(RelFileLocator::new(1663, DB, 16500));
        chain.create(&mut cx, old, &t, ForkNumber::Main, false).unwrap();

        let assocs = cx.shared.store.relfile_queue().drain();
        assert_eq!(assocs.len(), 1);
        assert_eq!(assocs[0].old, old);
        assert_eq!(assocs[0].new, r.locator);
        assert!(assocs[0].identity.is_none());
    }

    #[test]
    fn test_temp_tracking_modes() {
        let t = SmgrRelation::temp(RelFileLocator::new(1663, DB, 16500));
        let no_old = RelFileLocator::new(0, 0, 0);

        let (mut chain, mut cx, _) = setup(TempTracking::Off);
        chain.create(&mut cx, no_old, &t, ForkNumber::Main, false).unwrap();
        chain
            .extend(&mut cx, &t, ForkNumber::Main, 0, &[0u8; BLOCK_SIZE], false)
            .unwrap();
        assert!(cx.shared.store.is_empty());

        let (mut chain, mut cx, _) = setup(TempTracking::Aggregate);
        chain.create(&mut cx, no_old, &t, ForkNumber::Main, false).unwrap();
        chain
            .extend(&mut cx, &t, ForkNumber::Main, 0, &[0u8; BLOCK_SIZE], false)
            .unwrap();
        let e = cx.shared.store.find(&ObjectKey::temp_aggregate(DB)).unwrap();
        assert_eq!(e.extends, 1);
        assert!(e.meta.valid);
        drop(e);
        assert!(cx.resolver.pending().is_empty());
        assert_eq!(cx.shared.store.len(), 1);

        let (mut chain, mut cx, _) = setup(TempTracking::Individual);
        chain.create(&mut cx, no_old, &t, ForkNumber::Main, false).unwrap();
        assert!(cx.shared.store.find(&key(&t, ForkNumber::Main)).is_some());
    }

    #[test]
    fn test_aggregate_mode_detects_runs_per_relation() {
        let (mut chain, mut cx, _) = setup(TempTracking::Aggregate);
        let no_old = RelFileLocator::new(0, 0, 0);
        let a = SmgrRelation::temp(RelFileLocator::new(1663, DB, 16500));
        let b = SmgrRelation::temp(RelFileLocator::new(1663, DB, 16501));
        for t in [&a, &b] {
            chain.create(&mut cx, no_old, t, ForkNumber::Main, false).unwrap();
            chain
                .zero_extend(&mut cx, t, ForkNumber::Main, 0, 4, false)
                .unwrap();
        }
        // Interleaved but each relation is read sequentially.
        for blk in 0..2 {
            for t in [&a, &b] {
                let mut buf = pages(1);
                chain
                    .readv(&mut cx, t, ForkNumber::Main, blk, &mut buf)
                    .unwrap();
            }
        }
        let e = cx.shared.store.find(&ObjectKey::temp_aggregate(DB)).unwrap();
        assert_eq!(e.reads, 4);
        assert_eq!(e.random_reads, 2);
        assert_eq!(e.sequential_reads, 2);
    }

    #[test]
    fn test_async_read_completion() {
        let (mut chain, mut cx, _) = setup(TempTracking::Aggregate);
        let r = rel(16384);
        let no_old = RelFileLocator::new(0, 0, 0);
        chain.create(&mut cx, no_old, &r, ForkNumber::Main, false).unwrap();
        chain
            .zero_extend(&mut cx, &r, ForkNumber::Main, 0, 16, false)
            .unwrap();

        let h1 = AioHandle { id: 3, nblocks: 4 };
        chain
            .start_readv(&mut cx, &h1, &r, ForkNumber::Main, 0)
            .unwrap();
        // Entry exists before completion; nothing counted yet.
        assert_eq!(cx.shared.store.find(&key(&r, ForkNumber::Main)).unwrap().reads, 0);
        assert_eq!(chain.complete_readv(&mut cx, &h1, AioResult::Ok), AioResult::Ok);

        let h2 = AioHandle { id: 4, nblocks: 4 };
        chain
            .start_readv(&mut cx, &h2, &r, ForkNumber::Main, 4)
            .unwrap();
        assert_eq!(
            chain.complete_readv(&mut cx, &h2, AioResult::Failed),
            AioResult::Failed
        );

        let e = cx.shared.store.find(&key(&r, ForkNumber::Main)).unwrap();
        assert_eq!(e.reads, 1);
        assert_eq!(e.read_blocks, 4);
        assert_eq!(e.random_reads, 1);
        assert_eq!(e.read_timing.count, 1);
    }

    #[test]
    fn test_failed_completion_keeps_closed_run() {
        let (mut chain, mut cx, _) = setup(TempTracking::Aggregate);
        let r = rel(16384);
        let no_old = RelFileLocator::new(0, 0, 0);
        chain.create(&mut cx, no_old, &r, ForkNumber::Main, false).unwrap();
        chain
            .zero_extend(&mut cx, &r, ForkNumber::Main, 0, 16, false)
            .unwrap();

        for blk in 0..3 {
            let mut buf = pages(1);
            chain
                .readv(&mut cx, &r, ForkNumber::Main, blk, &mut buf)
                .unwrap();
        }
        // Jumps away, closing the 3-block run, then fails.
        let h = AioHandle { id: 2, nblocks: 2 };
        chain
            .start_readv(&mut cx, &h, &r, ForkNumber::Main, 10)
            .unwrap();
        assert_eq!(
            chain.complete_readv(&mut cx, &h, AioResult::Failed),
            AioResult::Failed
        );

        let e = cx.shared.store.find(&key(&r, ForkNumber::Main)).unwrap();
        assert_eq!(e.reads, 3);
        assert_eq!(e.read_runs.count, 1);
        assert_eq!(e.read_runs.mean, 3.0);
    }

    #[test]
    fn test_aggregate_runs_flushed_into_temp_entry() {
        let (mut chain, mut cx, _) = setup(TempTracking::Aggregate);
        let no_old = RelFileLocator::new(0, 0, 0);
        let t = SmgrRelation::temp(RelFileLocator::new(1663, DB, 16500));
        chain.create(&mut cx, no_old, &t, ForkNumber::Main, false).unwrap();
        chain
            .zero_extend(&mut cx, &t, ForkNumber::Main, 0, 4, false)
            .unwrap();
        chain
            .writev(&mut cx, &t, ForkNumber::Main, 0, &pages(4), false)
            .unwrap();

        assert_eq!(cx.seq.flush_runs(&cx.shared.store), 1);
        let e = cx.shared.store.find(&ObjectKey::temp_aggregate(DB)).unwrap();
        assert_eq!(e.write_runs.count, 1);
        assert_eq!(e.write_runs.mean, 4.0);
    }
}
