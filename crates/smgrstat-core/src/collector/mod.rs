//! Periodic drain of the shared statistics into durable history.
//!
//! One cycle:
//! 1. destructive snapshot (closes the bucket, resets live entries)
//! 2. inline metadata resolution for entries of the collector's database
//! 3. drain of the relfile association queue
//! 4. persistence through a [`HistorySink`]
//! 5. retention
//!
//! A failed write is logged and the cycle's data is gone; live entries were
//! already reset in step 1.

pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::metadata::{
    CatalogLookup, LookupOutcome, SessionState, apply_if_unresolved, lookup_metadata,
};
use crate::shared::SharedStats;
use crate::storage::{BucketRecord, HistorySink, RelfileRecord};
use crate::store::{
    EntryMetadata, INVALID_OID, ObjectKey, RelFileLocator, RelfileAssoc, StatsEntry,
};

pub use worker::{
    CollectorHandle, StartPhase, WorkerFlags, WorkerRegistration, WorkerSignal, spawn_collector,
};

/// Summary of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub bucket_id: u64,
    pub entries: usize,
    /// Entries that received an identity during this cycle.
    pub resolved: usize,
    pub relfile_events: usize,
    /// False if any write of this cycle failed.
    pub persisted: bool,
}

pub struct Collector {
    shared: Arc<SharedStats>,
    session: SessionState,
    catalog: Box<dyn CatalogLookup>,
    sink: Box<dyn HistorySink>,
}

impl Collector {
    /// `session` describes the database the collector is connected to.
    pub fn new(
        shared: Arc<SharedStats>,
        session: SessionState,
        catalog: Box<dyn CatalogLookup>,
        sink: Box<dyn HistorySink>,
    ) -> Self {
        Self {
            shared,
            session,
            catalog,
            sink,
        }
    }

    pub fn run_cycle(&mut self) -> CycleReport {
        let mut snapshot = self.shared.store.snapshot(true);

        self.session.in_transaction = true;
        let resolved = self.resolve_inline(&mut snapshot.entries);
        self.session.in_transaction = false;

        let assocs = self.drain_relfile_queue();
        let collected_at = self.shared.now_micros();

        let mut report = CycleReport {
            bucket_id: snapshot.bucket_id,
            entries: snapshot.entries.len(),
            resolved,
            relfile_events: assocs.len(),
            persisted: true,
        };

        if !snapshot.entries.is_empty() {
            let record = BucketRecord {
                bucket_id: snapshot.bucket_id,
                collected_at,
                entries: snapshot.entries,
            };
            if let Err(e) = self.sink.persist_bucket(&record) {
                error!(
                    bucket = record.bucket_id,
                    error = %e,
                    "failed to persist bucket, data lost"
                );
                report.persisted = false;
            }
        }

        if !assocs.is_empty() {
            let record = RelfileRecord {
                bucket_id: snapshot.bucket_id,
                collected_at,
                assocs,
            };
            if let Err(e) = self.sink.persist_relfile(&record) {
                error!(
                    bucket = record.bucket_id,
                    error = %e,
                    "failed to persist relfile associations, data lost"
                );
                report.persisted = false;
            }
        }

        self.apply_retention(collected_at);

        info!(
            bucket = report.bucket_id,
            entries = report.entries,
            resolved = report.resolved,
            relfile_events = report.relfile_events,
            "collection cycle complete"
        );
        report
    }

    /// Resolves unresolved snapshot entries that belong to the collector's
    /// database or are shared. Updates both the snapshot copy and the live
    /// entry, then copies the identity to other forks of the same relation
    /// in the snapshot.
    fn resolve_inline(&mut self, entries: &mut [StatsEntry]) -> usize {
        let mut found: HashMap<RelFileLocator, EntryMetadata> = HashMap::new();
        let mut resolved = 0;

        for entry in entries.iter_mut() {
            let db = entry.key.locator.db_oid;
            if entry.meta.valid || (db != INVALID_OID && db != self.session.database_oid) {
                continue;
            }
            if let Some(meta) = found.get(&entry.key.locator) {
                entry.meta = meta.clone();
                resolved += 1;
                continue;
            }

            // A backend may have resolved it since the snapshot was taken.
            let live = self
                .shared
                .store
                .find(&entry.key)
                .filter(|e| e.meta.valid)
                .map(|e| e.meta.clone());
            let meta = match live {
                Some(meta) => meta,
                None => match lookup_metadata(self.catalog.as_mut(), &self.session, &entry.key) {
                    LookupOutcome::Resolved(meta) => {
                        apply_if_unresolved(&self.shared.store, &entry.key, &meta);
                        meta
                    }
                    LookupOutcome::Failed(e) => {
                        debug!(key = %entry.key, error = %e, "collector metadata lookup failed");
                        continue;
                    }
                    LookupOutcome::NotFound | LookupOutcome::Refused(_) => continue,
                },
            };
            entry.meta = meta.clone();
            found.insert(entry.key.locator, meta);
            resolved += 1;
        }

        // Forks visited before their relation was resolved.
        for entry in entries.iter_mut() {
            if !entry.meta.valid
                && let Some(meta) = found.get(&entry.key.locator)
            {
                entry.meta = meta.clone();
                resolved += 1;
            }
        }
        resolved
    }

    /// Drains queued associations and attaches the identity of the old
    /// relation where it is known.
    fn drain_relfile_queue(&self) -> Vec<RelfileAssoc> {
        let queue = self.shared.store.relfile_queue();
        let dropped = queue.dropped();
        if dropped > 0 {
            debug!(dropped, "relfile events dropped since startup");
        }

        let mut assocs = queue.drain();
        for assoc in assocs.iter_mut() {
            let key = ObjectKey::new(assoc.old, assoc.fork);
            if let Some(entry) = self.shared.store.find(&key)
                && entry.meta.valid
            {
                assoc.identity = Some(entry.meta.clone());
            }
        }
        assocs
    }

    fn apply_retention(&mut self, collected_at: i64) {
        let hours = self.shared.tunables.retention_hours();
        if hours == 0 {
            return;
        }
        let now = DateTime::from_timestamp_micros(collected_at).unwrap_or_else(Utc::now);
        match self.sink.apply_retention(hours, now) {
            Ok(result) if result.files_removed > 0 => info!(
                removed = result.files_removed,
                bytes_freed = result.bytes_freed,
                remaining = result.files_remaining,
                "history retention applied"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "history retention failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Settings;
    use crate::metadata::{StaticCatalog, StaticRelation};
    use crate::storage::{
        HistoryStore, RotationResult, SegmentKind, StorageError, read_bucket, read_relfile,
    };
    use crate::store::{ForkNumber, RelKind, RelfileEvent};
    use tempfile::tempdir;

    const DB: u32 = 5;
    const START: i64 = 1_790_000_000_000_000;

    fn catalog() -> StaticCatalog {
        let mut cat = StaticCatalog::new();
        cat.add_relation(
            0,
            16384,
            StaticRelation {
                reloid: 16384,
                main_reloid: 0,
                relkind: RelKind::Table,
                relname: "accounts".into(),
                nsp_oid: 2200,
            },
        );
        cat
    }

    fn key(db: u32, rel: u32, fork: ForkNumber) -> ObjectKey {
        ObjectKey::new(RelFileLocator::new(1663, db, rel), fork)
    }

    fn touch(shared: &SharedStats, k: &ObjectKey) {
        let (mut e, _) = shared.store.get_or_create(k);
        e.reads += 1;
        e.touch(shared.now_micros());
    }

    struct FailingSink;

    impl HistorySink for FailingSink {
        fn persist_bucket(&mut self, _: &BucketRecord) -> Result<(), StorageError> {
            Err(StorageError::Corrupt("disk full".into()))
        }

        fn persist_relfile(&mut self, _: &RelfileRecord) -> Result<(), StorageError> {
            Err(StorageError::Corrupt("disk full".into()))
        }

        fn apply_retention(
            &mut self,
            _: u32,
            _: DateTime<Utc>,
        ) -> Result<RotationResult, StorageError> {
            Ok(RotationResult::default())
        }
    }

    #[test]
    fn test_cycle_persists_and_resets() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let shared = SharedStats::with_clock(&Settings::default(), clock);
        let mut collector = Collector::new(
            shared.clone(),
            SessionState::new(DB, 1663),
            Box::new(catalog()),
            Box::new(HistoryStore::new(dir.path()).unwrap()),
        );

        let main = key(DB, 16384, ForkNumber::Main);
        let fsm = key(DB, 16384, ForkNumber::Fsm);
        let foreign = key(9, 16384, ForkNumber::Main);
        touch(&shared, &fsm);
        touch(&shared, &main);
        touch(&shared, &foreign);
        shared.store.relfile_queue().enqueue(RelfileEvent {
            old: main.locator,
            new: RelFileLocator::new(1663, DB, 16400),
            fork: ForkNumber::Main,
            is_redo: false,
        });

        let report = collector.run_cycle();
        assert_eq!(report.bucket_id, 1);
        assert_eq!(report.entries, 3);
        assert_eq!(report.resolved, 2);
        assert_eq!(report.relfile_events, 1);
        assert!(report.persisted);

        // Live entries were reset but kept their identity.
        let live = shared.store.find(&main).unwrap();
        assert_eq!(live.reads, 0);
        assert!(live.meta.valid);
        drop(live);
        assert!(!shared.store.find(&foreign).unwrap().meta.valid);

        let files = HistoryStore::new(dir.path()).unwrap().list_segments().unwrap();
        assert_eq!(files.len(), 2);
        let bucket = read_bucket(&files[0].path).unwrap();
        assert_eq!(bucket.bucket_id, 1);
        assert_eq!(bucket.collected_at, START);
        let named = bucket
            .entries
            .iter()
            .filter(|e| e.meta.relname == "accounts")
            .count();
        assert_eq!(named, 2);

        assert_eq!(files[1].kind, SegmentKind::Relfile);
        let rel = read_relfile(&files[1].path).unwrap();
        assert_eq!(rel.assocs[0].identity.as_ref().unwrap().relname, "accounts");

        // Nothing happened since: the next bucket is empty and not written.
        let report = collector.run_cycle();
        assert_eq!(report.bucket_id, 2);
        assert_eq!(report.entries, 0);
        let files = HistoryStore::new(dir.path()).unwrap().list_segments().unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_persistence_failure_loses_data() {
        let shared = SharedStats::new(&Settings::default());
        let mut collector = Collector::new(
            shared.clone(),
            SessionState::new(DB, 1663),
            Box::new(catalog()),
            Box::new(FailingSink),
        );
        let k = key(DB, 16384, ForkNumber::Main);
        touch(&shared, &k);

        let report = collector.run_cycle();
        assert!(!report.persisted);
        assert_eq!(report.entries, 1);

        // The period is closed regardless.
        assert_eq!(shared.store.find(&k).unwrap().reads, 0);
        assert_eq!(collector.run_cycle().entries, 0);
    }

    #[test]
    fn test_retention_uses_tunables() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let settings = Settings {
            retention_hours: 1,
            ..Settings::default()
        };
        let shared = SharedStats::with_clock(&settings, clock.clone());
        let mut collector = Collector::new(
            shared.clone(),
            SessionState::new(DB, 1663),
            Box::new(StaticCatalog::new()),
            Box::new(HistoryStore::new(dir.path()).unwrap()),
        );

        touch(&shared, &key(DB, 1, ForkNumber::Main));
        collector.run_cycle();
        clock.advance(2 * 3600 * 1_000_000);
        touch(&shared, &key(DB, 1, ForkNumber::Main));
        collector.run_cycle();

        let files = HistoryStore::new(dir.path()).unwrap().list_segments().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].bucket_id, 2);
    }
}
