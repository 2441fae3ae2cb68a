//! Per-backend state and its lifecycle.
//!
//! A backend owns everything that is not shared: session flags, the run
//! detector cache, the pending metadata list, async read slots and its
//! catalog handles. Shared state is reached through `shared`.
//!
//! The host calls [`BackendContext::after_unit_of_work`] at the end of every
//! statement and [`BackendContext::shutdown`] once before the backend exits.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::TempTracking;
use crate::metadata::{
    CatalogLookup, MetadataResolver, RawCatalog, ResolveStats, SessionState,
    resolve_new_database,
};
use crate::seq::SequentialRunDetector;
use crate::shared::SharedStats;
use crate::smgr::{AioSlots, SmgrRelation};
use crate::store::{EntryGuard, ForkNumber, ObjectKey, Oid};

/// A completed statement, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWork {
    /// Data-modifying statement.
    Dml,
    /// Schema or utility statement. `created_database` is set after a
    /// successful CREATE DATABASE to `(db_oid, default_tablespace)`.
    Utility {
        created_database: Option<(Oid, Oid)>,
        succeeded: bool,
    },
}

pub struct BackendContext {
    pub shared: Arc<SharedStats>,
    pub session: SessionState,
    pub seq: SequentialRunDetector,
    pub resolver: MetadataResolver,
    pub aio: AioSlots,
    catalog: Box<dyn CatalogLookup>,
    raw_catalog: Option<Box<dyn RawCatalog + Send>>,
}

impl BackendContext {
    pub fn new(
        shared: Arc<SharedStats>,
        session: SessionState,
        catalog: Box<dyn CatalogLookup>,
        io_max_concurrency: usize,
    ) -> Self {
        Self {
            shared,
            session,
            seq: SequentialRunDetector::new(),
            resolver: MetadataResolver::new(),
            aio: AioSlots::new(io_max_concurrency),
            catalog,
            raw_catalog: None,
        }
    }

    /// Enables the bulk path for CREATE DATABASE.
    pub fn with_raw_catalog(mut self, raw: Box<dyn RawCatalog + Send>) -> Self {
        self.raw_catalog = Some(raw);
        self
    }

    /// Key that I/O on `rel`/`fork` is accounted to, or `None` when it is
    /// not tracked.
    pub fn tracking_key(&self, rel: &SmgrRelation, fork: ForkNumber) -> Option<ObjectKey> {
        if rel.is_temp {
            match self.shared.tunables.track_temp_tables() {
                TempTracking::Off => return None,
                TempTracking::Individual => {}
                TempTracking::Aggregate => {
                    return Some(ObjectKey::temp_aggregate(rel.locator.db_oid));
                }
            }
        }
        Some(ObjectKey::new(rel.locator, fork))
    }

    /// Locked entry for `key`; a newly created one is queued for metadata.
    pub(crate) fn entry_for(&mut self, key: &ObjectKey) -> EntryGuard {
        let (entry, created) = self.shared.store.get_or_create(key);
        if created {
            self.resolver.add_pending(key, &self.session);
        }
        entry
    }

    pub fn begin_transaction(&mut self) {
        self.session.in_transaction = true;
    }

    pub fn end_transaction(&mut self) {
        self.session.in_transaction = false;
    }

    /// Drains pending metadata. Runs whether or not the statement succeeded.
    pub fn resolve_pending(&mut self) -> ResolveStats {
        self.resolver
            .resolve_pending(&self.shared.store, self.catalog.as_mut(), &self.session)
    }

    /// Safe point at the end of a statement.
    pub fn after_unit_of_work(&mut self, unit: UnitOfWork) -> ResolveStats {
        if let UnitOfWork::Utility {
            created_database: Some((db_oid, spc_oid)),
            succeeded: true,
        } = unit
        {
            self.resolve_created_database(db_oid, spc_oid);
        }
        self.resolve_pending()
    }

    fn resolve_created_database(&mut self, db_oid: Oid, spc_oid: Oid) {
        let Some(raw) = self.raw_catalog.as_mut() else {
            debug!(db = db_oid, "no raw catalog, skipping bulk resolution");
            return;
        };
        match resolve_new_database(
            &self.shared.store,
            raw.as_mut(),
            self.catalog.as_mut(),
            db_oid,
            spc_oid,
        ) {
            Ok(n) => debug!(db = db_oid, resolved = n, "bulk metadata resolution done"),
            Err(e) => warn!(db = db_oid, error = %e, "bulk metadata resolution failed"),
        }
    }

    /// Last call before the backend goes away: records open runs, then
    /// makes a final attempt at pending metadata.
    pub fn shutdown(&mut self) -> ResolveStats {
        let runs = self.seq.flush_runs(&self.shared.store);
        let stats = self.resolve_pending();
        debug!(
            runs,
            resolved = stats.resolved,
            unresolved = stats.retained,
            "backend shutdown"
        );
        stats
    }
}
