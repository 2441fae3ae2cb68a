//! Deferred catalog identity resolution.
//!
//! New entries are created on the storage path where catalog access is not
//! allowed, so their keys are queued per backend and resolved at safe
//! points. Every resolution follows the same discipline:
//!
//! 1. lock the entry, check `valid`, unlock
//! 2. query the catalog with no lock held
//! 3. lock again and apply only if still unresolved
//! 4. copy the identity to the relation's other forks that are unresolved

pub mod bulk;
pub mod catalog;
#[cfg(feature = "postgres")]
pub mod pg;

use tracing::{debug, trace};

use crate::store::{EntryMetadata, ForkNumber, INVALID_OID, ObjectKey, StatsStore};

pub use bulk::{ClassTuple, MemRawCatalog, RawCatalog, resolve_new_database};
pub use catalog::{
    CatalogError, CatalogLookup, LookupOutcome, RefusalReason, SessionState, StaticCatalog,
    StaticRelation,
};

/// Looks up the identity of `key` if the session allows catalog access.
pub fn lookup_metadata(
    catalog: &mut dyn CatalogLookup,
    session: &SessionState,
    key: &ObjectKey,
) -> LookupOutcome {
    if key.is_temp_aggregate() {
        return LookupOutcome::Resolved(EntryMetadata::temp_aggregate());
    }
    if key.locator.rel_number == INVALID_OID {
        return LookupOutcome::Refused(RefusalReason::InvalidRelNumber);
    }
    if session.database_oid == INVALID_OID {
        return LookupOutcome::Refused(RefusalReason::NoDatabase);
    }
    if !session.in_transaction {
        return LookupOutcome::Refused(RefusalReason::NoTransaction);
    }
    if session.critical_section_depth > 0 {
        return LookupOutcome::Refused(RefusalReason::CriticalSection);
    }

    let spc = key.locator.spc_oid;
    let rel = key.locator.rel_number;
    let mut found = catalog.lookup_relation(spc, rel);
    // Relations in the default tablespace are stored with tablespace 0.
    if matches!(found, Ok(None)) && spc != INVALID_OID {
        found = catalog.lookup_relation(INVALID_OID, rel);
    }
    match found {
        Ok(Some(meta)) => LookupOutcome::Resolved(meta),
        Ok(None) => LookupOutcome::NotFound,
        Err(e) => LookupOutcome::Failed(e),
    }
}

/// Applies `meta` to the entry for `key` if it is still unresolved, then to
/// the relation's other forks. Returns whether the primary entry changed.
pub fn apply_if_unresolved(store: &StatsStore, key: &ObjectKey, meta: &EntryMetadata) -> bool {
    let applied = match store.find(key) {
        Some(mut entry) => entry.set_metadata_if_unresolved(meta),
        None => false,
    };
    if applied {
        fan_out(store, key, meta);
    }
    applied
}

/// Copies `meta` to every other fork of the same relation whose entry exists
/// and is unresolved.
pub fn fan_out(store: &StatsStore, key: &ObjectKey, meta: &EntryMetadata) -> usize {
    let mut updated = 0;
    for fork in ForkNumber::ALL {
        if fork == key.fork {
            continue;
        }
        if let Some(mut sibling) = store.find(&key.with_fork(fork))
            && sibling.set_metadata_if_unresolved(meta)
        {
            updated += 1;
        }
    }
    updated
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub resolved: usize,
    /// Keys left pending for the next safe point.
    pub retained: usize,
}

/// Per-backend list of keys whose entries still need an identity.
#[derive(Debug, Default)]
pub struct MetadataResolver {
    pending: Vec<ObjectKey>,
}

impl MetadataResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a newly created key. Keys of other databases and the temp
    /// aggregate key are ignored.
    pub fn add_pending(&mut self, key: &ObjectKey, session: &SessionState) -> bool {
        if key.is_temp_aggregate() || !session.owns_database(key.locator.db_oid) {
            return false;
        }
        self.pending.push(*key);
        true
    }

    pub fn pending(&self) -> &[ObjectKey] {
        &self.pending
    }

    /// Resolves queued keys. Keys that are refused or whose lookup fails or
    /// finds nothing stay queued; keys already resolved or without an entry
    /// are dropped.
    pub fn resolve_pending(
        &mut self,
        store: &StatsStore,
        catalog: &mut dyn CatalogLookup,
        session: &SessionState,
    ) -> ResolveStats {
        if self.pending.is_empty() {
            return ResolveStats::default();
        }

        let mut stats = ResolveStats::default();
        let keys = std::mem::take(&mut self.pending);
        for key in keys {
            if !session.owns_database(key.locator.db_oid) {
                self.pending.push(key);
                continue;
            }

            let needs_resolution = match store.find(&key) {
                Some(entry) => !entry.meta.valid,
                None => false,
            };
            if !needs_resolution {
                continue;
            }

            match lookup_metadata(catalog, session, &key) {
                LookupOutcome::Resolved(meta) => {
                    if apply_if_unresolved(store, &key, &meta) {
                        stats.resolved += 1;
                    }
                }
                LookupOutcome::Refused(reason) => {
                    trace!(key = %key, %reason, "metadata lookup refused");
                    self.pending.push(key);
                }
                LookupOutcome::NotFound => {
                    self.pending.push(key);
                }
                LookupOutcome::Failed(e) => {
                    debug!(key = %key, error = %e, "metadata lookup failed");
                    self.pending.push(key);
                }
            }
        }
        stats.retained = self.pending.len();
        stats
    }
}
