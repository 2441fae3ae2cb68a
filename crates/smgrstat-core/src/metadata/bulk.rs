//! Bulk identity resolution for a freshly created database.
//!
//! A new database starts with a copy of its template's class catalog and no
//! warm catalog cache, so the catalog pages are scanned directly. Candidates
//! are collected while the page is locked; identities are built and applied
//! after the page lock is released.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::apply_if_unresolved;
use super::catalog::{CatalogError, CatalogLookup};
use crate::store::{
    EntryMetadata, ForkNumber, INVALID_OID, ObjectKey, Oid, RelFileLocator, RelKind, StatsStore,
};

/// Upper bound of candidates taken from a single catalog page.
pub const MAX_CANDIDATES_PER_PAGE: usize = 256;

/// The class-catalog columns the bulk path needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassTuple {
    pub oid: Oid,
    pub relname: String,
    pub relnamespace: Oid,
    pub relkind: char,
    /// 0 means the database default tablespace.
    pub reltablespace: Oid,
    pub relfilenode: Oid,
    pub relisshared: bool,
}

impl ClassTuple {
    /// Relation number if this row describes storage that may have an entry.
    fn trackable_rel_number(&self) -> Option<Oid> {
        if self.relisshared || self.relfilenode == INVALID_OID {
            return None;
        }
        let kind = RelKind::from_code(self.relkind)?;
        kind.has_storage().then_some(self.relfilenode)
    }
}

/// Page-level access to a database's class catalog.
pub trait RawCatalog {
    /// Number of pages in the class catalog of `db_oid`.
    fn page_count(&mut self, db_oid: Oid, spc_oid: Oid) -> Result<u32, CatalogError>;

    /// Calls `visit` with the visible tuples of one page while holding the
    /// page's share lock. The lock is released when this returns.
    fn with_page(
        &mut self,
        db_oid: Oid,
        spc_oid: Oid,
        page: u32,
        visit: &mut dyn FnMut(&[ClassTuple]),
    ) -> Result<(), CatalogError>;
}

/// Raw catalog backed by in-memory pages.
#[derive(Debug, Default, Clone)]
pub struct MemRawCatalog {
    pages: HashMap<Oid, Vec<Vec<ClassTuple>>>,
}

impl MemRawCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&mut self, db_oid: Oid, tuples: Vec<ClassTuple>) {
        self.pages.entry(db_oid).or_default().push(tuples);
    }
}

impl RawCatalog for MemRawCatalog {
    fn page_count(&mut self, db_oid: Oid, _spc_oid: Oid) -> Result<u32, CatalogError> {
        Ok(self.pages.get(&db_oid).map_or(0, |p| p.len() as u32))
    }

    fn with_page(
        &mut self,
        db_oid: Oid,
        _spc_oid: Oid,
        page: u32,
        visit: &mut dyn FnMut(&[ClassTuple]),
    ) -> Result<(), CatalogError> {
        let tuples = self
            .pages
            .get(&db_oid)
            .and_then(|p| p.get(page as usize))
            .ok_or_else(|| CatalogError::QueryError(format!("page {} out of range", page)))?;
        visit(tuples);
        Ok(())
    }
}

struct Candidate {
    key: ObjectKey,
    reloid: Oid,
    relnamespace: Oid,
    relkind: char,
    relname: String,
}

/// Resolves every unresolved entry of the new database `db_oid`. Returns the
/// number of primary entries that received an identity.
pub fn resolve_new_database(
    store: &StatsStore,
    raw: &mut dyn RawCatalog,
    catalog: &mut dyn CatalogLookup,
    db_oid: Oid,
    spc_oid: Oid,
) -> Result<usize, CatalogError> {
    let nblocks = raw.page_count(db_oid, spc_oid)?;
    if nblocks == 0 {
        return Ok(0);
    }

    let mut resolved = 0;
    let mut candidates: Vec<Candidate> = Vec::with_capacity(MAX_CANDIDATES_PER_PAGE);
    for page in 0..nblocks {
        candidates.clear();
        raw.with_page(db_oid, spc_oid, page, &mut |tuples| {
            collect_candidates(store, tuples, db_oid, spc_oid, &mut candidates);
        })?;

        for c in candidates.drain(..) {
            let meta = build_metadata(catalog, &c);
            if apply_if_unresolved(store, &c.key, &meta) {
                resolved += 1;
            }
        }
    }

    debug!(db = db_oid, pages = nblocks, resolved, "resolved new database entries");
    Ok(resolved)
}

fn collect_candidates(
    store: &StatsStore,
    tuples: &[ClassTuple],
    db_oid: Oid,
    spc_oid: Oid,
    out: &mut Vec<Candidate>,
) {
    for t in tuples {
        if out.len() >= MAX_CANDIDATES_PER_PAGE {
            break;
        }
        let Some(rel_number) = t.trackable_rel_number() else {
            continue;
        };
        let spc = if t.reltablespace != INVALID_OID {
            t.reltablespace
        } else {
            spc_oid
        };
        let key = ObjectKey::new(RelFileLocator::new(spc, db_oid, rel_number), ForkNumber::Main);

        let needs_resolution = match store.find(&key) {
            Some(entry) => !entry.meta.valid,
            None => false,
        };
        if !needs_resolution {
            continue;
        }

        out.push(Candidate {
            key,
            reloid: t.oid,
            relnamespace: t.relnamespace,
            relkind: t.relkind,
            relname: t.relname.clone(),
        });
    }
}

fn build_metadata(catalog: &mut dyn CatalogLookup, c: &Candidate) -> EntryMetadata {
    let nspname = match catalog.namespace_name(c.relnamespace) {
        Ok(name) => name.unwrap_or_default(),
        Err(e) => {
            warn!(nsp = c.relnamespace, error = %e, "namespace lookup failed");
            String::new()
        }
    };
    EntryMetadata {
        reloid: c.reloid,
        main_reloid: INVALID_OID,
        relkind: RelKind::from_code(c.relkind),
        relname: c.relname.clone(),
        nspname,
        valid: true,
    }
}
