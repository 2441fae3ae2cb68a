//! Catalog lookup seam and per-backend session state.

use std::collections::HashMap;

use crate::store::{EntryMetadata, INVALID_OID, Oid, RelKind};

/// Errors reported by a catalog implementation.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogError {
    EnvNotSet(String),
    ConnectionError(String),
    QueryError(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::EnvNotSet(var) => write!(f, "catalog: {} not set", var),
            CatalogError::ConnectionError(msg) => write!(f, "catalog: {}", msg),
            CatalogError::QueryError(msg) => write!(f, "catalog query error: {}", msg),
        }
    }
}

impl std::error::Error for CatalogError {}

/// What the backend is currently doing, as far as catalog access is
/// concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Connected database; `INVALID_OID` before a connection is established.
    pub database_oid: Oid,
    pub default_tablespace: Oid,
    pub in_transaction: bool,
    pub critical_section_depth: u32,
}

impl SessionState {
    pub fn new(database_oid: Oid, default_tablespace: Oid) -> Self {
        Self {
            database_oid,
            default_tablespace,
            in_transaction: false,
            critical_section_depth: 0,
        }
    }

    pub fn enter_critical_section(&mut self) {
        self.critical_section_depth += 1;
    }

    pub fn exit_critical_section(&mut self) {
        self.critical_section_depth = self.critical_section_depth.saturating_sub(1);
    }

    /// Keys of this database and of shared catalogs (db 0) belong here.
    pub fn owns_database(&self, db_oid: Oid) -> bool {
        db_oid == self.database_oid || db_oid == INVALID_OID
    }
}

/// Why a lookup was skipped. Not an error: the key is retried later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    InvalidRelNumber,
    NoDatabase,
    NoTransaction,
    CriticalSection,
}

impl std::fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RefusalReason::InvalidRelNumber => "invalid relation number",
            RefusalReason::NoDatabase => "no database connection",
            RefusalReason::NoTransaction => "not in a transaction",
            RefusalReason::CriticalSection => "inside a critical section",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Resolved(EntryMetadata),
    NotFound,
    Refused(RefusalReason),
    Failed(CatalogError),
}

/// Catalog access used for metadata resolution. Implementations may block;
/// callers never hold an entry lock while calling in.
pub trait CatalogLookup: Send {
    /// Identity of the relation stored at `(spc_oid, rel_number)`, with
    /// `valid` set. `spc_oid` 0 means the database default tablespace.
    fn lookup_relation(
        &mut self,
        spc_oid: Oid,
        rel_number: Oid,
    ) -> Result<Option<EntryMetadata>, CatalogError>;

    fn namespace_name(&mut self, nsp_oid: Oid) -> Result<Option<String>, CatalogError>;
}

/// Relation row registered in a [`StaticCatalog`].
#[derive(Debug, Clone)]
pub struct StaticRelation {
    pub reloid: Oid,
    pub main_reloid: Oid,
    pub relkind: RelKind,
    pub relname: String,
    pub nsp_oid: Oid,
}

/// In-memory catalog for the simulator and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    relations: HashMap<(Oid, Oid), StaticRelation>,
    namespaces: HashMap<Oid, String>,
    /// Number of `lookup_relation` calls served.
    pub lookups: usize,
    /// When set, every call fails with a query error.
    pub fail: bool,
}

impl StaticCatalog {
    pub fn new() -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(11, "pg_catalog".to_string());
        namespaces.insert(2200, "public".to_string());
        Self {
            namespaces,
            ..Self::default()
        }
    }

    pub fn add_namespace(&mut self, nsp_oid: Oid, name: &str) {
        self.namespaces.insert(nsp_oid, name.to_string());
    }

    /// Registers a relation under `(spc_oid, rel_number)`.
    pub fn add_relation(&mut self, spc_oid: Oid, rel_number: Oid, rel: StaticRelation) {
        self.relations.insert((spc_oid, rel_number), rel);
    }

    fn check(&self) -> Result<(), CatalogError> {
        if self.fail {
            return Err(CatalogError::QueryError("catalog unavailable".to_string()));
        }
        Ok(())
    }
}

impl CatalogLookup for StaticCatalog {
    fn lookup_relation(
        &mut self,
        spc_oid: Oid,
        rel_number: Oid,
    ) -> Result<Option<EntryMetadata>, CatalogError> {
        self.lookups += 1;
        self.check()?;
        let Some(rel) = self.relations.get(&(spc_oid, rel_number)) else {
            return Ok(None);
        };
        Ok(Some(EntryMetadata {
            reloid: rel.reloid,
            main_reloid: rel.main_reloid,
            relkind: Some(rel.relkind),
            relname: rel.relname.clone(),
            nspname: self
                .namespaces
                .get(&rel.nsp_oid)
                .cloned()
                .unwrap_or_default(),
            valid: true,
        }))
    }

    fn namespace_name(&mut self, nsp_oid: Oid) -> Result<Option<String>, CatalogError> {
        self.check()?;
        Ok(self.namespaces.get(&nsp_oid).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_catalog_lookup() {
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

        let meta = cat.lookup_relation(0, 16384).unwrap().unwrap();
        assert!(meta.valid);
        assert_eq!(meta.relname, "accounts");
        assert_eq!(meta.nspname, "public");
        assert_eq!(cat.lookup_relation(1663, 16384).unwrap(), None);
        assert_eq!(cat.lookups, 2);

        cat.fail = true;
        assert!(cat.lookup_relation(0, 16384).is_err());
    }

    #[test]
    fn test_session_owns_shared_database() {
        let s = SessionState::new(5, 1663);
        assert!(s.owns_database(5));
        assert!(s.owns_database(0));
        assert!(!s.owns_database(6));
    }
}
