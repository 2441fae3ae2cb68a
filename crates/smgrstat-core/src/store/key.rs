use serde::{Deserialize, Serialize};

/// Catalog object identifier.
pub type Oid = u32;

pub const INVALID_OID: Oid = 0;

/// Relation number used by the synthetic per-database temp aggregate key.
pub const TEMP_AGGREGATE_REL_NUMBER: Oid = u32::MAX;

/// Named sub-stream of a relation's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ForkNumber {
    Main = 0,
    Fsm = 1,
    VisibilityMap = 2,
    Init = 3,
}

impl ForkNumber {
    pub const ALL: [ForkNumber; 4] = [
        ForkNumber::Main,
        ForkNumber::Fsm,
        ForkNumber::VisibilityMap,
        ForkNumber::Init,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ForkNumber::Main => "main",
            ForkNumber::Fsm => "fsm",
            ForkNumber::VisibilityMap => "vm",
            ForkNumber::Init => "init",
        }
    }
}

/// Physical location of a relation's storage, without the fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelFileLocator {
    pub spc_oid: Oid,
    pub db_oid: Oid,
    pub rel_number: Oid,
}

impl RelFileLocator {
    pub fn new(spc_oid: Oid, db_oid: Oid, rel_number: Oid) -> Self {
        Self {
            spc_oid,
            db_oid,
            rel_number,
        }
    }
}

impl std::fmt::Display for RelFileLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.spc_oid, self.db_oid, self.rel_number)
    }
}

/// Identifies one physical storage stream (tablespace, database, relation, fork).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub locator: RelFileLocator,
    pub fork: ForkNumber,
}

impl ObjectKey {
    pub fn new(locator: RelFileLocator, fork: ForkNumber) -> Self {
        Self { locator, fork }
    }

    /// Synthetic key that collects all temporary-relation I/O of one database.
    pub fn temp_aggregate(db_oid: Oid) -> Self {
        Self {
            locator: RelFileLocator::new(INVALID_OID, db_oid, TEMP_AGGREGATE_REL_NUMBER),
            fork: ForkNumber::Main,
        }
    }

    pub fn is_temp_aggregate(&self) -> bool {
        self.locator.spc_oid == INVALID_OID
            && self.locator.rel_number == TEMP_AGGREGATE_REL_NUMBER
            && self.fork == ForkNumber::Main
    }

    /// Same relation, different fork.
    pub fn with_fork(&self, fork: ForkNumber) -> Self {
        Self {
            locator: self.locator,
            fork,
        }
    }

    /// Fixed byte encoding used for partition hashing.
    pub(crate) fn to_bytes(self) -> [u8; 13] {
        let mut buf = [0u8; 13];
        buf[0..4].copy_from_slice(&self.locator.spc_oid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.locator.db_oid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.locator.rel_number.to_le_bytes());
        buf[12] = self.fork as u8;
        buf
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.locator, self.fork.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_aggregate_key() {
        let key = ObjectKey::temp_aggregate(5);
        assert!(key.is_temp_aggregate());
        assert_eq!(key.locator.db_oid, 5);

        let real = ObjectKey::new(RelFileLocator::new(1663, 5, 16384), ForkNumber::Main);
        assert!(!real.is_temp_aggregate());
    }

    #[test]
    fn test_display() {
        let key = ObjectKey::new(RelFileLocator::new(1663, 5, 16384), ForkNumber::VisibilityMap);
        assert_eq!(key.to_string(), "1663/5/16384_vm");
    }
}
