//! Per-object statistics entry.

use serde::{Deserialize, Serialize};

use super::key::{INVALID_OID, ObjectKey, Oid};
use crate::stats::{Histogram, OnlineStats};

const USECS_PER_SEC: i64 = 1_000_000;

/// Relation kind as stored in the class catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelKind {
    Table,
    Index,
    Sequence,
    Toast,
    View,
    MaterializedView,
    CompositeType,
    ForeignTable,
    PartitionedTable,
    PartitionedIndex,
    /// Synthetic kind of the per-database temp aggregate entry.
    TempAggregate,
}

impl RelKind {
    pub fn from_code(code: char) -> Option<Self> {
        Some(match code {
            'r' => RelKind::Table,
            'i' => RelKind::Index,
            'S' => RelKind::Sequence,
            't' => RelKind::Toast,
            'v' => RelKind::View,
            'm' => RelKind::MaterializedView,
            'c' => RelKind::CompositeType,
            'f' => RelKind::ForeignTable,
            'p' => RelKind::PartitionedTable,
            'I' => RelKind::PartitionedIndex,
            'T' => RelKind::TempAggregate,
            _ => return None,
        })
    }

    pub fn code(self) -> char {
        match self {
            RelKind::Table => 'r',
            RelKind::Index => 'i',
            RelKind::Sequence => 'S',
            RelKind::Toast => 't',
            RelKind::View => 'v',
            RelKind::MaterializedView => 'm',
            RelKind::CompositeType => 'c',
            RelKind::ForeignTable => 'f',
            RelKind::PartitionedTable => 'p',
            RelKind::PartitionedIndex => 'I',
            RelKind::TempAggregate => 'T',
        }
    }

    /// Whether relations of this kind own physical storage.
    pub fn has_storage(self) -> bool {
        matches!(
            self,
            RelKind::Table
                | RelKind::Index
                | RelKind::Sequence
                | RelKind::Toast
                | RelKind::MaterializedView
        )
    }
}

/// Catalog identity attached to an entry. `valid` only ever goes false → true.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub reloid: Oid,
    /// Owning table for indexes and toast relations.
    pub main_reloid: Oid,
    pub relkind: Option<RelKind>,
    pub relname: String,
    pub nspname: String,
    pub valid: bool,
}

impl EntryMetadata {
    /// Pre-resolved identity of the temp aggregate entry.
    pub fn temp_aggregate() -> Self {
        Self {
            reloid: INVALID_OID,
            main_reloid: INVALID_OID,
            relkind: Some(RelKind::TempAggregate),
            relname: "<temporary tables>".to_string(),
            nspname: "pg_temp".to_string(),
            valid: true,
        }
    }
}

/// Inter-arrival time tracking for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Burstiness {
    /// Inter-arrival times in microseconds.
    pub iat: OnlineStats,
    /// Timestamp of the previous operation; survives resets.
    pub last_op_time: i64,
}

impl Burstiness {
    pub fn record(&mut self, now: i64) {
        if self.last_op_time != 0 {
            self.iat.record((now - self.last_op_time) as f64);
        }
        self.last_op_time = now;
    }
}

/// Aggregated I/O statistics for one [`ObjectKey`].
///
/// Timestamps are microseconds since the Unix epoch; 0 means unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEntry {
    pub key: ObjectKey,

    pub reads: u64,
    pub read_blocks: u64,
    pub writes: u64,
    pub write_blocks: u64,
    pub extends: u64,
    pub extend_blocks: u64,
    pub truncates: u64,
    pub fsyncs: u64,

    pub read_timing: Histogram,
    pub write_timing: Histogram,

    pub read_burst: Burstiness,
    pub write_burst: Burstiness,

    pub sequential_reads: u64,
    pub random_reads: u64,
    pub sequential_writes: u64,
    pub random_writes: u64,
    /// Completed read run lengths, in blocks.
    pub read_runs: OnlineStats,
    pub write_runs: OnlineStats,

    /// Distinct seconds with activity in the current period.
    pub active_seconds: u32,
    /// Survives resets so a second straddling two periods counts once per period.
    pub last_active_second: i64,
    pub first_access: i64,
    pub last_access: i64,

    pub meta: EntryMetadata,
}

impl StatsEntry {
    /// Fresh entry with zeroed counters and sentinel state.
    pub fn new(key: ObjectKey) -> Self {
        let meta = if key.is_temp_aggregate() {
            EntryMetadata::temp_aggregate()
        } else {
            EntryMetadata::default()
        };
        Self {
            key,
            reads: 0,
            read_blocks: 0,
            writes: 0,
            write_blocks: 0,
            extends: 0,
            extend_blocks: 0,
            truncates: 0,
            fsyncs: 0,
            read_timing: Histogram::default(),
            write_timing: Histogram::default(),
            read_burst: Burstiness::default(),
            write_burst: Burstiness::default(),
            sequential_reads: 0,
            random_reads: 0,
            sequential_writes: 0,
            random_writes: 0,
            read_runs: OnlineStats::default(),
            write_runs: OnlineStats::default(),
            active_seconds: 0,
            last_active_second: 0,
            first_access: 0,
            last_access: 0,
            meta,
        }
    }

    /// Zeroes period counters. Keeps `last_active_second`, both
    /// `last_op_time`s and metadata.
    pub fn reset(&mut self) {
        self.reads = 0;
        self.read_blocks = 0;
        self.writes = 0;
        self.write_blocks = 0;
        self.extends = 0;
        self.extend_blocks = 0;
        self.truncates = 0;
        self.fsyncs = 0;
        self.read_timing.reset();
        self.write_timing.reset();
        self.read_burst.iat.reset();
        self.write_burst.iat.reset();
        self.sequential_reads = 0;
        self.random_reads = 0;
        self.sequential_writes = 0;
        self.random_writes = 0;
        self.read_runs.reset();
        self.write_runs.reset();
        self.active_seconds = 0;
        self.first_access = 0;
        self.last_access = 0;
    }

    /// True once any operation touched the entry in the current period.
    pub fn has_activity(&self) -> bool {
        self.first_access != 0
    }

    /// Updates first/last access and the distinct-seconds counter.
    pub fn touch(&mut self, now: i64) {
        if self.first_access == 0 {
            self.first_access = now;
        }
        self.last_access = self.last_access.max(now);
        let second = now.div_euclid(USECS_PER_SEC);
        if second != self.last_active_second {
            self.active_seconds += 1;
            self.last_active_second = second;
        }
    }

    /// Attaches catalog identity unless already resolved. Returns whether it
    /// was applied.
    pub fn set_metadata_if_unresolved(&mut self, meta: &EntryMetadata) -> bool {
        if self.meta.valid || !meta.valid {
            return false;
        }
        self.meta = meta.clone();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::key::{ForkNumber, RelFileLocator};

    fn key() -> ObjectKey {
        ObjectKey::new(RelFileLocator::new(1663, 5, 16384), ForkNumber::Main)
    }

    #[test]
    fn test_touch_counts_distinct_seconds() {
        let mut e = StatsEntry::new(key());
        e.touch(10_000_000);
        e.touch(10_500_000);
        e.touch(11_000_001);
        assert_eq!(e.active_seconds, 2);
        assert_eq!(e.first_access, 10_000_000);
        assert_eq!(e.last_access, 11_000_001);
        assert!(e.last_access >= e.first_access);
    }

    #[test]
    fn test_reset_preserves_cross_period_fields() {
        let mut e = StatsEntry::new(key());
        e.reads = 3;
        e.read_burst.record(1_000_000);
        e.read_burst.record(1_000_500);
        e.write_burst.record(2_000_000);
        e.touch(2_000_000);
        e.read_timing.record(12);

        e.reset();

        assert_eq!(e.reads, 0);
        assert!(e.read_timing.is_empty());
        assert_eq!(e.read_burst.iat.count, 0);
        assert_eq!(e.read_burst.last_op_time, 1_000_500);
        assert_eq!(e.write_burst.last_op_time, 2_000_000);
        assert_eq!(e.last_active_second, 2);
        assert_eq!(e.active_seconds, 0);
        assert!(!e.has_activity());

        // Same second after reset is not counted again.
        e.touch(2_100_000);
        assert_eq!(e.active_seconds, 0);
        assert!(e.has_activity());
    }

    #[test]
    fn test_metadata_first_writer_wins() {
        let mut e = StatsEntry::new(key());
        let first = EntryMetadata {
            reloid: 100,
            relkind: Some(RelKind::Table),
            relname: "a".into(),
            nspname: "public".into(),
            valid: true,
            ..EntryMetadata::default()
        };
        let second = EntryMetadata {
            reloid: 200,
            relname: "b".into(),
            ..first.clone()
        };

        assert!(e.set_metadata_if_unresolved(&first));
        assert!(!e.set_metadata_if_unresolved(&second));
        assert_eq!(e.meta, first);
    }

    #[test]
    fn test_temp_aggregate_entry_is_resolved() {
        let e = StatsEntry::new(ObjectKey::temp_aggregate(5));
        assert!(e.meta.valid);
        assert_eq!(e.meta.relkind, Some(RelKind::TempAggregate));
    }

    #[test]
    fn test_relkind_codes() {
        for c in ['r', 'i', 'S', 't', 'v', 'm', 'c', 'f', 'p', 'I', 'T'] {
            assert_eq!(RelKind::from_code(c).unwrap().code(), c);
        }
        assert_eq!(RelKind::from_code('x'), None);
        assert!(RelKind::Toast.has_storage());
        assert!(!RelKind::View.has_storage());
    }
}
