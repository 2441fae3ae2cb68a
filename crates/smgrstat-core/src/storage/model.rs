use serde::{Deserialize, Serialize};

use crate::store::{RelfileAssoc, StatsEntry};

/// One closed collection period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub bucket_id: u64,
    /// Microseconds since the Unix epoch at the end of the cycle.
    pub collected_at: i64,
    pub entries: Vec<StatsEntry>,
}

/// Relfile associations drained during one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelfileRecord {
    pub bucket_id: u64,
    pub collected_at: i64,
    pub assocs: Vec<RelfileAssoc>,
}
