//! Durable collection history.
//!
//! Every cycle produces at most two segment files in the history directory:
//!
//! ```text
//! smgrstat_2026-10-19_14-05-00_b12.zst   closed bucket 12
//! relfile_2026-10-19_14-05-00_b12.zst    associations drained in the same cycle
//! ```
//!
//! Each file is one atomic write. Retention works from the timestamp in the
//! file name, so it never has to open a segment.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

use super::StorageError;
use super::model::{BucketRecord, RelfileRecord};
use super::segment::{SegmentKind, read_segment, write_segment};

const BUCKET_PREFIX: &str = "smgrstat_";
const RELFILE_PREFIX: &str = "relfile_";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Destination of collected history.
pub trait HistorySink: Send {
    fn persist_bucket(&mut self, record: &BucketRecord) -> Result<(), StorageError>;

    fn persist_relfile(&mut self, record: &RelfileRecord) -> Result<(), StorageError>;

    /// Deletes history older than `retention_hours` before `now`. 0 keeps
    /// everything.
    fn apply_retention(
        &mut self,
        retention_hours: u32,
        now: DateTime<Utc>,
    ) -> Result<RotationResult, StorageError>;
}

/// A segment file found in the history directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub kind: SegmentKind,
    pub written_at: NaiveDateTime,
    pub bucket_id: u64,
    pub size: u64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RotationResult {
    pub files_removed: usize,
    pub bytes_freed: u64,
    pub files_remaining: usize,
}

/// [`HistorySink`] writing segment files into one directory.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    base_path: PathBuf,
}

impl HistoryStore {
    /// Opens (creating if needed) the history directory and removes
    /// leftover `.tmp` files of interrupted writes.
    pub fn new(base_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;

        for entry in fs::read_dir(&base_path)?.flatten() {
            if entry.path().extension().is_some_and(|ext| ext == "tmp") {
                let _ = fs::remove_file(entry.path());
            }
        }

        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn segment_path(&self, kind: SegmentKind, collected_at: i64, bucket_id: u64) -> PathBuf {
        let ts = DateTime::from_timestamp_micros(collected_at)
            .unwrap_or_default()
            .format(TIMESTAMP_FORMAT);
        let prefix = match kind {
            SegmentKind::Bucket => BUCKET_PREFIX,
            SegmentKind::Relfile => RELFILE_PREFIX,
        };
        self.base_path
            .join(format!("{}{}_b{}.zst", prefix, ts, bucket_id))
    }

    /// Every recognised segment, oldest first.
    pub fn list_segments(&self) -> std::io::Result<Vec<SegmentFile>> {
        list_segments(&self.base_path)
    }
}

/// Segments under `dir`, oldest first. Unrecognised files are ignored.
pub fn list_segments(dir: &Path) -> std::io::Result<Vec<SegmentFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((kind, written_at, bucket_id)) = parse_segment_name(name) else {
            continue;
        };
        let size = entry.metadata()?.len();
        files.push(SegmentFile {
            path,
            kind,
            written_at,
            bucket_id,
            size,
        });
    }
    files.sort_by_key(|f| (f.written_at, f.bucket_id, f.kind as u8));
    Ok(files)
}

/// Parses `<prefix>YYYY-MM-DD_HH-MM-SS_b<bucket>.zst`.
pub fn parse_segment_name(name: &str) -> Option<(SegmentKind, NaiveDateTime, u64)> {
    let (kind, rest) = if let Some(rest) = name.strip_prefix(BUCKET_PREFIX) {
        (SegmentKind::Bucket, rest)
    } else if let Some(rest) = name.strip_prefix(RELFILE_PREFIX) {
        (SegmentKind::Relfile, rest)
    } else {
        return None;
    };
    let stem = rest.strip_suffix(".zst")?;
    let (ts, bucket) = stem.rsplit_once("_b")?;
    let written_at = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()?;
    let bucket_id = bucket.parse().ok()?;
    Some((kind, written_at, bucket_id))
}

pub fn read_bucket(path: &Path) -> Result<BucketRecord, StorageError> {
    read_segment(path, SegmentKind::Bucket)
}

pub fn read_relfile(path: &Path) -> Result<RelfileRecord, StorageError> {
    read_segment(path, SegmentKind::Relfile)
}

impl HistorySink for HistoryStore {
    fn persist_bucket(&mut self, record: &BucketRecord) -> Result<(), StorageError> {
        let path = self.segment_path(SegmentKind::Bucket, record.collected_at, record.bucket_id);
        write_segment(&path, SegmentKind::Bucket, record)?;
        debug!(
            path = %path.display(),
            bucket = record.bucket_id,
            entries = record.entries.len(),
            "bucket persisted"
        );
        Ok(())
    }

    fn persist_relfile(&mut self, record: &RelfileRecord) -> Result<(), StorageError> {
        let path = self.segment_path(SegmentKind::Relfile, record.collected_at, record.bucket_id);
        write_segment(&path, SegmentKind::Relfile, record)?;
        debug!(
            path = %path.display(),
            bucket = record.bucket_id,
            assocs = record.assocs.len(),
            "relfile associations persisted"
        );
        Ok(())
    }

    fn apply_retention(
        &mut self,
        retention_hours: u32,
        now: DateTime<Utc>,
    ) -> Result<RotationResult, StorageError> {
        let files = self.list_segments()?;
        if retention_hours == 0 {
            return Ok(RotationResult {
                files_remaining: files.len(),
                ..RotationResult::default()
            });
        }

        let limit = now.naive_utc() - chrono::Duration::hours(i64::from(retention_hours));
        let mut result = RotationResult::default();
        for file in files {
            if file.written_at >= limit {
                result.files_remaining += 1;
                continue;
            }
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    result.files_removed += 1;
                    result.bytes_freed += file.size;
                }
                Err(e) => {
                    warn!(
                        path = %file.path.display(),
                        error = %e,
                        "failed to remove expired segment"
                    );
                    result.files_remaining += 1;
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ForkNumber, ObjectKey, RelFileLocator, RelfileAssoc, StatsEntry};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn micros(y: i32, mo: u32, d: u32, h: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0)
            .unwrap()
            .timestamp_micros()
    }

    fn bucket(bucket_id: u64, collected_at: i64) -> BucketRecord {
        let key = ObjectKey::new(RelFileLocator::new(1663, 5, 16384), ForkNumber::Main);
        let mut entry = StatsEntry::new(key);
        entry.reads = 7;
        entry.read_timing.record(120);
        BucketRecord {
            bucket_id,
            collected_at,
            entries: vec![entry],
        }
    }

    #[test]
    fn test_parse_segment_name() {
        let (kind, ts, bucket) =
            parse_segment_name("smgrstat_2026-10-19_14-05-09_b12.zst").unwrap();
        assert_eq!(kind, SegmentKind::Bucket);
        assert_eq!(ts.to_string(), "2026-10-19 14:05:09");
        assert_eq!(bucket, 12);

        let (kind, _, _) = parse_segment_name("relfile_2026-10-19_14-05-09_b3.zst").unwrap();
        assert_eq!(kind, SegmentKind::Relfile);

        assert!(parse_segment_name("smgrstat_garbage.zst").is_none());
        assert!(parse_segment_name("metrics_2026-10-19_14.zst").is_none());
        assert!(parse_segment_name("smgrstat_2026-10-19_14-05-09_b12.tmp").is_none());
    }

    #[test]
    fn test_persist_and_read_back() {
        let dir = tempdir().unwrap();
        let mut store = HistoryStore::new(dir.path()).unwrap();
        let at = micros(2026, 10, 19, 14);

        store.persist_bucket(&bucket(4, at)).unwrap();
        let old = RelFileLocator::new(1663, 5, 16384);
        let new = RelFileLocator::new(1663, 5, 16400);
        store
            .persist_relfile(&RelfileRecord {
                bucket_id: 4,
                collected_at: at,
                assocs: vec![RelfileAssoc {
                    old,
                    new,
                    fork: ForkNumber::Main,
                    is_redo: false,
                    identity: None,
                }],
            })
            .unwrap();

        let files = store.list_segments().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].kind, SegmentKind::Bucket);
        assert_eq!(files[1].kind, SegmentKind::Relfile);

        let back = read_bucket(&files[0].path).unwrap();
        assert_eq!(back, bucket(4, at));
        let rel = read_relfile(&files[1].path).unwrap();
        assert_eq!(rel.assocs[0].new, new);
    }

    #[test]
    fn test_new_removes_stale_tmp_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("smgrstat_x.tmp"), b"partial").unwrap();
        HistoryStore::new(dir.path()).unwrap();
        assert!(!dir.path().join("smgrstat_x.tmp").exists());
    }

    #[test]
    fn test_retention_by_hours() {
        let dir = tempdir().unwrap();
        let mut store = HistoryStore::new(dir.path()).unwrap();
        store.persist_bucket(&bucket(1, micros(2026, 10, 18, 1))).unwrap();
        store.persist_bucket(&bucket(2, micros(2026, 10, 19, 10))).unwrap();
        store.persist_bucket(&bucket(3, micros(2026, 10, 19, 13))).unwrap();
        fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        let now = Utc.with_ymd_and_hms(2026, 10, 19, 14, 0, 0).unwrap();

        // Zero disables retention.
        let result = store.apply_retention(0, now).unwrap();
        assert_eq!(result.files_removed, 0);
        assert_eq!(result.files_remaining, 3);

        let result = store.apply_retention(6, now).unwrap();
        assert_eq!(result.files_removed, 1);
        assert_eq!(result.files_remaining, 2);
        assert!(result.bytes_freed > 0);

        let left: Vec<u64> = store
            .list_segments()
            .unwrap()
            .iter()
            .map(|f| f.bucket_id)
            .collect();
        assert_eq!(left, vec![2, 3]);
        assert!(dir.path().join("notes.txt").exists());
    }
}
