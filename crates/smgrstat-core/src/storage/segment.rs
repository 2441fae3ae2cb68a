//! Single-record segment files.
//!
//! File layout:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ HEADER (20 bytes, uncompressed)              │
//! │   magic: [u8; 4]          = b"SMS1"          │
//! │   version: u16            = 1                │
//! │   kind: u8                (1 bucket, 2 relf) │
//! │   _reserved: u8           = 0                │
//! │   payload_len: u64                           │
//! │   crc32: u32              (of payload)       │
//! ├──────────────────────────────────────────────┤
//! │ PAYLOAD                                      │
//! │   zstd(postcard(record))                     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A segment is written to `<name>.tmp`, synced, then renamed into place, so
//! readers never see a partial file.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::StorageError;

const MAGIC: [u8; 4] = *b"SMS1";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 20;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentKind {
    Bucket = 1,
    Relfile = 2,
}

impl SegmentKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(SegmentKind::Bucket),
            2 => Some(SegmentKind::Relfile),
            _ => None,
        }
    }
}

pub fn write_segment<T: Serialize>(
    path: &Path,
    kind: SegmentKind,
    record: &T,
) -> Result<(), StorageError> {
    let raw = postcard::to_allocvec(record)?;
    let payload = zstd::encode_all(&raw[..], ZSTD_LEVEL)?;

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = kind as u8;
    header[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    header[16..20].copy_from_slice(&crc32fast::hash(&payload).to_le_bytes());

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(&header)?;
    file.write_all(&payload)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp_path, path)?;
    Ok(())
}

pub fn read_segment<T: DeserializeOwned>(
    path: &Path,
    expected: SegmentKind,
) -> Result<T, StorageError> {
    let data = fs::read(path)?;
    let payload = check_header(&data, expected)?;

    let raw = zstd::decode_all(payload)?;
    postcard::from_bytes(&raw).map_err(|e| {
        warn!(
            path = %path.display(),
            payload_len = payload.len(),
            error = %e,
            "segment: record deserialization failed"
        );
        StorageError::Encode(e)
    })
}

fn check_header(data: &[u8], expected: SegmentKind) -> Result<&[u8], StorageError> {
    if data.len() < HEADER_SIZE {
        return Err(StorageError::Corrupt("file too small for header".into()));
    }
    if data[0..4] != MAGIC {
        return Err(StorageError::Corrupt(format!(
            "invalid magic: expected SMS1, got {:?}",
            &data[0..4]
        )));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != VERSION {
        return Err(StorageError::Corrupt(format!(
            "unsupported version: {}",
            version
        )));
    }
    match SegmentKind::from_u8(data[6]) {
        Some(kind) if kind == expected => {}
        other => {
            return Err(StorageError::Corrupt(format!(
                "expected {:?} segment, got {:?}",
                expected, other
            )));
        }
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[8..16]);
    let payload_len = u64::from_le_bytes(len_bytes) as usize;
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&data[16..20]);
    let crc = u32::from_le_bytes(crc_bytes);

    let payload = data
        .get(HEADER_SIZE..HEADER_SIZE + payload_len)
        .ok_or_else(|| StorageError::Corrupt("payload extends past end of file".into()))?;
    if crc32fast::hash(payload) != crc {
        return Err(StorageError::Corrupt("payload checksum mismatch".into()));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Sample {
        id: u64,
        name: String,
    }

    fn sample() -> Sample {
        Sample {
            id: 42,
            name: "accounts".into(),
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.zst");
        write_segment(&path, SegmentKind::Bucket, &sample()).unwrap();

        assert!(!path.with_extension("tmp").exists());
        let back: Sample = read_segment(&path, SegmentKind::Bucket).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.zst");
        write_segment(&path, SegmentKind::Relfile, &sample()).unwrap();
        let err = read_segment::<Sample>(&path, SegmentKind::Bucket).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    #[test]
    fn test_corrupted_payload_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.zst");
        write_segment(&path, SegmentKind::Bucket, &sample()).unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let err = read_segment::<Sample>(&path, SegmentKind::Bucket).unwrap_err();
        assert!(err.to_string().contains("checksum"));

        fs::write(&path, b"SMS").unwrap();
        assert!(read_segment::<Sample>(&path, SegmentKind::Bucket).is_err());
    }
}
