pub mod history;
pub mod model;
pub mod segment;

pub use history::{
    HistorySink, HistoryStore, RotationResult, SegmentFile, list_segments, parse_segment_name,
    read_bucket, read_relfile,
};
pub use model::{BucketRecord, RelfileRecord};
pub use segment::SegmentKind;

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Encode(postcard::Error),
    Corrupt(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "I/O error: {}", e),
            StorageError::Encode(e) => write!(f, "serialization error: {}", e),
            StorageError::Corrupt(msg) => write!(f, "corrupt segment: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Encode(e) => Some(e),
            StorageError::Corrupt(_) => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<postcard::Error> for StorageError {
    fn from(e: postcard::Error) -> Self {
        StorageError::Encode(e)
    }
}
