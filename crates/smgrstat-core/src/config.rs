//! Settings and their hot-path mirror.
//!
//! [`Settings`] is the serde form read from the settings file. [`Tunables`]
//! holds the reloadable subset as atomics inside the shared state so the
//! storage path never takes a lock to read them.

use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_DATABASE: &str = "postgres";
pub const DEFAULT_COLLECTION_INTERVAL_SECS: u32 = 60;
pub const MIN_COLLECTION_INTERVAL_SECS: u32 = 1;
pub const MAX_COLLECTION_INTERVAL_SECS: u32 = 3600;
pub const DEFAULT_IO_MAX_CONCURRENCY: usize = 64;

/// How I/O on temporary relations is accounted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TempTracking {
    /// Not tracked at all.
    Off = 0,
    /// One entry per temporary relation fork.
    Individual = 1,
    /// One synthetic entry per database.
    #[default]
    Aggregate = 2,
}

impl TempTracking {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TempTracking::Off,
            1 => TempTracking::Individual,
            _ => TempTracking::Aggregate,
        }
    }
}

impl std::str::FromStr for TempTracking {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(TempTracking::Off),
            "individual" => Ok(TempTracking::Individual),
            "aggregate" => Ok(TempTracking::Aggregate),
            other => Err(ConfigError::Invalid(format!(
                "track_temp_tables must be one of off, individual, aggregate; got {}",
                other
            ))),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read settings: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse settings: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid settings: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Database the collector connects to. Fixed at startup.
    pub database: String,
    /// Seconds between collection cycles (1..=3600). Reloadable.
    pub collection_interval_secs: u32,
    /// Reloadable.
    pub track_temp_tables: TempTracking,
    /// History older than this is deleted; 0 keeps everything. Reloadable.
    pub retention_hours: u32,
    /// Number of async read staging slots per backend.
    pub io_max_concurrency: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            collection_interval_secs: DEFAULT_COLLECTION_INTERVAL_SECS,
            track_temp_tables: TempTracking::default(),
            retention_hours: 0,
            io_max_concurrency: DEFAULT_IO_MAX_CONCURRENCY,
        }
    }
}

impl Settings {
    /// Reads and validates a JSON settings file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        let settings: Settings = serde_json::from_slice(&data)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_COLLECTION_INTERVAL_SECS..=MAX_COLLECTION_INTERVAL_SECS)
            .contains(&self.collection_interval_secs)
        {
            return Err(ConfigError::Invalid(format!(
                "collection_interval_secs must be between {} and {}, got {}",
                MIN_COLLECTION_INTERVAL_SECS,
                MAX_COLLECTION_INTERVAL_SECS,
                self.collection_interval_secs
            )));
        }
        if self.database.is_empty() {
            return Err(ConfigError::Invalid("database must not be empty".into()));
        }
        if self.io_max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "io_max_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Reloadable settings readable without locks.
#[derive(Debug)]
pub struct Tunables {
    collection_interval_secs: AtomicU32,
    track_temp_tables: AtomicU8,
    retention_hours: AtomicU32,
}

impl Tunables {
    pub fn new(settings: &Settings) -> Self {
        Self {
            collection_interval_secs: AtomicU32::new(settings.collection_interval_secs),
            track_temp_tables: AtomicU8::new(settings.track_temp_tables as u8),
            retention_hours: AtomicU32::new(settings.retention_hours),
        }
    }

    /// Applies the reloadable subset. Startup-only fields are ignored by the
    /// caller, which compares them separately.
    pub fn apply(&self, settings: &Settings) {
        let interval = settings
            .collection_interval_secs
            .clamp(MIN_COLLECTION_INTERVAL_SECS, MAX_COLLECTION_INTERVAL_SECS);
        if interval != settings.collection_interval_secs {
            warn!(
                requested = settings.collection_interval_secs,
                applied = interval,
                "collection interval out of range, clamped"
            );
        }
        self.collection_interval_secs
            .store(interval, Ordering::Relaxed);
        self.track_temp_tables
            .store(settings.track_temp_tables as u8, Ordering::Relaxed);
        self.retention_hours
            .store(settings.retention_hours, Ordering::Relaxed);
    }

    pub fn collection_interval_secs(&self) -> u32 {
        self.collection_interval_secs.load(Ordering::Relaxed)
    }

    pub fn track_temp_tables(&self) -> TempTracking {
        TempTracking::from_u8(self.track_temp_tables.load(Ordering::Relaxed))
    }

    pub fn retention_hours(&self) -> u32 {
        self.retention_hours.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.database, "postgres");
        assert_eq!(s.collection_interval_secs, 60);
        assert_eq!(s.track_temp_tables, TempTracking::Aggregate);
        assert_eq!(s.retention_hours, 0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let s: Settings =
            serde_json::from_str(r#"{"collection_interval_secs": 5, "track_temp_tables": "off"}"#)
                .unwrap();
        assert_eq!(s.collection_interval_secs, 5);
        assert_eq!(s.track_temp_tables, TempTracking::Off);
        assert_eq!(s.database, "postgres");
    }

    #[test]
    fn test_interval_bounds() {
        let mut s = Settings::default();
        s.collection_interval_secs = 0;
        assert!(matches!(s.validate(), Err(ConfigError::Invalid(_))));
        s.collection_interval_secs = 3601;
        assert!(s.validate().is_err());
        s.collection_interval_secs = 3600;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"retention_hours": 48}"#).unwrap();
        let s = Settings::load(&path).unwrap();
        assert_eq!(s.retention_hours, 48);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Settings::load(&path), Err(ConfigError::Parse(_))));
        assert!(matches!(
            Settings::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_tunables_apply() {
        let t = Tunables::new(&Settings::default());
        let s = Settings {
            collection_interval_secs: 10,
            track_temp_tables: TempTracking::Individual,
            retention_hours: 24,
            ..Settings::default()
        };
        t.apply(&s);
        assert_eq!(t.collection_interval_secs(), 10);
        assert_eq!(t.track_temp_tables(), TempTracking::Individual);
        assert_eq!(t.retention_hours(), 24);
    }

    #[test]
    fn test_temp_tracking_from_str() {
        assert_eq!("off".parse::<TempTracking>().unwrap(), TempTracking::Off);
        assert!("all".parse::<TempTracking>().is_err());
    }
}
