use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{Settings, Tunables};
use crate::store::{ControlBlock, StatsStore};

/// State shared by every backend and the collector for the server lifetime.
pub struct SharedStats {
    pub store: StatsStore,
    pub tunables: Tunables,
    clock: Arc<dyn Clock>,
}

impl SharedStats {
    pub fn new(settings: &Settings) -> Arc<Self> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: &Settings, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            store: StatsStore::new(),
            tunables: Tunables::new(settings),
            clock,
        })
    }

    pub fn control(&self) -> &ControlBlock {
        self.store.control()
    }

    #[inline]
    pub fn now_micros(&self) -> i64 {
        self.clock.now_micros()
    }
}
