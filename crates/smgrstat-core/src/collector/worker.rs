//! Background worker hosting the [`Collector`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, error, info, warn};

use super::Collector;
use crate::config::Settings;
use crate::shared::SharedStats;

pub const COLLECTOR_NAME: &str = "smgrstat collector";
pub const RESTART_DELAY: Duration = Duration::from_secs(10);

/// Messages the host sends to a running collector.
#[derive(Debug, Clone)]
pub enum WorkerSignal {
    /// Collect now instead of waiting for the interval.
    Wake,
    /// Apply reloadable settings. Does not trigger a collection.
    Reload(Settings),
    /// Run a final collection and exit.
    Terminate,
}

/// When the host may start the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPhase {
    ServerStart,
    ConsistentState,
    AfterRecovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerFlags {
    pub shared_memory: bool,
    pub database_connection: bool,
}

/// How the host registers and supervises the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRegistration {
    pub name: String,
    pub restart_delay: Duration,
    pub start_phase: StartPhase,
    pub flags: WorkerFlags,
}

impl Default for WorkerRegistration {
    fn default() -> Self {
        Self {
            name: COLLECTOR_NAME.to_string(),
            restart_delay: RESTART_DELAY,
            start_phase: StartPhase::AfterRecovery,
            flags: WorkerFlags {
                shared_memory: true,
                database_connection: true,
            },
        }
    }
}

/// Outcome of [`Collector::run`].
enum Exit {
    Terminated,
    Disconnected,
}

impl Collector {
    /// Main loop: collects every `collection_interval_secs` or on
    /// [`WorkerSignal::Wake`], until terminated.
    pub fn run(&mut self, signals: &Receiver<WorkerSignal>) {
        let exit = loop {
            let interval = Duration::from_secs(u64::from(
                self.shared.tunables.collection_interval_secs(),
            ));
            match signals.recv_timeout(interval) {
                Ok(WorkerSignal::Wake) | Err(RecvTimeoutError::Timeout) => {
                    self.run_cycle();
                }
                Ok(WorkerSignal::Reload(settings)) => {
                    self.shared.tunables.apply(&settings);
                    info!(
                        interval = self.shared.tunables.collection_interval_secs(),
                        track_temp_tables = ?self.shared.tunables.track_temp_tables(),
                        retention_hours = self.shared.tunables.retention_hours(),
                        "collector settings reloaded"
                    );
                }
                Ok(WorkerSignal::Terminate) => break Exit::Terminated,
                Err(RecvTimeoutError::Disconnected) => break Exit::Disconnected,
            }
        };

        match exit {
            Exit::Terminated => debug!("collector terminating, running final cycle"),
            Exit::Disconnected => warn!("collector signal channel closed, running final cycle"),
        }
        self.run_cycle();
    }
}

/// Control handle for a spawned collector.
pub struct CollectorHandle {
    tx: Sender<WorkerSignal>,
    thread: JoinHandle<()>,
}

impl CollectorHandle {
    fn send(&self, signal: WorkerSignal) {
        if self.tx.send(signal).is_err() {
            warn!("collector is not running, signal dropped");
        }
    }

    pub fn wake(&self) {
        self.send(WorkerSignal::Wake);
    }

    pub fn reload(&self, settings: Settings) {
        self.send(WorkerSignal::Reload(settings));
    }

    pub fn terminate(&self) {
        self.send(WorkerSignal::Terminate);
    }

    /// Waits for the worker thread to exit.
    pub fn join(self) -> thread::Result<()> {
        drop(self.tx);
        self.thread.join()
    }
}

/// Starts the collector on its own thread. `factory` builds a fresh
/// collector at start and after every crash; a crashed collector is
/// restarted after `restart_delay`.
pub fn spawn_collector<F>(
    registration: WorkerRegistration,
    shared: Arc<SharedStats>,
    mut factory: F,
) -> std::io::Result<CollectorHandle>
where
    F: FnMut(Arc<SharedStats>) -> Collector + Send + 'static,
{
    let (tx, rx) = unbounded();
    let name = registration.name.clone();
    let thread = thread::Builder::new().name(name).spawn(move || {
        info!(
            name = %registration.name,
            start_phase = ?registration.start_phase,
            "collector started"
        );
        loop {
            let result = catch_unwind(AssertUnwindSafe(|| {
                let mut collector = factory(shared.clone());
                collector.run(&rx);
            }));
            if result.is_ok() {
                break;
            }
            error!(
                name = %registration.name,
                restart_in = ?registration.restart_delay,
                "collector crashed"
            );
            if !wait_for_restart(&rx, &shared, registration.restart_delay) {
                break;
            }
        }
        info!(name = %registration.name, "collector stopped");
    })?;
    Ok(CollectorHandle { tx, thread })
}

/// Sleeps out the restart delay. Returns false if the worker should stop
/// instead of restarting.
fn wait_for_restart(rx: &Receiver<WorkerSignal>, shared: &SharedStats, delay: Duration) -> bool {
    let deadline = std::time::Instant::now() + delay;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return true;
        }
        match rx.recv_timeout(remaining) {
            Ok(WorkerSignal::Reload(settings)) => shared.tunables.apply(&settings),
            Ok(WorkerSignal::Wake) => {}
            Ok(WorkerSignal::Terminate) | Err(RecvTimeoutError::Disconnected) => return false,
            Err(RecvTimeoutError::Timeout) => return true,
        }
    }
}
