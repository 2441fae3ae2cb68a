//! smgrstatd - storage I/O statistics host.
//!
//! Hosts the statistics collector in a background worker and drives a
//! synthetic workload of backends through the storage manager chain.
//! History segments are written to the output directory every collection
//! interval.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Returns unused jemalloc pages to the operating system.
fn release_memory_to_os() {
    // SAFETY: mallctl with a valid NUL-terminated name and no in/out values.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use chrono::{Timelike, Utc};
use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use smgrstat_core::backend::{BackendContext, UnitOfWork};
use smgrstat_core::collector::{Collector, WorkerRegistration, spawn_collector};
use smgrstat_core::config::{ConfigError, Settings, TempTracking};
#[cfg(feature = "postgres")]
use smgrstat_core::metadata::pg::PgCatalog;
use smgrstat_core::metadata::{CatalogLookup, SessionState, StaticCatalog, StaticRelation};
use smgrstat_core::shared::SharedStats;
use smgrstat_core::smgr::{
    AioHandle, AioResult, BLOCK_SIZE, MemSmgr, MemStorage, Page, SmgrChain, SmgrRelation,
    SmgrResult, StatsLink,
};
use smgrstat_core::storage::HistoryStore;
use smgrstat_core::store::{ForkNumber, Oid, RelFileLocator, RelKind};

const DATABASE_OID: Oid = 16384;
const DEFAULT_TABLESPACE: Oid = 1663;
const PUBLIC_NAMESPACE: Oid = 2200;
const SCRATCH_NAMESPACE: Oid = 16385;
const FIRST_TABLE: Oid = 16400;
const FIRST_SCRATCH: Oid = 30000;
/// A rewritten scratch table alternates between two relation numbers.
const REWRITE_OFFSET: Oid = 1000;
const FIRST_TEMP: Oid = 40000;
const SCRATCH_BLOCKS: u32 = 64;
const TEMP_MAX_BLOCKS: u32 = 32;
const MAX_SCAN_BLOCKS: u32 = 16;
/// Old locator passed when a relation is created fresh rather than rewritten.
const NO_OLD_RELFILE: RelFileLocator = RelFileLocator {
    spc_oid: 0,
    db_oid: 0,
    rel_number: 0,
};

/// Storage I/O statistics host.
#[derive(Parser)]
#[command(name = "smgrstatd", about = "Storage I/O statistics host", version)]
struct Args {
    /// Output directory for history segments.
    #[arg(short, long, default_value = "./smgrstat-data")]
    output_dir: PathBuf,

    /// JSON settings file. Re-read when its modification time changes.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Collection interval in seconds (overrides the settings file).
    #[arg(short, long)]
    interval: Option<u32>,

    /// History retention in hours, 0 keeps everything (overrides the settings file).
    #[arg(long)]
    retention_hours: Option<u32>,

    /// Temporary table tracking: off, individual or aggregate (overrides the settings file).
    #[arg(long)]
    track_temp: Option<TempTracking>,

    /// Number of synthetic backends.
    #[arg(short, long, default_value = "4")]
    backends: u32,

    /// Number of shared tables the backends scan.
    #[arg(long, default_value = "8")]
    tables: u32,

    /// Size of each shared table in blocks.
    #[arg(long, default_value = "1024")]
    table_blocks: u32,

    /// Statements per second per backend.
    #[arg(long, default_value = "100")]
    rate: u32,

    /// Simulated storage latency per read and write, in microseconds.
    #[arg(long, default_value = "50")]
    io_latency_us: u64,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration: Option<u64>,

    /// Resolve relation identities from PostgreSQL.
    /// Uses PGUSER or $USER for connection.
    #[cfg(feature = "postgres")]
    #[arg(long)]
    postgres: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["smgrstatd", "smgrstat_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Settings file (or defaults) with command line overrides applied.
fn load_settings(args: &Args) -> Result<Settings, ConfigError> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(interval) = args.interval {
        settings.collection_interval_secs = interval;
    }
    if let Some(hours) = args.retention_hours {
        settings.retention_hours = hours;
    }
    if let Some(mode) = args.track_temp {
        settings.track_temp_tables = mode;
    }
    settings.validate()?;
    Ok(settings)
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ── Catalog ──────────────────────────────────────────────────────────────────

/// Catalog that knows every relation of the synthetic workload.
fn workload_catalog(args: &Args) -> StaticCatalog {
    let mut catalog = StaticCatalog::new();
    catalog.add_namespace(SCRATCH_NAMESPACE, "scratch");
    let mut add = |rel_number: Oid, reloid: Oid, relname: String, nsp_oid: Oid| {
        catalog.add_relation(
            0,
            rel_number,
            StaticRelation {
                reloid,
                main_reloid: 0,
                relkind: RelKind::Table,
                relname,
                nsp_oid,
            },
        );
    };
    for i in 0..args.tables {
        add(FIRST_TABLE + i, FIRST_TABLE + i, format!("table_{}", i), PUBLIC_NAMESPACE);
    }
    for b in 0..args.backends {
        let reloid = FIRST_SCRATCH + b;
        let name = format!("backend_{}", b);
        add(reloid, reloid, name.clone(), SCRATCH_NAMESPACE);
        add(reloid + REWRITE_OFFSET, reloid, name, SCRATCH_NAMESPACE);
    }
    catalog
}

#[derive(Clone)]
enum CatalogSource {
    Workload(StaticCatalog),
    #[cfg(feature = "postgres")]
    Postgres(String),
}

impl CatalogSource {
    fn open(&self) -> Box<dyn CatalogLookup> {
        match self {
            CatalogSource::Workload(catalog) => Box::new(catalog.clone()),
            #[cfg(feature = "postgres")]
            CatalogSource::Postgres(database) => match PgCatalog::from_env(database) {
                Ok(catalog) => Box::new(catalog),
                Err(e) => {
                    warn!("PostgreSQL catalog unavailable ({}), identities stay unresolved", e);
                    Box::new(StaticCatalog::new())
                }
            },
        }
    }
}

#[cfg(feature = "postgres")]
fn catalog_source(args: &Args, settings: &Settings) -> CatalogSource {
    if !args.postgres {
        debug!("Catalog: synthetic workload");
        return CatalogSource::Workload(workload_catalog(args));
    }
    match PgCatalog::from_env(&settings.database) {
        Ok(_) => {
            info!("Catalog: PostgreSQL database {}", settings.database);
            CatalogSource::Postgres(settings.database.clone())
        }
        Err(e) => {
            warn!("PostgreSQL catalog: disabled ({})", e);
            print_pg_warning(&e.to_string());
            CatalogSource::Workload(workload_catalog(args))
        }
    }
}

#[cfg(not(feature = "postgres"))]
fn catalog_source(args: &Args, _settings: &Settings) -> CatalogSource {
    CatalogSource::Workload(workload_catalog(args))
}

// ── Workload ─────────────────────────────────────────────────────────────────

/// xorshift64; only needs to spread accesses around.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: u32) -> u32 {
        (self.next() % u64::from(n.max(1))) as u32
    }
}

fn pages(n: u32) -> Vec<Page> {
    vec![[0u8; BLOCK_SIZE]; n as usize]
}

fn locator(rel_number: Oid) -> RelFileLocator {
    RelFileLocator::new(DEFAULT_TABLESPACE, DATABASE_OID, rel_number)
}

fn session() -> SessionState {
    SessionState::new(DATABASE_OID, DEFAULT_TABLESPACE)
}

fn stats_chain(storage: &Arc<MemStorage>) -> SmgrChain {
    SmgrChain::new()
        .with(StatsLink::new())
        .with(MemSmgr::new(storage.clone()))
}

/// One synthetic backend: shared tables, a private scratch table that is
/// rewritten now and then, and a temporary table.
struct Backend {
    id: u32,
    chain: SmgrChain,
    cx: BackendContext,
    rng: XorShift,
    tables: Vec<SmgrRelation>,
    table_blocks: u32,
    scratch: SmgrRelation,
    temp: Option<SmgrRelation>,
    temp_blocks: u32,
    next_aio: u64,
}

impl Backend {
    fn new(
        id: u32,
        shared: Arc<SharedStats>,
        storage: &Arc<MemStorage>,
        catalog: Box<dyn CatalogLookup>,
        io_max_concurrency: usize,
        tables: Vec<SmgrRelation>,
        table_blocks: u32,
    ) -> SmgrResult<Self> {
        let mut backend = Self {
            id,
            chain: stats_chain(storage),
            cx: BackendContext::new(shared, session(), catalog, io_max_concurrency),
            rng: XorShift::new(u64::from(id) + 1),
            tables,
            table_blocks,
            scratch: SmgrRelation::new(locator(FIRST_SCRATCH + id)),
            temp: None,
            temp_blocks: 0,
            next_aio: 0,
        };
        let scratch = backend.scratch;
        backend.cx.begin_transaction();
        backend.chain.create(
            &mut backend.cx,
            NO_OLD_RELFILE,
            &scratch,
            ForkNumber::Main,
            false,
        )?;
        backend.chain.zero_extend(
            &mut backend.cx,
            &scratch,
            ForkNumber::Main,
            0,
            SCRATCH_BLOCKS,
            false,
        )?;
        backend.cx.after_unit_of_work(UnitOfWork::Utility {
            created_database: None,
            succeeded: true,
        });
        backend.cx.end_transaction();
        Ok(backend)
    }

    fn run(&mut self, running: &AtomicBool, pause: Duration) -> u64 {
        let mut statements = 0u64;
        while running.load(Ordering::SeqCst) {
            self.cx.begin_transaction();
            if let Err(e) = self.statement() {
                warn!(backend = self.id, error = %e, "statement failed");
            }
            self.cx.after_unit_of_work(UnitOfWork::Dml);
            self.cx.end_transaction();
            statements += 1;
            thread::sleep(pause);
        }
        let stats = self.cx.shutdown();
        info!(
            backend = self.id,
            statements,
            unresolved = stats.retained,
            "backend exited"
        );
        statements
    }

    fn statement(&mut self) -> SmgrResult<()> {
        match self.rng.below(100) {
            0..40 => self.seq_scan(),
            40..65 => self.index_lookup(),
            65..85 => self.update(),
            85..92 => self.prefetch(),
            92..97 => self.temp_write(),
            _ => self.rewrite(),
        }
    }

    fn pick_table(&mut self) -> SmgrRelation {
        let n = self.tables.len() as u32;
        self.tables[self.rng.below(n) as usize]
    }

    /// Block-by-block reads of a contiguous range.
    fn seq_scan(&mut self) -> SmgrResult<()> {
        let rel = self.pick_table();
        let start = self.rng.below(self.table_blocks);
        let end = (start + 1 + self.rng.below(MAX_SCAN_BLOCKS)).min(self.table_blocks);
        let mut buf = pages(1);
        for block in start..end {
            self.chain
                .readv(&mut self.cx, &rel, ForkNumber::Main, block, &mut buf)?;
        }
        Ok(())
    }

    fn index_lookup(&mut self) -> SmgrResult<()> {
        let mut buf = pages(1);
        for _ in 0..=self.rng.below(4) {
            let rel = self.pick_table();
            let block = self.rng.below(self.table_blocks);
            self.chain
                .readv(&mut self.cx, &rel, ForkNumber::Main, block, &mut buf)?;
        }
        Ok(())
    }

    fn update(&mut self) -> SmgrResult<()> {
        let n = 1 + self.rng.below(8);
        let block = self.rng.below(SCRATCH_BLOCKS - n + 1);
        let scratch = self.scratch;
        self.chain
            .writev(&mut self.cx, &scratch, ForkNumber::Main, block, &pages(n), false)?;
        if self.rng.below(4) == 0 {
            self.chain
                .immedsync(&mut self.cx, &scratch, ForkNumber::Main)?;
        }
        Ok(())
    }

    /// Asynchronous multi-block read.
    fn prefetch(&mut self) -> SmgrResult<()> {
        let rel = self.pick_table();
        let nblocks = (1 + self.rng.below(4)).min(self.table_blocks);
        let block = self.rng.below(self.table_blocks - nblocks + 1);
        let handle = AioHandle {
            id: self.next_aio,
            nblocks,
        };
        self.next_aio += 1;
        self.chain
            .start_readv(&mut self.cx, &handle, &rel, ForkNumber::Main, block)?;
        self.chain
            .complete_readv(&mut self.cx, &handle, AioResult::Ok);
        Ok(())
    }

    fn temp_write(&mut self) -> SmgrResult<()> {
        let temp = match self.temp {
            Some(temp) => temp,
            None => {
                let temp = SmgrRelation::temp(locator(FIRST_TEMP + self.id));
                self.chain.create(
                    &mut self.cx,
                    NO_OLD_RELFILE,
                    &temp,
                    ForkNumber::Main,
                    false,
                )?;
                self.temp = Some(temp);
                temp
            }
        };
        if self.temp_blocks >= TEMP_MAX_BLOCKS {
            self.chain.truncate(
                &mut self.cx,
                &temp,
                ForkNumber::Main,
                self.temp_blocks,
                0,
            )?;
            self.temp_blocks = 0;
        }
        let page = [0u8; BLOCK_SIZE];
        self.chain.extend(
            &mut self.cx,
            &temp,
            ForkNumber::Main,
            self.temp_blocks,
            &page,
            true,
        )?;
        self.temp_blocks += 1;
        Ok(())
    }

    /// Rewrites the scratch table into its alternate relation number.
    fn rewrite(&mut self) -> SmgrResult<()> {
        let old = self.scratch;
        let base = FIRST_SCRATCH + self.id;
        let new_number = if old.locator.rel_number == base {
            base + REWRITE_OFFSET
        } else {
            base
        };
        let new = SmgrRelation::new(locator(new_number));
        self.chain
            .create(&mut self.cx, old.locator, &new, ForkNumber::Main, false)?;
        self.chain
            .zero_extend(&mut self.cx, &new, ForkNumber::Main, 0, SCRATCH_BLOCKS, false)?;
        self.chain
            .truncate(&mut self.cx, &old, ForkNumber::Main, SCRATCH_BLOCKS, 0)?;
        self.chain.immedsync(&mut self.cx, &new, ForkNumber::Main)?;
        self.scratch = new;
        debug!(
            backend = self.id,
            old = %old.locator,
            new = %new.locator,
            "scratch table rewritten"
        );
        Ok(())
    }
}

/// Creates the shared tables through the chain so their creation is
/// accounted like any other I/O.
fn prepare_tables(
    args: &Args,
    shared: &Arc<SharedStats>,
    storage: &Arc<MemStorage>,
    catalog: Box<dyn CatalogLookup>,
) -> SmgrResult<Vec<SmgrRelation>> {
    let mut chain = stats_chain(storage);
    debug!(links = ?chain.link_names(), "storage manager chain");
    let mut cx = BackendContext::new(shared.clone(), session(), catalog, 1);
    let mut tables = Vec::with_capacity(args.tables as usize);
    cx.begin_transaction();
    for i in 0..args.tables {
        let rel = SmgrRelation::new(locator(FIRST_TABLE + i));
        chain.create(&mut cx, NO_OLD_RELFILE, &rel, ForkNumber::Main, false)?;
        chain.zero_extend(&mut cx, &rel, ForkNumber::Main, 0, args.table_blocks, false)?;
        tables.push(rel);
    }
    cx.after_unit_of_work(UnitOfWork::Utility {
        created_database: None,
        succeeded: true,
    });
    cx.end_transaction();
    cx.shutdown();
    Ok(tables)
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let mut settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid settings: {}", e);
            std::process::exit(1);
        }
    };
    if args.backends == 0 || args.tables == 0 || args.table_blocks < 4 {
        error!("Need at least one backend, one table and four blocks per table");
        std::process::exit(1);
    }

    info!("smgrstatd {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: interval={}s, retention={}h, temp tables={:?}, output={}",
        settings.collection_interval_secs,
        settings.retention_hours,
        settings.track_temp_tables,
        args.output_dir.display()
    );
    info!(
        "Workload: {} backends, {} tables x {} blocks, {} statements/s each",
        args.backends, args.tables, args.table_blocks, args.rate
    );

    let history = match HistoryStore::new(&args.output_dir) {
        Ok(history) => history,
        Err(e) => {
            error!("Cannot open {}: {}", args.output_dir.display(), e);
            std::process::exit(1);
        }
    };
    info!("History stored at {}", history.base_path().display());

    let shared = SharedStats::new(&settings);
    let catalogs = catalog_source(&args, &settings);
    let storage = MemStorage::with_latency(Duration::from_micros(args.io_latency_us));

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let collector_catalogs = catalogs.clone();
    let collector = match spawn_collector(
        WorkerRegistration::default(),
        shared.clone(),
        move |shared| {
            Collector::new(
                shared,
                session(),
                collector_catalogs.open(),
                Box::new(history.clone()),
            )
        },
    ) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start collector: {}", e);
            std::process::exit(1);
        }
    };

    let tables = match prepare_tables(&args, &shared, &storage, catalogs.open()) {
        Ok(tables) => tables,
        Err(e) => {
            error!("Failed to create tables: {}", e);
            collector.terminate();
            let _ = collector.join();
            std::process::exit(1);
        }
    };

    let pause = Duration::from_micros(1_000_000 / u64::from(args.rate.max(1)));
    let mut backends: Vec<JoinHandle<()>> = Vec::with_capacity(args.backends as usize);
    for id in 0..args.backends {
        let shared = shared.clone();
        let storage = storage.clone();
        let catalog = catalogs.open();
        let tables = tables.clone();
        let running = running.clone();
        let io_max_concurrency = settings.io_max_concurrency;
        let table_blocks = args.table_blocks;
        let spawned = thread::Builder::new()
            .name(format!("backend-{}", id))
            .spawn(move || {
                match Backend::new(
                    id,
                    shared,
                    &storage,
                    catalog,
                    io_max_concurrency,
                    tables,
                    table_blocks,
                ) {
                    Ok(mut backend) => {
                        backend.run(&running, pause);
                    }
                    Err(e) => error!(backend = id, error = %e, "backend failed to start"),
                }
            });
        match spawned {
            Ok(handle) => backends.push(handle),
            Err(e) => error!("Failed to start backend {}: {}", id, e),
        }
    }
    info!("{} backends running", backends.len());

    let started = Instant::now();
    let deadline = args.duration.map(Duration::from_secs);
    let mut config_mtime = args.config.as_deref().and_then(modified_at);
    let mut last_config_check = Instant::now();
    let mut last_purge_hour = Utc::now().hour();

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));

        if deadline.is_some_and(|d| started.elapsed() >= d) {
            info!("Duration elapsed");
            running.store(false, Ordering::SeqCst);
            break;
        }

        if let Some(path) = args.config.as_deref()
            && last_config_check.elapsed() >= Duration::from_secs(1)
        {
            last_config_check = Instant::now();
            let mtime = modified_at(path);
            if mtime != config_mtime {
                config_mtime = mtime;
                match load_settings(&args) {
                    Ok(new) => {
                        if new.database != settings.database {
                            warn!("database change to {} needs a restart", new.database);
                        }
                        info!("Settings file changed, reloading");
                        collector.reload(new.clone());
                        settings = new;
                    }
                    Err(e) => warn!("Ignoring settings change: {}", e),
                }
            }
        }

        let hour = Utc::now().hour();
        if hour != last_purge_hour {
            last_purge_hour = hour;
            release_memory_to_os();
            debug!("Memory released");
        }
    }

    // Graceful shutdown: backends first so their open runs reach the final cycle.
    info!("Shutting down...");
    running.store(false, Ordering::SeqCst);
    for handle in backends {
        if handle.join().is_err() {
            error!("Backend thread panicked");
        }
    }
    collector.terminate();
    if collector.join().is_err() {
        error!("Collector thread panicked");
    }
    info!(entries = shared.store.len(), "Shutdown complete");
}

/// Prints a colored PostgreSQL warning with configuration hints.
#[cfg(feature = "postgres")]
fn print_pg_warning(error: &str) {
    const RED: &str = "\x1b[1;31m";
    const YELLOW: &str = "\x1b[33m";
    const RESET: &str = "\x1b[0m";

    eprintln!("{RED}PostgreSQL: {error}{RESET}");
    eprintln!();
    eprintln!("{YELLOW}  Configure connection with environment variables:");
    eprintln!("    PGHOST     - server host (default: localhost)");
    eprintln!("    PGPORT     - server port (default: 5432)");
    eprintln!("    PGUSER     - user name (default: $USER)");
    eprintln!("    PGPASSWORD - password{RESET}");
    eprintln!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xorshift_below_stays_in_range() {
        let mut rng = XorShift::new(7);
        for _ in 0..1000 {
            assert!(rng.below(10) < 10);
        }
        assert_eq!(rng.below(0), 0);
    }

    #[test]
    fn test_workload_catalog_covers_rewrites() {
        let args = Args::parse_from(["smgrstatd", "--backends", "2", "--tables", "3"]);
        let mut catalog = workload_catalog(&args);
        let a = catalog.lookup_relation(0, FIRST_SCRATCH + 1).unwrap().unwrap();
        let b = catalog
            .lookup_relation(0, FIRST_SCRATCH + 1 + REWRITE_OFFSET)
            .unwrap()
            .unwrap();
        assert_eq!(a.reloid, b.reloid);
        assert_eq!(a.relname, "backend_1");
        assert_eq!(a.nspname, "scratch");
        assert_eq!(
            catalog.lookup_relation(0, FIRST_TABLE + 2).unwrap().unwrap().nspname,
            "public"
        );
        assert!(catalog.lookup_relation(0, FIRST_TABLE + 3).unwrap().is_none());
    }

    #[test]
    fn test_overrides_apply_to_defaults() {
        let args = Args::parse_from([
            "smgrstatd",
            "--interval",
            "5",
            "--retention-hours",
            "48",
            "--track-temp",
            "off",
        ]);
        let settings = load_settings(&args).unwrap();
        assert_eq!(settings.collection_interval_secs, 5);
        assert_eq!(settings.retention_hours, 48);
        assert_eq!(settings.track_temp_tables, TempTracking::Off);

        let bad = Args::parse_from(["smgrstatd", "--interval", "0"]);
        assert!(load_settings(&bad).is_err());
    }

    #[test]
    fn test_backend_statements_are_accounted() {
        let args = Args::parse_from(["smgrstatd", "--tables", "2", "--table-blocks", "32"]);
        let shared = SharedStats::new(&Settings::default());
        let storage = MemStorage::new();
        let catalog = workload_catalog(&args);
        let tables =
            prepare_tables(&args, &shared, &storage, Box::new(catalog.clone())).unwrap();
        let mut backend = Backend::new(
            0,
            shared.clone(),
            &storage,
            Box::new(catalog),
            4,
            tables,
            args.table_blocks,
        )
        .unwrap();
        backend.cx.begin_transaction();
        for _ in 0..200 {
            backend.statement().unwrap();
            backend.cx.after_unit_of_work(UnitOfWork::Dml);
        }
        backend.cx.shutdown();

        let snapshot = shared.store.snapshot(false);
        assert!(snapshot.entries.iter().any(|e| e.reads > 0));
        assert!(snapshot.entries.iter().any(|e| e.writes > 0));
        assert!(
            snapshot
                .entries
                .iter()
                .filter(|e| !e.key.is_temp_aggregate())
                .all(|e| e.meta.valid)
        );
    }
}
