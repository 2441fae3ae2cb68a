//! smgrstat-core: per-object storage I/O statistics.
//!
//! Provides:
//! - `stats`: log2 latency histogram and streaming mean/variance
//! - `store`: shared keyed entry table, control block, relfile event ring
//! - `seq`: per-backend sequential run detection
//! - `metadata`: deferred catalog identity resolution
//! - `smgr`: storage manager intercept chain and the statistics link
//! - `backend`: per-backend context and lifecycle hooks
//! - `collector`: periodic drain into history, background worker
//! - `storage`: durable history segments and retention
//! - `config`, `clock`, `shared`: settings, time source, shared state
//!
//! With `postgres` feature (default):
//! - `metadata::pg`: catalog lookups over a PostgreSQL connection

pub mod backend;
pub mod clock;
pub mod collector;
pub mod config;
pub mod metadata;
pub mod seq;
pub mod shared;
pub mod smgr;
pub mod stats;
pub mod storage;
pub mod store;

pub use backend::{BackendContext, UnitOfWork};
pub use collector::{Collector, CycleReport};
pub use config::{Settings, TempTracking};
pub use shared::SharedStats;
