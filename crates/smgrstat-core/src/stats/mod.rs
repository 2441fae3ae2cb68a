//! Online statistics primitives shared by every stats entry.

pub mod histogram;
mod online;

pub use histogram::{HIST_BINS, Histogram, HistogramError, percentile};
pub use online::OnlineStats;
