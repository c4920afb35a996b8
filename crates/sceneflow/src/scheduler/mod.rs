//! Job scheduling: polling dispatcher, bounded worker pool, retry
//! backoff, and the stale-job sweep.

pub mod backoff;
pub mod pool;
pub mod sweep;

pub use pool::{JobListener, Scheduler};
