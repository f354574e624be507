//! Logging and in-process metrics for the flexicli runtime.
//!
//! The metrics collector here is a cache for live dashboards; the session
//! store's counters table remains the durable source of truth.

pub mod logging;
pub mod metrics;
