//! Metric state and persistence.
//! Counters accumulate `i64` deltas, gauges keep the last `f64` written.
//! Backends: memory, memory plus a JSON snapshot file, or SQLite.

pub mod backend;
pub mod database;
pub mod error;
pub mod file;
pub mod memory;
pub mod model;
pub mod retry;
pub mod service;

pub use {
    backend::MetricsBackend,
    database::run_migrations,
    error::{Error, Result},
    model::{Metric, MetricKind, MetricUpdate, MetricValue, MetricsSnapshot},
    service::MetricsService,
};
