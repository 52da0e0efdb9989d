//! Metrics agent: samples host gauges on one timer and ships them to the
//! server on another.

pub mod collector;
pub mod error;
pub mod runner;
pub mod sender;

pub use {
    collector::{GaugeSource, PollState, SystemCollector},
    error::{Error, Result},
    runner::Agent,
    sender::Sender,
};
