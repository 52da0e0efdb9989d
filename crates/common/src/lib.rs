//! Pieces shared by the tally server and agent.

pub mod error;
pub mod shutdown;
pub mod signing;

pub use {
    error::{Error, Result},
    shutdown::shutdown_signal,
    signing::{HASH_HEADER, SigningKey},
};
