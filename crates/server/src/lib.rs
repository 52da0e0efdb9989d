//! HTTP front end for the metrics store.

pub mod error;
pub mod handlers;
pub mod server;
pub mod signature;
pub mod status_page;

pub use server::{AppState, build_app, run, serve};
