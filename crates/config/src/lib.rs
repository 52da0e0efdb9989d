//! Configuration schema and loading.
//!
//! Config files: `tally.toml`, `tally.yaml`, or `tally.json`
//! Searched in `./` then `~/.config/tally/`.

pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, discover_and_load, load_config, load_or_discover},
    schema::{AgentConfig, RetryConfig, ServerConfig, StorageConfig, TallyConfig},
};
