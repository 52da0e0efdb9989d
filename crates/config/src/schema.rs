/// Config schema types (server, storage, agent).
use std::{path::PathBuf, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub agent: AgentConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `host:port` to listen on.
    pub address: String,
    /// Shared key for `HashSHA256` request signing. Unset disables the check.
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub key: Option<Secret<String>>,
    /// Append logs to this file instead of stdout.
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8080".into(),
            key: None,
            log_file: None,
        }
    }
}

/// Storage backend configuration.
///
/// Backend selection happens once, in this order: `database_dsn` set →
/// database, `file_storage_path` set → file snapshot, otherwise memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// sqlx connection string, e.g. `sqlite:tally.db?mode=rwc`.
    pub database_dsn: Option<String>,
    /// Snapshot file for the file backend.
    pub file_storage_path: Option<PathBuf>,
    /// Seconds between background snapshots. 0 disables the timer; the
    /// snapshot is then only written on close.
    pub store_interval: u64,
    /// Write the snapshot after every accepted update.
    pub sync_flush: bool,
    /// Load the snapshot file at startup.
    pub restore: bool,
    pub retry: RetryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_dsn: None,
            file_storage_path: None,
            store_interval: 300,
            sync_flush: false,
            restore: true,
            retry: RetryConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Empty strings from env/flags count as "not configured".
    #[must_use]
    pub fn database_dsn(&self) -> Option<&str> {
        self.database_dsn.as_deref().filter(|dsn| !dsn.trim().is_empty())
    }

    #[must_use]
    pub fn file_storage_path(&self) -> Option<&PathBuf> {
        self.file_storage_path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    #[must_use]
    pub fn store_interval(&self) -> Duration {
        Duration::from_secs(self.store_interval)
    }
}

/// Retry schedule for transient database failures.
///
/// The delay before retry `n` (1-based) is `initial_delay_ms + (n - 1) * step_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub step_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            step_ms: 2_000,
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Server `host:port` (or full `http://` base URL) to report to.
    pub address: String,
    /// Seconds between metric polls.
    pub poll_interval: u64,
    /// Seconds between reports to the server.
    pub report_interval: u64,
    /// Maximum concurrent in-flight reports. 0 is treated as 1.
    pub rate_limit: usize,
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub key: Option<Secret<String>>,
    pub retry: RetryConfig,
    /// Append logs to this file instead of stdout.
    pub log_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8080".into(),
            poll_interval: 2,
            report_interval: 10,
            rate_limit: 1,
            key: None,
            retry: RetryConfig::default(),
            log_file: None,
        }
    }
}

impl AgentConfig {
    /// Base URL of the server, adding `http://` when no scheme is given.
    #[must_use]
    pub fn base_url(&self) -> String {
        let address = self.address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        }
    }
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
