//! Command-line and environment overrides for the loaded config.
//!
//! Precedence, highest first: explicit flag, environment variable, config
//! file, built-in default.

use std::path::PathBuf;

use {
    clap::Args,
    secrecy::Secret,
    tally_config::TallyConfig,
};

#[derive(Debug, Default, Args)]
pub struct ServerArgs {
    /// Listen address (host:port).
    #[arg(short, long, env = "ADDRESS")]
    pub address: Option<String>,
    /// Seconds between snapshot writes; 0 writes only on shutdown.
    #[arg(short = 'i', long, env = "STORE_INTERVAL")]
    pub store_interval: Option<u64>,
    /// Snapshot file for the file backend.
    #[arg(short, long, env = "FILE_STORAGE_PATH")]
    pub file_storage_path: Option<PathBuf>,
    /// Write the snapshot after every update.
    #[arg(long, env = "SYNC_FLUSH")]
    pub sync_flush: Option<bool>,
    /// Load the snapshot file at startup.
    #[arg(short, long, env = "RESTORE")]
    pub restore: Option<bool>,
    /// Database connection string; selects the database backend.
    #[arg(short, long, env = "DATABASE_DSN")]
    pub database_dsn: Option<String>,
    /// Shared key for HashSHA256 signatures.
    #[arg(short, long, env = "KEY", hide_env_values = true)]
    pub key: Option<String>,
    /// Append logs to this file instead of stdout.
    #[arg(short = 'l', long, env = "SERVER_LOGGER_FILE")]
    pub log_file: Option<PathBuf>,
}

impl ServerArgs {
    pub fn apply(&self, config: &mut TallyConfig) {
        if let Some(address) = self.address.clone() {
            config.server.address = address;
        }
        if let Some(key) = self.key.clone() {
            config.server.key = Some(Secret::new(key));
        }
        if let Some(path) = self.log_file.clone() {
            config.server.log_file = Some(path);
        }
        let storage = &mut config.storage;
        if let Some(interval) = self.store_interval {
            storage.store_interval = interval;
        }
        if let Some(path) = self.file_storage_path.clone() {
            storage.file_storage_path = Some(path);
        }
        if let Some(sync) = self.sync_flush {
            storage.sync_flush = sync;
        }
        if let Some(restore) = self.restore {
            storage.restore = restore;
        }
        if let Some(dsn) = self.database_dsn.clone() {
            storage.database_dsn = Some(dsn);
        }
    }
}

#[derive(Debug, Default, Args)]
pub struct AgentArgs {
    /// Server address (host:port) to report to.
    #[arg(short, long, env = "ADDRESS")]
    pub address: Option<String>,
    /// Seconds between reports.
    #[arg(short, long, env = "REPORT_INTERVAL")]
    pub report_interval: Option<u64>,
    /// Seconds between polls.
    #[arg(short, long, env = "POLL_INTERVAL")]
    pub poll_interval: Option<u64>,
    /// Maximum concurrent reports.
    #[arg(short = 'l', long, env = "RATE_LIMIT")]
    pub rate_limit: Option<usize>,
    /// Shared key for HashSHA256 signatures.
    #[arg(short, long, env = "KEY", hide_env_values = true)]
    pub key: Option<String>,
    /// Append logs to this file instead of stdout.
    #[arg(short = 'm', long, env = "AGENT_LOG_NAME")]
    pub log_file: Option<PathBuf>,
}

impl AgentArgs {
    pub fn apply(&self, config: &mut TallyConfig) {
        let agent = &mut config.agent;
        if let Some(address) = self.address.clone() {
            agent.address = address;
        }
        if let Some(interval) = self.report_interval {
            agent.report_interval = interval;
        }
        if let Some(interval) = self.poll_interval {
            agent.poll_interval = interval;
        }
        if let Some(limit) = self.rate_limit {
            agent.rate_limit = limit;
        }
        if let Some(key) = self.key.clone() {
            agent.key = Some(Secret::new(key));
        }
        if let Some(path) = self.log_file.clone() {
            agent.log_file = Some(path);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    #[test]
    fn server_flags_override_file_values() {
        let mut config = TallyConfig::default();
        config.storage.store_interval = 60;
        config.storage.restore = true;

        ServerArgs {
            address: Some("0.0.0.0:9090".into()),
            store_interval: Some(0),
            restore: Some(false),
            database_dsn: Some("sqlite::memory:".into()),
            key: Some("k".into()),
            ..ServerArgs::default()
        }
        .apply(&mut config);

        assert_eq!(config.server.address, "0.0.0.0:9090");
        assert_eq!(config.storage.store_interval, 0);
        assert!(!config.storage.restore);
        assert_eq!(config.storage.database_dsn(), Some("sqlite::memory:"));
        assert_eq!(config.server.key.unwrap().expose_secret(), "k");
    }

    #[test]
    fn absent_flags_leave_config_untouched() {
        let mut config = TallyConfig::default();
        config.agent.poll_interval = 5;

        AgentArgs::default().apply(&mut config);
        ServerArgs::default().apply(&mut config);

        assert_eq!(config.agent.poll_interval, 5);
        assert_eq!(config.storage.store_interval, 300);
        assert!(config.agent.key.is_none());
    }

    #[test]
    fn agent_flags_override() {
        let mut config = TallyConfig::default();
        AgentArgs {
            address: Some("metrics:8080".into()),
            report_interval: Some(30),
            rate_limit: Some(4),
            log_file: Some("agent.log".into()),
            ..AgentArgs::default()
        }
        .apply(&mut config);

        assert_eq!(config.agent.log_file, Some(PathBuf::from("agent.log")));
        assert!(config.server.log_file.is_none());

        assert_eq!(config.agent.base_url(), "http://metrics:8080");
        assert_eq!(config.agent.report_interval, 30);
        assert_eq!(config.agent.rate_limit, 4);
        assert_eq!(config.agent.poll_interval, 2);
    }
}
