//! The normalised configuration surface consumed by the view syncer core.
//!
//! Environment-variable parsing and validation beyond clap's own belong to
//! the embedding binary; the core only reads these fields.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// View syncer configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "viewsync")]
pub struct Options {
    /// Path to the local replica file.
    #[arg(long = "replica-file", env = "VS_REPLICA_FILE")]
    pub replica_file: PathBuf,

    /// Connection string of the database holding client view records.
    #[arg(long = "cvr-db", env = "VS_CVR_DB")]
    pub cvr_db: String,

    /// Connection string of the upstream database.
    #[arg(long = "upstream-db", env = "VS_UPSTREAM_DB")]
    pub upstream_db: String,

    /// Application id; namespaces all persisted state.
    #[arg(long = "app-id", env = "VS_APP_ID", default_value = "app")]
    pub app_id: String,

    /// Shard number within the application.
    #[arg(long = "shard-num", env = "VS_SHARD_NUM", default_value = "0")]
    pub shard_num: u32,

    /// Number of parallel sync worker processes.
    #[arg(long = "num-sync-workers", env = "VS_NUM_SYNC_WORKERS", default_value = "1")]
    pub num_sync_workers: usize,

    /// Per-user mutation rate limit (mutations per minute); unlimited when
    /// absent.
    #[arg(long = "per-user-mutation-limit", env = "VS_PER_USER_MUTATION_LIMIT")]
    pub per_user_mutation_limit: Option<u32>,

    /// Endpoint resolving named (custom) queries; inline ASTs only when
    /// absent.
    #[arg(long = "query-url", env = "VS_QUERY_URL")]
    pub query_url: Option<String>,

    /// Hydrations slower than this many milliseconds are logged as slow.
    #[arg(
        long = "log-slow-hydrate-threshold",
        env = "VS_LOG_SLOW_HYDRATE_THRESHOLD",
        default_value = "100"
    )]
    pub log_slow_hydrate_threshold: u64,

    /// Log level filter.
    #[arg(long = "log-level", env = "VS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// How long an empty client group stays alive awaiting reconnects, in
    /// milliseconds.
    #[arg(long = "keepalive", env = "VS_KEEPALIVE", default_value = "5000")]
    pub keepalive_ms: u64,
}

impl Options {
    /// The slow-hydration threshold as a [`Duration`].
    pub fn slow_hydrate_threshold(&self) -> Duration {
        Duration::from_millis(self.log_slow_hydrate_threshold)
    }

    /// The keepalive window as a [`Duration`].
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    /// The logical schema namespacing this app shard's persisted state.
    pub fn cvr_schema(&self) -> String {
        format!("{}_{}/cvr", self.app_id, self.shard_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_command_line() {
        let opts = Options::parse_from([
            "viewsync",
            "--replica-file",
            "/tmp/replica.db",
            "--cvr-db",
            "postgres://cvr",
            "--upstream-db",
            "postgres://up",
        ]);
        assert_eq!(opts.app_id, "app");
        assert_eq!(opts.shard_num, 0);
        assert_eq!(opts.keepalive(), Duration::from_millis(5000));
        assert_eq!(opts.cvr_schema(), "app_0/cvr");
    }
}
