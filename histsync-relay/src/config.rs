//! Relay server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Deployment flavour. Production and test are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    #[default]
    Development,
    Test,
}

impl Environment {
    /// Parse the value of `HISTSYNC_ENV` or `--environment`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Some(Self::Production),
            "dev" | "development" => Some(Self::Development),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    pub fn is_test(self) -> bool {
        self == Self::Test
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub storage_path: PathBuf,
    pub environment: Environment,
    /// Cap on distinct users. `None` disables the cap.
    pub max_users: Option<u64>,
    pub track_usage_data: bool,
    pub max_payload_size: usize,
    /// Query stops returning an entry once its read count reaches this.
    pub query_read_limit: u32,
    /// Rows per multi-row INSERT statement.
    pub insert_chunk_size: usize,
    pub entry_gc_read_count: u32,
    pub deletion_gc_read_count: u32,
    pub dump_gc_read_count: u32,
    pub sweep_interval_secs: u64,
    pub deep_clean_interval_secs: u64,
    pub inactive_retention_days: u32,
    /// Users storing more rows than this lose entries older than the retention window.
    pub max_entries_per_user: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            storage_path: PathBuf::from("histsync.db"),
            environment: Environment::default(),
            max_users: None,
            track_usage_data: true,
            max_payload_size: 32 * 1024 * 1024,
            query_read_limit: 5,
            insert_chunk_size: 1000,
            entry_gc_read_count: 10,
            deletion_gc_read_count: 100,
            dump_gc_read_count: 100,
            sweep_interval_secs: 3600,
            deep_clean_interval_secs: 86_400,
            inactive_retention_days: 90,
            max_entries_per_user: 50_000_000,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml_dep::from_str(&content)?;
        Ok(config)
    }

    /// Apply `HISTSYNC_ENV` and `HISTSYNC_MAX_NUM_USERS` on top of the file values.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(env) = lookup("HISTSYNC_ENV") {
            match Environment::parse(&env) {
                Some(parsed) => self.environment = parsed,
                None => tracing::warn!(value = %env, "Ignoring unknown HISTSYNC_ENV"),
            }
        }
        if let Some(max) = lookup("HISTSYNC_MAX_NUM_USERS") {
            // An unparseable cap means "no cap".
            self.max_users = max.trim().parse().ok();
        }
    }
}
