//! Runtime configuration of the sync engine.

use std::time::Duration;

use log::warn;

use crate::sync::{
    RetryPolicy, CONNECTIVITY_DEBOUNCE_MS, DEFAULT_CRITICAL_TABLES, DEFAULT_KEY_FIELD,
    DEFAULT_MAX_PARALLEL_KEYS, DEFAULT_PUSH_BATCH_SIZE, DEFAULT_REQUEST_TIMEOUT_SECS,
    SYNC_FOREGROUND_INTERVAL_SECS, SYNC_INTERVAL_JITTER_SECS,
};

pub const ENV_REMOTE_URL: &str = "SITESYNC_REMOTE_URL";
pub const ENV_REMOTE_API_KEY: &str = "SITESYNC_REMOTE_API_KEY";
pub const ENV_SYNC_INTERVAL_SECS: &str = "SITESYNC_SYNC_INTERVAL_SECS";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "SITESYNC_REQUEST_TIMEOUT_SECS";
pub const ENV_BATCH_SIZE: &str = "SITESYNC_BATCH_SIZE";
pub const ENV_CRITICAL_TABLES: &str = "SITESYNC_CRITICAL_TABLES";
pub const ENV_CONNECTIVITY_DEBOUNCE_MS: &str = "SITESYNC_CONNECTIVITY_DEBOUNCE_MS";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub remote_url: Option<String>,
    pub remote_api_key: Option<String>,
    pub sync_interval: Duration,
    pub interval_jitter: Duration,
    pub request_timeout: Duration,
    pub connectivity_debounce: Duration,
    pub batch_size: i64,
    pub max_parallel_keys: usize,
    /// Tables `sync_data` accepts writes for.
    pub tables: Vec<String>,
    /// Tables pulled on every cycle.
    pub critical_tables: Vec<String>,
    pub key_field: String,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let tables: Vec<String> = DEFAULT_CRITICAL_TABLES
            .iter()
            .map(|table| table.to_string())
            .collect();
        Self {
            remote_url: None,
            remote_api_key: None,
            sync_interval: Duration::from_secs(SYNC_FOREGROUND_INTERVAL_SECS),
            interval_jitter: Duration::from_secs(SYNC_INTERVAL_JITTER_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connectivity_debounce: Duration::from_millis(CONNECTIVITY_DEBOUNCE_MS),
            batch_size: DEFAULT_PUSH_BATCH_SIZE,
            max_parallel_keys: DEFAULT_MAX_PARALLEL_KEYS,
            critical_tables: tables.clone(),
            tables,
            key_field: DEFAULT_KEY_FIELD.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `SITESYNC_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`SyncConfig::from_env`] with an injectable variable source.
    /// Unparseable values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        config.remote_url = read(ENV_REMOTE_URL);
        config.remote_api_key = read(ENV_REMOTE_API_KEY);

        if let Some(secs) =
            parse_number::<u64>(ENV_SYNC_INTERVAL_SECS, read(ENV_SYNC_INTERVAL_SECS))
        {
            config.sync_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) =
            parse_number::<u64>(ENV_REQUEST_TIMEOUT_SECS, read(ENV_REQUEST_TIMEOUT_SECS))
        {
            config.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = parse_number::<u64>(
            ENV_CONNECTIVITY_DEBOUNCE_MS,
            read(ENV_CONNECTIVITY_DEBOUNCE_MS),
        ) {
            config.connectivity_debounce = Duration::from_millis(ms);
        }
        if let Some(size) = parse_number::<i64>(ENV_BATCH_SIZE, read(ENV_BATCH_SIZE)) {
            config.batch_size = size.max(1);
        }
        if let Some(raw) = read(ENV_CRITICAL_TABLES) {
            let critical: Vec<String> = raw
                .split(',')
                .map(|table| table.trim().to_string())
                .filter(|table| !table.is_empty())
                .collect();
            for table in &critical {
                if !config.tables.contains(table) {
                    config.tables.push(table.clone());
                }
            }
            config.critical_tables = critical;
        }

        config
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self.critical_tables = self.tables.clone();
        self
    }

    pub fn is_known_table(&self, table: &str) -> bool {
        self.tables.iter().any(|known| known == table)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: Option<String>) -> Option<T> {
    let value = value?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("[Config] Ignoring {}={:?}: not a valid number", name, value);
            None
        }
    }
}
