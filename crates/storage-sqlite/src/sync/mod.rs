//! SQLite storage for the offline sync engine: cached records, the outbox
//! and engine bookkeeping.

pub mod engine_state;
pub mod local_store;
pub mod outbox;

use std::sync::Arc;

use sitesync_core::sync::RetryPolicy;
use sitesync_core::Result;

use crate::db::{create_pool, init, run_migrations, spawn_writer};

pub use engine_state::{SyncEngineStateDB, SyncEngineStateRepository};
pub use local_store::{LocalRecordDB, LocalStoreRepository};
pub use outbox::{write_outbox_entry, OutboxRepository, SyncCountersDB, SyncOutboxEntryDB};

pub(crate) fn enum_to_db<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

pub(crate) fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

/// The three repositories over one database, sharing a pool and writer.
pub struct SqliteSyncStores {
    pub records: Arc<LocalStoreRepository>,
    pub outbox: Arc<OutboxRepository>,
    pub engine_state: Arc<SyncEngineStateRepository>,
}

impl SqliteSyncStores {
    /// Open (creating and migrating if needed) the database under `app_data_dir`.
    pub fn open(app_data_dir: &str) -> Result<Self> {
        Self::open_with_retry_policy(app_data_dir, RetryPolicy::default())
    }

    pub fn open_with_retry_policy(app_data_dir: &str, retry_policy: RetryPolicy) -> Result<Self> {
        let db_path = init(app_data_dir)?;
        run_migrations(&db_path)?;
        let pool = create_pool(&db_path)?;
        let writer = spawn_writer(pool.as_ref().clone());
        Ok(Self {
            records: Arc::new(LocalStoreRepository::new(pool.clone(), writer.clone())),
            outbox: Arc::new(
                OutboxRepository::new(pool.clone(), writer.clone()).with_retry_policy(retry_policy),
            ),
            engine_state: Arc::new(SyncEngineStateRepository::new(pool, writer)),
        })
    }
}
