//! SQLite persistence for the sitesync engine.

pub mod db;
pub mod errors;
pub mod schema;
pub mod sync;

pub use db::{create_pool, get_connection, init, run_migrations, spawn_writer, DbPool, WriteHandle};
pub use errors::StorageError;
pub use sync::{LocalStoreRepository, OutboxRepository, SqliteSyncStores, SyncEngineStateRepository};
