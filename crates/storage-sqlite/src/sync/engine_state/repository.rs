//! Repository for engine bookkeeping that survives restarts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::sqlite::SqliteConnection;

use sitesync_core::sync::{SyncCycleOutcome, SyncEngineStateRepositoryTrait, SyncEngineStatus};
use sitesync_core::Result;

use super::model::SyncEngineStateDB;
use crate::db::{get_connection, WriteHandle};
use crate::errors::StorageError;
use crate::schema::sync_engine_state;

fn load_state(conn: &mut SqliteConnection) -> Result<SyncEngineStateDB> {
    let row = sync_engine_state::table
        .find(1)
        .first::<SyncEngineStateDB>(conn)
        .optional()
        .map_err(StorageError::from)?;
    Ok(row.unwrap_or(SyncEngineStateDB {
        id: 1,
        ..SyncEngineStateDB::default()
    }))
}

fn save_state(conn: &mut SqliteConnection, row: &SyncEngineStateDB) -> Result<()> {
    diesel::replace_into(sync_engine_state::table)
        .values(row)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

pub struct SyncEngineStateRepository {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
}

impl SyncEngineStateRepository {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        Self { pool, writer }
    }
}

#[async_trait]
impl SyncEngineStateRepositoryTrait for SyncEngineStateRepository {
    fn get_engine_status(&self) -> Result<SyncEngineStatus> {
        let mut conn = get_connection(&self.pool)?;
        let engine = load_state(&mut conn)?;
        Ok(SyncEngineStatus {
            bootstrapped_at: engine.bootstrapped_at,
            last_push_at: engine.last_push_at,
            last_pull_at: engine.last_pull_at,
            last_error: engine.last_error,
            consecutive_failures: engine.consecutive_failures,
            last_cycle_status: engine.last_cycle_status,
            last_cycle_duration_ms: engine.last_cycle_duration_ms,
        })
    }

    async fn mark_bootstrap_complete(&self) -> Result<()> {
        self.writer
            .exec(|conn| {
                let mut row = load_state(conn)?;
                row.bootstrapped_at = Some(Utc::now().to_rfc3339());
                save_state(conn, &row)
            })
            .await
    }

    async fn mark_cycle_outcome(&self, outcome: SyncCycleOutcome) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let now = Utc::now().to_rfc3339();
                let mut row = load_state(conn)?;
                row.last_cycle_status = Some(outcome.status);
                row.last_cycle_duration_ms = Some(outcome.duration_ms);
                if outcome.pushed {
                    row.last_push_at = Some(now.clone());
                }
                if outcome.pulled {
                    row.last_pull_at = Some(now);
                }
                match outcome.error {
                    Some(message) => {
                        row.last_error = Some(message);
                        row.consecutive_failures = row.consecutive_failures.saturating_add(1);
                    }
                    None => {
                        row.last_error = None;
                        row.consecutive_failures = 0;
                    }
                }
                save_state(conn, &row)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::db::{create_pool, init, run_migrations, write_actor::spawn_writer};

    fn setup_db() -> SyncEngineStateRepository {
        let app_data = tempdir()
            .expect("tempdir")
            .keep()
            .to_string_lossy()
            .to_string();
        let db_path = init(&app_data).expect("init db");
        run_migrations(&db_path).expect("migrate db");
        let pool = create_pool(&db_path).expect("create pool");
        let writer = spawn_writer(pool.as_ref().clone());
        SyncEngineStateRepository::new(pool, writer)
    }

    fn outcome(status: &str, error: Option<&str>) -> SyncCycleOutcome {
        SyncCycleOutcome {
            status: status.to_string(),
            duration_ms: 12,
            pushed: error.is_none(),
            pulled: error.is_none(),
            error: error.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn fresh_database_is_not_bootstrapped() {
        let repo = setup_db();
        let status = repo.get_engine_status().expect("status");
        assert_eq!(status, SyncEngineStatus::default());

        repo.mark_bootstrap_complete().await.expect("bootstrap");
        assert!(repo
            .get_engine_status()
            .expect("status")
            .bootstrapped_at
            .is_some());
    }

    #[tokio::test]
    async fn failures_accumulate_until_a_successful_cycle() {
        let repo = setup_db();
        repo.mark_cycle_outcome(outcome("offline", Some("unreachable")))
            .await
            .expect("outcome");
        repo.mark_cycle_outcome(outcome("offline", Some("unreachable")))
            .await
            .expect("outcome");

        let status = repo.get_engine_status().expect("status");
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.last_error.as_deref(), Some("unreachable"));
        assert!(status.last_push_at.is_none());

        repo.mark_cycle_outcome(outcome("ok", None))
            .await
            .expect("outcome");
        let status = repo.get_engine_status().expect("status");
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.last_error, None);
        assert_eq!(status.last_cycle_status.as_deref(), Some("ok"));
        assert!(status.last_pull_at.is_some());
    }
}
