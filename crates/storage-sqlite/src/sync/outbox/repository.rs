//! Durable outbox of local writes awaiting the remote store.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::sqlite::SqliteConnection;
use log::{debug, warn};

use sitesync_core::errors::{DatabaseError, Error, Result};
use sitesync_core::sync::{
    next_entry_state, EntryTransition, OutboxEntry, OutboxRepositoryTrait, OutboxStatus,
    OutboxWriteRequest, PushOutcome, RetryPolicy,
};

use super::model::{SyncCountersDB, SyncOutboxEntryDB};
use crate::db::{get_connection, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{sync_counters, sync_outbox};
use crate::sync::{enum_from_db, enum_to_db};

const RETRYABLE_ERROR_CODE: &str = "retryable";

fn to_outbox_entry(row: SyncOutboxEntryDB) -> Result<OutboxEntry> {
    Ok(OutboxEntry {
        seq: row.seq,
        table: row.table_name,
        key: row.record_key,
        operation: enum_from_db(&row.op)?,
        payload: serde_json::from_str(&row.payload)?,
        status: enum_from_db(&row.status)?,
        enqueued_at: row.enqueued_at,
        attempt_count: row.attempt_count,
        next_retry_at: row.next_retry_at,
        last_error: row.last_error,
        last_error_code: row.last_error_code,
    })
}

fn load_counters(conn: &mut SqliteConnection) -> Result<SyncCountersDB> {
    sync_counters::table
        .find(1)
        .first::<SyncCountersDB>(conn)
        .optional()
        .map_err(StorageError::from)?
        .ok_or_else(|| {
            Error::Database(DatabaseError::Corrupted(
                "Outbox counters row is missing".to_string(),
            ))
        })
}

/// Shift the cached pending/failed counts. Must run in the same transaction
/// as the outbox change it accounts for.
pub(crate) fn adjust_counters(
    conn: &mut SqliteConnection,
    pending_delta: i64,
    failed_delta: i64,
) -> Result<()> {
    if pending_delta == 0 && failed_delta == 0 {
        return Ok(());
    }
    diesel::update(sync_counters::table.find(1))
        .set((
            sync_counters::pending_count.eq(sync_counters::pending_count + pending_delta),
            sync_counters::failed_count.eq(sync_counters::failed_count + failed_delta),
            sync_counters::updated_at.eq(Utc::now().to_rfc3339()),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

/// Reset counts after a purge. The sequence keeps counting up.
pub(crate) fn clear_counters(conn: &mut SqliteConnection) -> Result<()> {
    diesel::update(sync_counters::table.find(1))
        .set((
            sync_counters::pending_count.eq(0_i64),
            sync_counters::failed_count.eq(0_i64),
            sync_counters::updated_at.eq(Utc::now().to_rfc3339()),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

fn allocate_seq(conn: &mut SqliteConnection) -> Result<i64> {
    let seq = load_counters(conn)?.next_seq;
    diesel::update(sync_counters::table.find(1))
        .set(sync_counters::next_seq.eq(seq + 1))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(seq)
}

/// Append an entry inside the caller's transaction.
pub fn write_outbox_entry(
    conn: &mut SqliteConnection,
    request: OutboxWriteRequest,
) -> Result<OutboxEntry> {
    let seq = allocate_seq(conn)?;
    let row = SyncOutboxEntryDB {
        seq,
        table_name: request.table,
        record_key: request.key,
        op: enum_to_db(&request.operation)?,
        payload: serde_json::to_string(&request.payload)?,
        status: enum_to_db(&OutboxStatus::Pending)?,
        attempt_count: 0,
        next_retry_at: None,
        last_error: None,
        last_error_code: None,
        enqueued_at: Utc::now().to_rfc3339(),
    };

    diesel::insert_into(sync_outbox::table)
        .values(&row)
        .execute(conn)
        .map_err(StorageError::from)?;
    adjust_counters(conn, 1, 0)?;

    to_outbox_entry(row)
}

/// Outbox entries of any status still referencing a record.
pub(crate) fn entries_for_record(
    conn: &mut SqliteConnection,
    table: &str,
    key: &str,
) -> Result<i64> {
    let count = sync_outbox::table
        .filter(sync_outbox::table_name.eq(table))
        .filter(sync_outbox::record_key.eq(key))
        .count()
        .get_result::<i64>(conn)
        .map_err(StorageError::from)?;
    Ok(count)
}

pub struct OutboxRepository {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
    retry_policy: RetryPolicy,
}

impl OutboxRepository {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        Self {
            pool,
            writer,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    fn load_entry(conn: &mut SqliteConnection, seq: i64) -> Result<Option<OutboxEntry>> {
        sync_outbox::table
            .find(seq)
            .first::<SyncOutboxEntryDB>(conn)
            .optional()
            .map_err(StorageError::from)?
            .map(to_outbox_entry)
            .transpose()
    }
}

#[async_trait]
impl OutboxRepositoryTrait for OutboxRepository {
    async fn enqueue(&self, request: OutboxWriteRequest) -> Result<OutboxEntry> {
        self.writer
            .exec(move |conn| write_outbox_entry(conn, request))
            .await
    }

    fn peek_batch(&self, max_size: i64) -> Result<Vec<OutboxEntry>> {
        if max_size <= 0 {
            return Ok(Vec::new());
        }
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_outbox::table
            .filter(sync_outbox::status.eq(enum_to_db(&OutboxStatus::Pending)?))
            .order(sync_outbox::seq.asc())
            .load::<SyncOutboxEntryDB>(&mut conn)
            .map_err(StorageError::from)?;

        let now = Utc::now();
        // A record whose oldest entry is backing off keeps its later entries queued.
        let mut blocked: HashSet<(String, String)> = HashSet::new();
        let mut batch = Vec::new();
        for row in rows {
            let entry = to_outbox_entry(row)?;
            let id = (entry.table.clone(), entry.key.clone());
            if blocked.contains(&id) {
                continue;
            }
            if !entry.is_due(now) {
                blocked.insert(id);
                continue;
            }
            batch.push(entry);
            if batch.len() as i64 >= max_size {
                break;
            }
        }
        Ok(batch)
    }

    async fn acknowledge(&self, seqs: Vec<i64>) -> Result<usize> {
        if seqs.is_empty() {
            return Ok(0);
        }
        self.writer
            .exec(move |conn| {
                let pending = enum_to_db(&OutboxStatus::Pending)?;
                let removed = diesel::delete(
                    sync_outbox::table
                        .filter(sync_outbox::seq.eq_any(&seqs))
                        .filter(sync_outbox::status.eq(pending)),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                adjust_counters(conn, -(removed as i64), 0)?;
                Ok(removed)
            })
            .await
    }

    async fn mark_failed(
        &self,
        seq: i64,
        error: String,
        retryable: bool,
    ) -> Result<Option<OutboxEntry>> {
        let policy = self.retry_policy;
        self.writer
            .exec(move |conn| {
                let Some(entry) = Self::load_entry(conn, seq)? else {
                    return Ok(None);
                };
                if entry.status != OutboxStatus::Pending {
                    return Ok(Some(entry));
                }

                let outcome = PushOutcome::Failed {
                    message: error,
                    retryable,
                };
                match next_entry_state(&entry, &outcome, Utc::now(), &policy) {
                    EntryTransition::Acknowledge => return Ok(Some(entry)),
                    EntryTransition::Retry {
                        attempt_count,
                        next_retry_at,
                        last_error,
                    } => {
                        diesel::update(sync_outbox::table.find(seq))
                            .set((
                                sync_outbox::attempt_count.eq(attempt_count),
                                sync_outbox::next_retry_at.eq(Some(next_retry_at.to_rfc3339())),
                                sync_outbox::last_error.eq(Some(last_error)),
                                sync_outbox::last_error_code
                                    .eq(Some(RETRYABLE_ERROR_CODE.to_string())),
                            ))
                            .execute(conn)
                            .map_err(StorageError::from)?;
                        debug!(
                            "[Outbox] seq {} attempt {} retries at {}",
                            seq, attempt_count, next_retry_at
                        );
                    }
                    EntryTransition::DeadLetter {
                        attempt_count,
                        last_error,
                        code,
                    } => {
                        diesel::update(sync_outbox::table.find(seq))
                            .set((
                                sync_outbox::status.eq(enum_to_db(&OutboxStatus::Dead)?),
                                sync_outbox::attempt_count.eq(attempt_count),
                                sync_outbox::next_retry_at.eq::<Option<String>>(None),
                                sync_outbox::last_error.eq(Some(last_error)),
                                sync_outbox::last_error_code.eq(Some(code.to_string())),
                            ))
                            .execute(conn)
                            .map_err(StorageError::from)?;
                        adjust_counters(conn, -1, 1)?;
                        warn!(
                            "[Outbox] seq {} ({}/{}) dead-lettered: {}",
                            seq, entry.table, entry.key, code
                        );
                    }
                }

                Self::load_entry(conn, seq)
            })
            .await
    }

    fn get_entry(&self, seq: i64) -> Result<Option<OutboxEntry>> {
        let mut conn = get_connection(&self.pool)?;
        Self::load_entry(&mut conn, seq)
    }

    fn pending_for_record(&self, table: &str, key: &str) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        let count = sync_outbox::table
            .filter(sync_outbox::table_name.eq(table))
            .filter(sync_outbox::record_key.eq(key))
            .filter(sync_outbox::status.eq(enum_to_db(&OutboxStatus::Pending)?))
            .count()
            .get_result::<i64>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(count)
    }

    fn list_dead_letters(&self) -> Result<Vec<OutboxEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_outbox::table
            .filter(sync_outbox::status.eq(enum_to_db(&OutboxStatus::Dead)?))
            .order(sync_outbox::seq.asc())
            .load::<SyncOutboxEntryDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(to_outbox_entry).collect()
    }

    fn count_failed(&self) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        Ok(load_counters(&mut conn)?.failed_count)
    }

    async fn discard_dead_letter(&self, seq: i64) -> Result<Option<OutboxEntry>> {
        self.writer
            .exec(move |conn| {
                let Some(entry) = Self::load_entry(conn, seq)? else {
                    return Ok(None);
                };
                if entry.status != OutboxStatus::Dead {
                    return Ok(None);
                }
                diesel::delete(sync_outbox::table.find(seq))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                adjust_counters(conn, 0, -1)?;
                Ok(Some(entry))
            })
            .await
    }

    async fn requeue_dead_letter(&self, seq: i64) -> Result<bool> {
        self.writer
            .exec(move |conn| {
                let dead = enum_to_db(&OutboxStatus::Dead)?;
                let updated = diesel::update(
                    sync_outbox::table
                        .filter(sync_outbox::seq.eq(seq))
                        .filter(sync_outbox::status.eq(dead)),
                )
                .set((
                    sync_outbox::status.eq(enum_to_db(&OutboxStatus::Pending)?),
                    sync_outbox::attempt_count.eq(0),
                    sync_outbox::next_retry_at.eq::<Option<String>>(None),
                    sync_outbox::last_error_code.eq::<Option<String>>(None),
                ))
                .execute(conn)
                .map_err(StorageError::from)?;
                if updated > 0 {
                    adjust_counters(conn, 1, -1)?;
                }
                Ok(updated > 0)
            })
            .await
    }
}
