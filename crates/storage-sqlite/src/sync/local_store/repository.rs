//! Repository for locally cached records.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::sqlite::SqliteConnection;
use log::debug;

use sitesync_core::sync::{
    merge_remote_record, should_remove_missing, LocalMutation, MergeAction, OutboxEntry,
    OutboxOperation, PullSummary, PurgeSummary, Record, RecordFilter, RecordRepositoryTrait,
    RemoteRecord, SyncState,
};
use sitesync_core::Result;

use super::model::LocalRecordDB;
use crate::db::{get_connection, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{local_records, sync_counters, sync_engine_state, sync_outbox};
use crate::sync::outbox::{clear_counters, entries_for_record, write_outbox_entry};
use crate::sync::{enum_from_db, enum_to_db};

fn to_record(row: LocalRecordDB) -> Result<Record> {
    Ok(Record {
        table: row.table_name,
        key: row.record_key,
        payload: serde_json::from_str(&row.payload)?,
        version: row.version,
        sync_state: enum_from_db(&row.sync_state)?,
        updated_at: row.updated_at,
    })
}

fn load_row(conn: &mut SqliteConnection, table: &str, key: &str) -> Result<Option<LocalRecordDB>> {
    let row = local_records::table
        .find((table, key))
        .first::<LocalRecordDB>(conn)
        .optional()
        .map_err(StorageError::from)?;
    Ok(row)
}

fn upsert_row(
    conn: &mut SqliteConnection,
    table: &str,
    key: &str,
    payload: &serde_json::Value,
    version: i64,
    state: SyncState,
) -> Result<LocalRecordDB> {
    let row = LocalRecordDB {
        table_name: table.to_string(),
        record_key: key.to_string(),
        payload: serde_json::to_string(payload)?,
        version,
        sync_state: enum_to_db(&state)?,
        updated_at: Utc::now().to_rfc3339(),
    };
    diesel::replace_into(local_records::table)
        .values(&row)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(row)
}

fn delete_row(conn: &mut SqliteConnection, table: &str, key: &str) -> Result<bool> {
    let removed = diesel::delete(local_records::table.find((table, key)))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(removed > 0)
}

fn set_state(conn: &mut SqliteConnection, table: &str, key: &str, state: SyncState) -> Result<()> {
    diesel::update(local_records::table.find((table, key)))
        .set((
            local_records::sync_state.eq(enum_to_db(&state)?),
            local_records::updated_at.eq(Utc::now().to_rfc3339()),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

/// Shallow merge of a partial update into the cached payload.
fn merged_payload(
    existing: Option<&serde_json::Value>,
    update: &serde_json::Value,
) -> serde_json::Value {
    match (existing, update) {
        (Some(serde_json::Value::Object(current)), serde_json::Value::Object(changes)) => {
            let mut merged = current.clone();
            for (field, value) in changes {
                merged.insert(field.clone(), value.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => update.clone(),
    }
}

fn stage_mutation_tx(conn: &mut SqliteConnection, mutation: LocalMutation) -> Result<OutboxEntry> {
    let request = mutation.request;
    let existing = load_row(conn, &request.table, &request.key)?
        .map(to_record)
        .transpose()?;
    let state = SyncState::after_local(
        request.operation,
        existing.as_ref().map(|record| record.sync_state),
    );
    let payload = match request.operation {
        OutboxOperation::Insert => request.payload.clone(),
        OutboxOperation::Update => {
            merged_payload(existing.as_ref().map(|record| &record.payload), &request.payload)
        }
        // Tombstone keeps the last known payload so a revert can restore it.
        OutboxOperation::Delete => existing
            .as_ref()
            .map(|record| record.payload.clone())
            .unwrap_or_else(|| request.payload.clone()),
    };

    upsert_row(
        conn,
        &request.table,
        &request.key,
        &payload,
        mutation.version,
        state,
    )?;
    write_outbox_entry(conn, request)
}

fn apply_snapshot_tx(
    conn: &mut SqliteConnection,
    table: &str,
    remote_records: Vec<RemoteRecord>,
) -> Result<PullSummary> {
    let mut locals: HashMap<String, Record> = HashMap::new();
    let rows = local_records::table
        .filter(local_records::table_name.eq(table))
        .load::<LocalRecordDB>(conn)
        .map_err(StorageError::from)?;
    for row in rows {
        let record = to_record(row)?;
        locals.insert(record.key.clone(), record);
    }

    let mut summary = PullSummary::default();
    let mut seen: HashSet<String> = HashSet::new();
    for remote in remote_records {
        match merge_remote_record(locals.get(&remote.key), &remote) {
            MergeAction::Insert => {
                upsert_row(
                    conn,
                    table,
                    &remote.key,
                    &remote.payload,
                    remote.version,
                    SyncState::Clean,
                )?;
                summary.inserted += 1;
            }
            MergeAction::Replace => {
                upsert_row(
                    conn,
                    table,
                    &remote.key,
                    &remote.payload,
                    remote.version,
                    SyncState::Clean,
                )?;
                summary.replaced += 1;
            }
            MergeAction::KeepLocal => summary.kept_local += 1,
            MergeAction::Unchanged => summary.unchanged += 1,
        }
        seen.insert(remote.key);
    }

    for (key, local) in &locals {
        if !seen.contains(key) && should_remove_missing(local) {
            delete_row(conn, table, key)?;
            summary.removed += 1;
        }
    }
    Ok(summary)
}

pub struct LocalStoreRepository {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
}

impl LocalStoreRepository {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        Self { pool, writer }
    }

    pub fn get_record(&self, table: &str, key: &str) -> Result<Option<Record>> {
        let mut conn = get_connection(&self.pool)?;
        load_row(&mut conn, table, key)?.map(to_record).transpose()
    }
}

#[async_trait]
impl RecordRepositoryTrait for LocalStoreRepository {
    async fn put(
        &self,
        table: String,
        key: String,
        payload: serde_json::Value,
        state: SyncState,
    ) -> Result<Record> {
        self.writer
            .exec(move |conn| {
                let version = Utc::now().timestamp_millis();
                let row = upsert_row(conn, &table, &key, &payload, version, state)?;
                to_record(row)
            })
            .await
    }

    fn get_page(
        &self,
        table: &str,
        filter: &RecordFilter,
        after_key: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Record>> {
        let mut conn = get_connection(&self.pool)?;
        let states = filter
            .view
            .states()
            .iter()
            .map(enum_to_db)
            .collect::<Result<Vec<String>>>()?;

        let mut query = local_records::table
            .filter(local_records::table_name.eq(table.to_string()))
            .filter(local_records::sync_state.eq_any(states))
            .into_boxed();
        if let Some(key) = &filter.key {
            query = query.filter(local_records::record_key.eq(key.clone()));
        }
        if let Some(after) = after_key {
            query = query.filter(local_records::record_key.gt(after.to_string()));
        }

        let rows = query
            .order(local_records::record_key.asc())
            .limit(limit)
            .load::<LocalRecordDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(to_record).collect()
    }

    async fn remove(&self, table: String, key: String) -> Result<bool> {
        self.writer
            .exec(move |conn| delete_row(conn, &table, &key))
            .await
    }

    fn count_pending(&self) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        let pending = sync_counters::table
            .find(1)
            .select(sync_counters::pending_count)
            .first::<i64>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(pending.unwrap_or(0))
    }

    async fn stage_mutation(&self, mutation: LocalMutation) -> Result<OutboxEntry> {
        self.writer
            .exec(move |conn| stage_mutation_tx(conn, mutation))
            .await
    }

    async fn confirm_record(&self, table: String, key: String) -> Result<bool> {
        self.writer
            .exec(move |conn| {
                if entries_for_record(conn, &table, &key)? > 0 {
                    return Ok(false);
                }
                let Some(row) = load_row(conn, &table, &key)? else {
                    return Ok(false);
                };
                match enum_from_db::<SyncState>(&row.sync_state)? {
                    SyncState::Clean => Ok(false),
                    SyncState::PendingDelete => delete_row(conn, &table, &key),
                    SyncState::PendingCreate | SyncState::PendingUpdate => {
                        set_state(conn, &table, &key, SyncState::Clean)?;
                        Ok(true)
                    }
                }
            })
            .await
    }

    async fn revert_record(&self, table: String, key: String) -> Result<bool> {
        self.writer
            .exec(move |conn| {
                if entries_for_record(conn, &table, &key)? > 0 {
                    return Ok(false);
                }
                let Some(row) = load_row(conn, &table, &key)? else {
                    return Ok(false);
                };
                match enum_from_db::<SyncState>(&row.sync_state)? {
                    SyncState::Clean => Ok(false),
                    SyncState::PendingCreate => delete_row(conn, &table, &key),
                    // The next pull restores the remote payload.
                    SyncState::PendingUpdate | SyncState::PendingDelete => {
                        set_state(conn, &table, &key, SyncState::Clean)?;
                        Ok(true)
                    }
                }
            })
            .await
    }

    async fn apply_remote_snapshot(
        &self,
        table: String,
        records: Vec<RemoteRecord>,
    ) -> Result<PullSummary> {
        self.writer
            .exec(move |conn| {
                let summary = apply_snapshot_tx(conn, &table, records)?;
                debug!(
                    "[LocalStore] Merged '{}': +{} ~{} -{} kept={}",
                    table, summary.inserted, summary.replaced, summary.removed, summary.kept_local
                );
                Ok(summary)
            })
            .await
    }

    async fn purge_all(&self) -> Result<PurgeSummary> {
        self.writer
            .exec(|conn| {
                let records = diesel::delete(local_records::table)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                let outbox_entries = diesel::delete(sync_outbox::table)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                diesel::delete(sync_engine_state::table)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                clear_counters(conn)?;
                Ok(PurgeSummary {
                    records,
                    outbox_entries,
                })
            })
            .await
    }
}
