//! Database models for the outbox and its counters.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(seq))]
#[diesel(table_name = crate::schema::sync_outbox)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncOutboxEntryDB {
    pub seq: i64,
    pub table_name: String,
    pub record_key: String,
    pub op: String,
    pub payload: String,
    pub status: String,
    pub attempt_count: i32,
    pub next_retry_at: Option<String>,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
    pub enqueued_at: String,
}

/// Single-row table kept in step with the outbox so counts are O(1).
#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::sync_counters)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncCountersDB {
    pub id: i32,
    pub pending_count: i64,
    pub failed_count: i64,
    pub next_seq: i64,
    pub updated_at: String,
}
