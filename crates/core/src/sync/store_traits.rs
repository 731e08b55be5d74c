//! Storage contracts the coordinator is written against.
//!
//! Reads are synchronous and served from a connection pool; writes are async
//! because implementations serialize them through a single writer.

use async_trait::async_trait;

use super::sync_model::{
    LocalMutation, OutboxEntry, OutboxWriteRequest, PullSummary, Record, RecordFilter,
    RemoteRecord, SyncCycleOutcome, SyncEngineStatus, SyncState,
};
use crate::errors::Result;

/// Rows removed by a destructive reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub records: usize,
    pub outbox_entries: usize,
}

/// Local Store: cached records plus optimistic local writes.
#[async_trait]
pub trait RecordRepositoryTrait: Send + Sync {
    /// Atomic replace-or-insert of one record.
    async fn put(
        &self,
        table: String,
        key: String,
        payload: serde_json::Value,
        state: SyncState,
    ) -> Result<Record>;

    /// One page of matching records ordered by key, starting after `after_key`.
    ///
    /// Key and view are applied here; payload predicates are applied by
    /// [`super::RecordCursor`].
    fn get_page(
        &self,
        table: &str,
        filter: &RecordFilter,
        after_key: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Record>>;

    /// Idempotent delete. Returns whether a row was removed.
    async fn remove(&self, table: String, key: String) -> Result<bool>;

    /// Outbox entries not yet acknowledged and not dead-lettered.
    fn count_pending(&self) -> Result<i64>;

    /// Write the optimistic record and its outbox entry in one transaction.
    async fn stage_mutation(&self, mutation: LocalMutation) -> Result<OutboxEntry>;

    /// Mark a record clean (or drop its delete tombstone) once no pending
    /// outbox entry references it. Returns whether the record changed.
    async fn confirm_record(&self, table: String, key: String) -> Result<bool>;

    /// Drop unconfirmed local changes of a record that has no pending outbox
    /// entry left: unconfirmed creates disappear, other states become clean.
    async fn revert_record(&self, table: String, key: String) -> Result<bool>;

    /// Merge a full remote snapshot of one table in one transaction.
    async fn apply_remote_snapshot(
        &self,
        table: String,
        records: Vec<RemoteRecord>,
    ) -> Result<PullSummary>;

    /// Remove every record, outbox entry and bookkeeping row.
    async fn purge_all(&self) -> Result<PurgeSummary>;
}

/// Durable ordered queue of pending writes.
#[async_trait]
pub trait OutboxRepositoryTrait: Send + Sync {
    async fn enqueue(&self, request: OutboxWriteRequest) -> Result<OutboxEntry>;

    /// Oldest due pending entries in sequence order. Read-only.
    fn peek_batch(&self, max_size: i64) -> Result<Vec<OutboxEntry>>;

    /// Remove entries the remote confirmed. Returns how many were removed.
    async fn acknowledge(&self, seqs: Vec<i64>) -> Result<usize>;

    /// Record a failed push. Returns the entry as stored afterwards.
    async fn mark_failed(
        &self,
        seq: i64,
        error: String,
        retryable: bool,
    ) -> Result<Option<OutboxEntry>>;

    fn get_entry(&self, seq: i64) -> Result<Option<OutboxEntry>>;

    fn pending_for_record(&self, table: &str, key: &str) -> Result<i64>;

    fn list_dead_letters(&self) -> Result<Vec<OutboxEntry>>;

    fn count_failed(&self) -> Result<i64>;

    /// Drop a dead-lettered entry for good.
    async fn discard_dead_letter(&self, seq: i64) -> Result<Option<OutboxEntry>>;

    /// Put a dead-lettered entry back in the queue with a fresh attempt count.
    async fn requeue_dead_letter(&self, seq: i64) -> Result<bool>;
}

/// Engine bookkeeping that survives restarts.
#[async_trait]
pub trait SyncEngineStateRepositoryTrait: Send + Sync {
    fn get_engine_status(&self) -> Result<SyncEngineStatus>;

    async fn mark_bootstrap_complete(&self) -> Result<()>;

    async fn mark_cycle_outcome(&self, outcome: SyncCycleOutcome) -> Result<()>;
}
