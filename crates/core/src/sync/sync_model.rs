//! Offline sync domain models.

use serde::{Deserialize, Serialize};

/// Tables the application pulls on every cycle unless configured otherwise.
pub const DEFAULT_CRITICAL_TABLES: [&str; 7] = [
    "projects",
    "tasks",
    "timesheets",
    "materials",
    "invoices",
    "schedule_items",
    "team_members",
];

/// Payload field holding the primary key when callers do not pass one.
pub const DEFAULT_KEY_FIELD: &str = "id";

/// Reconciliation state of a locally cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Clean,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
}

impl SyncState {
    pub fn is_pending(&self) -> bool {
        !matches!(self, SyncState::Clean)
    }

    /// State a record takes after a local mutation, given what it was before.
    ///
    /// An update to a record the remote has never seen stays a create, so the
    /// remote receives an insert first.
    pub fn after_local(operation: OutboxOperation, previous: Option<SyncState>) -> SyncState {
        match operation {
            OutboxOperation::Insert => SyncState::PendingCreate,
            OutboxOperation::Update => match previous {
                Some(SyncState::PendingCreate) => SyncState::PendingCreate,
                _ => SyncState::PendingUpdate,
            },
            OutboxOperation::Delete => SyncState::PendingDelete,
        }
    }
}

/// Write operations carried by the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOperation {
    Insert,
    Update,
    Delete,
}

/// Outbox lifecycle status. Acknowledged entries are deleted, not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Dead,
}

/// Which records a reader wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordView {
    /// Only records confirmed by the remote store.
    Confirmed,
    /// Confirmed records plus local creates/updates; pending deletes are hidden.
    #[default]
    Optimistic,
    /// Only records with unconfirmed local changes, delete tombstones included.
    Pending,
}

impl RecordView {
    pub fn states(&self) -> &'static [SyncState] {
        match self {
            RecordView::Confirmed => &[SyncState::Clean],
            RecordView::Optimistic => &[
                SyncState::Clean,
                SyncState::PendingCreate,
                SyncState::PendingUpdate,
            ],
            RecordView::Pending => &[
                SyncState::PendingCreate,
                SyncState::PendingUpdate,
                SyncState::PendingDelete,
            ],
        }
    }

    pub fn admits(&self, state: SyncState) -> bool {
        self.states().contains(&state)
    }
}

/// A cached row of one application table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub table: String,
    pub key: String,
    pub payload: serde_json::Value,
    /// Millisecond timestamp of the version this payload represents.
    pub version: i64,
    pub sync_state: SyncState,
    pub updated_at: String,
}

/// Selection criteria for [`Record`] reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub key: Option<String>,
    pub view: RecordView,
    pub field_equals: Vec<(String, serde_json::Value)>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn view(mut self, view: RecordView) -> Self {
        self.view = view;
        self
    }

    /// Keep only records whose payload has `field == value`.
    pub fn field_eq(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.field_equals.push((field.into(), value));
        self
    }

    /// Payload predicates. Key and view are applied by the store itself.
    pub fn matches_payload(&self, record: &Record) -> bool {
        self.field_equals
            .iter()
            .all(|(field, expected)| record.payload.get(field) == Some(expected))
    }
}

/// A queued write awaiting acknowledgement by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub seq: i64,
    pub table: String,
    pub key: String,
    pub operation: OutboxOperation,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub enqueued_at: String,
    pub attempt_count: i32,
    pub next_retry_at: Option<String>,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
}

impl OutboxEntry {
    /// Whether the entry's backoff window has elapsed.
    pub fn is_due(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self.next_retry_at.as_deref() {
            None => true,
            Some(value) => chrono::DateTime::parse_from_rfc3339(value)
                .map(|at| at.with_timezone(&chrono::Utc) <= now)
                .unwrap_or(true),
        }
    }

    pub fn record_id(&self) -> (&str, &str) {
        (&self.table, &self.key)
    }
}

/// Request to append one entry to the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxWriteRequest {
    pub table: String,
    pub key: String,
    pub operation: OutboxOperation,
    pub payload: serde_json::Value,
}

impl OutboxWriteRequest {
    pub fn new(
        table: impl Into<String>,
        key: impl Into<String>,
        operation: OutboxOperation,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            operation,
            payload,
        }
    }
}

/// An optimistic local write: record upsert plus its outbox entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMutation {
    pub request: OutboxWriteRequest,
    pub version: i64,
}

impl LocalMutation {
    pub fn new(request: OutboxWriteRequest) -> Self {
        Self {
            request,
            version: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A record as returned by the remote store during pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub key: String,
    pub payload: serde_json::Value,
    pub version: i64,
}

/// Per-table result of merging pulled remote state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub kept_local: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl PullSummary {
    /// Rows whose local copy changed because of the pull.
    pub fn applied(&self) -> usize {
        self.inserted + self.replaced + self.removed
    }

    pub fn absorb(&mut self, other: PullSummary) {
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.kept_local += other.kept_local;
        self.removed += other.removed;
        self.unchanged += other.unchanged;
    }
}

/// Coordinator lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Uninitialized,
    Bootstrapping,
    Idle,
    Syncing,
}

/// Snapshot handed to status observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub initialized: bool,
    pub pending_sync: i64,
    pub failed_count: i64,
    pub phase: SyncPhase,
    pub last_error: Option<String>,
}

/// Trigger source for sync cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCycleTrigger {
    Startup,
    Manual,
    ConnectivityRegained,
    Periodic,
    LocalMutation,
    RemoteChange,
}

/// Persisted engine bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEngineStatus {
    pub bootstrapped_at: Option<String>,
    pub last_push_at: Option<String>,
    pub last_pull_at: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    pub last_cycle_status: Option<String>,
    pub last_cycle_duration_ms: Option<i64>,
}

/// Outcome of one cycle, as persisted by the engine state repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCycleOutcome {
    pub status: String,
    pub duration_ms: i64,
    pub pushed: bool,
    pub pulled: bool,
    pub error: Option<String>,
}

/// Result of a completed sync drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCycleResult {
    pub trigger: SyncCycleTrigger,
    pub status: String,
    pub pushed_count: usize,
    pub pulled_count: usize,
    pub retried_count: usize,
    pub dead_lettered_count: usize,
    pub duration_ms: i64,
}

impl SyncCycleResult {
    pub fn synced_count(&self) -> usize {
        self.pushed_count + self.pulled_count
    }
}

/// Extract a record key from a payload field.
pub fn record_key_from_payload(payload: &serde_json::Value, key_field: &str) -> Option<String> {
    match payload.get(key_field)? {
        serde_json::Value::String(v) if !v.trim().is_empty() => Some(v.clone()),
        serde_json::Value::Number(v) => Some(v.to_string()),
        _ => None,
    }
}
