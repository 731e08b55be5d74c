//! End-to-end coordinator behaviour over a real SQLite store and an
//! in-memory remote.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::tempdir;
use tokio::sync::mpsc;

use sitesync_core::config::SyncConfig;
use sitesync_core::connectivity::ConnectivityMonitor;
use sitesync_core::events::{SyncEvent, SyncEventKind};
use sitesync_core::sync::{
    OutboxOperation, OutboxRepositoryTrait, RecordFilter, RecordView, RemoteChange, RemoteError,
    RemoteRecord, RemoteStoreTrait, ResetConfirmation, ResetOutcome, ResetPreview, SyncCoordinator,
    SyncPhase, SyncState,
};
use sitesync_core::Error;
use sitesync_storage_sqlite::SqliteSyncStores;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Call {
    op: &'static str,
    table: String,
    key: String,
}

#[derive(Default)]
struct MockRemote {
    tables: Mutex<HashMap<String, BTreeMap<String, RemoteRecord>>>,
    calls: Mutex<Vec<Call>>,
    scripted_failures: Mutex<VecDeque<RemoteError>>,
    rejected_keys: Mutex<HashMap<String, RemoteError>>,
    unreachable: AtomicBool,
    writes_started: AtomicI64,
    write_delay_ms: AtomicI64,
    version: AtomicI64,
    change_feed: Mutex<Option<mpsc::Receiver<RemoteChange>>>,
}

impl MockRemote {
    fn calls(&self, op: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.op == op)
            .cloned()
            .collect()
    }

    fn write_calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.op != "fetch")
            .cloned()
            .collect()
    }

    fn fail_next(&self, err: RemoteError) {
        self.scripted_failures.lock().unwrap().push_back(err);
    }

    fn reject_key(&self, key: &str, err: RemoteError) {
        self.rejected_keys.lock().unwrap().insert(key.to_string(), err);
    }

    async fn wait_for_write_in_flight(&self) {
        for _ in 0..200 {
            if self.writes_started.load(Ordering::SeqCst) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no remote write started");
    }

    fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn seed(&self, table: &str, key: &str, payload: serde_json::Value) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(
                key.to_string(),
                RemoteRecord {
                    key: key.to_string(),
                    payload,
                    version,
                },
            );
    }

    fn row(&self, table: &str, key: &str) -> Option<serde_json::Value> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .and_then(|rows| rows.get(key))
            .map(|row| row.payload.clone())
    }

    async fn write(
        &self,
        op: &'static str,
        table: &str,
        key: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        self.writes_started.fetch_add(1, Ordering::SeqCst);
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        self.calls.lock().unwrap().push(Call {
            op,
            table: table.to_string(),
            key: key.to_string(),
        });
        if let Some(err) = self.scripted_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.rejected_keys.lock().unwrap().get(key).cloned() {
            return Err(err);
        }
        match payload {
            Some(payload) => {
                let merged = match self.row(table, key) {
                    Some(serde_json::Value::Object(mut current)) if op == "update" => {
                        if let serde_json::Value::Object(changes) = payload {
                            current.extend(changes.clone());
                        }
                        serde_json::Value::Object(current)
                    }
                    _ => payload.clone(),
                };
                self.seed(table, key, merged);
            }
            None => {
                let removed = self
                    .tables
                    .lock()
                    .unwrap()
                    .get_mut(table)
                    .and_then(|rows| rows.remove(key));
                if removed.is_none() {
                    return Err(RemoteError::status(404, "not found"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStoreTrait for MockRemote {
    async fn fetch_table(&self, table: &str) -> Result<Vec<RemoteRecord>, RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Timeout);
        }
        self.calls.lock().unwrap().push(Call {
            op: "fetch",
            table: table.to_string(),
            key: String::new(),
        });
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(
        &self,
        table: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), RemoteError> {
        self.write("insert", table, key, Some(payload)).await
    }

    async fn update(
        &self,
        table: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), RemoteError> {
        self.write("update", table, key, Some(payload)).await
    }

    async fn delete(&self, table: &str, key: &str) -> Result<(), RemoteError> {
        self.write("delete", table, key, None).await
    }

    fn change_feed(&self) -> Option<mpsc::Receiver<RemoteChange>> {
        self.change_feed.lock().unwrap().take()
    }
}

struct Harness {
    coordinator: Arc<SyncCoordinator>,
    remote: Arc<MockRemote>,
    connectivity: Arc<ConnectivityMonitor>,
    stores: SqliteSyncStores,
}

fn harness_configured(
    online: bool,
    remote: MockRemote,
    configure: impl FnOnce(&mut SyncConfig),
) -> Harness {
    let app_data = tempdir()
        .expect("tempdir")
        .keep()
        .to_string_lossy()
        .to_string();
    let mut config = SyncConfig::default().with_tables(["tasks", "projects"]);
    config.sync_interval = Duration::from_secs(3600);
    config.connectivity_debounce = Duration::ZERO;
    configure(&mut config);
    let stores =
        SqliteSyncStores::open_with_retry_policy(&app_data, config.retry).expect("open stores");
    let remote = Arc::new(remote);
    let connectivity = ConnectivityMonitor::from_config(online, &config);
    let coordinator = SyncCoordinator::new(
        config,
        stores.records.clone(),
        stores.outbox.clone(),
        stores.engine_state.clone(),
        remote.clone(),
        connectivity.clone(),
    );
    Harness {
        coordinator: Arc::new(coordinator),
        remote,
        connectivity,
        stores,
    }
}

fn harness_with(online: bool, remote: MockRemote) -> Harness {
    harness_configured(online, remote, |_| {})
}

fn harness(online: bool) -> Harness {
    harness_with(online, MockRemote::default())
}

fn record_events(h: &Harness) -> Arc<Mutex<Vec<SyncEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    h.coordinator
        .notifier()
        .subscribe(move |event| sink.lock().unwrap().push(event.clone()))
        .detach();
    events
}

fn local(h: &Harness, key: &str, view: RecordView) -> Option<sitesync_core::sync::Record> {
    h.coordinator
        .get_local_data("tasks", RecordFilter::new().key(key).view(view))
        .expect("cursor")
        .into_records()
        .expect("records")
        .into_iter()
        .next()
}

struct Answer(bool);

impl ResetConfirmation for Answer {
    fn confirm_reset(&self, _preview: &ResetPreview) -> bool {
        self.0
    }
}

#[tokio::test]
async fn online_write_round_trips_to_remote() {
    let h = harness(true);
    let events = record_events(&h);
    h.coordinator.init().await.expect("init");

    let result = h
        .coordinator
        .sync_data(
            "tasks",
            OutboxOperation::Insert,
            json!({ "id": "t1", "title": "Frame north wall" }),
        )
        .await
        .expect("sync data");

    assert!(result.pushed);
    assert_eq!(
        h.remote.row("tasks", "t1"),
        Some(json!({ "id": "t1", "title": "Frame north wall" }))
    );
    let record = local(&h, "t1", RecordView::Confirmed).expect("confirmed record");
    assert_eq!(record.sync_state, SyncState::Clean);

    let status = h.coordinator.get_sync_status();
    assert_eq!(status.pending_sync, 0);
    assert_eq!(status.phase, SyncPhase::Idle);
    assert!(status.initialized);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        SyncEvent::LocalDataChanged {
            key: Some(key),
            operation: None,
            ..
        } if key == "t1"
    )));
}

#[tokio::test]
async fn insert_without_key_gets_generated_key() {
    let h = harness(false);
    h.coordinator.init().await.expect("init");

    let result = h
        .coordinator
        .sync_data("tasks", OutboxOperation::Insert, json!({ "title": "Order rebar" }))
        .await
        .expect("sync data");

    let record = local(&h, &result.key, RecordView::Optimistic).expect("record");
    assert_eq!(record.payload["id"], json!(result.key));

    let err = h
        .coordinator
        .sync_data("tasks", OutboxOperation::Update, json!({ "title": "x" }))
        .await
        .expect_err("update needs a key");
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = h
        .coordinator
        .sync_data("payroll", OutboxOperation::Insert, json!({ "id": "p1" }))
        .await
        .expect_err("unknown table");
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn offline_write_is_pushed_once_connectivity_returns() {
    let h = harness(false);
    let events = record_events(&h);
    h.coordinator.init().await.expect("init");

    let result = h
        .coordinator
        .sync_data("tasks", OutboxOperation::Insert, json!({ "id": "t1", "title": "Pour footing" }))
        .await
        .expect("sync data");

    assert!(!result.pushed);
    let status = h.coordinator.get_sync_status();
    assert!(!status.online);
    assert_eq!(status.pending_sync, 1);
    let record = local(&h, "t1", RecordView::Optimistic).expect("visible offline");
    assert_eq!(record.sync_state, SyncState::PendingCreate);
    assert!(h.remote.write_calls().is_empty());

    h.connectivity.report_platform(true);
    let cycle = h.coordinator.start_sync().await.expect("sync");

    assert_eq!(cycle.pushed_count, 1);
    assert_eq!(h.coordinator.get_sync_status().pending_sync, 0);
    assert!(h.remote.row("tasks", "t1").is_some());
    assert_eq!(
        local(&h, "t1", RecordView::Optimistic).map(|r| r.sync_state),
        Some(SyncState::Clean)
    );

    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        SyncEvent::LocalDataChanged {
            key: Some(key),
            operation: Some(OutboxOperation::Insert),
            ..
        } if key == "t1"
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        SyncEvent::SyncCompleted { synced, failed: 0 } if *synced >= 1
    )));
}

#[tokio::test]
async fn writes_replay_in_order_per_record() {
    let h = harness(false);
    h.coordinator.init().await.expect("init");

    for (operation, payload) in [
        (OutboxOperation::Insert, json!({ "id": "t1", "title": "a" })),
        (OutboxOperation::Insert, json!({ "id": "t2", "title": "b" })),
        (OutboxOperation::Update, json!({ "id": "t1", "title": "a2" })),
        (OutboxOperation::Delete, json!({ "id": "t1" })),
    ] {
        h.coordinator
            .sync_data("tasks", operation, payload)
            .await
            .expect("stage");
    }

    h.connectivity.report_platform(true);
    h.coordinator.start_sync().await.expect("sync");

    let t1_ops: Vec<&str> = h
        .remote
        .write_calls()
        .iter()
        .filter(|call| call.table == "tasks" && call.key == "t1")
        .map(|call| call.op)
        .collect();
    assert_eq!(t1_ops, vec!["insert", "update", "delete"]);
    assert!(h.remote.row("tasks", "t1").is_none());
    assert!(h.remote.row("tasks", "t2").is_some());
    assert!(local(&h, "t1", RecordView::Pending).is_none());
    assert_eq!(h.coordinator.get_sync_status().pending_sync, 0);
}

#[tokio::test]
async fn concurrent_start_sync_pushes_each_entry_once() {
    let h = harness(false);
    h.coordinator.init().await.expect("init");
    h.coordinator
        .sync_data("tasks", OutboxOperation::Insert, json!({ "id": "t1" }))
        .await
        .expect("stage");
    h.remote.write_delay_ms.store(50, Ordering::SeqCst);
    h.connectivity.report_platform(true);

    let (first, second) = tokio::join!(h.coordinator.start_sync(), h.coordinator.start_sync());

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(h.remote.calls("insert").len(), 1);
}

#[tokio::test]
async fn rejected_write_is_dead_lettered_and_not_retried() {
    let h = harness(true);
    h.coordinator.init().await.expect("init");
    h.remote
        .fail_next(RemoteError::status(422, "title is required"));

    let result = h
        .coordinator
        .sync_data("tasks", OutboxOperation::Insert, json!({ "id": "t1" }))
        .await
        .expect("sync data");
    assert!(!result.pushed);

    let status = h.coordinator.get_sync_status();
    assert_eq!(status.pending_sync, 0);
    assert_eq!(status.failed_count, 1);

    h.coordinator.start_sync().await.expect("sync");
    assert_eq!(h.remote.calls("insert").len(), 1);

    let failed = h.coordinator.failed_items().expect("failed items");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].last_error_code.as_deref(), Some("rejected"));
    let message = failed[0].last_error.as_deref().unwrap_or_default();
    assert!(message.starts_with("Remote rejected write"), "{message}");
    assert!(message.contains("title is required"), "{message}");

    assert!(h
        .coordinator
        .discard_failed(failed[0].seq)
        .await
        .expect("discard"));
    assert!(local(&h, "t1", RecordView::Pending).is_none());
    assert_eq!(h.coordinator.get_sync_status().failed_count, 0);
}

#[tokio::test]
async fn failed_write_can_be_retried() {
    let h = harness(true);
    h.coordinator.init().await.expect("init");
    h.remote.fail_next(RemoteError::status(400, "bad request"));
    let result = h
        .coordinator
        .sync_data("tasks", OutboxOperation::Insert, json!({ "id": "t1" }))
        .await
        .expect("sync data");

    assert!(h.coordinator.retry_failed(result.seq).await.expect("retry"));

    assert_eq!(h.remote.calls("insert").len(), 2);
    assert!(h.remote.row("tasks", "t1").is_some());
    let status = h.coordinator.get_sync_status();
    assert_eq!(status.failed_count, 0);
    assert_eq!(status.pending_sync, 0);
}

#[tokio::test]
async fn pull_keeps_pending_local_update() {
    let remote = MockRemote::default();
    remote.seed("tasks", "t1", json!({ "id": "t1", "title": "original" }));
    let h = harness_with(true, remote);
    h.coordinator.init().await.expect("init");
    assert_eq!(
        local(&h, "t1", RecordView::Confirmed).map(|r| r.payload["title"].clone()),
        Some(json!("original"))
    );

    h.remote.seed("tasks", "t1", json!({ "id": "t1", "title": "theirs" }));
    h.remote.fail_next(RemoteError::status(503, "unavailable"));
    let result = h
        .coordinator
        .sync_data("tasks", OutboxOperation::Update, json!({ "id": "t1", "title": "mine" }))
        .await
        .expect("sync data");

    let record = local(&h, "t1", RecordView::Optimistic).expect("record");
    assert_eq!(record.payload["title"], json!("mine"));
    assert_eq!(record.sync_state, SyncState::PendingUpdate);
    assert_eq!(h.coordinator.get_sync_status().pending_sync, 1);

    let entry = h.stores.outbox.peek_batch(10).expect("peek");
    assert!(entry.is_empty(), "entry is backing off");

    let entry = h
        .stores
        .outbox
        .get_entry(result.seq)
        .expect("get")
        .expect("still queued");
    assert_eq!(entry.attempt_count, 1);
    let message = entry.last_error.as_deref().unwrap_or_default();
    assert!(message.starts_with("Transient sync failure"), "{message}");
}

#[tokio::test]
async fn rejected_record_does_not_block_other_records() {
    let h = harness(false);
    h.coordinator.init().await.expect("init");
    for key in ["t1", "t2", "t3"] {
        h.coordinator
            .sync_data("tasks", OutboxOperation::Insert, json!({ "id": key, "title": key }))
            .await
            .expect("stage");
    }
    h.remote
        .reject_key("t1", RemoteError::status(422, "title is required"));

    h.connectivity.report_platform(true);
    let cycle = h.coordinator.start_sync().await.expect("sync");

    assert_eq!(cycle.pushed_count, 2);
    assert_eq!(cycle.dead_lettered_count, 1);
    assert!(h.remote.row("tasks", "t1").is_none());
    assert!(h.remote.row("tasks", "t2").is_some());
    assert!(h.remote.row("tasks", "t3").is_some());

    let status = h.coordinator.get_sync_status();
    assert_eq!(status.pending_sync, 0);
    assert_eq!(status.failed_count, 1);
    assert_eq!(
        local(&h, "t1", RecordView::Optimistic).map(|r| r.sync_state),
        Some(SyncState::PendingCreate)
    );
    assert_eq!(
        local(&h, "t2", RecordView::Confirmed).map(|r| r.sync_state),
        Some(SyncState::Clean)
    );
}

#[tokio::test]
async fn stalled_remote_times_out_without_spending_an_attempt() {
    let h = harness_configured(true, MockRemote::default(), |config| {
        config.request_timeout = Duration::from_millis(100);
    });
    h.coordinator.init().await.expect("init");
    h.remote.write_delay_ms.store(5_000, Ordering::SeqCst);

    let result = h
        .coordinator
        .sync_data("tasks", OutboxOperation::Insert, json!({ "id": "t1" }))
        .await
        .expect("sync data");

    assert!(!result.pushed);
    assert!(h.remote.calls("insert").is_empty());
    let status = h.coordinator.get_sync_status();
    assert!(!status.online);
    assert_eq!(status.pending_sync, 1);
    assert!(status.last_error.is_some());
    let entry = h
        .stores
        .outbox
        .get_entry(result.seq)
        .expect("get")
        .expect("still queued");
    assert_eq!(entry.attempt_count, 0);
}

#[tokio::test]
async fn abandoned_sync_call_still_finishes_push() {
    let h = harness(false);
    h.coordinator.init().await.expect("init");
    h.coordinator
        .sync_data("tasks", OutboxOperation::Insert, json!({ "id": "t1" }))
        .await
        .expect("stage");
    h.remote.write_delay_ms.store(200, Ordering::SeqCst);
    h.connectivity.report_platform(true);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), h.coordinator.start_sync()).await;
    assert!(abandoned.is_err(), "push is still in flight");

    h.coordinator.teardown().await;
    assert!(h.remote.row("tasks", "t1").is_some());
    assert_eq!(h.coordinator.get_sync_status().pending_sync, 0);

    h.coordinator.start_sync().await.expect("sync");
    assert_eq!(h.remote.calls("insert").len(), 1);
}

#[tokio::test]
async fn teardown_waits_for_background_push() {
    let h = harness(false);
    h.coordinator.init().await.expect("init");
    h.coordinator
        .sync_data("tasks", OutboxOperation::Insert, json!({ "id": "t1" }))
        .await
        .expect("stage");
    h.remote.write_delay_ms.store(200, Ordering::SeqCst);
    h.coordinator.start_background().await;

    h.connectivity.report_platform(true);
    h.remote.wait_for_write_in_flight().await;
    h.coordinator.teardown().await;

    assert!(h.remote.row("tasks", "t1").is_some());
    assert_eq!(h.coordinator.get_sync_status().pending_sync, 0);
    let entry = h.stores.outbox.peek_batch(10).expect("peek");
    assert!(entry.is_empty());

    h.coordinator.start_sync().await.expect("sync");
    assert_eq!(h.remote.calls("insert").len(), 1);
}

#[tokio::test]
async fn unreachable_remote_halts_cycle_and_keeps_queue() {
    let h = harness(true);
    h.coordinator.init().await.expect("init");
    h.remote.set_unreachable(true);

    let result = h
        .coordinator
        .sync_data("tasks", OutboxOperation::Insert, json!({ "id": "t1" }))
        .await
        .expect("sync data");
    assert!(!result.pushed);

    let status = h.coordinator.get_sync_status();
    assert!(!status.online);
    assert_eq!(status.pending_sync, 1);
    assert!(status.last_error.is_some());
    let entry = h
        .stores
        .outbox
        .get_entry(result.seq)
        .expect("get")
        .expect("still queued");
    assert_eq!(entry.attempt_count, 0);

    let err = h.coordinator.start_sync().await.expect_err("still unreachable");
    assert!(err.is_connectivity());

    h.remote.set_unreachable(false);
    h.connectivity.report_request_success();
    h.coordinator.start_sync().await.expect("sync");
    assert_eq!(h.coordinator.get_sync_status().pending_sync, 0);
    assert!(h.coordinator.get_sync_status().last_error.is_none());
}

#[tokio::test]
async fn first_run_pull_tolerates_offline_start() {
    let remote = MockRemote::default();
    remote.seed("projects", "p1", json!({ "id": "p1", "name": "Riverside" }));
    let h = harness_with(false, remote);

    h.coordinator.init().await.expect("init offline");
    let status = h.coordinator.get_sync_status();
    assert!(status.initialized);
    assert_eq!(status.phase, SyncPhase::Idle);
    assert!(h.remote.calls("fetch").is_empty());

    h.connectivity.report_platform(true);
    h.coordinator.start_sync().await.expect("sync");
    let projects = h
        .coordinator
        .get_local_data("projects", RecordFilter::new())
        .expect("cursor")
        .into_records()
        .expect("records");
    assert_eq!(projects.len(), 1);
}

#[tokio::test]
async fn reset_requires_confirmation() {
    let h = harness(false);
    h.coordinator.init().await.expect("init");
    h.coordinator
        .sync_data("tasks", OutboxOperation::Insert, json!({ "id": "t1" }))
        .await
        .expect("stage");

    let outcome = h
        .coordinator
        .reset_local_state(&Answer(false))
        .await
        .expect("reset");
    assert_eq!(outcome, ResetOutcome::Cancelled);
    assert_eq!(h.coordinator.get_sync_status().pending_sync, 1);

    let outcome = h
        .coordinator
        .reset_local_state(&Answer(true))
        .await
        .expect("reset");
    assert_eq!(
        outcome,
        ResetOutcome::Cleared {
            records: 1,
            outbox_entries: 1,
            reload_required: true,
        }
    );
    assert_eq!(h.coordinator.get_sync_status().pending_sync, 0);
    assert!(local(&h, "t1", RecordView::Pending).is_none());
}

#[tokio::test]
async fn remote_change_feed_triggers_background_cycle() {
    let remote = MockRemote::default();
    let (tx, rx) = mpsc::channel(4);
    *remote.change_feed.lock().unwrap() = Some(rx);
    let h = harness_with(true, remote);
    h.coordinator.init().await.expect("init");

    let completed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&completed);
    let _subscription = h
        .coordinator
        .notifier()
        .subscribe_kind(SyncEventKind::SyncCompleted, move |_| {
            flag.store(true, Ordering::SeqCst);
        });
    h.coordinator.start_background().await;

    h.remote.seed("tasks", "t9", json!({ "id": "t9", "title": "Inspect scaffold" }));
    tx.send(RemoteChange {
        table: "tasks".to_string(),
        key: Some("t9".to_string()),
    })
    .await
    .expect("send change");

    for _ in 0..100 {
        if completed.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(completed.load(Ordering::SeqCst));
    assert!(local(&h, "t9", RecordView::Confirmed).is_some());

    h.coordinator.teardown().await;
}
