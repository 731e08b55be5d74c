//! Sync coordinator: single-flight push/pull cycles over the local store,
//! the outbox and the remote store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::cursor::RecordCursor;
use super::remote::{RemoteChange, RemoteError, RemoteStoreTrait};
use super::scheduler::{interval_jitter_ms, PENDING_OUTBOX_RECHECK_MS};
use super::store_traits::{
    OutboxRepositoryTrait, RecordRepositoryTrait, SyncEngineStateRepositoryTrait,
};
use super::sync_model::{
    record_key_from_payload, LocalMutation, OutboxEntry, OutboxOperation, OutboxStatus,
    OutboxWriteRequest, RecordFilter, SyncCycleOutcome, SyncCycleResult, SyncCycleTrigger,
    SyncPhase, SyncStatus,
};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::errors::{Error, Result, SyncError};
use crate::events::{ChangeNotifier, SyncEvent};

/// What `sync_data` did with a local write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDataResult {
    pub key: String,
    pub seq: i64,
    /// The remote store acknowledged the write before the call returned.
    pub pushed: bool,
}

/// Shown to the user before local data is wiped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPreview {
    pub pending_sync: i64,
    pub failed_count: i64,
}

/// Asks the user to confirm a destructive local reset.
pub trait ResetConfirmation: Send + Sync {
    fn confirm_reset(&self, preview: &ResetPreview) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum ResetOutcome {
    Cancelled,
    /// The rendering layer must reload; cached views are stale.
    Cleared {
        records: usize,
        outbox_entries: usize,
        reload_required: bool,
    },
}

#[derive(Default)]
struct DriveState {
    running: bool,
    rerun: Option<SyncCycleTrigger>,
    waiters: Vec<oneshot::Sender<Result<SyncCycleResult>>>,
}

/// Releases waiters if the drive task dies mid-cycle.
struct DriveGuard<'a> {
    drive: &'a Mutex<DriveState>,
    finished: bool,
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let waiters = {
            let mut drive = lock(self.drive);
            drive.running = false;
            drive.rerun = None;
            std::mem::take(&mut drive.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(Error::Unexpected(
                "sync cycle was interrupted".to_string(),
            )));
        }
    }
}

/// Tracks progress during one cycle.
struct CycleContext {
    trigger: SyncCycleTrigger,
    started_at: Instant,
    pushed_count: usize,
    pulled_count: usize,
    retried_count: usize,
    dead_lettered_count: usize,
}

impl CycleContext {
    fn new(trigger: SyncCycleTrigger) -> Self {
        Self {
            trigger,
            started_at: Instant::now(),
            pushed_count: 0,
            pulled_count: 0,
            retried_count: 0,
            dead_lettered_count: 0,
        }
    }

    fn duration_ms(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }

    fn result(&self, status: &str) -> SyncCycleResult {
        SyncCycleResult {
            trigger: self.trigger,
            status: status.to_string(),
            pushed_count: self.pushed_count,
            pulled_count: self.pulled_count,
            retried_count: self.retried_count,
            dead_lettered_count: self.dead_lettered_count,
            duration_ms: self.duration_ms(),
        }
    }
}

#[derive(Default)]
struct GroupReport {
    pushed: usize,
    retried: usize,
    dead_lettered: usize,
    unreachable: Option<SyncError>,
}

struct BackgroundTask {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn cycle_status_code(err: &Error) -> &'static str {
    match err {
        Error::Sync(SyncError::Connectivity(_)) => "offline",
        Error::Database(_) => "storage_error",
        _ => "error",
    }
}

/// Split a batch into per-record groups, keeping `seq` order inside each
/// group and ordering groups by their first entry.
fn group_by_record(batch: Vec<OutboxEntry>) -> Vec<Vec<OutboxEntry>> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut groups: Vec<Vec<OutboxEntry>> = Vec::new();
    for entry in batch {
        let (table, key) = entry.record_id();
        let id = (table.to_string(), key.to_string());
        match index.get(&id) {
            Some(position) => groups[*position].push(entry),
            None => {
                index.insert(id, groups.len());
                groups.push(vec![entry]);
            }
        }
    }
    groups
}

async fn next_remote_change(
    feed: &mut Option<mpsc::Receiver<RemoteChange>>,
) -> Option<RemoteChange> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

enum Wake {
    Stop,
    Tick,
    Connectivity(bool),
    Remote(Option<RemoteChange>),
}

/// Owns sync state transitions between the local store, the outbox and the
/// remote store. Construct once, share through an `Arc`.
pub struct SyncCoordinator {
    config: SyncConfig,
    records: Arc<dyn RecordRepositoryTrait>,
    outbox: Arc<dyn OutboxRepositoryTrait>,
    engine_state: Arc<dyn SyncEngineStateRepositoryTrait>,
    remote: Arc<dyn RemoteStoreTrait>,
    connectivity: Arc<ConnectivityMonitor>,
    notifier: Arc<ChangeNotifier>,
    initialized: AtomicBool,
    bootstrapped: AtomicBool,
    phase: Mutex<SyncPhase>,
    pending_sync: AtomicI64,
    failed_count: AtomicI64,
    last_error: Mutex<Option<String>>,
    drive: Mutex<DriveState>,
    drive_task: Mutex<Option<JoinHandle<()>>>,
    cycle_mutex: AsyncMutex<()>,
    background_task: AsyncMutex<Option<BackgroundTask>>,
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        records: Arc<dyn RecordRepositoryTrait>,
        outbox: Arc<dyn OutboxRepositoryTrait>,
        engine_state: Arc<dyn SyncEngineStateRepositoryTrait>,
        remote: Arc<dyn RemoteStoreTrait>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            config,
            records,
            outbox,
            engine_state,
            remote,
            connectivity,
            notifier: Arc::new(ChangeNotifier::new()),
            initialized: AtomicBool::new(false),
            bootstrapped: AtomicBool::new(false),
            phase: Mutex::new(SyncPhase::Uninitialized),
            pending_sync: AtomicI64::new(0),
            failed_count: AtomicI64::new(0),
            last_error: Mutex::new(None),
            drive: Mutex::new(DriveState::default()),
            drive_task: Mutex::new(None),
            cycle_mutex: AsyncMutex::new(()),
            background_task: AsyncMutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Load counters, pull critical tables on first run, become `Idle`.
    ///
    /// Pull failures are tolerated: the app starts offline and bootstraps on
    /// the first successful cycle.
    pub async fn init(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let _cycle_guard = self.cycle_mutex.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        self.set_phase(SyncPhase::Bootstrapping);
        if let Err(err) = self.bootstrap().await {
            error!("[Sync] Initialization failed: {}", err);
            self.set_phase(SyncPhase::Uninitialized);
            return Err(err);
        }

        self.initialized.store(true, Ordering::SeqCst);
        self.set_phase(SyncPhase::Idle);
        info!(
            "[Sync] Initialized pending={} failed={} online={}",
            self.pending_sync.load(Ordering::SeqCst),
            self.failed_count.load(Ordering::SeqCst),
            self.connectivity.is_online()
        );
        Ok(())
    }

    async fn bootstrap(&self) -> Result<()> {
        self.refresh_counters()?;
        let status = self.engine_state.get_engine_status()?;
        if status.bootstrapped_at.is_some() {
            self.bootstrapped.store(true, Ordering::SeqCst);
            return Ok(());
        }
        if !self.connectivity.is_online() {
            info!("[Sync] Starting offline, initial pull deferred");
            return Ok(());
        }

        let mut ctx = CycleContext::new(SyncCycleTrigger::Startup);
        match self.pull_critical_tables(&mut ctx).await {
            Ok(()) => {
                self.engine_state.mark_bootstrap_complete().await?;
                self.bootstrapped.store(true, Ordering::SeqCst);
                info!(
                    "[Sync] Initial pull complete: {} record(s) in {}ms",
                    ctx.pulled_count,
                    ctx.duration_ms()
                );
            }
            Err(err) if err.is_storage() => return Err(err),
            Err(err) => warn!("[Sync] Initial pull failed, continuing offline: {}", err),
        }
        Ok(())
    }

    /// Stop background work and wait for the in-flight drive, including any
    /// queued rerun, to finish. Pushes already sent are acknowledged first.
    pub async fn teardown(&self) {
        self.stop_background().await;
        self.wait_for_drive().await;
        let _cycle_guard = self.cycle_mutex.lock().await;
        info!("[Sync] Coordinator stopped");
    }

    async fn wait_for_drive(&self) {
        let handle = lock(&self.drive_task).take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("[Sync] Sync drive ended abnormally: {}", err);
            }
        }
    }

    pub fn get_sync_status(&self) -> SyncStatus {
        SyncStatus {
            online: self.connectivity.is_online(),
            initialized: self.is_initialized(),
            pending_sync: self.pending_sync.load(Ordering::SeqCst),
            failed_count: self.failed_count.load(Ordering::SeqCst),
            phase: *lock(&self.phase),
            last_error: lock(&self.last_error).clone(),
        }
    }

    /// Run a manual cycle. Concurrent callers share one drive and all receive
    /// the result of its last cycle.
    pub async fn start_sync(self: &Arc<Self>) -> Result<SyncCycleResult> {
        self.request_cycle(SyncCycleTrigger::Manual).await
    }

    /// Record a local write optimistically and queue it for the remote store.
    ///
    /// Inserts without a key get a generated one. When online the write is
    /// pushed right away; a failed push leaves it queued.
    pub async fn sync_data(
        self: &Arc<Self>,
        table: &str,
        operation: OutboxOperation,
        data: serde_json::Value,
    ) -> Result<SyncDataResult> {
        if !self.config.is_known_table(table) {
            return Err(Error::InvalidInput(format!("Unknown table '{}'", table)));
        }
        let mut payload = data;
        let key_field = self.config.key_field.clone();
        let key = match record_key_from_payload(&payload, &key_field) {
            Some(key) => key,
            None if operation == OutboxOperation::Insert => {
                let key = Uuid::new_v4().to_string();
                let Some(fields) = payload.as_object_mut() else {
                    return Err(Error::InvalidInput(format!(
                        "Payload for '{}' must be a JSON object",
                        table
                    )));
                };
                fields.insert(key_field, serde_json::Value::String(key.clone()));
                key
            }
            None => {
                return Err(Error::InvalidInput(format!(
                    "{:?} on '{}' requires a '{}' field",
                    operation, table, key_field
                )));
            }
        };

        let request = OutboxWriteRequest::new(table, key.clone(), operation, payload);
        let entry = self.records.stage_mutation(LocalMutation::new(request)).await?;
        self.refresh_counters()?;
        debug!(
            "[Sync] Staged {:?} {}/{} as seq {}",
            operation, table, key, entry.seq
        );
        self.notifier
            .publish(SyncEvent::local_write(table, key.clone(), operation));

        let mut pushed = false;
        if self.is_initialized() && self.connectivity.is_online() {
            if let Err(err) = self.request_cycle(SyncCycleTrigger::LocalMutation).await {
                warn!(
                    "[Sync] Immediate push of {}/{} deferred: {}",
                    table, key, err
                );
            }
            pushed = self.outbox.get_entry(entry.seq)?.is_none();
        }

        Ok(SyncDataResult {
            key,
            seq: entry.seq,
            pushed,
        })
    }

    /// Lazy read of cached records. The default view includes pending local
    /// writes and hides pending deletes.
    pub fn get_local_data(&self, table: &str, filter: RecordFilter) -> Result<RecordCursor> {
        if !self.config.is_known_table(table) {
            return Err(Error::InvalidInput(format!("Unknown table '{}'", table)));
        }
        Ok(RecordCursor::new(Arc::clone(&self.records), table, filter))
    }

    /// Dead-lettered writes awaiting a user decision.
    pub fn failed_items(&self) -> Result<Vec<OutboxEntry>> {
        self.outbox.list_dead_letters()
    }

    /// Give up on a dead-lettered write and roll its record back.
    pub async fn discard_failed(&self, seq: i64) -> Result<bool> {
        let Some(entry) = self.outbox.discard_dead_letter(seq).await? else {
            return Ok(false);
        };
        self.records
            .revert_record(entry.table.clone(), entry.key.clone())
            .await?;
        self.refresh_counters()?;
        info!(
            "[Sync] Discarded failed {:?} of {}/{}",
            entry.operation, entry.table, entry.key
        );
        self.notifier.publish(SyncEvent::LocalDataChanged {
            table: entry.table,
            key: Some(entry.key),
            operation: None,
        });
        Ok(true)
    }

    /// Put a dead-lettered write back in the queue and try it again.
    pub async fn retry_failed(self: &Arc<Self>, seq: i64) -> Result<bool> {
        if !self.outbox.requeue_dead_letter(seq).await? {
            return Ok(false);
        }
        self.refresh_counters()?;
        if self.is_initialized() && self.connectivity.is_online() {
            if let Err(err) = self.request_cycle(SyncCycleTrigger::Manual).await {
                warn!("[Sync] Retry of seq {} deferred: {}", seq, err);
            }
        }
        Ok(true)
    }

    /// Wipe every cached record and queued write after user confirmation.
    ///
    /// Background work is stopped and the in-flight cycle awaited first. On
    /// failure the local state is undefined and the app must reload.
    pub async fn reset_local_state(
        &self,
        confirmation: &dyn ResetConfirmation,
    ) -> Result<ResetOutcome> {
        let preview = ResetPreview {
            pending_sync: self.pending_sync.load(Ordering::SeqCst),
            failed_count: self.failed_count.load(Ordering::SeqCst),
        };
        if !confirmation.confirm_reset(&preview) {
            info!("[Sync] Local reset cancelled");
            return Ok(ResetOutcome::Cancelled);
        }

        self.stop_background().await;
        let _cycle_guard = self.cycle_mutex.lock().await;

        let purged = match self.records.purge_all().await {
            Ok(summary) => summary,
            Err(err) => {
                error!("[Sync] Local reset failed, reload required: {}", err);
                return Err(err);
            }
        };
        self.bootstrapped.store(false, Ordering::SeqCst);
        *lock(&self.last_error) = None;
        self.refresh_counters()?;

        warn!(
            "[Sync] Local state cleared: {} record(s), {} queued write(s) dropped",
            purged.records, purged.outbox_entries
        );
        for table in &self.config.tables {
            self.notifier.publish(SyncEvent::table_changed(table.clone()));
        }

        Ok(ResetOutcome::Cleared {
            records: purged.records,
            outbox_entries: purged.outbox_entries,
            reload_required: true,
        })
    }

    /// Spawn the background loop: periodic cycles with jitter, cycles on
    /// regained connectivity and on remote change notifications.
    pub async fn start_background(self: &Arc<Self>) {
        let mut guard = self.background_task.lock().await;
        if let Some(task) = guard.as_ref() {
            if !task.handle.is_finished() {
                return;
            }
            guard.take();
        }

        let coordinator = Arc::downgrade(self);
        let mut connectivity_rx = self.connectivity.subscribe();
        let mut remote_changes = self.remote.change_feed();
        let (stop, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                let delay = match coordinator.upgrade() {
                    Some(coordinator) => coordinator.next_cycle_delay(),
                    None => break,
                };

                let wake = tokio::select! {
                    _ = stop_rx.changed() => Wake::Stop,
                    _ = tokio::time::sleep(delay) => Wake::Tick,
                    changed = connectivity_rx.changed() => Wake::Connectivity(changed.is_ok()),
                    change = next_remote_change(&mut remote_changes) => Wake::Remote(change),
                };

                let trigger = match wake {
                    Wake::Stop => break,
                    Wake::Tick => SyncCycleTrigger::Periodic,
                    Wake::Connectivity(false) => break,
                    Wake::Connectivity(true) => {
                        if !*connectivity_rx.borrow_and_update() {
                            continue;
                        }
                        SyncCycleTrigger::ConnectivityRegained
                    }
                    Wake::Remote(Some(change)) => {
                        debug!(
                            "[Sync] Remote change on '{}' ({})",
                            change.table,
                            change.key.as_deref().unwrap_or("*")
                        );
                        SyncCycleTrigger::RemoteChange
                    }
                    Wake::Remote(None) => {
                        remote_changes = None;
                        continue;
                    }
                };

                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                if trigger == SyncCycleTrigger::Periodic
                    && !coordinator.connectivity.is_online()
                    && !coordinator.connectivity.should_probe()
                {
                    continue;
                }
                match coordinator.request_cycle(trigger).await {
                    Ok(result) => debug!(
                        "[Sync] Cycle complete trigger={:?} status={} pushed={} pulled={}",
                        result.trigger, result.status, result.pushed_count, result.pulled_count
                    ),
                    Err(err) => warn!("[Sync] Background {:?} cycle failed: {}", trigger, err),
                }
            }
        });
        *guard = Some(BackgroundTask { handle, stop });
    }

    /// Signal the background loop and wait for it to exit. A cycle it started
    /// keeps running in its own task.
    pub async fn stop_background(&self) {
        let mut guard = self.background_task.lock().await;
        if let Some(task) = guard.take() {
            let _ = task.stop.send(true);
            if let Err(err) = task.handle.await {
                error!("[Sync] Background loop ended abnormally: {}", err);
            }
            debug!("[Sync] Background loop stopped");
        }
    }

    fn next_cycle_delay(&self) -> Duration {
        let jitter_ms = interval_jitter_ms(self.config.interval_jitter.as_secs());
        let mut delay_ms = (self.config.sync_interval.as_millis() as u64).saturating_add(jitter_ms);
        if self.connectivity.is_online() {
            if let Ok(batch) = self.outbox.peek_batch(1) {
                if !batch.is_empty() {
                    delay_ms = delay_ms.min(PENDING_OUTBOX_RECHECK_MS + (jitter_ms % 500));
                }
            }
        }
        Duration::from_millis(delay_ms)
    }

    /// Single-flight entry point for every trigger. The drive runs in its own
    /// task, so a caller giving up on the result never cancels a push.
    async fn request_cycle(
        self: &Arc<Self>,
        trigger: SyncCycleTrigger,
    ) -> Result<SyncCycleResult> {
        if !self.is_initialized() {
            self.init().await?;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut drive = lock(&self.drive);
            drive.waiters.push(tx);
            if drive.running {
                drive.rerun = Some(trigger);
                debug!("[Sync] {:?} trigger joined the running cycle", trigger);
            } else {
                drive.running = true;
                let coordinator = Arc::clone(self);
                let handle = tokio::spawn(async move { coordinator.drive(trigger).await });
                *lock(&self.drive_task) = Some(handle);
            }
        }

        rx.await
            .unwrap_or_else(|_| Err(Error::Unexpected("sync cycle was interrupted".to_string())))
    }

    async fn drive(&self, first: SyncCycleTrigger) {
        let mut guard = DriveGuard {
            drive: &self.drive,
            finished: false,
        };
        let mut trigger = first;
        loop {
            let result = self.run_cycle(trigger).await;
            let waiters = {
                let mut drive = lock(&self.drive);
                match drive.rerun.take() {
                    Some(next) => {
                        trigger = next;
                        None
                    }
                    None => {
                        drive.running = false;
                        Some(std::mem::take(&mut drive.waiters))
                    }
                }
            };
            if let Some(waiters) = waiters {
                guard.finished = true;
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
                return;
            }
        }
    }

    async fn run_cycle(&self, trigger: SyncCycleTrigger) -> Result<SyncCycleResult> {
        if !self.connectivity.is_online() && !self.connectivity.should_probe() {
            debug!("[Sync] Skipping {:?} cycle while offline", trigger);
            return Err(SyncError::Connectivity("remote store is offline".to_string()).into());
        }

        let _cycle_guard = self.cycle_mutex.lock().await;
        let mut ctx = CycleContext::new(trigger);
        self.set_phase(SyncPhase::Syncing);
        let outcome = self.push_and_pull(&mut ctx).await;
        self.set_phase(SyncPhase::Idle);

        match outcome {
            Ok(()) => self.complete(ctx).await,
            Err(err) => {
                self.fail(&ctx, &err).await;
                Err(err)
            }
        }
    }

    async fn push_and_pull(&self, ctx: &mut CycleContext) -> Result<()> {
        self.push_pending(ctx).await?;
        self.pull_critical_tables(ctx).await?;
        if !self.bootstrapped.load(Ordering::SeqCst) {
            self.engine_state.mark_bootstrap_complete().await?;
            self.bootstrapped.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn complete(&self, ctx: CycleContext) -> Result<SyncCycleResult> {
        let result = ctx.result("ok");
        self.engine_state
            .mark_cycle_outcome(SyncCycleOutcome {
                status: result.status.clone(),
                duration_ms: result.duration_ms,
                pushed: result.pushed_count > 0,
                pulled: true,
                error: None,
            })
            .await?;
        self.refresh_counters()?;
        *lock(&self.last_error) = None;

        self.notifier.publish(SyncEvent::sync_completed(
            result.synced_count(),
            result.dead_lettered_count,
        ));
        Ok(result)
    }

    async fn fail(&self, ctx: &CycleContext, err: &Error) {
        let status = cycle_status_code(err);
        warn!("[Sync] {:?} cycle failed ({}): {}", ctx.trigger, status, err);
        *lock(&self.last_error) = Some(err.to_string());

        let persisted = self
            .engine_state
            .mark_cycle_outcome(SyncCycleOutcome {
                status: status.to_string(),
                duration_ms: ctx.duration_ms(),
                pushed: ctx.pushed_count > 0,
                pulled: false,
                error: Some(err.to_string()),
            })
            .await;
        if let Err(persist_err) = persisted {
            error!("[Sync] Failed to record cycle outcome: {}", persist_err);
        }
        if let Err(refresh_err) = self.refresh_counters() {
            error!("[Sync] Failed to refresh counters: {}", refresh_err);
        }
    }

    async fn push_pending(&self, ctx: &mut CycleContext) -> Result<()> {
        let batch = self.outbox.peek_batch(self.config.batch_size)?;
        if batch.is_empty() {
            return Ok(());
        }
        debug!("[Sync] Pushing {} outbox entr(ies)", batch.len());

        let halted = AtomicBool::new(false);
        let reports: Vec<Result<GroupReport>> = stream::iter(group_by_record(batch))
            .map(|group| self.push_group(group, &halted))
            .buffer_unordered(self.config.max_parallel_keys.max(1))
            .collect()
            .await;

        let mut unreachable = None;
        for report in reports {
            let report = report?;
            ctx.pushed_count += report.pushed;
            ctx.retried_count += report.retried;
            ctx.dead_lettered_count += report.dead_lettered;
            if unreachable.is_none() {
                unreachable = report.unreachable;
            }
        }
        if let Some(err) = unreachable {
            return Err(err.into());
        }
        Ok(())
    }

    /// Push one record's entries strictly in order. A failure leaves the rest
    /// of the group queued.
    async fn push_group(
        &self,
        group: Vec<OutboxEntry>,
        halted: &AtomicBool,
    ) -> Result<GroupReport> {
        let mut report = GroupReport::default();
        for entry in group {
            if halted.load(Ordering::SeqCst) {
                break;
            }
            let failure = match self.send_entry(&entry).await {
                Ok(()) => {
                    self.connectivity.report_request_success();
                    self.outbox.acknowledge(vec![entry.seq]).await?;
                    let confirmed = self
                        .records
                        .confirm_record(entry.table.clone(), entry.key.clone())
                        .await?;
                    if confirmed {
                        self.notifier.publish(SyncEvent::LocalDataChanged {
                            table: entry.table.clone(),
                            key: Some(entry.key.clone()),
                            operation: None,
                        });
                    }
                    report.pushed += 1;
                    continue;
                }
                Err(err) => SyncError::from(err),
            };

            match failure {
                SyncError::Connectivity(message) => {
                    halted.store(true, Ordering::SeqCst);
                    self.connectivity.report_request_failure();
                    warn!(
                        "[Sync] Remote unreachable while pushing seq {}: {}",
                        entry.seq, message
                    );
                    report.unreachable = Some(SyncError::Connectivity(message));
                    break;
                }
                err => {
                    self.connectivity.report_request_success();
                    let retryable = matches!(err, SyncError::Transient(_));
                    let stored = self
                        .outbox
                        .mark_failed(entry.seq, err.to_string(), retryable)
                        .await?;
                    match stored.map(|stored| stored.status) {
                        Some(OutboxStatus::Dead) => {
                            report.dead_lettered += 1;
                            warn!(
                                "[Sync] {:?} of {}/{} rejected permanently: {}",
                                entry.operation, entry.table, entry.key, err
                            );
                        }
                        Some(OutboxStatus::Pending) => {
                            report.retried += 1;
                            debug!(
                                "[Sync] {:?} of {}/{} will be retried: {}",
                                entry.operation, entry.table, entry.key, err
                            );
                        }
                        None => {}
                    }
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn send_entry(&self, entry: &OutboxEntry) -> std::result::Result<(), RemoteError> {
        let call = async {
            match entry.operation {
                OutboxOperation::Insert => {
                    self.remote
                        .insert(&entry.table, &entry.key, &entry.payload)
                        .await
                }
                OutboxOperation::Update => {
                    self.remote
                        .update(&entry.table, &entry.key, &entry.payload)
                        .await
                }
                // Already gone remotely counts as done.
                OutboxOperation::Delete => {
                    match self.remote.delete(&entry.table, &entry.key).await {
                        Err(err) if err.is_not_found() => Ok(()),
                        other => other,
                    }
                }
            }
        };
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    /// Pull every critical table. A table the remote rejects is skipped; an
    /// unreachable remote aborts the pull.
    async fn pull_critical_tables(&self, ctx: &mut CycleContext) -> Result<()> {
        for table in &self.config.critical_tables {
            let fetched = match tokio::time::timeout(
                self.config.request_timeout,
                self.remote.fetch_table(table),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout),
            };

            let remote_records = match fetched {
                Ok(remote_records) => {
                    self.connectivity.report_request_success();
                    remote_records
                }
                Err(err) if err.is_connectivity() => {
                    self.connectivity.report_request_failure();
                    return Err(SyncError::from(err).into());
                }
                Err(err) => {
                    self.connectivity.report_request_success();
                    warn!("[Sync] Pull of '{}' failed: {}", table, err);
                    continue;
                }
            };

            let summary = self
                .records
                .apply_remote_snapshot(table.clone(), remote_records)
                .await?;
            if summary.kept_local > 0 {
                debug!(
                    "[Sync] Kept {} pending local record(s) in '{}'",
                    summary.kept_local, table
                );
            }
            ctx.pulled_count += summary.applied();
            if summary.applied() > 0 {
                self.notifier.publish(SyncEvent::table_changed(table.clone()));
            }
        }
        Ok(())
    }

    fn refresh_counters(&self) -> Result<()> {
        self.pending_sync
            .store(self.records.count_pending()?, Ordering::SeqCst);
        self.failed_count
            .store(self.outbox.count_failed()?, Ordering::SeqCst);
        Ok(())
    }

    fn set_phase(&self, phase: SyncPhase) {
        *lock(&self.phase) = phase;
    }
}
