use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::watch;
use tokio::time::Instant;

use super::debounce::Debouncer;
use crate::config::SyncConfig;

struct MonitorState {
    platform: Debouncer,
    /// Set by a failed remote request, cleared by a successful one.
    unreachable: bool,
}

impl MonitorState {
    fn effective(&self) -> bool {
        self.platform.stable() && !self.unreachable
    }
}

/// Tracks whether the remote store is believed reachable.
///
/// Two inputs feed it: the platform's reachability signal, which is debounced
/// so brief flaps never start a cycle, and the outcome of real remote
/// requests, which is applied immediately.
pub struct ConnectivityMonitor {
    state: Mutex<MonitorState>,
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initial_online: bool, debounce: Duration) -> Arc<Self> {
        let (tx, _rx) = watch::channel(initial_online);
        Arc::new(Self {
            state: Mutex::new(MonitorState {
                platform: Debouncer::new(initial_online, debounce),
                unreachable: false,
            }),
            tx,
        })
    }

    /// Monitor using the configured platform debounce window.
    pub fn from_config(initial_online: bool, config: &SyncConfig) -> Arc<Self> {
        Self::new(initial_online, config.connectivity_debounce)
    }

    pub fn is_online(&self) -> bool {
        let mut state = self.lock_state();
        state.platform.settle(Instant::now());
        let online = state.effective();
        self.publish(online);
        online
    }

    /// Platform says online but recent requests failed: worth a probe cycle.
    pub fn should_probe(&self) -> bool {
        let mut state = self.lock_state();
        state.platform.settle(Instant::now());
        state.platform.stable() && state.unreachable
    }

    /// Receiver notified only when the effective state flips.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Raw platform reachability signal.
    pub fn report_platform(self: &Arc<Self>, online: bool) {
        let deadline = {
            let mut state = self.lock_state();
            let now = Instant::now();
            let deadline = state.platform.observe(online, now);
            if state.platform.settle(now).is_some() {
                let effective = state.effective();
                self.publish(effective);
            }
            deadline.filter(|_| state.platform.deadline().is_some())
        };

        if let Some(deadline) = deadline {
            debug!(
                "[Connectivity] Platform reports {}, waiting for it to hold",
                if online { "online" } else { "offline" }
            );
            self.schedule_settle(deadline);
        }
    }

    pub fn report_request_failure(&self) {
        let mut state = self.lock_state();
        if !state.unreachable {
            debug!("[Connectivity] Remote request failed, marking remote unreachable");
        }
        state.unreachable = true;
        let effective = state.effective();
        self.publish(effective);
    }

    pub fn report_request_success(&self) {
        let mut state = self.lock_state();
        state.unreachable = false;
        let effective = state.effective();
        self.publish(effective);
    }

    fn schedule_settle(self: &Arc<Self>, deadline: Instant) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime: the next is_online() settles lazily.
            return;
        };
        let monitor: Weak<Self> = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(monitor) = monitor.upgrade() {
                monitor.is_online();
            }
        });
    }

    fn publish(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!(
                "[Connectivity] Remote is now {}",
                if online { "reachable" } else { "unreachable" }
            );
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
