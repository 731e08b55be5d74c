//! Scheduler constants for the sync coordinator.

/// Foreground pull cadence in seconds.
pub const SYNC_FOREGROUND_INTERVAL_SECS: u64 = 45;

/// Maximum jitter (seconds) added to periodic cycle intervals.
pub const SYNC_INTERVAL_JITTER_SECS: u64 = 5;

/// Upper bound for a single remote call.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Outbox entries read per push step.
pub const DEFAULT_PUSH_BATCH_SIZE: i64 = 100;

/// Record keys pushed concurrently. Entries of one key are always sequential.
pub const DEFAULT_MAX_PARALLEL_KEYS: usize = 4;

/// Window a platform reachability signal must hold before it is believed.
pub const CONNECTIVITY_DEBOUNCE_MS: u64 = 2_000;

/// Delay before the next cycle while due outbox entries are waiting.
pub const PENDING_OUTBOX_RECHECK_MS: u64 = 2_000;

/// Jitter in milliseconds for a periodic cycle, bounded by
/// [`SYNC_INTERVAL_JITTER_SECS`].
pub fn interval_jitter_ms(jitter_secs: u64) -> u64 {
    let bound = jitter_secs.saturating_mul(1000);
    if bound == 0 {
        return 0;
    }
    rand::random::<u64>() % bound
}
