//! Outbox persistence.

mod model;
mod repository;

pub use model::{SyncCountersDB, SyncOutboxEntryDB};
pub(crate) use repository::{adjust_counters, clear_counters, entries_for_record};
pub use repository::{write_outbox_entry, OutboxRepository};
