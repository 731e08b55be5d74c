//! Typed change notifications for UI observers.

mod notifier;

pub use notifier::{ChangeNotifier, Subscription};

use serde::Serialize;

use crate::sync::OutboxOperation;

/// Event kinds observers can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    LocalDataChanged,
    SyncCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A local write or a pull changed cached data. `key` is `None` when a
    /// whole table may have changed.
    LocalDataChanged {
        table: String,
        key: Option<String>,
        operation: Option<OutboxOperation>,
    },
    /// A full push + pull pass finished.
    SyncCompleted { synced: usize, failed: usize },
}

impl SyncEvent {
    pub fn local_write(
        table: impl Into<String>,
        key: impl Into<String>,
        operation: OutboxOperation,
    ) -> Self {
        SyncEvent::LocalDataChanged {
            table: table.into(),
            key: Some(key.into()),
            operation: Some(operation),
        }
    }

    pub fn table_changed(table: impl Into<String>) -> Self {
        SyncEvent::LocalDataChanged {
            table: table.into(),
            key: None,
            operation: None,
        }
    }

    pub fn sync_completed(synced: usize, failed: usize) -> Self {
        SyncEvent::SyncCompleted { synced, failed }
    }

    pub fn kind(&self) -> SyncEventKind {
        match self {
            SyncEvent::LocalDataChanged { .. } => SyncEventKind::LocalDataChanged,
            SyncEvent::SyncCompleted { .. } => SyncEventKind::SyncCompleted,
        }
    }
}
