//! Pull merge policy: local pending writes win until the outbox settles them.
//!
//! This is not a conflict-resolution scheme. Rows are normally edited by the
//! one worker they are assigned to, so a pending local copy is presumed newer
//! than anything pulled.

use super::sync_model::{Record, RemoteRecord, SyncState};

/// What to do with one pulled row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Insert,
    Replace,
    KeepLocal,
    Unchanged,
}

pub fn merge_remote_record(local: Option<&Record>, remote: &RemoteRecord) -> MergeAction {
    match local {
        None => MergeAction::Insert,
        Some(record) if record.sync_state.is_pending() => MergeAction::KeepLocal,
        Some(record) if record.version == remote.version && record.payload == remote.payload => {
            MergeAction::Unchanged
        }
        Some(_) => MergeAction::Replace,
    }
}

/// A local row missing from a full remote snapshot was deleted remotely,
/// unless it carries a local change the remote has not seen yet.
pub fn should_remove_missing(local: &Record) -> bool {
    local.sync_state == SyncState::Clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local(state: SyncState, version: i64, title: &str) -> Record {
        Record {
            table: "tasks".to_string(),
            key: "t1".to_string(),
            payload: json!({ "id": "t1", "title": title }),
            version,
            sync_state: state,
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn remote(version: i64, title: &str) -> RemoteRecord {
        RemoteRecord {
            key: "t1".to_string(),
            payload: json!({ "id": "t1", "title": title }),
            version,
        }
    }

    #[test]
    fn new_remote_rows_are_inserted() {
        assert_eq!(merge_remote_record(None, &remote(1, "a")), MergeAction::Insert);
    }

    #[test]
    fn pending_local_update_is_not_overwritten() {
        let record = local(SyncState::PendingUpdate, 1, "local edit");
        assert_eq!(
            merge_remote_record(Some(&record), &remote(99, "remote edit")),
            MergeAction::KeepLocal
        );
    }

    #[test]
    fn clean_rows_follow_the_remote() {
        let record = local(SyncState::Clean, 1, "old");
        assert_eq!(
            merge_remote_record(Some(&record), &remote(2, "new")),
            MergeAction::Replace
        );
        assert_eq!(
            merge_remote_record(Some(&record), &remote(1, "old")),
            MergeAction::Unchanged
        );
    }

    #[test]
    fn only_clean_rows_are_removed_when_missing() {
        assert!(should_remove_missing(&local(SyncState::Clean, 1, "x")));
        assert!(!should_remove_missing(&local(SyncState::PendingCreate, 1, "x")));
    }
}
