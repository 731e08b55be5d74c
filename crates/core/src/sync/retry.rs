//! Retry classification, backoff and the outbox entry state transition.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::sync_model::OutboxEntry;

/// Retry policy classification for remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

impl SyncRetryClass {
    /// Whether an outbox entry failing with this class stays queued.
    ///
    /// Auth failures are retried: the session is refreshed outside the engine.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncRetryClass::Permanent)
    }

    pub fn code(&self) -> &'static str {
        match self {
            SyncRetryClass::Retryable => "retryable",
            SyncRetryClass::Permanent => "permanent",
            SyncRetryClass::ReauthRequired => "reauth_required",
        }
    }
}

/// Classify HTTP status into retry behavior.
pub fn classify_http_status(status: u16) -> SyncRetryClass {
    match status {
        401 | 403 => SyncRetryClass::ReauthRequired,
        408 | 409 | 423 | 425 | 429 => SyncRetryClass::Retryable,
        500..=599 => SyncRetryClass::Retryable,
        _ => SyncRetryClass::Permanent,
    }
}

/// Exponential backoff in seconds with cap.
pub fn backoff_seconds(consecutive_failures: i32) -> i64 {
    RetryPolicy::default().backoff_seconds(consecutive_failures)
}

/// Per-entry retry limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub base_delay_secs: i64,
    pub max_exponent: i32,
    /// Transient failures after which an entry is dead-lettered anyway.
    pub max_attempts: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            max_exponent: 8,
            max_attempts: 25,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_seconds(&self, consecutive_failures: i32) -> i64 {
        let capped = consecutive_failures.clamp(0, self.max_exponent) as u32;
        2_i64.pow(capped) * self.base_delay_secs
    }
}

/// What happened when an entry was sent to the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Applied,
    Failed { message: String, retryable: bool },
}

/// New state of an outbox entry after a push attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryTransition {
    /// Remove from the outbox.
    Acknowledge,
    /// Keep queued; not eligible before `next_retry_at`.
    Retry {
        attempt_count: i32,
        next_retry_at: DateTime<Utc>,
        last_error: String,
    },
    /// Exclude from replay; count as failed.
    DeadLetter {
        attempt_count: i32,
        last_error: String,
        code: &'static str,
    },
}

pub const DEAD_LETTER_REJECTED: &str = "rejected";
pub const DEAD_LETTER_RETRIES_EXHAUSTED: &str = "retries_exhausted";

/// Pure transition: entry + outcome -> new entry state.
pub fn next_entry_state(
    entry: &OutboxEntry,
    outcome: &PushOutcome,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> EntryTransition {
    match outcome {
        PushOutcome::Applied => EntryTransition::Acknowledge,
        PushOutcome::Failed { message, retryable } => {
            let attempt_count = entry.attempt_count.saturating_add(1);
            if !retryable {
                return EntryTransition::DeadLetter {
                    attempt_count,
                    last_error: message.clone(),
                    code: DEAD_LETTER_REJECTED,
                };
            }
            if attempt_count >= policy.max_attempts {
                return EntryTransition::DeadLetter {
                    attempt_count,
                    last_error: message.clone(),
                    code: DEAD_LETTER_RETRIES_EXHAUSTED,
                };
            }
            EntryTransition::Retry {
                attempt_count,
                next_retry_at: now + Duration::seconds(policy.backoff_seconds(entry.attempt_count)),
                last_error: message.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{OutboxOperation, OutboxStatus};

    fn entry(attempt_count: i32) -> OutboxEntry {
        OutboxEntry {
            seq: 7,
            table: "tasks".to_string(),
            key: "t1".to_string(),
            operation: OutboxOperation::Update,
            payload: serde_json::json!({ "id": "t1" }),
            status: OutboxStatus::Pending,
            enqueued_at: "2026-01-01T00:00:00Z".to_string(),
            attempt_count,
            next_retry_at: None,
            last_error: None,
            last_error_code: None,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn classify_http_status_for_retry_policy() {
        assert_eq!(classify_http_status(500), SyncRetryClass::Retryable);
        assert_eq!(classify_http_status(429), SyncRetryClass::Retryable);
        assert_eq!(classify_http_status(401), SyncRetryClass::ReauthRequired);
        assert_eq!(classify_http_status(400), SyncRetryClass::Permanent);
        assert_eq!(classify_http_status(422), SyncRetryClass::Permanent);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_seconds(0), 5);
        assert_eq!(backoff_seconds(1), 10);
        assert_eq!(backoff_seconds(2), 20);
        assert_eq!(backoff_seconds(9), backoff_seconds(8));
    }

    #[test]
    fn success_acknowledges() {
        let transition = next_entry_state(
            &entry(3),
            &PushOutcome::Applied,
            now(),
            &RetryPolicy::default(),
        );
        assert_eq!(transition, EntryTransition::Acknowledge);
    }

    #[test]
    fn transient_failure_schedules_backoff() {
        let outcome = PushOutcome::Failed {
            message: "timeout".to_string(),
            retryable: true,
        };
        let transition = next_entry_state(&entry(2), &outcome, now(), &RetryPolicy::default());
        assert_eq!(
            transition,
            EntryTransition::Retry {
                attempt_count: 3,
                next_retry_at: now() + Duration::seconds(20),
                last_error: "timeout".to_string(),
            }
        );
    }

    #[test]
    fn terminal_failure_dead_letters_immediately() {
        let outcome = PushOutcome::Failed {
            message: "title is required".to_string(),
            retryable: false,
        };
        match next_entry_state(&entry(0), &outcome, now(), &RetryPolicy::default()) {
            EntryTransition::DeadLetter {
                attempt_count,
                code,
                ..
            } => {
                assert_eq!(attempt_count, 1);
                assert_eq!(code, DEAD_LETTER_REJECTED);
            }
            other => panic!("expected dead letter, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_retries_dead_letter() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let outcome = PushOutcome::Failed {
            message: "503".to_string(),
            retryable: true,
        };
        assert!(matches!(
            next_entry_state(&entry(1), &outcome, now(), &policy),
            EntryTransition::Retry { .. }
        ));
        assert!(matches!(
            next_entry_state(&entry(2), &outcome, now(), &policy),
            EntryTransition::DeadLetter {
                code: DEAD_LETTER_RETRIES_EXHAUSTED,
                ..
            }
        ));
    }
}
