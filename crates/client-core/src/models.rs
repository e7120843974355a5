//! Core data model for the client resilience layer

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// Waiting for a delivery attempt
    Pending,
    /// A delivery attempt is in flight
    Processing,
    /// Retries exhausted; retained until retried or cleared
    Failed,
    /// Delivered; purged at the end of the processing pass
    Completed,
}

/// A state-changing action waiting for delivery to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Derived snapshot of the synchronization state
///
/// `pending_count` and `failed_count` are recomputed from the queue on
/// every read; this struct is never an independent source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_at: Option<i64>,
    pub pending_count: usize,
    pub failed_count: usize,
    pub sync_errors: Vec<String>,
}

/// One message on the realtime channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
    pub timestamp: i64,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl WireMessage {
    pub fn new(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            timestamp: now_millis(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// An entity that can be reconciled against a remote source of truth
pub trait SyncableEntity {
    fn id(&self) -> &str;
    /// Millisecond timestamp of the latest local modification
    fn updated_at(&self) -> i64;
    /// Millisecond timestamp of the last confirmed sync point
    fn synced_at(&self) -> Option<i64>;
    /// True while the latest write has not been confirmed remotely
    fn is_local(&self) -> bool;
    /// Record a confirmed sync point and clear the local-only flag
    fn mark_synced(&mut self, timestamp: i64);
    /// Flag the entity as carrying an unconfirmed local write
    fn mark_local(&mut self);
}

/// Current Unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique identifier with the given prefix
pub fn generate_id(prefix: &str) -> String {
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", prefix, now_millis(), seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = generate_id("action");
        let b = generate_id("action");
        assert_ne!(a, b);
        assert!(a.starts_with("action-"));
    }

    #[test]
    fn test_wire_message_field_names() {
        let msg = WireMessage::new("chat_message", json!({"text": "hi"})).with_correlation("req-1");
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "chat_message");
        assert_eq!(value["correlationId"], "req-1");
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_wire_message_omits_absent_correlation_id() {
        let msg = WireMessage::new("weather_update", json!({}));
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("correlationId").is_none());
    }

    #[test]
    fn test_queued_action_roundtrip() {
        let action = QueuedAction {
            id: "action-1".to_string(),
            action_type: "create_task".to_string(),
            payload: json!({"title": "water plants"}),
            created_at: 1_700_000_000_000,
            retry_count: 1,
            max_retries: 3,
            status: ActionStatus::Pending,
            last_error: Some("timeout".to_string()),
        };

        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "create_task");
        assert_eq!(value["status"], "pending");

        let back: QueuedAction = serde_json::from_value(value).unwrap();
        assert_eq!(back.action_type, "create_task");
        assert_eq!(back.status, ActionStatus::Pending);
    }
}
