//! Queue event types and the observer seam
//!
//! Cross-cutting consumers (the completion tracker, dashboards) subscribe
//! to queue transitions through `SyncObserver` instead of reaching into the
//! queue's internals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CompletionEvent, EntryId, FailureKind, ItemId};

/// Types of queue events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventType {
    EntryEnqueued,
    EntryStarted,
    EntryCompleted,
    EntryFailed,
    ConflictDetected,
    ConflictResolved,
}

/// A queue transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    /// Event type
    #[serde(rename = "type")]
    pub event_type: QueueEventType,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Related item
    pub item_id: ItemId,
    /// Related queue entry (if applicable)
    pub entry_id: Option<EntryId>,
    /// Completion record (EntryCompleted and resolution applications only)
    pub completion: Option<CompletionEvent>,
    /// Additional data
    pub data: Option<serde_json::Value>,
}

impl QueueEvent {
    /// Create an entry enqueued event
    pub fn entry_enqueued(item_id: ItemId, entry_id: EntryId) -> Self {
        Self {
            event_type: QueueEventType::EntryEnqueued,
            timestamp: Utc::now(),
            item_id,
            entry_id: Some(entry_id),
            completion: None,
            data: None,
        }
    }

    /// Create an entry started event
    pub fn entry_started(item_id: ItemId, entry_id: EntryId) -> Self {
        Self {
            event_type: QueueEventType::EntryStarted,
            timestamp: Utc::now(),
            item_id,
            entry_id: Some(entry_id),
            completion: None,
            data: None,
        }
    }

    /// Create an entry completed event carrying its completion record
    pub fn entry_completed(item_id: ItemId, entry_id: EntryId, completion: CompletionEvent) -> Self {
        Self {
            event_type: QueueEventType::EntryCompleted,
            timestamp: Utc::now(),
            item_id,
            entry_id: Some(entry_id),
            completion: Some(completion),
            data: None,
        }
    }

    /// Create an entry failed event
    pub fn entry_failed(item_id: ItemId, entry_id: EntryId, kind: FailureKind) -> Self {
        Self {
            event_type: QueueEventType::EntryFailed,
            timestamp: Utc::now(),
            item_id,
            entry_id: Some(entry_id),
            completion: None,
            data: Some(serde_json::json!({ "kind": kind.as_str() })),
        }
    }

    /// Create a conflict detected event
    pub fn conflict_detected(item_id: ItemId, entry_id: EntryId, source_version: i64, current_version: i64) -> Self {
        Self {
            event_type: QueueEventType::ConflictDetected,
            timestamp: Utc::now(),
            item_id,
            entry_id: Some(entry_id),
            completion: None,
            data: Some(serde_json::json!({
                "source_version": source_version,
                "current_version": current_version,
            })),
        }
    }

    /// Create a conflict resolved event; carries a completion record when
    /// the resolution applied or merged a write
    pub fn conflict_resolved(
        item_id: ItemId,
        outcome: &str,
        completion: Option<CompletionEvent>,
    ) -> Self {
        Self {
            event_type: QueueEventType::ConflictResolved,
            timestamp: Utc::now(),
            item_id,
            entry_id: None,
            completion,
            data: Some(serde_json::json!({ "outcome": outcome })),
        }
    }
}

/// Observer of queue transitions. Implementations must not call back into
/// the queue; they run inside its notification path.
pub trait SyncObserver: Send + Sync {
    fn on_event(&self, event: &QueueEvent);
}
