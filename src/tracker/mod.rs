//! Completion tracker: read-side aggregation over completion events
//!
//! A pure consumer of the queue's event stream. Counts are recomputed from
//! the append-only log on every read; there are no separately mutated
//! counters to drift.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::events::{QueueEvent, SyncObserver};
use crate::storage::items::count_items_in_mission;
use crate::storage::Storage;
use crate::types::{CompletionAction, CompletionEvent};

/// Aggregated completion counts for a mission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionStats {
    pub mission_id: String,
    pub validated: i64,
    pub merged: i64,
    pub enriched: i64,
    pub total_features: i64,
    pub completion_rate: f64,
    pub enrichment_rate: f64,
}

/// One fixed 24-hour window of completion history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayBucket {
    /// Start of the 24-hour window
    pub date: DateTime<Utc>,
    pub completed: i64,
    pub validated: i64,
    pub merged: i64,
    pub enriched: i64,
}

/// Read-side tracker over the completion event log
pub struct CompletionTracker {
    storage: Arc<Storage>,
}

impl CompletionTracker {
    /// Create a tracker over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Append an event. Idempotent on (item, action, timestamp) identity:
    /// upstream retries deliver at least once, duplicates count once.
    /// Returns whether the event was newly recorded.
    pub fn record_event(&self, event: &CompletionEvent) -> Result<bool> {
        self.storage.with_connection(|conn| {
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO completion_events
                    (item_id, mission_id, user_id, action, timestamp, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    event.item_id,
                    event.mission_id,
                    event.user_id.as_str(),
                    event.action.as_str(),
                    event.timestamp.to_rfc3339(),
                    serde_json::to_string(&event.metadata)?,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Completion counts for a mission, recomputed from the event log
    pub fn stats_by_mission(&self, mission_id: &str) -> Result<MissionStats> {
        self.storage.with_connection(|conn| {
            let count_action = |action: CompletionAction| -> Result<i64> {
                conn.query_row(
                    "SELECT COUNT(*) FROM completion_events
                     WHERE mission_id = ?1 AND action = ?2",
                    params![mission_id, action.as_str()],
                    |row| row.get(0),
                )
                .map_err(crate::error::StrataError::from)
            };

            let validated = count_action(CompletionAction::Validated)?;
            let merged = count_action(CompletionAction::Merged)?;
            let enriched = count_action(CompletionAction::Enriched)?;
            let total_features = count_items_in_mission(conn, mission_id)?;

            Ok(MissionStats {
                mission_id: mission_id.to_string(),
                validated,
                merged,
                enriched,
                total_features,
                completion_rate: rate(validated, total_features),
                enrichment_rate: rate(enriched, total_features),
            })
        })
    }

    /// Per-day completion history: exactly `days` fixed 24-hour buckets
    /// ending now, oldest first. Days with no events yield all-zero counts.
    pub fn completion_history(&self, mission_id: &str, days: u32) -> Result<Vec<DayBucket>> {
        let now = Utc::now();
        let window_start = now - Duration::hours(24 * days as i64);

        let events = self.storage.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT action, timestamp FROM completion_events
                 WHERE mission_id = ?1 AND timestamp > ?2 AND timestamp <= ?3
                 ORDER BY timestamp ASC",
            )?;
            let rows: Vec<(String, String)> = stmt
                .query_map(
                    params![mission_id, window_start.to_rfc3339(), now.to_rfc3339()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut buckets: Vec<DayBucket> = (0..days)
            .map(|i| DayBucket {
                date: window_start + Duration::hours(24 * i as i64),
                completed: 0,
                validated: 0,
                merged: 0,
                enriched: 0,
            })
            .collect();

        for (action_str, ts_str) in events {
            let ts = match DateTime::parse_from_rfc3339(&ts_str) {
                Ok(dt) => dt.with_timezone(&Utc),
                Err(_) => continue,
            };
            let offset = (ts - window_start).num_hours() / 24;
            if offset < 0 || offset >= days as i64 {
                continue;
            }
            let bucket = &mut buckets[offset as usize];
            bucket.completed += 1;
            match action_str.parse::<CompletionAction>() {
                Ok(CompletionAction::Validated) => bucket.validated += 1,
                Ok(CompletionAction::Merged) => bucket.merged += 1,
                Ok(CompletionAction::Enriched) => bucket.enriched += 1,
                _ => {}
            }
        }

        Ok(buckets)
    }
}

/// `count / max(total, 1)`: a zero divisor yields 0.0, never an error
fn rate(count: i64, total: i64) -> f64 {
    count as f64 / total.max(1) as f64
}

impl SyncObserver for CompletionTracker {
    fn on_event(&self, event: &QueueEvent) {
        if let Some(ref completion) = event.completion {
            if let Err(e) = self.record_event(completion) {
                tracing::warn!(item = completion.item_id, "failed to record completion: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Role, UserManager};
    use crate::storage::items::create_item;
    use crate::types::{User, UserId};
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<Storage>, CompletionTracker, User) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let user = User::new("tracked", Role::Editor);
        storage
            .with_connection(|conn| UserManager::new(conn).create_user(&user))
            .unwrap();
        let tracker = CompletionTracker::new(Arc::clone(&storage));
        (storage, tracker, user)
    }

    fn event(item_id: i64, user: &UserId, action: CompletionAction) -> CompletionEvent {
        CompletionEvent::new(item_id, "m1", user.clone(), action)
    }

    #[test]
    fn test_record_idempotent() {
        let (_storage, tracker, user) = setup();
        let e = event(1, &user.id, CompletionAction::Validated);

        assert!(tracker.record_event(&e).unwrap());
        // Same identity delivered again counts once
        assert!(!tracker.record_event(&e).unwrap());

        let stats = tracker.stats_by_mission("m1").unwrap();
        assert_eq!(stats.validated, 1);
    }

    #[test]
    fn test_stats_by_mission() {
        let (storage, tracker, user) = setup();
        for i in 0..4 {
            storage
                .with_connection(|conn| create_item(conn, &user.id, "m1", &format!("f{}", i)))
                .unwrap();
        }

        tracker
            .record_event(&event(1, &user.id, CompletionAction::Validated))
            .unwrap();
        tracker
            .record_event(&event(2, &user.id, CompletionAction::Validated))
            .unwrap();
        tracker
            .record_event(&event(3, &user.id, CompletionAction::Merged))
            .unwrap();
        tracker
            .record_event(&event(4, &user.id, CompletionAction::Enriched))
            .unwrap();

        let stats = tracker.stats_by_mission("m1").unwrap();
        assert_eq!(stats.validated, 2);
        assert_eq!(stats.merged, 1);
        assert_eq!(stats.enriched, 1);
        assert_eq!(stats.total_features, 4);
        assert_eq!(stats.completion_rate, 0.5);
        assert_eq!(stats.enrichment_rate, 0.25);
    }

    #[test]
    fn test_rates_with_no_features() {
        let (_storage, tracker, _user) = setup();
        let stats = tracker.stats_by_mission("empty").unwrap();
        assert_eq!(stats.total_features, 0);
        assert_eq!(stats.completion_rate, 0.0);
        assert_eq!(stats.enrichment_rate, 0.0);
    }

    #[test]
    fn test_history_exact_bucket_count_when_empty() {
        let (_storage, tracker, _user) = setup();
        let history = tracker.completion_history("m1", 30).unwrap();
        assert_eq!(history.len(), 30);
        assert!(history
            .iter()
            .all(|b| b.completed == 0 && b.validated == 0 && b.merged == 0 && b.enriched == 0));
        // Oldest first
        for pair in history.windows(2) {
            assert!(pair[0].date < pair[1].date);
        }
    }

    #[test]
    fn test_history_buckets_events_by_day() {
        let (_storage, tracker, user) = setup();

        // One event now, one ~25 hours ago
        let recent = event(1, &user.id, CompletionAction::Validated);
        let mut old = event(2, &user.id, CompletionAction::Merged);
        old.timestamp = Utc::now() - Duration::hours(25);

        tracker.record_event(&recent).unwrap();
        tracker.record_event(&old).unwrap();

        let history = tracker.completion_history("m1", 7).unwrap();
        assert_eq!(history.len(), 7);

        let last = &history[6];
        assert_eq!(last.completed, 1);
        assert_eq!(last.validated, 1);

        let day_before = &history[5];
        assert_eq!(day_before.completed, 1);
        assert_eq!(day_before.merged, 1);
    }

    #[test]
    fn test_tracker_subscribes_to_queue() {
        use crate::auth::{AuthContext, Identity};
        use crate::queue::SyncQueue;
        use crate::registry::{DeviceRegistration, DeviceRegistry};
        use crate::types::DeviceType;

        let (storage, tracker, user) = setup();
        let device = storage
            .with_connection(|conn| {
                match DeviceRegistry::new(conn).register_device(&user, DeviceType::Desktop, "w")? {
                    DeviceRegistration::Registered(d) => Ok(d.id),
                    DeviceRegistration::Denied(a) => panic!("unexpected denial: {:?}", a),
                }
            })
            .unwrap();
        let item = storage
            .with_connection(|conn| create_item(conn, &user.id, "m1", "layer"))
            .unwrap();

        let queue = SyncQueue::new(Arc::clone(&storage));
        queue.subscribe(Arc::new(tracker));

        let auth = AuthContext::new(Identity {
            user_id: user.id.clone(),
            role: user.role,
        });
        let entry = queue
            .enqueue(&auth, item.id, &device, None, item.version)
            .unwrap();
        queue.dequeue_next().unwrap().unwrap();
        queue
            .mark_completed_with_action(entry.id, CompletionAction::Enriched)
            .unwrap();

        // The completion flowed through the observer into the event log
        let reader = CompletionTracker::new(storage);
        let stats = reader.stats_by_mission("m1").unwrap();
        assert_eq!(stats.enriched, 1);
        assert_eq!(stats.total_features, 1);
        assert_eq!(stats.enrichment_rate, 1.0);
    }

    #[test]
    fn test_events_outside_window_excluded() {
        let (_storage, tracker, user) = setup();
        let mut ancient = event(1, &user.id, CompletionAction::Validated);
        ancient.timestamp = Utc::now() - Duration::hours(24 * 10);
        tracker.record_event(&ancient).unwrap();

        let history = tracker.completion_history("m1", 7).unwrap();
        assert!(history.iter().all(|b| b.completed == 0));
    }
}
