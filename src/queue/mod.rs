//! Sync queue and conflict resolver
//!
//! The queue is the only writer of item status and version. Scheduling and
//! every terminal transition run inside the storage lock, which is the
//! single serialization point guaranteeing at most one in-flight entry per
//! item. Observers are notified after the lock is released.

pub mod conflict;
mod worker;

pub use conflict::{ManualDecision, ResolutionOutcome};
pub use worker::{QueueWorker, WorkerCommand};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

use crate::auth::{has_permission, AuthContext, ConflictStrategy, Permission, Role, UserManager};
use crate::error::{Result, StrataError};
use crate::events::{QueueEvent, SyncObserver};
use crate::registry::DeviceRegistry;
use crate::storage::items::{accept_write, get_item, require_item, set_item_status};
use crate::storage::{log_audit, AuditEvent, Storage};
use crate::types::{
    CompletionAction, CompletionEvent, DeviceId, EntryId, EntryStatus, FailureKind, ItemId,
    ItemStatus, SyncQueueEntry, SyncableItem, UserId,
};

use conflict::{decide, effective_strategy, Decision, VersionAuthor};

/// Transport seam: performs the actual transfer for a claimed entry.
/// Byte movement is out of scope here; implementations live with the
/// excluded transport layer.
pub trait SyncHandler: Send + Sync {
    fn transfer(&self, entry: &SyncQueueEntry, item: &SyncableItem) -> Result<()>;
}

/// Outcome of processing one claimed entry
#[derive(Debug, Clone)]
pub enum EntryOutcome {
    /// Transfer succeeded; carries the emitted completion record
    Completed(CompletionEvent),
    /// Transfer failed or the item disappeared
    Failed(FailureKind),
    /// A version conflict was detected and routed through resolution
    Conflict(ResolutionOutcome),
}

/// Per-item error reported by `sync_all`
#[derive(Debug, Clone)]
pub struct ItemError {
    pub item_id: ItemId,
    pub error: String,
}

/// Partial-failure summary of a `sync_all` fan-out
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
}

/// The sync queue state machine
pub struct SyncQueue {
    storage: Arc<Storage>,
    observers: RwLock<Vec<Arc<dyn SyncObserver>>>,
}

impl SyncQueue {
    /// Create a queue over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Shared storage handle
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Register an observer of queue transitions
    pub fn subscribe(&self, observer: Arc<dyn SyncObserver>) {
        self.observers.write().push(observer);
    }

    fn notify(&self, events: &[QueueEvent]) {
        let observers = self.observers.read();
        for event in events {
            for observer in observers.iter() {
                observer.on_event(event);
            }
        }
    }

    /// Create a Pending entry for an item.
    ///
    /// `source_version` is the item version the source device last saw;
    /// it is compared against the authoritative version at processing time.
    /// Fails with `PermissionDenied` when the source device's owner lacks
    /// Sync permission. Multiple Pending entries per item may coexist.
    pub fn enqueue(
        &self,
        auth: &AuthContext,
        item_id: ItemId,
        source_device_id: &DeviceId,
        target_device_id: Option<&DeviceId>,
        source_version: i64,
    ) -> Result<SyncQueueEntry> {
        let entry = self.storage.with_connection(|conn| {
            let registry = DeviceRegistry::new(conn);
            let device = registry.require_device(source_device_id)?;
            let owner = UserManager::new(conn).require_user(&device.user_id)?;

            if !has_permission(owner.role, Permission::Sync) {
                return Err(StrataError::PermissionDenied(format!(
                    "device owner role {} lacks Sync",
                    owner.role
                )));
            }

            let item = require_item(conn, item_id)?;
            if item.status == ItemStatus::Conflict {
                return Err(StrataError::ResolutionPending(item_id));
            }

            let now = Utc::now();
            conn.execute(
                r#"
                INSERT INTO sync_queue
                    (item_id, source_device_id, target_device_id, source_version, status, created_at)
                VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
                "#,
                params![
                    item_id,
                    source_device_id.as_str(),
                    target_device_id.map(|d| d.as_str()),
                    source_version,
                    now.to_rfc3339(),
                ],
            )?;
            let entry_id = conn.last_insert_rowid();

            log_audit(
                conn,
                item_id,
                AuditEvent::Enqueued,
                Some(auth.user_id.as_str()),
                Some(&serde_json::json!({ "entry_id": entry_id })),
            )?;

            require_entry(conn, entry_id)
        })?;

        tracing::debug!(entry = entry.id, item = item_id, "entry enqueued");
        self.notify(&[QueueEvent::entry_enqueued(item_id, entry.id)]);
        Ok(entry)
    }

    /// Pick and claim the next runnable entry: highest source-owner role
    /// priority first, ties by creation order, skipping items that already
    /// have an entry in flight. Scan and mark are one atomic step.
    pub fn dequeue_next(&self) -> Result<Option<SyncQueueEntry>> {
        let claimed = self.storage.with_transaction(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT q.id, u.role
                FROM sync_queue q
                JOIN devices d ON d.id = q.source_device_id
                JOIN users u ON u.id = d.user_id
                WHERE q.status = 'pending'
                  AND q.item_id NOT IN
                      (SELECT item_id FROM sync_queue WHERE status = 'in_progress')
                ORDER BY q.id ASC
                "#,
            )?;
            let candidates: Vec<(EntryId, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let best = candidates
                .into_iter()
                .filter_map(|(id, role_str)| {
                    Role::parse(&role_str).ok().map(|role| (id, role.sync_priority()))
                })
                // max_by picks the last max; candidates are id-ascending, so
                // compare strictly to keep the earliest entry on ties
                .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)));

            let (entry_id, _) = match best {
                Some(pick) => pick,
                None => return Ok(None),
            };

            mark_in_progress(conn, entry_id)?;
            require_entry(conn, entry_id).map(Some)
        })?;

        if let Some(ref entry) = claimed {
            tracing::debug!(entry = entry.id, item = entry.item_id, "entry claimed");
            self.notify(&[QueueEvent::entry_started(entry.item_id, entry.id)]);
        }
        Ok(claimed)
    }

    /// Claim a specific Pending entry if its item has nothing in flight.
    /// Returns false when the entry is not Pending or the item is busy.
    pub fn claim(&self, entry_id: EntryId) -> Result<bool> {
        let claimed = self.storage.with_transaction(|conn| {
            let entry = require_entry(conn, entry_id)?;
            if entry.status != EntryStatus::Pending {
                return Ok(None);
            }
            let busy: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE item_id = ?1 AND status = 'in_progress'",
                params![entry.item_id],
                |row| row.get(0),
            )?;
            if busy > 0 {
                return Ok(None);
            }
            mark_in_progress(conn, entry_id)?;
            Ok(Some(entry.item_id))
        })?;

        if let Some(item_id) = claimed {
            self.notify(&[QueueEvent::entry_started(item_id, entry_id)]);
        }
        Ok(claimed.is_some())
    }

    /// Get an entry by ID
    pub fn get_entry(&self, entry_id: EntryId) -> Result<SyncQueueEntry> {
        self.storage.with_connection(|conn| require_entry(conn, entry_id))
    }

    /// All entries referencing an item, oldest first
    pub fn entries_for_item(&self, item_id: ItemId) -> Result<Vec<SyncQueueEntry>> {
        self.storage.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sync_queue WHERE item_id = ?1 ORDER BY id ASC",
                ENTRY_COLUMNS
            ))?;
            let entries = stmt
                .query_map(params![item_id], map_entry_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Complete an in-progress entry, emitting a `modified` completion event
    pub fn mark_completed(&self, entry_id: EntryId) -> Result<CompletionEvent> {
        self.mark_completed_with_action(entry_id, CompletionAction::Modified)
    }

    /// Complete an in-progress entry with an explicit completion action.
    /// Advances the item version by exactly 1 and marks it Synced; emits
    /// exactly one completion event.
    pub fn mark_completed_with_action(
        &self,
        entry_id: EntryId,
        action: CompletionAction,
    ) -> Result<CompletionEvent> {
        let (item_id, completion) = self.storage.with_transaction(|conn| {
            let entry = require_entry(conn, entry_id)?;
            if entry.status != EntryStatus::InProgress {
                return Err(StrataError::InvalidInput(format!(
                    "entry {} is {}, only in-progress entries can complete",
                    entry_id,
                    entry.status.as_str()
                )));
            }

            let item = require_item(conn, entry.item_id)?;
            let author = author_of_entry(conn, &entry).unwrap_or_else(|| item.owner_id.clone());
            let new_version = accept_write(conn, item.id, &author)?;

            conn.execute(
                "UPDATE sync_queue SET status = 'completed', completed_at = ?2 WHERE id = ?1",
                params![entry_id, Utc::now().to_rfc3339()],
            )?;

            log_audit(
                conn,
                item.id,
                AuditEvent::Completed,
                Some(author.as_str()),
                Some(&serde_json::json!({
                    "entry_id": entry_id,
                    "action": action.as_str(),
                    "version": new_version,
                })),
            )?;

            let completion = CompletionEvent::new(item.id, item.mission_id.clone(), author, action)
                .with_metadata("entry_id", serde_json::json!(entry_id));
            Ok((item.id, completion))
        })?;

        tracing::info!(entry = entry_id, item = item_id, "entry completed");
        self.notify(&[QueueEvent::entry_completed(
            item_id,
            entry_id,
            completion.clone(),
        )]);
        Ok(completion)
    }

    /// Fail an in-progress entry. The item moves to Error, or to Conflict
    /// when the failure kind is a conflict. Tolerates the item having
    /// disappeared.
    pub fn mark_failed(
        &self,
        entry_id: EntryId,
        kind: FailureKind,
        error: Option<&str>,
    ) -> Result<()> {
        let item_id = self.storage.with_transaction(|conn| {
            let entry = require_entry(conn, entry_id)?;
            if entry.status != EntryStatus::InProgress {
                return Err(StrataError::InvalidInput(format!(
                    "entry {} is {}, only in-progress entries can fail",
                    entry_id,
                    entry.status.as_str()
                )));
            }

            conn.execute(
                "UPDATE sync_queue
                 SET status = 'failed', failure = ?2, error = ?3, completed_at = ?4
                 WHERE id = ?1",
                params![
                    entry_id,
                    kind.as_str(),
                    error,
                    Utc::now().to_rfc3339()
                ],
            )?;

            let item_status = match kind {
                FailureKind::Conflict => ItemStatus::Conflict,
                _ => ItemStatus::Error,
            };
            // The referenced item may be gone; the entry still terminates
            conn.execute(
                "UPDATE items SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    entry.item_id,
                    item_status.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )?;

            log_audit(
                conn,
                entry.item_id,
                AuditEvent::Failed,
                None,
                Some(&serde_json::json!({
                    "entry_id": entry_id,
                    "kind": kind.as_str(),
                    "error": error,
                })),
            )?;
            Ok(entry.item_id)
        })?;

        tracing::warn!(entry = entry_id, item = item_id, kind = kind.as_str(), "entry failed");
        self.notify(&[QueueEvent::entry_failed(item_id, entry_id, kind)]);
        Ok(())
    }

    /// Optimistic-concurrency check: does the entry's source version differ
    /// from the item's current authoritative version?
    pub fn detect_conflict(&self, entry_id: EntryId) -> Result<bool> {
        self.storage.with_connection(|conn| {
            let entry = require_entry(conn, entry_id)?;
            let item = require_item(conn, entry.item_id)?;
            Ok(entry.source_version != item.version)
        })
    }

    /// Withdraw a Pending entry without side effects. In-progress entries
    /// must run to a terminal state and cannot be withdrawn.
    pub fn withdraw(&self, entry_id: EntryId) -> Result<()> {
        self.storage.with_transaction(|conn| {
            let entry = require_entry(conn, entry_id)?;
            match entry.status {
                EntryStatus::Pending => {
                    conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![entry_id])?;
                    log_audit(
                        conn,
                        entry.item_id,
                        AuditEvent::Withdrawn,
                        None,
                        Some(&serde_json::json!({ "entry_id": entry_id })),
                    )?;
                    Ok(())
                }
                EntryStatus::InProgress => Err(StrataError::InvalidInput(
                    "in-progress entries must run to a terminal state".to_string(),
                )),
                _ => Err(StrataError::InvalidInput(format!(
                    "entry {} already terminal",
                    entry_id
                ))),
            }
        })
    }

    /// Resolve a detected conflict for a (typically failed-with-conflict)
    /// entry, dispatching on the strategy of the highest role present
    /// unless overridden. Manual strategies return `Pending`.
    pub fn resolve_conflict(
        &self,
        entry_id: EntryId,
        strategy_override: Option<ConflictStrategy>,
    ) -> Result<ResolutionOutcome> {
        let mut events: Vec<QueueEvent> = Vec::new();

        let outcome = self.storage.with_transaction(|conn| {
            let entry = require_entry(conn, entry_id)?;
            let item = require_item(conn, entry.item_id)?;

            let registry = DeviceRegistry::new(conn);
            let users = UserManager::new(conn);

            let device = registry.require_device(&entry.source_device_id)?;
            let incoming_user = users.require_user(&device.user_id)?;
            let incoming = VersionAuthor {
                role: incoming_user.role,
                modified_at: entry.created_at,
            };

            let owner = users.require_user(&item.owner_id)?;
            let current_role = match item.updated_by {
                Some(ref author_id) => users
                    .get_user(author_id)?
                    .map(|u| u.role)
                    .unwrap_or(owner.role),
                None => owner.role,
            };
            let current = VersionAuthor {
                role: current_role,
                modified_at: item.updated_at,
            };

            let strategy =
                strategy_override.unwrap_or_else(|| effective_strategy(owner.role, incoming.role));

            let outcome = match decide(strategy, &incoming, &current) {
                Decision::Accept => {
                    let new_version = accept_write(conn, item.id, &incoming_user.id)?;
                    let completion = CompletionEvent::new(
                        item.id,
                        item.mission_id.clone(),
                        incoming_user.id.clone(),
                        CompletionAction::Merged,
                    )
                    .with_metadata("entry_id", serde_json::json!(entry_id));
                    events.push(QueueEvent::conflict_resolved(
                        item.id,
                        "applied",
                        Some(completion),
                    ));
                    ResolutionOutcome::Applied {
                        item_id: item.id,
                        new_version,
                    }
                }
                Decision::Reject => {
                    set_item_status(conn, item.id, ItemStatus::Synced)?;
                    events.push(QueueEvent::conflict_resolved(item.id, "rejected", None));
                    ResolutionOutcome::Rejected { item_id: item.id }
                }
                Decision::Defer => {
                    set_item_status(conn, item.id, ItemStatus::Conflict)?;
                    return Ok(ResolutionOutcome::Pending { item_id: item.id });
                }
            };

            log_audit(
                conn,
                item.id,
                AuditEvent::ConflictResolved,
                Some(incoming_user.id.as_str()),
                Some(&serde_json::json!({
                    "entry_id": entry_id,
                    "strategy": format!("{:?}", strategy),
                    "outcome": outcome.as_str(),
                })),
            )?;
            Ok(outcome)
        })?;

        self.notify(&events);
        Ok(outcome)
    }

    /// Apply an explicit human decision to an item left in Conflict by the
    /// Manual strategy (or by Hierarchical peers).
    pub fn resolve_layer_conflict(
        &self,
        auth: &AuthContext,
        item_id: ItemId,
        decision: ManualDecision,
    ) -> Result<ResolutionOutcome> {
        let mut events: Vec<QueueEvent> = Vec::new();

        let outcome = self.storage.with_transaction(|conn| {
            let item = require_item(conn, item_id)?;
            if item.status != ItemStatus::Conflict {
                return Err(StrataError::InvalidInput(format!(
                    "item {} has no pending conflict",
                    item_id
                )));
            }

            let conflicted = latest_conflicted_entry(conn, item_id)?;

            let (outcome, completion) = match decision {
                ManualDecision::KeepLocal => {
                    set_item_status(conn, item_id, ItemStatus::Synced)?;
                    let completion = CompletionEvent::new(
                        item_id,
                        item.mission_id.clone(),
                        auth.user_id.clone(),
                        CompletionAction::Validated,
                    );
                    (ResolutionOutcome::Rejected { item_id }, completion)
                }
                ManualDecision::UseRemote => {
                    let entry = conflicted.ok_or_else(|| {
                        StrataError::InvalidInput(format!(
                            "item {} has no conflicted entry to apply",
                            item_id
                        ))
                    })?;
                    let author = author_of_entry(conn, &entry)
                        .unwrap_or_else(|| auth.user_id.clone());
                    let new_version = accept_write(conn, item_id, &author)?;
                    let completion = CompletionEvent::new(
                        item_id,
                        item.mission_id.clone(),
                        auth.user_id.clone(),
                        CompletionAction::Validated,
                    )
                    .with_metadata("entry_id", serde_json::json!(entry.id));
                    (
                        ResolutionOutcome::Applied {
                            item_id,
                            new_version,
                        },
                        completion,
                    )
                }
                ManualDecision::Merge => {
                    let new_version = accept_write(conn, item_id, &auth.user_id)?;
                    let completion = CompletionEvent::new(
                        item_id,
                        item.mission_id.clone(),
                        auth.user_id.clone(),
                        CompletionAction::Merged,
                    );
                    (
                        ResolutionOutcome::Applied {
                            item_id,
                            new_version,
                        },
                        completion,
                    )
                }
            };

            log_audit(
                conn,
                item_id,
                AuditEvent::ConflictResolved,
                Some(auth.user_id.as_str()),
                Some(&serde_json::json!({
                    "decision": decision.as_str(),
                    "outcome": outcome.as_str(),
                })),
            )?;

            events.push(QueueEvent::conflict_resolved(
                item_id,
                outcome.as_str(),
                Some(completion),
            ));
            Ok(outcome)
        })?;

        self.notify(&events);
        Ok(outcome)
    }

    /// Run one already-claimed entry to a terminal state
    pub fn process_claimed(
        &self,
        entry: &SyncQueueEntry,
        handler: &dyn SyncHandler,
    ) -> Result<EntryOutcome> {
        let item = self
            .storage
            .with_connection(|conn| get_item(conn, entry.item_id))?;

        let item = match item {
            Some(item) => item,
            None => {
                self.mark_failed(entry.id, FailureKind::NotFound, Some("item disappeared"))?;
                return Ok(EntryOutcome::Failed(FailureKind::NotFound));
            }
        };

        if entry.source_version != item.version {
            self.storage.with_connection(|conn| {
                log_audit(
                    conn,
                    item.id,
                    AuditEvent::ConflictDetected,
                    None,
                    Some(&serde_json::json!({
                        "entry_id": entry.id,
                        "source_version": entry.source_version,
                        "current_version": item.version,
                    })),
                )
            })?;
            self.notify(&[QueueEvent::conflict_detected(
                item.id,
                entry.id,
                entry.source_version,
                item.version,
            )]);
            self.mark_failed(
                entry.id,
                FailureKind::Conflict,
                Some(&format!(
                    "version mismatch: source {} vs current {}",
                    entry.source_version, item.version
                )),
            )?;
            let resolution = self.resolve_conflict(entry.id, None)?;
            return Ok(EntryOutcome::Conflict(resolution));
        }

        match handler.transfer(entry, &item) {
            Ok(()) => {
                let completion = self.mark_completed(entry.id)?;
                Ok(EntryOutcome::Completed(completion))
            }
            Err(e) => {
                self.mark_failed(entry.id, FailureKind::Transport, Some(&e.to_string()))?;
                Ok(EntryOutcome::Failed(FailureKind::Transport))
            }
        }
    }

    /// Fan-out helper: run each item's enqueue/claim/process sequence
    /// independently. A failure on one item never aborts the others;
    /// `success + failed` always equals the input length.
    pub fn sync_all(
        &self,
        auth: &AuthContext,
        item_ids: &[ItemId],
        source_device_id: &DeviceId,
        handler: &dyn SyncHandler,
    ) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();

        for &item_id in item_ids {
            match self.sync_one(auth, item_id, source_device_id, handler) {
                Ok(EntryOutcome::Completed(_))
                | Ok(EntryOutcome::Conflict(ResolutionOutcome::Applied { .. })) => {
                    summary.success += 1;
                }
                Ok(EntryOutcome::Conflict(outcome)) => {
                    summary.failed += 1;
                    summary.errors.push(ItemError {
                        item_id,
                        error: format!("conflict {}", outcome.as_str()),
                    });
                }
                Ok(EntryOutcome::Failed(kind)) => {
                    summary.failed += 1;
                    summary.errors.push(ItemError {
                        item_id,
                        error: format!("failed: {}", kind.as_str()),
                    });
                }
                Err(e) => {
                    summary.failed += 1;
                    summary.errors.push(ItemError {
                        item_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            total = item_ids.len(),
            success = summary.success,
            failed = summary.failed,
            "sync_all settled"
        );
        Ok(summary)
    }

    fn sync_one(
        &self,
        auth: &AuthContext,
        item_id: ItemId,
        source_device_id: &DeviceId,
        handler: &dyn SyncHandler,
    ) -> Result<EntryOutcome> {
        let version = self
            .storage
            .with_connection(|conn| require_item(conn, item_id))?
            .version;

        let entry = self.enqueue(auth, item_id, source_device_id, None, version)?;
        if !self.claim(entry.id)? {
            return Err(StrataError::Sync(format!(
                "item {} already has an entry in flight",
                item_id
            )));
        }
        let entry = self.get_entry(entry.id)?;
        self.process_claimed(&entry, handler)
    }
}

const ENTRY_COLUMNS: &str = "id, item_id, source_device_id, target_device_id, source_version, \
                             status, failure, error, created_at, started_at, completed_at";

fn require_entry(conn: &Connection, entry_id: EntryId) -> Result<SyncQueueEntry> {
    conn.query_row(
        &format!("SELECT {} FROM sync_queue WHERE id = ?1", ENTRY_COLUMNS),
        params![entry_id],
        map_entry_row,
    )
    .optional()?
    .ok_or(StrataError::UnknownEntry(entry_id))
}

fn mark_in_progress(conn: &Connection, entry_id: EntryId) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE sync_queue SET status = 'in_progress', started_at = ?2 WHERE id = ?1",
        params![entry_id, now],
    )?;
    let item_id: ItemId = conn.query_row(
        "SELECT item_id FROM sync_queue WHERE id = ?1",
        params![entry_id],
        |row| row.get(0),
    )?;
    // The item may already be gone; processing turns that into NotFound
    conn.execute(
        "UPDATE items SET status = 'syncing', updated_at = ?2 WHERE id = ?1",
        params![item_id, now],
    )?;
    log_audit(
        conn,
        item_id,
        AuditEvent::Started,
        None,
        Some(&serde_json::json!({ "entry_id": entry_id })),
    )?;
    Ok(())
}

/// Owning user of the entry's source device, when both still exist
fn author_of_entry(conn: &Connection, entry: &SyncQueueEntry) -> Option<UserId> {
    let registry = DeviceRegistry::new(conn);
    registry
        .get_device(&entry.source_device_id)
        .ok()
        .flatten()
        .map(|d| d.user_id)
}

fn latest_conflicted_entry(
    conn: &Connection,
    item_id: ItemId,
) -> Result<Option<SyncQueueEntry>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM sync_queue
             WHERE item_id = ?1 AND status = 'failed' AND failure = 'conflict'
             ORDER BY id DESC LIMIT 1",
            ENTRY_COLUMNS
        ),
        params![item_id],
        map_entry_row,
    )
    .optional()
    .map_err(StrataError::from)
}

fn map_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncQueueEntry> {
    let status_str: String = row.get(5)?;
    let failure_str: Option<String> = row.get(6)?;
    let target: Option<String> = row.get(3)?;
    let started: Option<String> = row.get(9)?;
    let completed: Option<String> = row.get(10)?;

    Ok(SyncQueueEntry {
        id: row.get(0)?,
        item_id: row.get(1)?,
        source_device_id: DeviceId::from_string(row.get::<_, String>(2)?),
        target_device_id: target.map(DeviceId::from_string),
        source_version: row.get(4)?,
        status: status_str.parse().unwrap_or(EntryStatus::Pending),
        failure: failure_str.and_then(|s| s.parse().ok()),
        error: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?),
        started_at: started.as_deref().map(parse_ts),
        completed_at: completed.as_deref().map(parse_ts),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, Role};
    use crate::registry::{DeviceRegistration, DeviceRegistry};
    use crate::storage::items::create_item;
    use crate::types::{DeviceType, User};

    /// Handler that always succeeds
    struct OkHandler;
    impl SyncHandler for OkHandler {
        fn transfer(&self, _entry: &SyncQueueEntry, _item: &SyncableItem) -> Result<()> {
            Ok(())
        }
    }

    /// Handler that fails for a chosen item
    struct FlakyHandler {
        poison: ItemId,
    }
    impl SyncHandler for FlakyHandler {
        fn transfer(&self, _entry: &SyncQueueEntry, item: &SyncableItem) -> Result<()> {
            if item.id == self.poison {
                Err(StrataError::Sync("simulated transport failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        queue: SyncQueue,
        user: User,
        device: DeviceId,
        auth: AuthContext,
    }

    fn fixture_with_role(role: Role) -> Fixture {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let user = User::new("syncer", role);
        let device = storage
            .with_connection(|conn| {
                UserManager::new(conn).create_user(&user)?;
                match DeviceRegistry::new(conn).register_device(&user, DeviceType::Desktop, "wks")? {
                    DeviceRegistration::Registered(d) => Ok(d.id),
                    DeviceRegistration::Denied(a) => panic!("unexpected denial: {:?}", a),
                }
            })
            .unwrap();
        let auth = AuthContext::new(Identity {
            user_id: user.id.clone(),
            role,
        });
        Fixture {
            queue: SyncQueue::new(storage),
            user,
            device,
            auth,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_role(Role::Editor)
    }

    fn new_item(f: &Fixture, mission: &str) -> SyncableItem {
        f.queue
            .storage()
            .with_connection(|conn| create_item(conn, &f.user.id, mission, "layer"))
            .unwrap()
    }

    #[test]
    fn test_round_trip_advances_version() {
        let f = fixture();
        let item = new_item(&f, "m1");

        let entry = f
            .queue
            .enqueue(&f.auth, item.id, &f.device, None, item.version)
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);

        let claimed = f.queue.dequeue_next().unwrap().unwrap();
        assert_eq!(claimed.id, entry.id);
        assert_eq!(claimed.status, EntryStatus::InProgress);

        f.queue.mark_completed(entry.id).unwrap();

        let refreshed = f
            .queue
            .storage()
            .with_connection(|conn| require_item(conn, item.id))
            .unwrap();
        assert_eq!(refreshed.version, item.version + 1);
        assert_eq!(refreshed.status, ItemStatus::Synced);
    }

    #[test]
    fn test_stale_version_detects_conflict() {
        let f = fixture();
        let item = new_item(&f, "m1");

        // First sync succeeds and bumps the version
        let e1 = f
            .queue
            .enqueue(&f.auth, item.id, &f.device, None, item.version)
            .unwrap();
        f.queue.dequeue_next().unwrap().unwrap();
        f.queue.mark_completed(e1.id).unwrap();

        // Second enqueue still carries the old version
        let e2 = f
            .queue
            .enqueue(&f.auth, item.id, &f.device, None, item.version)
            .unwrap();
        f.queue.dequeue_next().unwrap().unwrap();
        assert!(f.queue.detect_conflict(e2.id).unwrap());
    }

    #[test]
    fn test_enqueue_requires_sync_permission() {
        let f = fixture_with_role(Role::Viewer);
        let item = new_item(&f, "m1");

        match f.queue.enqueue(&f.auth, item.id, &f.device, None, 1) {
            Err(StrataError::PermissionDenied(_)) => {}
            other => panic!("expected PermissionDenied, got {:?}", other),
        }
    }

    #[test]
    fn test_enqueue_unknown_item() {
        let f = fixture();
        match f.queue.enqueue(&f.auth, 404, &f.device, None, 1) {
            Err(StrataError::UnknownItem(404)) => {}
            other => panic!("expected UnknownItem, got {:?}", other),
        }
    }

    #[test]
    fn test_at_most_one_in_progress_per_item() {
        let f = fixture();
        let item = new_item(&f, "m1");

        let e1 = f
            .queue
            .enqueue(&f.auth, item.id, &f.device, None, item.version)
            .unwrap();
        let e2 = f
            .queue
            .enqueue(&f.auth, item.id, &f.device, None, item.version)
            .unwrap();

        let first = f.queue.dequeue_next().unwrap().unwrap();
        assert_eq!(first.id, e1.id);

        // Second entry for the same item is not runnable while the first
        // is in flight
        assert!(f.queue.dequeue_next().unwrap().is_none());

        f.queue.mark_completed(e1.id).unwrap();
        let second = f.queue.dequeue_next().unwrap().unwrap();
        assert_eq!(second.id, e2.id);
    }

    #[test]
    fn test_priority_order_with_creation_tiebreak() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let low = User::new("low", Role::User);
        let high = User::new("high", Role::Admin);
        let (low_dev, high_dev) = storage
            .with_connection(|conn| {
                let users = UserManager::new(conn);
                users.create_user(&low)?;
                users.create_user(&high)?;
                let registry = DeviceRegistry::new(conn);
                let ld = match registry.register_device(&low, DeviceType::Mobile, "p")? {
                    DeviceRegistration::Registered(d) => d.id,
                    _ => unreachable!(),
                };
                let hd = match registry.register_device(&high, DeviceType::Desktop, "w")? {
                    DeviceRegistration::Registered(d) => d.id,
                    _ => unreachable!(),
                };
                Ok((ld, hd))
            })
            .unwrap();
        let queue = SyncQueue::new(storage);

        let (item_a, item_b, item_c) = queue
            .storage()
            .with_connection(|conn| {
                Ok((
                    create_item(conn, &low.id, "m", "a")?,
                    create_item(conn, &low.id, "m", "b")?,
                    create_item(conn, &high.id, "m", "c")?,
                ))
            })
            .unwrap();

        let low_auth = AuthContext::new(Identity {
            user_id: low.id.clone(),
            role: Role::User,
        });
        let high_auth = AuthContext::new(Identity {
            user_id: high.id.clone(),
            role: Role::Admin,
        });

        let e_a = queue.enqueue(&low_auth, item_a.id, &low_dev, None, 1).unwrap();
        let e_b = queue.enqueue(&low_auth, item_b.id, &low_dev, None, 1).unwrap();
        let e_c = queue.enqueue(&high_auth, item_c.id, &high_dev, None, 1).unwrap();

        // Admin-sourced entry wins despite being enqueued last
        assert_eq!(queue.dequeue_next().unwrap().unwrap().id, e_c.id);
        // Equal priority: earliest entry first
        assert_eq!(queue.dequeue_next().unwrap().unwrap().id, e_a.id);
        assert_eq!(queue.dequeue_next().unwrap().unwrap().id, e_b.id);
    }

    #[test]
    fn test_terminal_requires_in_progress() {
        let f = fixture();
        let item = new_item(&f, "m1");
        let entry = f
            .queue
            .enqueue(&f.auth, item.id, &f.device, None, item.version)
            .unwrap();

        // Pending entries cannot jump to a terminal state
        assert!(matches!(
            f.queue.mark_completed(entry.id),
            Err(StrataError::InvalidInput(_))
        ));
        assert!(matches!(
            f.queue.mark_failed(entry.id, FailureKind::Internal, None),
            Err(StrataError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_withdraw_pending_only() {
        let f = fixture();
        let item = new_item(&f, "m1");
        let entry = f
            .queue
            .enqueue(&f.auth, item.id, &f.device, None, item.version)
            .unwrap();

        f.queue.withdraw(entry.id).unwrap();
        assert!(matches!(
            f.queue.get_entry(entry.id),
            Err(StrataError::UnknownEntry(_))
        ));

        let entry = f
            .queue
            .enqueue(&f.auth, item.id, &f.device, None, item.version)
            .unwrap();
        f.queue.dequeue_next().unwrap().unwrap();
        assert!(matches!(
            f.queue.withdraw(entry.id),
            Err(StrataError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_failed_entry_sets_item_error() {
        let f = fixture();
        let item = new_item(&f, "m1");
        let entry = f
            .queue
            .enqueue(&f.auth, item.id, &f.device, None, item.version)
            .unwrap();
        f.queue.dequeue_next().unwrap().unwrap();
        f.queue
            .mark_failed(entry.id, FailureKind::Transport, Some("link down"))
            .unwrap();

        let refreshed = f
            .queue
            .storage()
            .with_connection(|conn| require_item(conn, item.id))
            .unwrap();
        assert_eq!(refreshed.status, ItemStatus::Error);

        let stored = f.queue.get_entry(entry.id).unwrap();
        assert_eq!(stored.status, EntryStatus::Failed);
        assert_eq!(stored.failure, Some(FailureKind::Transport));
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn test_item_disappearing_fails_not_found() {
        let f = fixture();
        let item = new_item(&f, "m1");
        let entry = f
            .queue
            .enqueue(&f.auth, item.id, &f.device, None, item.version)
            .unwrap();
        let claimed = f.queue.dequeue_next().unwrap().unwrap();

        f.queue
            .storage()
            .with_connection(|conn| crate::storage::items::delete_item(conn, item.id))
            .unwrap();

        let outcome = f.queue.process_claimed(&claimed, &OkHandler).unwrap();
        assert!(matches!(
            outcome,
            EntryOutcome::Failed(FailureKind::NotFound)
        ));
        let stored = f.queue.get_entry(entry.id).unwrap();
        assert_eq!(stored.failure, Some(FailureKind::NotFound));
    }

    #[test]
    fn test_sync_all_partial_failure_isolation() {
        let f = fixture();
        let good1 = new_item(&f, "m1");
        let poison = new_item(&f, "m1");
        let good2 = new_item(&f, "m1");

        let handler = FlakyHandler { poison: poison.id };
        let summary = f
            .queue
            .sync_all(
                &f.auth,
                &[good1.id, poison.id, good2.id, 9999],
                &f.device,
                &handler,
            )
            .unwrap();

        assert_eq!(summary.success, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.success + summary.failed, 4);
        assert_eq!(summary.errors.len(), 2);
        assert!(summary.errors.iter().any(|e| e.item_id == poison.id));
        assert!(summary.errors.iter().any(|e| e.item_id == 9999));

        // Failures did not leak into the healthy items
        for id in [good1.id, good2.id] {
            let refreshed = f
                .queue
                .storage()
                .with_connection(|conn| require_item(conn, id))
                .unwrap();
            assert_eq!(refreshed.status, ItemStatus::Synced);
            assert_eq!(refreshed.version, 2);
        }
    }

    #[test]
    fn test_auto_resolution_applies_higher_priority_author() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let owner = User::new("owner", Role::User);
        let editor = User::new("editor", Role::Editor);
        let editor_dev = storage
            .with_connection(|conn| {
                let users = UserManager::new(conn);
                users.create_user(&owner)?;
                users.create_user(&editor)?;
                match DeviceRegistry::new(conn).register_device(&editor, DeviceType::Desktop, "w")? {
                    DeviceRegistration::Registered(d) => Ok(d.id),
                    DeviceRegistration::Denied(a) => panic!("unexpected denial: {:?}", a),
                }
            })
            .unwrap();
        let queue = SyncQueue::new(Arc::clone(&storage));
        let item = storage
            .with_connection(|conn| create_item(conn, &owner.id, "m", "layer"))
            .unwrap();
        let auth = AuthContext::new(Identity {
            user_id: editor.id.clone(),
            role: Role::Editor,
        });

        // Stale source version forces a conflict on processing
        let entry = queue
            .enqueue(&auth, item.id, &editor_dev, None, item.version - 1)
            .unwrap();
        let claimed = queue.dequeue_next().unwrap().unwrap();

        let outcome = queue.process_claimed(&claimed, &OkHandler).unwrap();
        // Owner is User (Auto), incoming Editor outranks the stored author
        match outcome {
            EntryOutcome::Conflict(ResolutionOutcome::Applied { new_version, .. }) => {
                assert_eq!(new_version, item.version + 1);
            }
            other => panic!("expected applied resolution, got {:?}", other),
        }

        let refreshed = storage
            .with_connection(|conn| require_item(conn, item.id))
            .unwrap();
        assert_eq!(refreshed.status, ItemStatus::Synced);
        assert_eq!(refreshed.updated_by, Some(editor.id.clone()));

        let stored = queue.get_entry(entry.id).unwrap();
        assert_eq!(stored.failure, Some(FailureKind::Conflict));
    }

    #[test]
    fn test_peer_conflict_blocks_retry_until_manual_decision() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let owner = User::new("admin-a", Role::Admin);
        let peer = User::new("admin-b", Role::Admin);
        let peer_dev = storage
            .with_connection(|conn| {
                let users = UserManager::new(conn);
                users.create_user(&owner)?;
                users.create_user(&peer)?;
                match DeviceRegistry::new(conn).register_device(&peer, DeviceType::Server, "rack")? {
                    DeviceRegistration::Registered(d) => Ok(d.id),
                    DeviceRegistration::Denied(a) => panic!("unexpected denial: {:?}", a),
                }
            })
            .unwrap();
        let queue = SyncQueue::new(Arc::clone(&storage));
        let item = storage
            .with_connection(|conn| create_item(conn, &owner.id, "m", "layer"))
            .unwrap();
        let auth = AuthContext::new(Identity {
            user_id: peer.id.clone(),
            role: Role::Admin,
        });

        queue
            .enqueue(&auth, item.id, &peer_dev, None, item.version - 1)
            .unwrap();
        let claimed = queue.dequeue_next().unwrap().unwrap();

        // Hierarchical between equal roles: no silent auto-pick
        let outcome = queue.process_claimed(&claimed, &OkHandler).unwrap();
        assert!(matches!(
            outcome,
            EntryOutcome::Conflict(ResolutionOutcome::Pending { .. })
        ));
        let refreshed = storage
            .with_connection(|conn| require_item(conn, item.id))
            .unwrap();
        assert_eq!(refreshed.status, ItemStatus::Conflict);

        // Retrying is gated on the human decision
        match queue.enqueue(&auth, item.id, &peer_dev, None, item.version) {
            Err(StrataError::ResolutionPending(id)) => assert_eq!(id, item.id),
            other => panic!("expected ResolutionPending, got {:?}", other),
        }

        let outcome = queue
            .resolve_layer_conflict(&auth, item.id, ManualDecision::UseRemote)
            .unwrap();
        match outcome {
            ResolutionOutcome::Applied { new_version, .. } => {
                assert_eq!(new_version, item.version + 1);
            }
            other => panic!("expected applied, got {:?}", other),
        }

        // Unblocked: the retry enqueues cleanly now
        let refreshed = storage
            .with_connection(|conn| require_item(conn, item.id))
            .unwrap();
        assert_eq!(refreshed.status, ItemStatus::Synced);
        queue
            .enqueue(&auth, item.id, &peer_dev, None, refreshed.version)
            .unwrap();
    }

    #[test]
    fn test_resolve_layer_conflict_requires_conflict_state() {
        let f = fixture();
        let item = new_item(&f, "m1");
        assert!(matches!(
            f.queue
                .resolve_layer_conflict(&f.auth, item.id, ManualDecision::KeepLocal),
            Err(StrataError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_concurrent_dequeue_single_in_progress() {
        use std::thread;

        let f = fixture();
        let item = new_item(&f, "m1");
        for _ in 0..8 {
            f.queue
                .enqueue(&f.auth, item.id, &f.device, None, item.version)
                .unwrap();
        }

        let queue = Arc::new(f.queue);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                queue.dequeue_next().unwrap().map(|e| e.id)
            }));
        }

        let claimed: Vec<EntryId> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        // All entries reference one item, so exactly one claim wins
        assert_eq!(claimed.len(), 1);
        let in_progress = queue
            .entries_for_item(item.id)
            .unwrap()
            .into_iter()
            .filter(|e| e.status == EntryStatus::InProgress)
            .count();
        assert_eq!(in_progress, 1);
    }
}
