//! Append-only audit log of item transitions and resolution events

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::types::ItemId;

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub item_id: ItemId,
    pub event: AuditEvent,
    pub actor: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Types of auditable item events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Enqueued,
    Started,
    Completed,
    Failed,
    ConflictDetected,
    ConflictResolved,
    Withdrawn,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Enqueued => "enqueued",
            AuditEvent::Started => "started",
            AuditEvent::Completed => "completed",
            AuditEvent::Failed => "failed",
            AuditEvent::ConflictDetected => "conflict_detected",
            AuditEvent::ConflictResolved => "conflict_resolved",
            AuditEvent::Withdrawn => "withdrawn",
        }
    }
}

impl std::str::FromStr for AuditEvent {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(AuditEvent::Enqueued),
            "started" => Ok(AuditEvent::Started),
            "completed" => Ok(AuditEvent::Completed),
            "failed" => Ok(AuditEvent::Failed),
            "conflict_detected" => Ok(AuditEvent::ConflictDetected),
            "conflict_resolved" => Ok(AuditEvent::ConflictResolved),
            "withdrawn" => Ok(AuditEvent::Withdrawn),
            _ => Err(format!("Unknown audit event: {}", s)),
        }
    }
}

/// Append an audit entry
pub fn log_audit(
    conn: &Connection,
    item_id: ItemId,
    event: AuditEvent,
    actor: Option<&str>,
    detail: Option<&serde_json::Value>,
) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    let detail_str = detail.map(|d| d.to_string());

    conn.execute(
        "INSERT INTO item_audit (item_id, event, actor, detail, timestamp)
         VALUES (?, ?, ?, ?, ?)",
        params![item_id, event.as_str(), actor, detail_str, now],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Filter for querying the audit log
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub item_id: Option<ItemId>,
    pub actor: Option<String>,
    pub event: Option<AuditEvent>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Query audit log entries, newest first
pub fn query_audit_log(conn: &Connection, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
    let mut sql = String::from(
        "SELECT id, item_id, event, actor, detail, timestamp
         FROM item_audit WHERE 1=1",
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(item_id) = filter.item_id {
        sql.push_str(" AND item_id = ?");
        params_vec.push(Box::new(item_id));
    }

    if let Some(ref actor) = filter.actor {
        sql.push_str(" AND actor = ?");
        params_vec.push(Box::new(actor.clone()));
    }

    if let Some(ref event) = filter.event {
        sql.push_str(" AND event = ?");
        params_vec.push(Box::new(event.as_str().to_string()));
    }

    if let Some(ref since) = filter.since {
        sql.push_str(" AND timestamp >= ?");
        params_vec.push(Box::new(since.to_rfc3339()));
    }

    if let Some(ref until) = filter.until {
        sql.push_str(" AND timestamp <= ?");
        params_vec.push(Box::new(until.to_rfc3339()));
    }

    sql.push_str(" ORDER BY timestamp DESC, id DESC");

    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;

    let entries: Vec<AuditEntry> = stmt
        .query_map(params_ref.as_slice(), |row| {
            let event_str: String = row.get("event")?;
            let detail_str: Option<String> = row.get("detail")?;
            let timestamp_str: String = row.get("timestamp")?;

            Ok(AuditEntry {
                id: row.get("id")?,
                item_id: row.get("item_id")?,
                event: event_str.parse().unwrap_or(AuditEvent::Completed),
                actor: row.get("actor")?,
                detail: detail_str.and_then(|s| serde_json::from_str(&s).ok()),
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(entries)
}

/// Summary of audit activity for an item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSummary {
    pub item_id: ItemId,
    pub total_events: usize,
    pub unique_actors: usize,
    pub first_event: Option<DateTime<Utc>>,
    pub last_event: Option<DateTime<Utc>>,
    pub event_counts: HashMap<String, i64>,
}

/// Get audit summary for an item
pub fn get_item_audit_summary(conn: &Connection, item_id: ItemId) -> Result<AuditSummary> {
    let filter = AuditFilter {
        item_id: Some(item_id),
        limit: Some(1000),
        ..Default::default()
    };

    let entries = query_audit_log(conn, &filter)?;

    let total_events = entries.len();
    let unique_actors: std::collections::HashSet<_> =
        entries.iter().filter_map(|e| e.actor.as_ref()).collect();
    let first_event = entries.last().map(|e| e.timestamp);
    let last_event = entries.first().map(|e| e.timestamp);

    let mut event_counts: HashMap<String, i64> = HashMap::new();
    for entry in &entries {
        *event_counts
            .entry(entry.event.as_str().to_string())
            .or_insert(0) += 1;
    }

    Ok(AuditSummary {
        item_id,
        total_events,
        unique_actors: unique_actors.len(),
        first_event,
        last_event,
        event_counts,
    })
}
