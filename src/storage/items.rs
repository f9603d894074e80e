//! Syncable item persistence
//!
//! Status and version mutations here are called only from the sync queue;
//! nothing else writes these columns.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StrataError};
use crate::types::{ItemId, ItemStatus, SyncableItem, UserId};

/// Create a new item at version 1
pub fn create_item(
    conn: &Connection,
    owner_id: &UserId,
    mission_id: &str,
    name: &str,
) -> Result<SyncableItem> {
    let now = Utc::now();
    conn.execute(
        r#"
        INSERT INTO items (owner_id, mission_id, name, version, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, 1, 'pending', ?4, ?4)
        "#,
        params![owner_id.as_str(), mission_id, name, now.to_rfc3339()],
    )?;

    let id = conn.last_insert_rowid();
    Ok(SyncableItem {
        id,
        owner_id: owner_id.clone(),
        mission_id: mission_id.to_string(),
        name: name.to_string(),
        version: 1,
        status: ItemStatus::Pending,
        updated_by: None,
        created_at: now,
        updated_at: now,
    })
}

/// Get an item by ID
pub fn get_item(conn: &Connection, id: ItemId) -> Result<Option<SyncableItem>> {
    conn.query_row(
        r#"
        SELECT id, owner_id, mission_id, name, version, status, updated_by, created_at, updated_at
        FROM items WHERE id = ?1
        "#,
        params![id],
        map_item_row,
    )
    .optional()
    .map_err(StrataError::from)
}

/// Get an item, failing with `UnknownItem` when absent
pub fn require_item(conn: &Connection, id: ItemId) -> Result<SyncableItem> {
    get_item(conn, id)?.ok_or(StrataError::UnknownItem(id))
}

/// Set an item's sync status
pub fn set_item_status(conn: &Connection, id: ItemId, status: ItemStatus) -> Result<()> {
    let updated = conn.execute(
        "UPDATE items SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, status.as_str(), Utc::now().to_rfc3339()],
    )?;
    if updated == 0 {
        return Err(StrataError::UnknownItem(id));
    }
    Ok(())
}

/// Accept a write: advance the version by exactly 1, record the author,
/// and mark the item Synced. The version check is done by the caller under
/// the same connection lock.
pub fn accept_write(conn: &Connection, id: ItemId, author: &UserId) -> Result<i64> {
    let updated = conn.execute(
        r#"
        UPDATE items
        SET version = version + 1, status = 'synced', updated_by = ?2, updated_at = ?3
        WHERE id = ?1
        "#,
        params![id, author.as_str(), Utc::now().to_rfc3339()],
    )?;
    if updated == 0 {
        return Err(StrataError::UnknownItem(id));
    }
    conn.query_row("SELECT version FROM items WHERE id = ?1", params![id], |r| {
        r.get(0)
    })
    .map_err(StrataError::from)
}

/// Delete an item (owner cleanup path)
pub fn delete_item(conn: &Connection, id: ItemId) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM items WHERE id = ?1", params![id])?;
    Ok(deleted > 0)
}

/// Count items in a mission
pub fn count_items_in_mission(conn: &Connection, mission_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM items WHERE mission_id = ?1",
        params![mission_id],
        |row| row.get(0),
    )
    .map_err(StrataError::from)
}

fn map_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncableItem> {
    let status_str: String = row.get(5)?;
    let updated_by: Option<String> = row.get(6)?;
    Ok(SyncableItem {
        id: row.get(0)?,
        owner_id: UserId::from_string(row.get::<_, String>(1)?),
        mission_id: row.get(2)?,
        name: row.get(3)?,
        version: row.get(4)?,
        status: status_str.parse().unwrap_or(ItemStatus::Pending),
        updated_by: updated_by.map(UserId::from_string),
        created_at: parse_ts(&row.get::<_, String>(7)?),
        updated_at: parse_ts(&row.get::<_, String>(8)?),
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
    use crate::auth::{Role, UserManager};
    use crate::storage::Storage;
    use crate::types::User;

    fn setup() -> (Storage, User) {
        let storage = Storage::open_in_memory().unwrap();
        let user = User::new("owner", Role::Editor);
        storage
            .with_connection(|conn| UserManager::new(conn).create_user(&user))
            .unwrap();
        (storage, user)
    }

    #[test]
    fn test_create_and_get() {
        let (storage, user) = setup();
        storage
            .with_connection(|conn| {
                let item = create_item(conn, &user.id, "mission-1", "layer-a")?;
                assert_eq!(item.version, 1);
                assert_eq!(item.status, ItemStatus::Pending);

                let fetched = require_item(conn, item.id)?;
                assert_eq!(fetched.mission_id, "mission-1");
                assert_eq!(fetched.owner_id, user.id);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_accept_write_bumps_version_once() {
        let (storage, user) = setup();
        storage
            .with_connection(|conn| {
                let item = create_item(conn, &user.id, "m", "layer")?;
                let v = accept_write(conn, item.id, &user.id)?;
                assert_eq!(v, 2);

                let fetched = require_item(conn, item.id)?;
                assert_eq!(fetched.version, 2);
                assert_eq!(fetched.status, ItemStatus::Synced);
                assert_eq!(fetched.updated_by, Some(user.id.clone()));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_missing_item() {
        let (storage, _) = setup();
        storage
            .with_connection(|conn| {
                assert!(get_item(conn, 999)?.is_none());
                match require_item(conn, 999) {
                    Err(StrataError::UnknownItem(999)) => Ok(()),
                    other => panic!("expected UnknownItem, got {:?}", other),
                }
            })
            .unwrap();
    }

    #[test]
    fn test_count_items_in_mission() {
        let (storage, user) = setup();
        storage
            .with_connection(|conn| {
                create_item(conn, &user.id, "m1", "a")?;
                create_item(conn, &user.id, "m1", "b")?;
                create_item(conn, &user.id, "m2", "c")?;
                assert_eq!(count_items_in_mission(conn, "m1")?, 2);
                assert_eq!(count_items_in_mission(conn, "empty")?, 0);
                Ok(())
            })
            .unwrap();
    }
}
