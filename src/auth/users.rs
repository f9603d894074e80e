//! User management

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::Role;
use crate::error::{Result, StrataError};
use crate::types::{User, UserId};

/// User management operations
pub struct UserManager<'a> {
    conn: &'a Connection,
}

impl<'a> UserManager<'a> {
    /// Create a new user manager
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create a new user
    pub fn create_user(&self, user: &User) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO users (id, username, role, is_active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                user.id.as_str(),
                user.username,
                user.role.as_str(),
                user.is_active,
                user.created_at.to_rfc3339(),
                user.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get user by ID
    pub fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        self.conn
            .query_row(
                r#"
                SELECT id, username, role, is_active, created_at, updated_at
                FROM users WHERE id = ?1
                "#,
                params![id.as_str()],
                map_user_row,
            )
            .optional()
            .map_err(StrataError::from)
    }

    /// Get user by ID, failing with `UnknownUser` when absent
    pub fn require_user(&self, id: &UserId) -> Result<User> {
        self.get_user(id)?
            .ok_or_else(|| StrataError::UnknownUser(id.to_string()))
    }

    /// Change a user's role. This is the explicit administrative action;
    /// nothing in the sync core mutates roles. Devices registered under the
    /// old role are not re-validated.
    pub fn set_role(&self, id: &UserId, role: Role) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE users SET role = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.as_str(), role.as_str(), Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(StrataError::UnknownUser(id.to_string()));
        }
        tracing::info!(user = %id, role = %role, "role changed");
        Ok(())
    }

    /// Deactivate a user (kept for audit history rather than deleted)
    pub fn deactivate(&self, id: &UserId) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE users SET is_active = 0, updated_at = ?2 WHERE id = ?1",
            params![id.as_str(), Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(StrataError::UnknownUser(id.to_string()));
        }
        Ok(())
    }

    /// List all users
    pub fn list_users(&self, include_inactive: bool) -> Result<Vec<User>> {
        let sql = if include_inactive {
            "SELECT id, username, role, is_active, created_at, updated_at
             FROM users ORDER BY created_at DESC"
        } else {
            "SELECT id, username, role, is_active, created_at, updated_at
             FROM users WHERE is_active = 1 ORDER BY created_at DESC"
        };

        let mut stmt = self.conn.prepare(sql)?;
        let users = stmt
            .query_map([], map_user_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }
}

fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let role_str: String = row.get(2)?;
    Ok(User {
        id: UserId::from_string(row.get::<_, String>(0)?),
        username: row.get(1)?,
        role: Role::parse(&role_str).unwrap_or(Role::Viewer),
        is_active: row.get(3)?,
        created_at: parse_ts(&row.get::<_, String>(4)?),
        updated_at: parse_ts(&row.get::<_, String>(5)?),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
