//! Device registry and admission rules
//!
//! Admission is a fixed policy table evaluated in order: device-type gating
//! first, then the per-role quota. Rejections are structured results, not
//! errors. Checks apply at registration time only.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::error::{Result, StrataError};
use crate::types::{Device, DeviceId, DeviceStatus, DeviceType, MobilityClass, User, UserId};

/// Minimum role allowed to register a Server-type device
pub const SERVER_MIN_ROLE: Role = Role::Admin;

/// Maximum device count per role
pub fn device_quota(role: Role) -> u32 {
    match role {
        Role::Viewer => 1,
        Role::User => 3,
        Role::Editor => 5,
        // Large fixed cap rather than unbounded, so the check stays total
        Role::Admin | Role::SuperAdmin => 64,
    }
}

/// Structured admission decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Admission {
    fn granted() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Decide whether a device of `device_type` may be added for `role` given
/// the user's `current_count` of registered devices.
///
/// Type gating runs before quota gating so the reason reflects the first
/// violated rule when both would fail.
pub fn can_add_device(device_type: DeviceType, role: Role, current_count: u32) -> Admission {
    if device_type == DeviceType::Server && role < SERVER_MIN_ROLE {
        return Admission::denied(format!(
            "device type {} not authorized for role {}",
            device_type.as_str(),
            role
        ));
    }

    let quota = device_quota(role);
    if current_count >= quota {
        return Admission::denied(format!("device limit reached ({} of {})", current_count, quota));
    }

    Admission::granted()
}

/// Outcome of a registration attempt
#[derive(Debug, Clone)]
pub enum DeviceRegistration {
    Registered(Device),
    Denied(Admission),
}

/// Device registry operations
pub struct DeviceRegistry<'a> {
    conn: &'a Connection,
}

impl<'a> DeviceRegistry<'a> {
    /// Create a new registry over a connection
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Register a device for a user, applying the admission rules. The
    /// mobility class is stamped from the owner's role profile.
    pub fn register_device(
        &self,
        user: &User,
        device_type: DeviceType,
        name: &str,
    ) -> Result<DeviceRegistration> {
        let current = self.count_devices(&user.id)?;
        let admission = can_add_device(device_type, user.role, current);
        if !admission.allowed {
            tracing::debug!(
                user = %user.id,
                device_type = device_type.as_str(),
                reason = admission.reason.as_deref().unwrap_or(""),
                "device registration denied"
            );
            return Ok(DeviceRegistration::Denied(admission));
        }

        let device = Device {
            id: DeviceId::new(),
            user_id: user.id.clone(),
            device_type,
            name: name.to_string(),
            status: DeviceStatus::Offline,
            mobility: user.role.mobility(),
            last_seen_at: None,
            created_at: Utc::now(),
        };

        self.conn.execute(
            r#"
            INSERT INTO devices (id, user_id, device_type, name, status, mobility, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                device.id.as_str(),
                device.user_id.as_str(),
                device.device_type.as_str(),
                device.name,
                device.status.as_str(),
                device.mobility.as_str(),
                device.created_at.to_rfc3339(),
            ],
        )?;

        tracing::info!(device = %device.id, user = %user.id, "device registered");
        Ok(DeviceRegistration::Registered(device))
    }

    /// Number of devices registered for a user
    pub fn count_devices(&self, user_id: &UserId) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM devices WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u32)
            .map_err(StrataError::from)
    }

    /// Get a device by ID
    pub fn get_device(&self, id: &DeviceId) -> Result<Option<Device>> {
        self.conn
            .query_row(
                r#"
                SELECT id, user_id, device_type, name, status, mobility, last_seen_at, created_at
                FROM devices WHERE id = ?1
                "#,
                params![id.as_str()],
                map_device_row,
            )
            .optional()
            .map_err(StrataError::from)
    }

    /// Get a device, failing with `UnknownDevice` when absent
    pub fn require_device(&self, id: &DeviceId) -> Result<Device> {
        self.get_device(id)?
            .ok_or_else(|| StrataError::UnknownDevice(id.to_string()))
    }

    /// List devices belonging to a user
    pub fn list_devices(&self, user_id: &UserId) -> Result<Vec<Device>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, device_type, name, status, mobility, last_seen_at, created_at
            FROM devices WHERE user_id = ?1 ORDER BY created_at ASC
            "#,
        )?;
        let devices = stmt
            .query_map(params![user_id.as_str()], map_device_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    /// Mark a device online and refresh its last-seen timestamp
    pub fn mark_online(&self, id: &DeviceId) -> Result<()> {
        self.set_status(id, DeviceStatus::Online)
    }

    /// Mark a device offline
    pub fn mark_offline(&self, id: &DeviceId) -> Result<()> {
        self.set_status(id, DeviceStatus::Offline)
    }

    fn set_status(&self, id: &DeviceId, status: DeviceStatus) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE devices SET status = ?2, last_seen_at = ?3 WHERE id = ?1",
            params![id.as_str(), status.as_str(), Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(StrataError::UnknownDevice(id.to_string()));
        }
        Ok(())
    }

    /// Refresh a device's last-seen timestamp
    pub fn touch(&self, id: &DeviceId) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE devices SET last_seen_at = ?2 WHERE id = ?1",
            params![id.as_str(), Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(StrataError::UnknownDevice(id.to_string()));
        }
        Ok(())
    }

    /// Preferred authoritative merge target among a user's devices:
    /// least-mobile first, ties broken by most recently seen.
    pub fn preferred_merge_target(&self, user_id: &UserId) -> Result<Option<Device>> {
        let mut devices = self.list_devices(user_id)?;
        devices.sort_by(|a, b| {
            a.mobility
                .cmp(&b.mobility)
                .then(b.last_seen_at.cmp(&a.last_seen_at))
        });
        Ok(devices.into_iter().next())
    }
}

fn map_device_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    let type_str: String = row.get(2)?;
    let status_str: String = row.get(4)?;
    let mobility_str: String = row.get(5)?;
    let last_seen: Option<String> = row.get(6)?;
    Ok(Device {
        id: DeviceId::from_string(row.get::<_, String>(0)?),
        user_id: UserId::from_string(row.get::<_, String>(1)?),
        device_type: type_str.parse().unwrap_or(DeviceType::Desktop),
        name: row.get(3)?,
        status: status_str.parse().unwrap_or(DeviceStatus::Offline),
        mobility: mobility_str.parse().unwrap_or(MobilityClass::Amovible),
        last_seen_at: last_seen.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }),
        created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(7)?)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
