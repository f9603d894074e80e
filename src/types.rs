//! Core types for Strata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a syncable item (file/layer)
pub type ItemId = i64;

/// Unique identifier for a sync queue entry
pub type EntryId = i64;

/// Mission identifier (a grouping of items, e.g. a project or dataset)
pub type MissionId = String;

/// User identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a new random user ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// System user ID
    pub fn system() -> Self {
        Self("system".to_string())
    }

    /// Get the string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new random device ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device hardware class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Mobile,
    Desktop,
    Server,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mobile => "mobile",
            DeviceType::Desktop => "desktop",
            DeviceType::Server => "server",
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mobile" => Ok(DeviceType::Mobile),
            "desktop" => Ok(DeviceType::Desktop),
            "server" => Ok(DeviceType::Server),
            _ => Err(format!("Unknown device type: {}", s)),
        }
    }
}

/// Physical permanence class of a device, stamped at registration from the
/// owner's role profile. Informational only: it never gates admission, but
/// the queue prefers less-mobile devices as authoritative merge targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MobilityClass {
    /// Fixed, server-grade hardware
    NonAmovible,
    /// Workstation-class, rarely moved
    SemiAmovible,
    /// Removable/mobile hardware
    Amovible,
}

impl MobilityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MobilityClass::NonAmovible => "non_amovible",
            MobilityClass::SemiAmovible => "semi_amovible",
            MobilityClass::Amovible => "amovible",
        }
    }
}

impl std::str::FromStr for MobilityClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "non_amovible" => Ok(MobilityClass::NonAmovible),
            "semi_amovible" => Ok(MobilityClass::SemiAmovible),
            "amovible" => Ok(MobilityClass::Amovible),
            _ => Err(format!("Unknown mobility class: {}", s)),
        }
    }
}

/// Online/offline presence of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            _ => Err(format!("Unknown device status: {}", s)),
        }
    }
}

/// Sync status of an item. Transitions happen only through the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Syncing,
    Synced,
    Conflict,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Syncing => "syncing",
            ItemStatus::Synced => "synced",
            ItemStatus::Conflict => "conflict",
            ItemStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "syncing" => Ok(ItemStatus::Syncing),
            "synced" => Ok(ItemStatus::Synced),
            "conflict" => Ok(ItemStatus::Conflict),
            "error" => Ok(ItemStatus::Error),
            _ => Err(format!("Unknown item status: {}", s)),
        }
    }
}

/// Lifecycle state of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::InProgress => "in_progress",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        }
    }

    /// Completed or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Completed | EntryStatus::Failed)
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "in_progress" => Ok(EntryStatus::InProgress),
            "completed" => Ok(EntryStatus::Completed),
            "failed" => Ok(EntryStatus::Failed),
            _ => Err(format!("Unknown entry status: {}", s)),
        }
    }
}

/// Why a queue entry failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Version mismatch; the item moved to Conflict, not Error
    Conflict,
    /// Referenced item disappeared between enqueue and processing
    NotFound,
    /// The transport layer reported a failure
    Transport,
    /// Anything else
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Conflict => "conflict",
            FailureKind::NotFound => "not_found",
            FailureKind::Transport => "transport",
            FailureKind::Internal => "internal",
        }
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "conflict" => Ok(FailureKind::Conflict),
            "not_found" => Ok(FailureKind::NotFound),
            "transport" => Ok(FailureKind::Transport),
            "internal" => Ok(FailureKind::Internal),
            _ => Err(format!("Unknown failure kind: {}", s)),
        }
    }
}

/// Terminal, value-adding action recorded by a completion event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionAction {
    Validated,
    Merged,
    Enriched,
    Modified,
}

impl CompletionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionAction::Validated => "validated",
            CompletionAction::Merged => "merged",
            CompletionAction::Enriched => "enriched",
            CompletionAction::Modified => "modified",
        }
    }
}

impl std::str::FromStr for CompletionAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "validated" => Ok(CompletionAction::Validated),
            "merged" => Ok(CompletionAction::Merged),
            "enriched" => Ok(CompletionAction::Enriched),
            "modified" => Ok(CompletionAction::Modified),
            _ => Err(format!("Unknown completion action: {}", s)),
        }
    }
}

/// User record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub role: crate::auth::Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a new user with the given role
    pub fn new(username: impl Into<String>, role: crate::auth::Role) -> Self {
        let now = Utc::now();
        Self {
            id: UserId::new(),
            username: username.into(),
            role,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A registered device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub user_id: UserId,
    pub device_type: DeviceType,
    pub name: String,
    pub status: DeviceStatus,
    pub mobility: MobilityClass,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A syncable file/layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncableItem {
    pub id: ItemId,
    pub owner_id: UserId,
    pub mission_id: MissionId,
    pub name: String,
    /// Monotonic; strictly increases on every accepted write
    pub version: i64,
    pub status: ItemStatus,
    /// Author of the current authoritative version
    pub updated_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of sync work. Holds non-owning references by id; the referenced
/// item may disappear before processing (handled as a NotFound failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub id: EntryId,
    pub item_id: ItemId,
    pub source_device_id: DeviceId,
    pub target_device_id: Option<DeviceId>,
    /// Item version the source device last saw (optimistic-concurrency token)
    pub source_version: i64,
    pub status: EntryStatus,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Immutable record of a terminal, value-adding action on an item.
/// Write-once; consumed only for aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub item_id: ItemId,
    pub mission_id: MissionId,
    pub user_id: UserId,
    pub action: CompletionAction,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CompletionEvent {
    /// Create an event stamped now
    pub fn new(
        item_id: ItemId,
        mission_id: impl Into<MissionId>,
        user_id: UserId,
        action: CompletionAction,
    ) -> Self {
        Self {
            item_id,
            mission_id: mission_id.into(),
            user_id,
            action,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata key
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database path, or ":memory:" for tests
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_status_roundtrip() {
        for status in [
            EntryStatus::Pending,
            EntryStatus::InProgress,
            EntryStatus::Completed,
            EntryStatus::Failed,
        ] {
            let s = status.as_str();
            let parsed: EntryStatus = s.parse().unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_item_status_roundtrip() {
        for status in [
            ItemStatus::Pending,
            ItemStatus::Syncing,
            ItemStatus::Synced,
            ItemStatus::Conflict,
            ItemStatus::Error,
        ] {
            let parsed: ItemStatus = status.as_str().parse().unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(EntryStatus::Completed.is_terminal());
        assert!(EntryStatus::Failed.is_terminal());
        assert!(!EntryStatus::Pending.is_terminal());
        assert!(!EntryStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_unknown_strings_fail() {
        assert!("teleporting".parse::<DeviceType>().is_err());
        assert!("gone".parse::<ItemStatus>().is_err());
        assert!("oops".parse::<CompletionAction>().is_err());
    }

    #[test]
    fn test_mobility_order() {
        // NonAmovible sorts first: least mobile is the preferred merge target
        assert!(MobilityClass::NonAmovible < MobilityClass::SemiAmovible);
        assert!(MobilityClass::SemiAmovible < MobilityClass::Amovible);
    }

    #[test]
    fn test_completion_event_metadata() {
        let event = CompletionEvent::new(1, "m1", UserId::system(), CompletionAction::Merged)
            .with_metadata("entry_id", serde_json::json!(42));
        assert_eq!(event.metadata.get("entry_id"), Some(&serde_json::json!(42)));
    }
}
