//! Role ladder and per-role sync profiles
//!
//! Roles form a fixed total order; each role carries a static profile
//! (permission set, device mobility class, sync priority, conflict
//! strategy). The table is built once at process start and never mutated.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::error::{Result, StrataError};
use crate::types::MobilityClass;

/// Permission types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Read access
    Read,
    /// Write/create access
    Write,
    /// Delete access
    Delete,
    /// Enqueue sync work
    Sync,
    /// Administrative access to user accounts
    ManageUsers,
}

/// Conflict-resolution strategy configured per role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Higher-priority author wins automatically, ties by newest timestamp
    Auto,
    /// Defer to an explicit human decision
    Manual,
    /// Strictly higher role wins regardless of timestamps
    Hierarchical,
}

/// The fixed role ladder, lowest to highest authority.
///
/// Declaration order is the total order; `derive(Ord)` relies on it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    User,
    Editor,
    Admin,
    SuperAdmin,
}

impl Role {
    /// All roles, ladder order
    pub const ALL: [Role; 5] = [
        Role::Viewer,
        Role::User,
        Role::Editor,
        Role::Admin,
        Role::SuperAdmin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::User => "user",
            Role::Editor => "editor",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    /// Parse a stored role string, failing with `UnknownRole`
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "user" => Ok(Role::User),
            "editor" => Ok(Role::Editor),
            "admin" => Ok(Role::Admin),
            "super_admin" => Ok(Role::SuperAdmin),
            _ => Err(StrataError::UnknownRole(s.to_string())),
        }
    }

    /// Static profile for this role
    pub fn profile(&self) -> &'static RoleProfile {
        ROLE_TABLE
            .get(self)
            .expect("role table covers every Role variant")
    }

    /// Sync priority weight (higher wins conflicts and queue ordering)
    pub fn sync_priority(&self) -> i32 {
        self.profile().sync_priority
    }

    /// Mobility class stamped onto devices registered under this role
    pub fn mobility(&self) -> MobilityClass {
        self.profile().mobility
    }

    /// Conflict strategy configured for this role
    pub fn strategy(&self) -> ConflictStrategy {
        self.profile().strategy
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        Role::parse(s)
    }
}

/// Static per-role attributes
#[derive(Debug, Clone)]
pub struct RoleProfile {
    permissions: HashSet<Permission>,
    pub mobility: MobilityClass,
    pub sync_priority: i32,
    pub strategy: ConflictStrategy,
}

impl RoleProfile {
    fn new(
        permissions: &[Permission],
        mobility: MobilityClass,
        sync_priority: i32,
        strategy: ConflictStrategy,
    ) -> Self {
        Self {
            permissions: permissions.iter().copied().collect(),
            mobility,
            sync_priority,
            strategy,
        }
    }

    /// Check if a permission is in this profile
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// All permissions as a vector
    pub fn to_vec(&self) -> Vec<Permission> {
        self.permissions.iter().copied().collect()
    }
}

static ROLE_TABLE: Lazy<HashMap<Role, RoleProfile>> = Lazy::new(|| {
    use ConflictStrategy::*;
    use Permission::*;

    let mut table = HashMap::new();
    table.insert(
        Role::Viewer,
        RoleProfile::new(&[Read], MobilityClass::Amovible, 1, Manual),
    );
    table.insert(
        Role::User,
        RoleProfile::new(&[Read, Write, Sync], MobilityClass::Amovible, 2, Auto),
    );
    table.insert(
        Role::Editor,
        RoleProfile::new(
            &[Read, Write, Delete, Sync],
            MobilityClass::SemiAmovible,
            3,
            Auto,
        ),
    );
    table.insert(
        Role::Admin,
        RoleProfile::new(
            &[Read, Write, Delete, Sync, ManageUsers],
            MobilityClass::NonAmovible,
            4,
            Hierarchical,
        ),
    );
    table.insert(
        Role::SuperAdmin,
        RoleProfile::new(
            &[Read, Write, Delete, Sync, ManageUsers],
            MobilityClass::NonAmovible,
            5,
            Hierarchical,
        ),
    );
    table
});

/// Check whether `role` carries `permission`. Pure; no side effects.
pub fn has_permission(role: Role, permission: Permission) -> bool {
    role.profile().has(permission)
}

/// Compare two roles by the ladder's total order
pub fn compare_roles(a: Role, b: Role) -> Ordering {
    a.cmp(&b)
}

/// The strictly higher of two roles. Commutative; always returns one of
/// the inputs. Equal roles return that role; ties between same-role
/// authors are broken downstream by the queue's secondary rule.
pub fn resolve_conflict_by_role(a: Role, b: Role) -> Role {
    a.max(b)
}
