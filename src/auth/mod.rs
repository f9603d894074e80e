//! Identity and authorization
//!
//! Provides:
//! - The fixed role ladder and per-role sync profiles
//! - Authenticated request contexts with permission checks
//! - User management (the only place a role ever changes)
//!
//! Authentication itself (passwords, tokens) belongs to the external
//! request layer; the core consumes an already-verified identity record.

pub mod roles;
mod users;

pub use roles::{
    compare_roles, has_permission, resolve_conflict_by_role, ConflictStrategy, Permission, Role,
    RoleProfile,
};
pub use users::UserManager;

use crate::error::{Result, StrataError};
use crate::types::UserId;

/// An identity record verified by the external auth layer
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
}

/// Authorization context for a request
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: UserId,
    pub role: Role,
}

impl AuthContext {
    /// Create a context from a verified identity
    pub fn new(identity: Identity) -> Self {
        Self {
            user_id: identity.user_id,
            role: identity.role,
        }
    }

    /// Build a context from an optional identity, failing with
    /// `Unauthenticated` when none is present
    pub fn authenticate(identity: Option<Identity>) -> Result<Self> {
        identity.map(Self::new).ok_or(StrataError::Unauthenticated)
    }

    /// Check if the caller has a permission
    pub fn has_permission(&self, permission: Permission) -> bool {
        has_permission(self.role, permission)
    }

    /// Require a permission or return `PermissionDenied`
    pub fn require_permission(&self, permission: Permission) -> Result<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(StrataError::PermissionDenied(format!(
                "role {} lacks {:?}",
                self.role, permission
            )))
        }
    }

    /// System-level context for internal maintenance paths
    pub fn system() -> Self {
        Self {
            user_id: UserId::system(),
            role: Role::SuperAdmin,
        }
    }
}
