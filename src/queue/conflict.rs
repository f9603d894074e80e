//! Conflict resolution strategies
//!
//! A conflict is a version disagreement between what a source device last
//! saw and the item's current authoritative version. Strategy dispatch is
//! pure; the queue applies the decision under its storage lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::auth::{compare_roles, ConflictStrategy, Role};
use crate::types::ItemId;

/// Author of one side of a conflict: the role that wrote it and when
#[derive(Debug, Clone, Copy)]
pub struct VersionAuthor {
    pub role: Role,
    pub modified_at: DateTime<Utc>,
}

/// What a strategy decided about the incoming change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Apply the incoming change over the stored version
    Accept,
    /// Keep the stored version, discard the incoming change
    Reject,
    /// No automatic pick; a human decision is required
    Defer,
}

/// Explicit human decision for a deferred conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualDecision {
    /// Keep the stored authoritative version
    KeepLocal,
    /// Accept the incoming remote change
    UseRemote,
    /// Merge both sides into a new version
    Merge,
}

impl ManualDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManualDecision::KeepLocal => "keep_local",
            ManualDecision::UseRemote => "use_remote",
            ManualDecision::Merge => "merge",
        }
    }
}

impl std::str::FromStr for ManualDecision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "keep_local" => Ok(ManualDecision::KeepLocal),
            "use_remote" => Ok(ManualDecision::UseRemote),
            "merge" => Ok(ManualDecision::Merge),
            _ => Err(format!("Unknown manual decision: {}", s)),
        }
    }
}

/// Outcome of a resolution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ResolutionOutcome {
    /// The incoming change was applied; the item advanced to this version
    Applied { item_id: ItemId, new_version: i64 },
    /// The stored version was kept
    Rejected { item_id: ItemId },
    /// Awaiting a human decision. A valid suspended state, not an error.
    Pending { item_id: ItemId },
}

impl ResolutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionOutcome::Applied { .. } => "applied",
            ResolutionOutcome::Rejected { .. } => "rejected",
            ResolutionOutcome::Pending { .. } => "pending",
        }
    }
}

/// The strategy governing a conflict: the configured strategy of the
/// higher of the two roles involved (item owner vs incoming author).
pub fn effective_strategy(owner_role: Role, incoming_role: Role) -> ConflictStrategy {
    owner_role.max(incoming_role).strategy()
}

/// Dispatch a strategy over the two sides of a conflict.
///
/// Total for Auto and Hierarchical; Manual always defers, and
/// Hierarchical degrades to Manual between equal roles rather than
/// silently picking a peer.
pub fn decide(
    strategy: ConflictStrategy,
    incoming: &VersionAuthor,
    current: &VersionAuthor,
) -> Decision {
    match strategy {
        ConflictStrategy::Manual => Decision::Defer,
        ConflictStrategy::Auto => {
            match incoming
                .role
                .sync_priority()
                .cmp(&current.role.sync_priority())
            {
                Ordering::Greater => Decision::Accept,
                Ordering::Less => Decision::Reject,
                // Same priority: most recent write wins
                Ordering::Equal => {
                    if incoming.modified_at > current.modified_at {
                        Decision::Accept
                    } else {
                        Decision::Reject
                    }
                }
            }
        }
        ConflictStrategy::Hierarchical => match compare_roles(incoming.role, current.role) {
            Ordering::Greater => Decision::Accept,
            Ordering::Less => Decision::Reject,
            Ordering::Equal => Decision::Defer,
        },
    }
}
