//! # Offline Actions
//!
//! Entity operations captured while the client works offline, plus the
//! conflict records produced when the server disagrees with them.
//!
//! ## Action Lifecycle
//! ```text
//!                 add_action()
//!                      │
//!                      ▼
//!   ┌──────────┐  eligible  ┌──────────┐   ack    ┌───────────┐
//!   │ Pending  │──────────►│ Syncing  │────────►│ Completed │
//!   └──────────┘           └────┬─────┘         └───────────┘
//!        ▲                      │
//!        │ retry_count <        │ error
//!        │ max_retries          ▼
//!        └──────────────── ┌──────────┐
//!                          │ Failed   │ (budget spent, rejected,
//!                          └──────────┘  or dependency failed)
//!
//!   Pending ──cancel()──► Cancelled
//! ```

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::error::CoreError;
use crate::{DEFAULT_ACTION_PRIORITY, DEFAULT_MAX_RETRIES};

/// Queue-assigned identifier. Monotonic and never reused within a store.
pub type ActionId = u64;

// =============================================================================
// Verb & Status
// =============================================================================

/// What the action does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ActionVerb {
    Create,
    Update,
    Delete,
    /// Pull the server copy into the local snapshot cache.
    Sync,
}

impl ActionVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionVerb::Create => "create",
            ActionVerb::Update => "update",
            ActionVerb::Delete => "delete",
            ActionVerb::Sync => "sync",
        }
    }
}

impl std::fmt::Display for ActionVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionVerb {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ActionVerb::Create),
            "update" => Ok(ActionVerb::Update),
            "delete" => Ok(ActionVerb::Delete),
            "sync" => Ok(ActionVerb::Sync),
            other => Err(CoreError::UnknownVerb(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ActionStatus {
    #[default]
    Pending,
    Syncing,
    Completed,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Syncing => "syncing",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled actions never change again.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Cancelled
        )
    }

    /// Pending or syncing.
    pub fn is_open(&self) -> bool {
        matches!(self, ActionStatus::Pending | ActionStatus::Syncing)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "syncing" => Ok(ActionStatus::Syncing),
            "completed" => Ok(ActionStatus::Completed),
            "failed" => Ok(ActionStatus::Failed),
            "cancelled" => Ok(ActionStatus::Cancelled),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

// =============================================================================
// Conflict Resolution
// =============================================================================

/// How a version conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ResolutionStrategy {
    /// Drop the local change and keep the server copy.
    ServerWins,
    /// Re-send the local change against the server's version.
    ClientWins,
    /// Shallow-merge the local payload over the server payload and re-send.
    Merge,
    /// Hold the action until someone decides.
    #[default]
    Manual,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolutionStrategy::ServerWins => "server_wins",
            ResolutionStrategy::ClientWins => "client_wins",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Manual => "manual",
        };
        f.write_str(s)
    }
}

impl FromStr for ResolutionStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server_wins" => Ok(ResolutionStrategy::ServerWins),
            "client_wins" => Ok(ResolutionStrategy::ClientWins),
            "merge" => Ok(ResolutionStrategy::Merge),
            "manual" => Ok(ResolutionStrategy::Manual),
            other => Err(CoreError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Server and client copies of an entity that disagreed on version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConflictRecord {
    #[ts(type = "number")]
    pub action_id: ActionId,
    pub entity_type: String,
    pub entity_id: String,

    #[ts(type = "number")]
    pub server_version: u64,
    pub server_payload: Value,

    #[ts(type = "number | null")]
    pub client_version: Option<u64>,
    pub client_payload: Value,

    /// Strategy configured when the conflict was detected.
    pub strategy: ResolutionStrategy,

    /// Strategy actually applied. `None` while unresolved.
    pub resolution: Option<ResolutionStrategy>,

    /// Who decided: `auto` for configured strategies, otherwise the name
    /// passed to `resolve_conflict`.
    pub resolver: Option<String>,

    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Shallow merge: every top-level key of `client` overrides `server`.
///
/// Non-object inputs fall back to the client value.
pub fn merge_payloads(server: &Value, client: &Value) -> Value {
    match (server, client) {
        (Value::Object(server_obj), Value::Object(client_obj)) => {
            let mut merged = server_obj.clone();
            for (key, value) in client_obj {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => client.clone(),
    }
}

// =============================================================================
// Actions
// =============================================================================

/// Input to `add_action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAction {
    pub verb: ActionVerb,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub payload: Value,
    /// Server version the change was made against.
    #[serde(default)]
    pub base_version: Option<u64>,
    /// 0..=10, higher is more urgent. `None` takes the queue default.
    #[serde(default)]
    pub priority: Option<u8>,
    /// `None` takes the queue default.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Explicit prerequisites in addition to the automatic same-entity link.
    #[serde(default)]
    pub depends_on: Vec<ActionId>,
}

impl NewAction {
    pub fn new(
        verb: ActionVerb,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        NewAction {
            verb,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            base_version: None,
            priority: None,
            max_retries: None,
            depends_on: Vec::new(),
        }
    }

    pub fn create(entity_type: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
        Self::new(ActionVerb::Create, entity_type, entity_id, payload)
    }

    pub fn update(entity_type: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
        Self::new(ActionVerb::Update, entity_type, entity_id, payload)
    }

    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(ActionVerb::Delete, entity_type, entity_id, Value::Null)
    }

    pub fn sync(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(ActionVerb::Sync, entity_type, entity_id, Value::Null)
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    pub fn depends_on(mut self, id: ActionId) -> Self {
        self.depends_on.push(id);
        self
    }
}

/// A durable entry of the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct QueuedAction {
    #[ts(type = "number")]
    pub id: ActionId,
    pub verb: ActionVerb,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    #[ts(type = "number | null")]
    pub base_version: Option<u64>,
    pub status: ActionStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: u8,
    #[ts(type = "Array<number>")]
    pub dependencies: Vec<ActionId>,
    pub last_error: Option<String>,
    /// Version acknowledged by the server once completed.
    #[ts(type = "number | null")]
    pub server_version: Option<u64>,
    pub conflict: Option<ConflictRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedAction {
    /// Materializes a new pending action with the crate-wide defaults.
    pub fn from_new(id: ActionId, new: NewAction, now: DateTime<Utc>) -> Self {
        Self::from_new_with_defaults(id, new, now, DEFAULT_ACTION_PRIORITY, DEFAULT_MAX_RETRIES)
    }

    /// Materializes a new pending action, filling unset fields from the
    /// given defaults.
    pub fn from_new_with_defaults(
        id: ActionId,
        new: NewAction,
        now: DateTime<Utc>,
        default_priority: u8,
        default_max_retries: u32,
    ) -> Self {
        QueuedAction {
            id,
            verb: new.verb,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            payload: new.payload,
            base_version: new.base_version,
            status: ActionStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            priority: new.priority.unwrap_or(default_priority),
            dependencies: new.depends_on,
            last_error: None,
            server_version: None,
            conflict: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when a conflict is waiting for a manual decision.
    pub fn has_open_conflict(&self) -> bool {
        self.conflict.as_ref().is_some_and(|c| !c.is_resolved())
    }

    pub fn same_entity(&self, entity_type: &str, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }

    pub fn set_status(&mut self, status: ActionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

/// Sync order: higher priority first, then oldest, then lowest id.
pub fn queue_order(a: &QueuedAction, b: &QueuedAction) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Cached server copy of an entity, written when the server wins a
/// conflict or a sync action pulls fresh state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct EntitySnapshot {
    pub entity_type: String,
    pub entity_id: String,
    #[ts(type = "number | null")]
    pub version: Option<u64>,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Queries
// =============================================================================

/// Criteria for `get_actions`. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionFilter {
    pub status: Option<ActionStatus>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub verb: Option<ActionVerb>,
}

impl ActionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: ActionStatus) -> Self {
        ActionFilter {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn for_entity(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        ActionFilter {
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, action: &QueuedAction) -> bool {
        self.status.map_or(true, |s| action.status == s)
            && self.verb.map_or(true, |v| action.verb == v)
            && self
                .entity_type
                .as_deref()
                .map_or(true, |t| action.entity_type == t)
            && self
                .entity_id
                .as_deref()
                .map_or(true, |id| action.entity_id == id)
    }
}

/// Queue counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct QueueStats {
    pub pending: usize,
    pub syncing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Actions holding an unresolved conflict.
    pub conflicts: usize,
}

impl QueueStats {
    pub fn from_actions<'a>(actions: impl IntoIterator<Item = &'a QueuedAction>) -> Self {
        let mut stats = QueueStats::default();
        for action in actions {
            match action.status {
                ActionStatus::Pending => stats.pending += 1,
                ActionStatus::Syncing => stats.syncing += 1,
                ActionStatus::Completed => stats.completed += 1,
                ActionStatus::Failed => stats.failed += 1,
                ActionStatus::Cancelled => stats.cancelled += 1,
            }
            if action.has_open_conflict() {
                stats.conflicts += 1;
            }
        }
        stats
    }

    pub fn total(&self) -> usize {
        self.pending + self.syncing + self.completed + self.failed + self.cancelled
    }
}
