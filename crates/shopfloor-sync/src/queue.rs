//! # Offline Action Queue
//!
//! Durable list of entity operations captured while the client may be
//! offline, replayed by the reconciler once the channel is back.
//!
//! ## Dependency Chains
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Same-Entity Ordering                                │
//! │                                                                         │
//! │  add create(part/p-1)  ──► #1  deps []                                 │
//! │  add update(part/p-1)  ──► #2  deps [1]      ◄── latest open action    │
//! │  add delete(part/p-1)  ──► #3  deps [2]          for the same entity   │
//! │  add update(part/p-9)  ──► #4  deps []                                 │
//! │                                                                         │
//! │  cancel(#2)            ──► #3  deps [1]      (relinked)                │
//! │                                                                         │
//! │  #1 failed             ──► #3 failed "dependency 1 failed"             │
//! │                            (transitively, nothing is stranded)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Durability
//! Every mutation works on a copy, persists it through the [`ActionStore`]
//! while the queue lock is held, and only then replaces the in-memory entry.
//! A failed write leaves both copies unchanged.

use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use shopfloor_core::validation::validate_new_action;
use shopfloor_core::{
    queue_order, ActionFilter, ActionId, ActionStatus, ConflictRecord, NewAction, QueueStats,
    QueuedAction,
};

use crate::config::QueueSettings;
use crate::error::{SyncError, SyncResult};
use crate::store::ActionStore;

struct QueueState {
    actions: BTreeMap<ActionId, QueuedAction>,
    next_id: ActionId,
}

impl QueueState {
    fn dependency_satisfied(&self, dep: ActionId) -> bool {
        // purged actions were finished; failed and cancelled ones never are
        self.actions
            .get(&dep)
            .map_or(true, |a| a.status == ActionStatus::Completed)
    }

    fn is_eligible(&self, action: &QueuedAction) -> bool {
        action.status == ActionStatus::Pending
            && !action.has_open_conflict()
            && action
                .dependencies
                .iter()
                .all(|dep| self.dependency_satisfied(*dep))
    }

    /// Latest pending or syncing action on the same entity.
    fn latest_open_for(&self, entity_type: &str, entity_id: &str) -> Option<ActionId> {
        self.actions
            .values()
            .rev()
            .find(|a| a.status.is_open() && a.same_entity(entity_type, entity_id))
            .map(|a| a.id)
    }

    fn require(&self, id: ActionId) -> SyncResult<&QueuedAction> {
        self.actions.get(&id).ok_or(SyncError::ActionNotFound(id))
    }
}

/// Shared handle to the queue. Clones see the same queue.
#[derive(Clone)]
pub struct OfflineActionQueue {
    state: Arc<Mutex<QueueState>>,
    store: Arc<dyn ActionStore>,
    settings: QueueSettings,
}

impl std::fmt::Debug for OfflineActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineActionQueue")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl OfflineActionQueue {
    /// Loads the queue from the store.
    ///
    /// Actions left in `syncing` by a crash go back to `pending`; replay
    /// is expected to be idempotent on the server side.
    pub async fn load(store: Arc<dyn ActionStore>, settings: QueueSettings) -> SyncResult<Self> {
        let stored = store.load_actions().await?;
        let high_water = store.high_water_mark().await?.unwrap_or(0);

        let now = Utc::now();
        let mut reverted = Vec::new();
        let mut actions = BTreeMap::new();
        for mut action in stored {
            if action.status == ActionStatus::Syncing {
                action.set_status(ActionStatus::Pending, now);
                reverted.push(action.clone());
            }
            actions.insert(action.id, action);
        }

        if !reverted.is_empty() {
            warn!(count = reverted.len(), "Reverting interrupted actions to pending");
            store.save_actions(&reverted).await?;
        }

        let max_loaded = actions.keys().next_back().copied().unwrap_or(0);
        let next_id = high_water.max(max_loaded) + 1;

        info!(actions = actions.len(), next_id, "Offline action queue loaded");

        Ok(OfflineActionQueue {
            state: Arc::new(Mutex::new(QueueState { actions, next_id })),
            store,
            settings,
        })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub(crate) fn store(&self) -> &Arc<dyn ActionStore> {
        &self.store
    }

    async fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().await
    }

    // =========================================================================
    // Public Operations
    // =========================================================================

    /// Validates, stores and returns a new pending action.
    pub async fn add_action(&self, new: NewAction) -> SyncResult<QueuedAction> {
        validate_new_action(&new)?;

        let mut state = self.lock().await;

        let mut dependencies: Vec<ActionId> = Vec::new();
        for dep in &new.depends_on {
            if *dep >= state.next_id {
                return Err(SyncError::ActionNotFound(*dep));
            }
            match state.actions.get(dep) {
                Some(existing) if existing.status == ActionStatus::Failed => {
                    return Err(SyncError::InvalidActionState {
                        id: *dep,
                        status: ActionStatus::Failed,
                        expected: ActionStatus::Pending,
                    });
                }
                // a cancelled prerequisite stands in for its own prerequisites
                Some(existing) if existing.status == ActionStatus::Cancelled => {
                    dependencies.extend(existing.dependencies.iter().copied());
                }
                _ => dependencies.push(*dep),
            }
        }
        if let Some(latest) = state.latest_open_for(&new.entity_type, &new.entity_id) {
            dependencies.push(latest);
        }
        dependencies.sort_unstable();
        dependencies.dedup();

        let id = state.next_id;
        let mut action = QueuedAction::from_new_with_defaults(
            id,
            new,
            Utc::now(),
            self.settings.default_priority,
            self.settings.default_max_retries,
        );
        action.dependencies = dependencies;

        self.store.save_action(&action).await?;
        state.next_id = id + 1;
        state.actions.insert(id, action.clone());

        info!(
            action_id = id,
            verb = %action.verb,
            entity_type = %action.entity_type,
            entity_id = %action.entity_id,
            dependencies = ?action.dependencies,
            "Action queued"
        );
        Ok(action)
    }

    pub async fn get(&self, id: ActionId) -> Option<QueuedAction> {
        self.lock().await.actions.get(&id).cloned()
    }

    /// Matching actions in sync order: priority desc, created asc, id asc.
    pub async fn get_actions(&self, filter: &ActionFilter) -> Vec<QueuedAction> {
        let state = self.lock().await;
        let mut actions: Vec<QueuedAction> = state
            .actions
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        actions.sort_by(queue_order);
        actions
    }

    pub async fn stats(&self) -> QueueStats {
        QueueStats::from_actions(self.lock().await.actions.values())
    }

    /// Conflict records in detection order, resolved ones included.
    pub async fn conflicts(&self) -> Vec<ConflictRecord> {
        let state = self.lock().await;
        let mut records: Vec<ConflictRecord> = state
            .actions
            .values()
            .filter_map(|a| a.conflict.clone())
            .collect();
        records.sort_by_key(|c| (c.detected_at, c.action_id));
        records
    }

    /// Cancels a pending action.
    ///
    /// Returns `Ok(false)` when it was already cancelled. Dependents take
    /// over the cancelled action's own dependencies.
    pub async fn cancel(&self, id: ActionId) -> SyncResult<bool> {
        let mut state = self.lock().await;
        let status = state.require(id)?.status;
        match status {
            ActionStatus::Cancelled => return Ok(false),
            ActionStatus::Pending => {}
            other => {
                return Err(SyncError::InvalidActionState {
                    id,
                    status: other,
                    expected: ActionStatus::Pending,
                })
            }
        }

        self.cancel_locked(&mut state, id, |_| {}).await?;
        info!(action_id = id, "Action cancelled");
        Ok(true)
    }

    /// Removes completed and cancelled actions.
    pub async fn purge_finished(&self) -> SyncResult<usize> {
        self.remove_where(|a| {
            matches!(a.status, ActionStatus::Completed | ActionStatus::Cancelled)
        })
        .await
    }

    /// Removes completed and cancelled actions not touched within `retention`.
    pub async fn cleanup(&self, retention: Duration) -> SyncResult<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| SyncError::InvalidConfig(format!("retention out of range: {}", e)))?;
        let cutoff = Utc::now() - retention;
        self.remove_where(|a| {
            matches!(a.status, ActionStatus::Completed | ActionStatus::Cancelled)
                && a.updated_at < cutoff
        })
        .await
    }

    /// Removes failed actions. Nothing else does.
    pub async fn clear_failed(&self) -> SyncResult<usize> {
        self.remove_where(|a| a.status == ActionStatus::Failed).await
    }

    async fn remove_where(&self, predicate: impl Fn(&QueuedAction) -> bool) -> SyncResult<usize> {
        let mut state = self.lock().await;
        let ids: Vec<ActionId> = state
            .actions
            .values()
            .filter(|a| predicate(a))
            .map(|a| a.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        self.store.delete_actions(&ids).await?;
        for id in &ids {
            state.actions.remove(id);
        }

        debug!(removed = ids.len(), "Removed actions from queue");
        Ok(ids.len())
    }

    // =========================================================================
    // Reconciler Support
    // =========================================================================

    /// Next action ready to sync, in queue order, skipping `exclude`.
    pub(crate) async fn next_eligible(&self, exclude: &HashSet<ActionId>) -> Option<QueuedAction> {
        let state = self.lock().await;
        state
            .actions
            .values()
            .filter(|a| !exclude.contains(&a.id) && state.is_eligible(a))
            .min_by(|a, b| queue_order(a, b))
            .cloned()
    }

    /// Pending actions that cannot run: waiting on a dependency or a
    /// conflict decision.
    pub(crate) async fn blocked_count(&self) -> usize {
        let state = self.lock().await;
        state
            .actions
            .values()
            .filter(|a| a.status == ActionStatus::Pending && !state.is_eligible(a))
            .count()
    }

    /// True when at least one pending action is free of open conflicts.
    pub async fn has_pending_work(&self) -> bool {
        let state = self.lock().await;
        state
            .actions
            .values()
            .any(|a| a.status == ActionStatus::Pending && !a.has_open_conflict())
    }

    /// Moves an eligible pending action to `syncing`.
    pub(crate) async fn begin_sync(&self, id: ActionId) -> SyncResult<QueuedAction> {
        let mut state = self.lock().await;
        let action = state.require(id)?;
        if !state.is_eligible(action) {
            return Err(SyncError::InvalidActionState {
                id,
                status: action.status,
                expected: ActionStatus::Pending,
            });
        }

        let mut updated = action.clone();
        updated.set_status(ActionStatus::Syncing, Utc::now());
        self.store.save_action(&updated).await?;
        state.actions.insert(id, updated.clone());
        Ok(updated)
    }

    /// Applies `change` to a copy of the action, persists it, then commits.
    pub(crate) async fn update_with(
        &self,
        id: ActionId,
        change: impl FnOnce(&mut QueuedAction),
    ) -> SyncResult<QueuedAction> {
        let mut state = self.lock().await;
        let mut updated = state.require(id)?.clone();
        change(&mut updated);
        updated.updated_at = Utc::now();

        self.store.save_action(&updated).await?;
        state.actions.insert(id, updated.clone());
        Ok(updated)
    }

    /// Cancels an action from any open status, after applying `change`.
    pub(crate) async fn cancel_with(
        &self,
        id: ActionId,
        change: impl FnOnce(&mut QueuedAction),
    ) -> SyncResult<QueuedAction> {
        let mut state = self.lock().await;
        self.cancel_locked(&mut state, id, change).await
    }

    async fn cancel_locked(
        &self,
        state: &mut QueueState,
        id: ActionId,
        change: impl FnOnce(&mut QueuedAction),
    ) -> SyncResult<QueuedAction> {
        let now = Utc::now();
        let mut cancelled = state.require(id)?.clone();
        change(&mut cancelled);
        cancelled.set_status(ActionStatus::Cancelled, now);

        let mut changed = vec![cancelled.clone()];
        for dependent in state
            .actions
            .values()
            .filter(|a| a.status.is_open() && a.dependencies.contains(&id))
        {
            let mut relinked = dependent.clone();
            relinked.dependencies.retain(|d| *d != id);
            relinked
                .dependencies
                .extend(cancelled.dependencies.iter().copied());
            relinked.dependencies.sort_unstable();
            relinked.dependencies.dedup();
            relinked.updated_at = now;
            debug!(
                action_id = relinked.id,
                dependencies = ?relinked.dependencies,
                "Relinked dependent of cancelled action"
            );
            changed.push(relinked);
        }

        self.store.save_actions(&changed).await?;
        for action in changed {
            state.actions.insert(action.id, action);
        }
        Ok(cancelled)
    }

    /// Fails every pending action that depends, directly or transitively,
    /// on `failed_id`. Returns the actions that changed.
    pub(crate) async fn fail_dependents(&self, failed_id: ActionId) -> SyncResult<Vec<QueuedAction>> {
        let mut state = self.lock().await;
        let now = Utc::now();

        let mut failed: HashSet<ActionId> = HashSet::from([failed_id]);
        let mut changed: Vec<QueuedAction> = Vec::new();
        loop {
            let newly: Vec<QueuedAction> = state
                .actions
                .values()
                .filter(|a| {
                    a.status == ActionStatus::Pending
                        && !failed.contains(&a.id)
                        && a.dependencies.iter().any(|d| failed.contains(d))
                })
                .cloned()
                .collect();
            if newly.is_empty() {
                break;
            }
            for mut action in newly {
                let cause = action
                    .dependencies
                    .iter()
                    .find(|d| failed.contains(d))
                    .copied()
                    .unwrap_or(failed_id);
                action.set_status(ActionStatus::Failed, now);
                action.last_error = Some(format!("dependency {} failed", cause));
                failed.insert(action.id);
                changed.push(action);
            }
        }

        if !changed.is_empty() {
            self.store.save_actions(&changed).await?;
            for action in &changed {
                warn!(action_id = action.id, "Action failed because a dependency failed");
                state.actions.insert(action.id, action.clone());
            }
        }
        Ok(changed)
    }
}
