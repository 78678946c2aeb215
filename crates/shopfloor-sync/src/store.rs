//! # Action Store
//!
//! Durable backing for the offline action queue.
//!
//! ```text
//!   OfflineActionQueue ──(every mutation, before returning)──► ActionStore
//!                                                                  │
//!                        ┌─────────────────────────────────────────┤
//!                        ▼                                         ▼
//!            shopfloor_store::Database                        MemoryStore
//!            (SQLite, survives restarts)           (ephemeral sessions, tests)
//! ```

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use shopfloor_core::{ActionId, EntitySnapshot, QueuedAction};
use shopfloor_store::Database;

use crate::error::SyncResult;

#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Every stored action, any status.
    async fn load_actions(&self) -> SyncResult<Vec<QueuedAction>>;

    async fn save_action(&self, action: &QueuedAction) -> SyncResult<()>;

    /// Saves several actions atomically where the backend supports it.
    async fn save_actions(&self, actions: &[QueuedAction]) -> SyncResult<()>;

    async fn delete_actions(&self, ids: &[ActionId]) -> SyncResult<u64>;

    /// Highest id ever saved, including deleted ones.
    async fn high_water_mark(&self) -> SyncResult<Option<ActionId>>;

    async fn save_snapshot(&self, snapshot: &EntitySnapshot) -> SyncResult<()>;

    async fn load_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> SyncResult<Option<EntitySnapshot>>;
}

// =============================================================================
// SQLite
// =============================================================================

#[async_trait]
impl ActionStore for Database {
    async fn load_actions(&self) -> SyncResult<Vec<QueuedAction>> {
        Ok(self.actions().load_all().await?)
    }

    async fn save_action(&self, action: &QueuedAction) -> SyncResult<()> {
        Ok(self.actions().upsert(action).await?)
    }

    async fn save_actions(&self, actions: &[QueuedAction]) -> SyncResult<()> {
        Ok(self.actions().upsert_many(actions).await?)
    }

    async fn delete_actions(&self, ids: &[ActionId]) -> SyncResult<u64> {
        Ok(self.actions().delete_many(ids).await?)
    }

    async fn high_water_mark(&self) -> SyncResult<Option<ActionId>> {
        Ok(self.actions().max_id().await?)
    }

    async fn save_snapshot(&self, snapshot: &EntitySnapshot) -> SyncResult<()> {
        Ok(self.snapshots().save(snapshot).await?)
    }

    async fn load_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> SyncResult<Option<EntitySnapshot>> {
        Ok(self.snapshots().load(entity_type, entity_id).await?)
    }
}

// =============================================================================
// In-Memory
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    actions: BTreeMap<ActionId, QueuedAction>,
    snapshots: HashMap<(String, String), EntitySnapshot>,
    high_water: ActionId,
}

/// Store that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stored copy of one action.
    pub fn stored(&self, id: ActionId) -> Option<QueuedAction> {
        self.lock().actions.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().actions.is_empty()
    }
}

#[async_trait]
impl ActionStore for MemoryStore {
    async fn load_actions(&self) -> SyncResult<Vec<QueuedAction>> {
        Ok(self.lock().actions.values().cloned().collect())
    }

    async fn save_action(&self, action: &QueuedAction) -> SyncResult<()> {
        let mut state = self.lock();
        state.high_water = state.high_water.max(action.id);
        state.actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn save_actions(&self, actions: &[QueuedAction]) -> SyncResult<()> {
        let mut state = self.lock();
        for action in actions {
            state.high_water = state.high_water.max(action.id);
            state.actions.insert(action.id, action.clone());
        }
        Ok(())
    }

    async fn delete_actions(&self, ids: &[ActionId]) -> SyncResult<u64> {
        let mut state = self.lock();
        let removed = ids
            .iter()
            .filter(|id| state.actions.remove(*id).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn high_water_mark(&self) -> SyncResult<Option<ActionId>> {
        let high_water = self.lock().high_water;
        Ok((high_water > 0).then_some(high_water))
    }

    async fn save_snapshot(&self, snapshot: &EntitySnapshot) -> SyncResult<()> {
        self.lock().snapshots.insert(
            (snapshot.entity_type.clone(), snapshot.entity_id.clone()),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn load_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> SyncResult<Option<EntitySnapshot>> {
        Ok(self
            .lock()
            .snapshots
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use shopfloor_core::NewAction;
    use shopfloor_store::DbConfig;

    fn action(id: ActionId) -> QueuedAction {
        QueuedAction::from_new(id, NewAction::update("part", "p-1", json!({"rev": id})), Utc::now())
    }

    async fn exercise(store: &dyn ActionStore) {
        store.save_action(&action(1)).await.unwrap();
        store.save_actions(&[action(2), action(3)]).await.unwrap();
        assert_eq!(store.load_actions().await.unwrap().len(), 3);

        assert_eq!(store.delete_actions(&[3, 99]).await.unwrap(), 1);
        assert_eq!(store.high_water_mark().await.unwrap(), Some(3));

        let snapshot = EntitySnapshot {
            entity_type: "part".into(),
            entity_id: "p-1".into(),
            version: Some(4),
            payload: json!({"rev": "C"}),
            updated_at: Utc::now(),
        };
        store.save_snapshot(&snapshot).await.unwrap();
        let loaded = store.load_snapshot("part", "p-1").await.unwrap().unwrap();
        assert_eq!(loaded.version, Some(4));
        assert!(store.load_snapshot("part", "p-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryStore::new();
        exercise(&store).await;
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_store_contract() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        exercise(&db).await;
    }
}
