//! # Queued Action Repository
//!
//! Durable rows behind the offline action queue.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  OfflineActionQueue (in-memory index, ordering, dependency rules)      │
//! │       │                                                                 │
//! │       │  every mutation is persisted before the call returns           │
//! │       ▼                                                                 │
//! │  QueuedActionRepository                                                │
//! │  ├── upsert(action)          INSERT ... ON CONFLICT(id) DO UPDATE      │
//! │  ├── upsert_many(actions)    same, one transaction                     │
//! │  ├── delete_many(ids)        one transaction, records high-water id    │
//! │  ├── load_all()              startup reload                            │
//! │  └── cleanup(cutoff)         prune finished rows at startup            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  queued_actions (payload / dependencies / conflict as JSON TEXT)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use shopfloor_core::{ActionId, ActionStatus, ConflictRecord, QueuedAction};

const SELECT_COLUMNS: &str = r#"
    SELECT
        id, verb, entity_type, entity_id, payload, base_version, status,
        retry_count, max_retries, priority, dependencies, last_error,
        server_version, conflict, created_at, updated_at
    FROM queued_actions
"#;

const UPSERT: &str = r#"
    INSERT INTO queued_actions (
        id, verb, entity_type, entity_id, payload, base_version, status,
        retry_count, max_retries, priority, dependencies, last_error,
        server_version, conflict, created_at, updated_at
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, ?6, ?7,
        ?8, ?9, ?10, ?11, ?12,
        ?13, ?14, ?15, ?16
    )
    ON CONFLICT(id) DO UPDATE SET
        verb = excluded.verb,
        entity_type = excluded.entity_type,
        entity_id = excluded.entity_id,
        payload = excluded.payload,
        base_version = excluded.base_version,
        status = excluded.status,
        retry_count = excluded.retry_count,
        max_retries = excluded.max_retries,
        priority = excluded.priority,
        dependencies = excluded.dependencies,
        last_error = excluded.last_error,
        server_version = excluded.server_version,
        conflict = excluded.conflict,
        updated_at = excluded.updated_at
"#;

const RECORD_HIGH_WATER: &str = r#"
    INSERT INTO queue_meta (key, value)
    SELECT 'high_water', COALESCE(MAX(id), 0) FROM queued_actions WHERE true
    ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)
"#;

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, FromRow)]
struct ActionRow {
    id: i64,
    verb: String,
    entity_type: String,
    entity_id: String,
    payload: String,
    base_version: Option<i64>,
    status: String,
    retry_count: i64,
    max_retries: i64,
    priority: i64,
    dependencies: String,
    last_error: Option<String>,
    server_version: Option<i64>,
    conflict: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ActionRow> for QueuedAction {
    type Error = DbError;

    fn try_from(row: ActionRow) -> Result<Self, Self::Error> {
        let conflict = row
            .conflict
            .as_deref()
            .map(serde_json::from_str::<ConflictRecord>)
            .transpose()
            .map_err(|e| DbError::invalid_data("conflict", e))?;

        Ok(QueuedAction {
            id: row.id as ActionId,
            verb: row.verb.parse().map_err(|e| DbError::invalid_data("verb", e))?,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            payload: serde_json::from_str(&row.payload)
                .map_err(|e| DbError::invalid_data("payload", e))?,
            base_version: row.base_version.map(|v| v as u64),
            status: row
                .status
                .parse()
                .map_err(|e| DbError::invalid_data("status", e))?,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            priority: row.priority as u8,
            dependencies: serde_json::from_str(&row.dependencies)
                .map_err(|e| DbError::invalid_data("dependencies", e))?,
            last_error: row.last_error,
            server_version: row.server_version.map(|v| v as u64),
            conflict,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn bind_upsert<'q>(
    action: &'q QueuedAction,
    payload: String,
    dependencies: String,
    conflict: Option<String>,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    sqlx::query(UPSERT)
        .bind(action.id as i64)
        .bind(action.verb.as_str())
        .bind(&action.entity_type)
        .bind(&action.entity_id)
        .bind(payload)
        .bind(action.base_version.map(|v| v as i64))
        .bind(action.status.as_str())
        .bind(action.retry_count as i64)
        .bind(action.max_retries as i64)
        .bind(action.priority as i64)
        .bind(dependencies)
        .bind(&action.last_error)
        .bind(action.server_version.map(|v| v as i64))
        .bind(conflict)
        .bind(action.created_at)
        .bind(action.updated_at)
}

fn encode_json(action: &QueuedAction) -> DbResult<(String, String, Option<String>)> {
    let payload =
        serde_json::to_string(&action.payload).map_err(|e| DbError::invalid_data("payload", e))?;
    let dependencies = serde_json::to_string(&action.dependencies)
        .map_err(|e| DbError::invalid_data("dependencies", e))?;
    let conflict = action
        .conflict
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DbError::invalid_data("conflict", e))?;
    Ok((payload, dependencies, conflict))
}

// =============================================================================
// Repository
// =============================================================================

#[derive(Debug, Clone)]
pub struct QueuedActionRepository {
    pool: SqlitePool,
}

impl QueuedActionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        QueuedActionRepository { pool }
    }

    /// Inserts or fully replaces one action.
    pub async fn upsert(&self, action: &QueuedAction) -> DbResult<()> {
        let (payload, dependencies, conflict) = encode_json(action)?;

        debug!(
            action_id = action.id,
            status = %action.status,
            "Persisting queued action"
        );

        bind_upsert(action, payload, dependencies, conflict)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Upserts several actions atomically.
    pub async fn upsert_many(&self, actions: &[QueuedAction]) -> DbResult<()> {
        if actions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for action in actions {
            let (payload, dependencies, conflict) = encode_json(action)?;
            bind_upsert(action, payload, dependencies, conflict)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(count = actions.len(), "Persisted queued actions");
        Ok(())
    }

    /// Loads every stored action, oldest id first.
    pub async fn load_all(&self) -> DbResult<Vec<QueuedAction>> {
        let rows: Vec<ActionRow> = sqlx::query_as(&format!("{} ORDER BY id ASC", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(QueuedAction::try_from).collect()
    }

    pub async fn get(&self, id: ActionId) -> DbResult<Option<QueuedAction>> {
        let row: Option<ActionRow> = sqlx::query_as(&format!("{} WHERE id = ?1", SELECT_COLUMNS))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueuedAction::try_from).transpose()
    }

    /// Deletes the given ids atomically. Returns how many rows went away.
    ///
    /// The current high-water id is recorded first so a restart never
    /// reissues a purged id.
    pub async fn delete_many(&self, ids: &[ActionId]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(RECORD_HIGH_WATER).execute(&mut *tx).await?;

        let mut removed = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM queued_actions WHERE id = ?1")
                .bind(*id as i64)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;

        debug!(removed, "Deleted queued actions");
        Ok(removed)
    }

    /// Deletes completed and cancelled rows last touched before `cutoff`.
    /// Failed rows are kept; only an explicit clear removes them.
    pub async fn cleanup(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(RECORD_HIGH_WATER).execute(&mut *tx).await?;

        let result = sqlx::query(
            r#"
            DELETE FROM queued_actions
            WHERE status IN ('completed', 'cancelled')
            AND updated_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    /// Highest id ever issued, including rows since deleted.
    pub async fn max_id(&self) -> DbResult<Option<ActionId>> {
        let max: i64 = sqlx::query_scalar(
            r#"
            SELECT MAX(
                COALESCE((SELECT MAX(id) FROM queued_actions), 0),
                COALESCE((SELECT value FROM queue_meta WHERE key = 'high_water'), 0)
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((max > 0).then_some(max as ActionId))
    }

    pub async fn count_by_status(&self, status: ActionStatus) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queued_actions WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use serde_json::json;
    use shopfloor_core::{NewAction, ResolutionStrategy};

    async fn repo() -> (Database, QueuedActionRepository) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.actions();
        (db, repo)
    }

    fn sample(id: ActionId) -> QueuedAction {
        QueuedAction::from_new(
            id,
            NewAction::update("work_order", "wo-1", json!({"qty": id})).depends_on(id.saturating_sub(1)),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_upsert_and_load() {
        let (_db, repo) = repo().await;
        repo.upsert(&sample(1)).await.unwrap();
        repo.upsert(&sample(2)).await.unwrap();

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].payload, json!({"qty": 2}));
        assert_eq!(loaded[1].dependencies, vec![1]);
        assert_eq!(repo.max_id().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_row() {
        let (_db, repo) = repo().await;
        let mut action = sample(1);
        repo.upsert(&action).await.unwrap();

        action.status = ActionStatus::Failed;
        action.retry_count = 3;
        action.last_error = Some("rejected".to_string());
        action.conflict = Some(ConflictRecord {
            action_id: 1,
            entity_type: "work_order".to_string(),
            entity_id: "wo-1".to_string(),
            server_version: 9,
            server_payload: json!({"qty": 7}),
            client_version: None,
            client_payload: json!({"qty": 1}),
            strategy: ResolutionStrategy::Manual,
            resolution: None,
            resolver: None,
            detected_at: Utc::now(),
            resolved_at: None,
        });
        repo.upsert(&action).await.unwrap();

        let stored = repo.get(1).await.unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.conflict.unwrap().server_version, 9);
        assert_eq!(repo.count_by_status(ActionStatus::Failed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_many() {
        let (_db, repo) = repo().await;
        repo.upsert_many(&[sample(1), sample(2), sample(3)]).await.unwrap();

        let removed = repo.delete_many(&[1, 3, 42]).await.unwrap();
        assert_eq!(removed, 2);

        let ids: Vec<ActionId> = repo.load_all().await.unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_high_water_survives_deleting_newest() {
        let (_db, repo) = repo().await;
        assert_eq!(repo.max_id().await.unwrap(), None);

        repo.upsert_many(&[sample(1), sample(2), sample(3)]).await.unwrap();
        repo.delete_many(&[2, 3]).await.unwrap();

        assert_eq!(repo.max_id().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_failed_and_recent() {
        let (_db, repo) = repo().await;
        let old = Utc::now() - chrono::Duration::days(30);

        let mut done = sample(1);
        done.status = ActionStatus::Completed;
        done.updated_at = old;
        let mut failed = sample(2);
        failed.status = ActionStatus::Failed;
        failed.updated_at = old;
        let mut recent = sample(3);
        recent.status = ActionStatus::Completed;
        repo.upsert_many(&[done, failed, recent]).await.unwrap();

        let removed = repo.cleanup(Utc::now() - chrono::Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);

        let ids: Vec<ActionId> = repo.load_all().await.unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_corrupt_row_reports_column() {
        let (db, repo) = repo().await;
        repo.upsert(&sample(1)).await.unwrap();
        sqlx::query("UPDATE queued_actions SET payload = '{broken' WHERE id = 1")
            .execute(db.pool())
            .await
            .unwrap();

        let err = repo.load_all().await.unwrap_err();
        assert!(matches!(err, DbError::InvalidData { ref column, .. } if column == "payload"));
    }

    #[tokio::test]
    async fn test_check_constraint_on_priority() {
        let (_db, repo) = repo().await;
        let mut action = sample(1);
        action.priority = 42;
        let err = repo.upsert(&action).await.unwrap_err();
        assert!(matches!(err, DbError::ConstraintViolation(_)));
    }
}
