//! # Entity Snapshot Repository
//!
//! Last known server copy of each entity, keyed by `(entity_type, entity_id)`.
//! Written when the server wins a conflict or a sync action pulls state.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use shopfloor_core::EntitySnapshot;

#[derive(Debug, FromRow)]
struct SnapshotRow {
    entity_type: String,
    entity_id: String,
    version: Option<i64>,
    payload: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for EntitySnapshot {
    type Error = DbError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(EntitySnapshot {
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            version: row.version.map(|v| v as u64),
            payload: serde_json::from_str(&row.payload)
                .map_err(|e| DbError::invalid_data("payload", e))?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EntitySnapshotRepository {
    pool: SqlitePool,
}

impl EntitySnapshotRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EntitySnapshotRepository { pool }
    }

    /// Replaces the cached copy of an entity.
    pub async fn save(&self, snapshot: &EntitySnapshot) -> DbResult<()> {
        let payload = serde_json::to_string(&snapshot.payload)
            .map_err(|e| DbError::invalid_data("payload", e))?;

        debug!(
            entity_type = %snapshot.entity_type,
            entity_id = %snapshot.entity_id,
            version = ?snapshot.version,
            "Saving entity snapshot"
        );

        sqlx::query(
            r#"
            INSERT INTO entity_snapshots (entity_type, entity_id, version, payload, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                version = excluded.version,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&snapshot.entity_type)
        .bind(&snapshot.entity_id)
        .bind(snapshot.version.map(|v| v as i64))
        .bind(payload)
        .bind(snapshot.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load(&self, entity_type: &str, entity_id: &str) -> DbResult<Option<EntitySnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT entity_type, entity_id, version, payload, updated_at
            FROM entity_snapshots
            WHERE entity_type = ?1 AND entity_id = ?2
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EntitySnapshot::try_from).transpose()
    }

    pub async fn delete(&self, entity_type: &str, entity_id: &str) -> DbResult<bool> {
        let result =
            sqlx::query("DELETE FROM entity_snapshots WHERE entity_type = ?1 AND entity_id = ?2")
                .bind(entity_type)
                .bind(entity_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}
