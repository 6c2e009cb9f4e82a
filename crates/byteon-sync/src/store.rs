//! Persistence for tracked entities: in-memory (YAML-seeded) and Postgres.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use byteon_core::TrackedEntity;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Entities with a non-blank source url, ordered by id.
    async fn list_tracked(&self) -> Result<Vec<TrackedEntity>>;

    async fn get(&self, id: &str) -> Result<Option<TrackedEntity>>;

    async fn record_success(&self, id: &str, count: u64, at: DateTime<Utc>) -> Result<()>;

    async fn record_failure(&self, id: &str, message: &str, at: DateTime<Utc>) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityRegistry {
    #[serde(default)]
    pub entities: Vec<TrackedEntity>,
}

#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: RwLock<BTreeMap<String, TrackedEntity>>,
}

impl MemoryEntityStore {
    pub fn new(entities: impl IntoIterator<Item = TrackedEntity>) -> Self {
        Self {
            entities: RwLock::new(entities.into_iter().map(|e| (e.id.clone(), e)).collect()),
        }
    }

    /// Seeds the store from an `entities.yaml` registry. A missing file gives an empty store.
    pub async fn from_registry_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            warn!(path = %path.display(), "entity registry not found; starting with no tracked entities");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: EntityRegistry =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), entities = registry.entities.len(), "loaded entity registry");
        Ok(Self::new(registry.entities))
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn list_tracked(&self) -> Result<Vec<TrackedEntity>> {
        let entities = self.entities.read().await;
        Ok(entities
            .values()
            .filter(|e| e.tracking_enabled())
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<TrackedEntity>> {
        Ok(self.entities.read().await.get(id).cloned())
    }

    async fn record_success(&self, id: &str, count: u64, at: DateTime<Utc>) -> Result<()> {
        let mut entities = self.entities.write().await;
        let Some(entity) = entities.get_mut(id) else {
            bail!("tracked entity {id} not found");
        };
        entity.record_success(count, at);
        Ok(())
    }

    async fn record_failure(&self, id: &str, message: &str, at: DateTime<Utc>) -> Result<()> {
        let mut entities = self.entities.write().await;
        let Some(entity) = entities.get_mut(id) else {
            bail!("tracked entity {id} not found");
        };
        entity.record_failure(message, at);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

fn entity_from_row(row: &PgRow) -> Result<TrackedEntity> {
    let cached_count: Option<i64> = row.try_get("cached_count")?;
    Ok(TrackedEntity {
        id: row.try_get("id")?,
        source_url: row.try_get("source_url")?,
        cached_count: cached_count.map(|c| c.max(0) as u64),
        last_synced_at: row.try_get("last_synced_at")?,
        last_sync_error: row.try_get("last_sync_error")?,
    })
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn list_tracked(&self) -> Result<Vec<TrackedEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_url, cached_count, last_synced_at, last_sync_error
              FROM tracked_entities
             WHERE source_url IS NOT NULL
               AND btrim(source_url) <> ''
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing tracked entities")?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn get(&self, id: &str) -> Result<Option<TrackedEntity>> {
        let row = sqlx::query(
            r#"
            SELECT id, source_url, cached_count, last_synced_at, last_sync_error
              FROM tracked_entities
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading tracked entity {id}"))?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn record_success(&self, id: &str, count: u64, at: DateTime<Utc>) -> Result<()> {
        let count = i64::try_from(count).context("count exceeds BIGINT")?;
        let result = sqlx::query(
            r#"
            UPDATE tracked_entities
               SET cached_count = $2,
                   last_synced_at = $3,
                   last_sync_error = NULL
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(count)
        .bind(at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording sync success for {id}"))?;
        if result.rows_affected() == 0 {
            bail!("tracked entity {id} not found");
        }
        Ok(())
    }

    async fn record_failure(&self, id: &str, message: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tracked_entities
               SET last_sync_error = $2,
                   last_synced_at = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(message)
        .bind(at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording sync failure for {id}"))?;
        if result.rows_affected() == 0 {
            bail!("tracked entity {id} not found");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn registry_file_seeds_store_and_skips_untracked() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("entities.yaml");
        std::fs::write(
            &path,
            r#"
entities:
  - id: spring-hack
    source_url: https://docs.example.com/spring/export?format=csv
    cached_count: 12
  - id: workshop
  - id: blank-source
    source_url: "  "
"#,
        )
        .expect("write registry");

        let store = MemoryEntityStore::from_registry_file(&path)
            .await
            .expect("load");

        let tracked = store.list_tracked().await.expect("list");
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].id, "spring-hack");
        assert_eq!(tracked[0].cached_count, Some(12));
        assert!(store.get("workshop").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn missing_registry_is_empty() {
        let dir = tempdir().expect("tempdir");
        let store = MemoryEntityStore::from_registry_file(dir.path().join("nope.yaml"))
            .await
            .expect("load");
        assert!(store.list_tracked().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn recording_against_unknown_entity_fails() {
        let store = MemoryEntityStore::default();
        assert!(store.record_success("ghost", 1, Utc::now()).await.is_err());
        assert!(store.record_failure("ghost", "boom", Utc::now()).await.is_err());
    }
}
