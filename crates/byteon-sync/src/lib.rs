//! Server-side registrant count sync.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use byteon_core::{count_rows, TrackedEntity};
use byteon_storage::{CsvFetcher, CsvSource, FetchError, HttpClientConfig, DEFAULT_USER_AGENT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod store;

pub use store::{EntityRegistry, EntityStore, MemoryEntityStore, PgEntityStore};

pub const CRATE_NAME: &str = "byteon-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub entities_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub cron_secret: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            entities_file: std::env::var("BYTEON_ENTITIES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./entities.yaml")),
            scheduler_enabled: std::env::var("BYTEON_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("BYTEON_SYNC_CRON")
                .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
            cron_secret: std::env::var("CRON_SECRET").ok().filter(|v| !v.is_empty()),
            user_agent: std::env::var("BYTEON_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("BYTEON_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: self.user_agent.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("tracked entity {id} not found")]
    EntityNotFound { id: String },
    #[error("tracked entity {id} has no source url configured")]
    NoSource { id: String },
    #[error(transparent)]
    Source(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Per-entity outcome of a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySyncResult {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntitySyncResult {
    fn ok(id: &str, count: u64) -> Self {
        Self {
            id: id.to_string(),
            success: true,
            count: Some(count),
            error: None,
        }
    }

    fn failed(id: &str, error: impl ToString) -> Self {
        Self {
            id: id.to_string(),
            success: false,
            count: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<EntitySyncResult>,
}

impl SyncReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// Fetches, counts, and persists registrant counts for tracked entities.
pub struct SyncService {
    store: Arc<dyn EntityStore>,
    source: Arc<dyn CsvSource>,
    entity_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncService {
    pub fn new(store: Arc<dyn EntityStore>, source: Arc<dyn CsvSource>) -> Self {
        Self {
            store,
            source,
            entity_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Syncs every tracked entity, or just `filter` when given.
    ///
    /// Only a failure to enumerate entities is an error; per-entity failures
    /// are reported in the results and never stop the run.
    pub async fn sync_all(&self, filter: Option<&str>) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id, filter = filter.unwrap_or("all"));

        async {
            let mut results = Vec::new();
            let targets = match filter {
                Some(id) => match self.store.get(id).await? {
                    Some(entity) if entity.tracking_enabled() => vec![entity],
                    Some(_) => {
                        results.push(EntitySyncResult::failed(id, SyncError::NoSource { id: id.to_string() }));
                        Vec::new()
                    }
                    None => {
                        results.push(EntitySyncResult::failed(
                            id,
                            SyncError::EntityNotFound { id: id.to_string() },
                        ));
                        Vec::new()
                    }
                },
                None => self.store.list_tracked().await?,
            };

            for entity in &targets {
                results.push(self.sync_entity(entity).await);
            }

            let report = SyncReport {
                run_id,
                started_at,
                finished_at: Utc::now(),
                results,
            };
            info!(
                entities = report.results.len(),
                succeeded = report.succeeded(),
                failed = report.failed(),
                "sync run finished"
            );
            Ok::<_, SyncError>(report)
        }
        .instrument(span)
        .await
    }

    /// Fetches and persists one entity's count. Attempts for the same entity are serialized.
    pub async fn sync_entity(&self, entity: &TrackedEntity) -> EntitySyncResult {
        let Some(url) = entity.source_url() else {
            return EntitySyncResult::failed(&entity.id, SyncError::NoSource { id: entity.id.clone() });
        };
        let lock = self.entity_lock(&entity.id).await;
        let _guard = lock.lock().await;

        let outcome = self.fetch_count(url).await;
        let now = Utc::now();
        match outcome {
            Ok(count) => match self.store.record_success(&entity.id, count, now).await {
                Ok(()) => {
                    info!(entity = %entity.id, count, "synced registrant count");
                    EntitySyncResult::ok(&entity.id, count)
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(entity = %entity.id, error = %message, "failed to persist count");
                    self.record_failure(&entity.id, &message, now).await;
                    EntitySyncResult::failed(&entity.id, message)
                }
            },
            Err(err) => {
                let message = err.to_string();
                warn!(entity = %entity.id, url, error = %message, "sync fetch failed");
                self.record_failure(&entity.id, &message, now).await;
                EntitySyncResult::failed(&entity.id, message)
            }
        }
    }

    /// Live count for one entity. Nothing is persisted.
    pub async fn count_one(&self, id: &str) -> Result<u64, SyncError> {
        let entity = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| SyncError::EntityNotFound { id: id.to_string() })?;
        let url = entity
            .source_url()
            .ok_or_else(|| SyncError::NoSource { id: id.to_string() })?;
        Ok(self.fetch_count(url).await?)
    }

    pub async fn entity(&self, id: &str) -> Result<TrackedEntity, SyncError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| SyncError::EntityNotFound { id: id.to_string() })
    }

    async fn record_failure(&self, id: &str, message: &str, at: DateTime<Utc>) {
        if let Err(err) = self.store.record_failure(id, message, at).await {
            warn!(entity = %id, error = %err, "failed to persist sync error");
        }
    }

    async fn fetch_count(&self, url: &str) -> Result<u64, FetchError> {
        let text = self.source.fetch_csv(url).await?;
        Ok(count_rows(&text))
    }

    async fn entity_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.entity_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Builds the service from config: Postgres when `DATABASE_URL` is set,
/// otherwise the YAML registry held in memory.
pub async fn build_service(config: &SyncConfig) -> Result<SyncService> {
    let store: Arc<dyn EntityStore> = match &config.database_url {
        Some(url) => Arc::new(PgEntityStore::connect(url).await?),
        None => Arc::new(MemoryEntityStore::from_registry_file(&config.entities_file).await?),
    };
    let source = Arc::new(CsvFetcher::new(config.http_client_config())?);
    Ok(SyncService::new(store, source))
}

pub async fn maybe_build_scheduler(
    service: Arc<SyncService>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            if let Err(err) = service.sync_all(None).await {
                warn!(error = %err, "scheduled sync failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "scheduled registrant sync");
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env(filter: Option<&str>) -> Result<SyncReport> {
    let config = SyncConfig::from_env();
    let service = build_service(&config).await?;
    Ok(service.sync_all(filter).await?)
}

pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let url = config
        .database_url
        .context("DATABASE_URL must be set to run migrations")?;
    PgEntityStore::connect(&url).await?.migrate().await
}
