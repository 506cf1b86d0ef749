//! libSQL storage for the entity roster, harvested mentions, and job records.
//!
//! The pipeline only sees the [`MentionStore`] trait. [`Storage`] is the local
//! libSQL implementation; it also carries the roster-management and reporting
//! queries used by the CLI.
//!
//! All writes go through one connection and are serialized by an async mutex,
//! so a batch insert's transaction never interleaves with a job update.

mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Row, Value, params};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use harvester_shared::{
    Entity, HarvestError, JobId, JobStatus, JobUpdate, Mention, Result, ScrapeJob,
};

// ---------------------------------------------------------------------------
// MentionStore
// ---------------------------------------------------------------------------

/// Outcome of an idempotent batch insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertStats {
    pub inserted: u64,
    /// Duplicates of an existing `(entity_id, original_url)` pair, plus rows
    /// the store refused.
    pub skipped: u64,
}

impl InsertStats {
    pub fn merge(&mut self, other: InsertStats) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
    }
}

/// Persistence operations the harvesting pipeline depends on.
#[async_trait]
pub trait MentionStore: Send + Sync {
    /// The full roster, ordered by id.
    async fn list_entities(&self) -> Result<Vec<Entity>>;

    /// Create a `pending` job. `None` means a whole-roster run.
    async fn create_job(&self, entity_id: Option<i64>) -> Result<JobId>;

    /// Apply a partial update. Rejects status moves that go backwards.
    async fn update_job(&self, job_id: &JobId, update: JobUpdate) -> Result<()>;

    /// Insert mentions in one transaction, skipping duplicates.
    async fn batch_insert(&self, mentions: &[Mention]) -> Result<InsertStats>;

    /// Cheap round trip proving the store is reachable.
    async fn ping(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

const INSERT_MENTION_SQL: &str = "INSERT INTO celebrity_mentions
     (celebrity_id, original_url, cleaned_text, domain, content_length,
      extraction_confidence, processing_time_ms, time_stamp)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
     ON CONFLICT(celebrity_id, original_url) DO NOTHING";

const SELECT_JOB_SQL: &str = "SELECT job_id, celebrity_id, status, mentions_found, urls_processed,
            start_time, end_time, error_message
     FROM scraping_jobs WHERE job_id = ?1";

/// Primary storage handle wrapping a local libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    HarvestError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            // Table doesn't exist yet
            Err(_) => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Roster
    // -----------------------------------------------------------------------

    /// Insert an entity, or rename it if the id already exists.
    pub async fn upsert_entity(&self, entity: &Entity) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO celebrities (celebrity_id, name) VALUES (?1, ?2)
                 ON CONFLICT(celebrity_id) DO UPDATE SET name = excluded.name",
                params![entity.id, entity.name.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Upsert a whole roster in one transaction. Returns the number of rows written.
    #[instrument(skip_all, fields(entities = entities.len()))]
    pub async fn import_entities(&self, entities: &[Entity]) -> Result<usize> {
        if let Some(blank) = entities.iter().find(|e| e.name.trim().is_empty()) {
            return Err(HarvestError::validation(format!(
                "entity {} has an empty name",
                blank.id
            )));
        }

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        for entity in entities {
            tx.execute(
                "INSERT INTO celebrities (celebrity_id, name) VALUES (?1, ?2)
                 ON CONFLICT(celebrity_id) DO UPDATE SET name = excluded.name",
                params![entity.id, entity.name.as_str()],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        info!(count = entities.len(), "roster imported");
        Ok(entities.len())
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<ScrapeJob>> {
        let id = job_id.to_string();
        let mut rows = self
            .conn
            .query(SELECT_JOB_SQL, params![id.as_str()])
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(job_from_row(&row)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Mentions
    // -----------------------------------------------------------------------

    pub async fn count_mentions(&self, entity_id: i64) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM celebrity_mentions WHERE celebrity_id = ?1",
                params![entity_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)?.max(0) as u64),
            None => Ok(0),
        }
    }

    /// Stored mentions for one entity, oldest first.
    pub async fn list_mentions(&self, entity_id: i64) -> Result<Vec<Mention>> {
        let mut rows = self
            .conn
            .query(
                "SELECT celebrity_id, original_url, cleaned_text, domain, content_length,
                        extraction_confidence, processing_time_ms, time_stamp
                 FROM celebrity_mentions WHERE celebrity_id = ?1 ORDER BY mention_id",
                params![entity_id],
            )
            .await
            .map_err(storage_err)?;

        let mut mentions = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            mentions.push(Mention {
                entity_id: row.get::<i64>(0).map_err(storage_err)?,
                original_url: row.get::<String>(1).map_err(storage_err)?,
                cleaned_text: row.get::<String>(2).map_err(storage_err)?,
                domain: row.get::<String>(3).map_err(storage_err)?,
                content_length: row.get::<i64>(4).map_err(storage_err)?.max(0) as usize,
                extraction_confidence: row.get::<f64>(5).map_err(storage_err)?,
                processing_time_ms: row.get::<i64>(6).map_err(storage_err)?.max(0) as u64,
                timestamp: parse_timestamp(&row.get::<String>(7).map_err(storage_err)?)?,
            });
        }
        Ok(mentions)
    }
}

#[async_trait]
impl MentionStore for Storage {
    async fn list_entities(&self) -> Result<Vec<Entity>> {
        let mut rows = self
            .conn
            .query(
                "SELECT celebrity_id, name FROM celebrities ORDER BY celebrity_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut entities = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            entities.push(Entity {
                id: row.get::<i64>(0).map_err(storage_err)?,
                name: row.get::<String>(1).map_err(storage_err)?,
            });
        }
        Ok(entities)
    }

    async fn create_job(&self, entity_id: Option<i64>) -> Result<JobId> {
        let job_id = JobId::new();
        let id = job_id.to_string();
        let now = Utc::now().to_rfc3339();

        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO scraping_jobs (job_id, celebrity_id, status, start_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.as_str(),
                    entity_id,
                    JobStatus::Pending.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;

        debug!(job_id = %job_id, ?entity_id, "job created");
        Ok(job_id)
    }

    async fn update_job(&self, job_id: &JobId, update: JobUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let current = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| HarvestError::Storage(format!("job not found: {job_id}")))?;

        if let Some(next) = update.status {
            if !current.status.can_transition_to(next) {
                return Err(HarvestError::validation(format!(
                    "job {job_id}: cannot move from {} to {next}",
                    current.status
                )));
            }
        }

        let id = job_id.to_string();
        let status = update.status.map(|s| s.as_str());
        let end_time = update
            .status
            .filter(JobStatus::is_terminal)
            .map(|_| Utc::now().to_rfc3339());

        self.conn
            .execute(
                "UPDATE scraping_jobs SET
                    status         = COALESCE(?2, status),
                    mentions_found = COALESCE(?3, mentions_found),
                    urls_processed = COALESCE(?4, urls_processed),
                    error_message  = COALESCE(?5, error_message),
                    end_time       = COALESCE(?6, end_time)
                 WHERE job_id = ?1",
                params![
                    id.as_str(),
                    status,
                    update.mentions_found.map(to_i64),
                    update.urls_processed.map(to_i64),
                    update.error_message,
                    end_time
                ],
            )
            .await
            .map_err(storage_err)?;

        debug!(job_id = %job_id, status = ?update.status, "job updated");
        Ok(())
    }

    #[instrument(skip_all, fields(mentions = mentions.len()))]
    async fn batch_insert(&self, mentions: &[Mention]) -> Result<InsertStats> {
        let mut stats = InsertStats::default();
        if mentions.is_empty() {
            return Ok(stats);
        }

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        for mention in mentions {
            let result = tx
                .execute(
                    INSERT_MENTION_SQL,
                    params![
                        mention.entity_id,
                        mention.original_url.as_str(),
                        mention.cleaned_text.as_str(),
                        mention.domain.as_str(),
                        to_i64(mention.content_length as u64),
                        mention.extraction_confidence,
                        to_i64(mention.processing_time_ms),
                        mention.timestamp.to_rfc3339()
                    ],
                )
                .await;

            match result {
                Ok(0) => {
                    debug!(url = %mention.original_url, "duplicate mention skipped");
                    stats.skipped += 1;
                }
                Ok(_) => stats.inserted += 1,
                Err(e) => {
                    warn!(url = %mention.original_url, error = %e, "mention rejected by store");
                    stats.skipped += 1;
                }
            }
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(inserted = stats.inserted, skipped = stats.skipped, "batch committed");
        Ok(stats)
    }

    async fn ping(&self) -> Result<()> {
        let mut rows = self
            .conn
            .query("SELECT 1", params![])
            .await
            .map_err(storage_err)?;
        rows.next().await.map_err(storage_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn storage_err(e: libsql::Error) -> HarvestError {
    HarvestError::Storage(e.to_string())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| HarvestError::Storage(format!("bad timestamp '{raw}': {e}")))
}

fn optional_text(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx).map_err(storage_err)? {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text)),
        other => Err(HarvestError::Storage(format!(
            "column {idx}: expected text, got {other:?}"
        ))),
    }
}

fn optional_integer(row: &Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx).map_err(storage_err)? {
        Value::Null => Ok(None),
        Value::Integer(n) => Ok(Some(n)),
        other => Err(HarvestError::Storage(format!(
            "column {idx}: expected integer, got {other:?}"
        ))),
    }
}

fn job_from_row(row: &Row) -> Result<ScrapeJob> {
    let job_id: String = row.get(0).map_err(storage_err)?;
    let status: String = row.get(2).map_err(storage_err)?;
    let start_time: String = row.get(5).map_err(storage_err)?;

    Ok(ScrapeJob {
        job_id: job_id
            .parse()
            .map_err(|e| HarvestError::Storage(format!("bad job id '{job_id}': {e}")))?,
        entity_id: optional_integer(row, 1)?,
        status: status.parse()?,
        mentions_found: row.get::<i64>(3).map_err(storage_err)?.max(0) as u64,
        urls_processed: row.get::<i64>(4).map_err(storage_err)?.max(0) as u64,
        start_time: parse_timestamp(&start_time)?,
        end_time: optional_text(row, 6)?
            .map(|t| parse_timestamp(&t))
            .transpose()?,
        error_message: optional_text(row, 7)?,
    })
}
