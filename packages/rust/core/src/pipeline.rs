//! Roster-wide harvest: roster → batches → per-entity units → store.
//!
//! A run is split in two steps so the caller can react to interrupts with a
//! job id in hand:
//! 1. [`Harvester::prepare`] loads the roster, applies the [`RunScope`], and
//!    creates the job row (`pending` → `running`). Failures here are fatal.
//! 2. [`Harvester::execute`] processes the batches. Per-entity and per-URL
//!    failures only degrade the totals in the returned [`RunSummary`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use harvester_extract::ExtractOptions;
use harvester_fetch::{FetchEngine, FetchedContent};
use harvester_search::SearchClient;
use harvester_shared::{
    AppConfig, Credential, Entity, FailedUrl, HarvestError, JobId, JobStatus, JobUpdate, Mention,
    PipelineConfig, Result, RetryPolicy,
};
use harvester_storage::{InsertStats, MentionStore};

// ---------------------------------------------------------------------------
// Scope and batching
// ---------------------------------------------------------------------------

/// Which part of the roster a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunScope {
    /// Every entity on the roster.
    All,
    /// A single entity; the job row is bound to it.
    Entity(i64),
    /// Roster entries with `id >= start`, for resuming an interrupted run.
    FromEntity(i64),
}

impl RunScope {
    /// Entity id recorded on the job row.
    pub fn job_entity(&self) -> Option<i64> {
        match self {
            Self::Entity(id) => Some(*id),
            Self::All | Self::FromEntity(_) => None,
        }
    }

    fn select(&self, roster: Vec<Entity>) -> Result<Vec<Entity>> {
        let selected: Vec<Entity> = match self {
            Self::All => roster,
            Self::Entity(id) => roster.into_iter().filter(|e| e.id == *id).collect(),
            Self::FromEntity(start) => roster.into_iter().filter(|e| e.id >= *start).collect(),
        };

        if selected.is_empty() {
            return Err(match self {
                Self::All => HarvestError::validation("entity roster is empty"),
                Self::Entity(id) => HarvestError::validation(format!("entity {id} is not on the roster")),
                Self::FromEntity(start) => {
                    HarvestError::validation(format!("no roster entries with id >= {start}"))
                }
            });
        }
        Ok(selected)
    }
}

/// Split `roster` into consecutive batches of at most `size` entities.
///
/// Produces `ceil(len / size)` batches whose concatenation is `roster` in
/// order. A `size` of zero is treated as one.
pub fn split_into_batches(roster: &[Entity], size: usize) -> Vec<Vec<Entity>> {
    roster.chunks(size.max(1)).map(<[Entity]>::to_vec).collect()
}

/// Turn cleaned pages into storable mentions for `entity`.
pub fn build_mentions(entity: &Entity, contents: Vec<FetchedContent>) -> Vec<Mention> {
    let timestamp = Utc::now();
    contents
        .into_iter()
        .map(|content| Mention {
            entity_id: entity.id,
            original_url: content.url,
            cleaned_text: content.cleaned_text,
            domain: content.domain,
            content_length: content.content_length,
            extraction_confidence: content.confidence.clamp(0.0, 1.0),
            processing_time_ms: content.elapsed_ms,
            timestamp,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Progress and results
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called once the job row exists.
    fn run_started(&self, job_id: &JobId, entities: usize, batches: usize);
    /// Called before a batch is dispatched (`index` is 1-based).
    fn batch_started(&self, index: usize, total: usize, size: usize);
    /// Called after an entity's mentions have been persisted.
    fn entity_finished(&self, entity: &Entity, inserted: u64, failed_urls: usize);
    /// Called when the run completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn run_started(&self, _job_id: &JobId, _entities: usize, _batches: usize) {}
    fn batch_started(&self, _index: usize, _total: usize, _size: usize) {}
    fn entity_finished(&self, _entity: &Entity, _inserted: u64, _failed_urls: usize) {}
    fn done(&self, _summary: &RunSummary) {}
}

/// A run whose job row exists and is `running`.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub job_id: JobId,
    pub scope: RunScope,
    pub roster: Vec<Entity>,
}

/// Totals for a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub job_id: JobId,
    pub entities: usize,
    pub batches: usize,
    /// Entities whose search failed outright or whose unit panicked.
    pub entities_failed: usize,
    pub mentions_inserted: u64,
    pub mentions_skipped: u64,
    /// URLs attempted (fetched successfully or not).
    pub urls_processed: u64,
    pub failed_urls: Vec<FailedUrl>,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Nothing was harvested and at least one search or fetch went wrong.
    ///
    /// A run whose searches simply found nothing is not a failure.
    pub fn is_total_failure(&self) -> bool {
        self.mentions_inserted == 0
            && self.mentions_skipped == 0
            && (self.entities_failed > 0 || !self.failed_urls.is_empty())
    }
}

/// What one entity unit produced.
struct UnitResult {
    entity: Entity,
    mentions: Vec<Mention>,
    failures: Vec<FailedUrl>,
    urls_attempted: usize,
    search_failed: bool,
}

impl UnitResult {
    fn empty(entity: Entity, search_failed: bool) -> Self {
        Self {
            entity,
            mentions: Vec::new(),
            failures: Vec::new(),
            urls_attempted: 0,
            search_failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Harvester
// ---------------------------------------------------------------------------

/// Drives search, fetch, and persistence across the roster.
pub struct Harvester {
    store: Arc<dyn MentionStore>,
    search: Arc<SearchClient>,
    fetch: Arc<FetchEngine>,
    config: PipelineConfig,
}

impl Harvester {
    pub fn new(
        store: Arc<dyn MentionStore>,
        search: Arc<SearchClient>,
        fetch: Arc<FetchEngine>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            search,
            fetch,
            config,
        }
    }

    /// Wire the HTTP search client and fetch engine from application config.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn MentionStore>,
        credentials: Vec<Credential>,
    ) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config.retry);
        let search = SearchClient::google(
            &config.search,
            credentials,
            retry.clone(),
            &config.fetch.user_agent,
        )?;
        let fetch = FetchEngine::http(&config.fetch, retry, ExtractOptions::from(&config.extract))?;

        Ok(Self::new(
            store,
            Arc::new(search),
            Arc::new(fetch),
            config.pipeline.clone(),
        ))
    }

    pub fn store(&self) -> &Arc<dyn MentionStore> {
        &self.store
    }

    /// Load and scope the roster, then create the job row and mark it running.
    #[instrument(skip_all, fields(scope = ?scope))]
    pub async fn prepare(&self, scope: RunScope) -> Result<PreparedRun> {
        let roster = self.store.list_entities().await?;
        let total = roster.len();
        let roster = scope.select(roster)?;

        let job_id = self.store.create_job(scope.job_entity()).await?;
        if let Err(e) = self
            .store
            .update_job(&job_id, JobUpdate::status(JobStatus::Running))
            .await
        {
            // Close the row out so it does not linger as pending.
            if let Err(close) = self
                .store
                .update_job(&job_id, JobUpdate::failed(format!("could not start: {e}")))
                .await
            {
                warn!(%job_id, error = %close, "failed to close unstarted job");
            }
            return Err(e);
        }

        info!(%job_id, roster = total, selected = roster.len(), "run prepared");
        Ok(PreparedRun {
            job_id,
            scope,
            roster,
        })
    }

    /// Process every batch of a prepared run and mark the job completed.
    #[instrument(skip_all, fields(job_id = %run.job_id))]
    pub async fn execute(&self, run: &PreparedRun, progress: &dyn ProgressReporter) -> RunSummary {
        let start = Instant::now();
        let batches = split_into_batches(&run.roster, self.config.batch_size);
        let workers = self.config.worker_count.max(1);

        info!(
            entities = run.roster.len(),
            batches = batches.len(),
            batch_size = self.config.batch_size,
            workers,
            "starting harvest"
        );
        progress.run_started(&run.job_id, run.roster.len(), batches.len());

        let mut totals = InsertStats::default();
        let mut urls_processed: u64 = 0;
        let mut entities_failed = 0;
        let mut failed_urls = Vec::new();

        for (index, batch) in batches.iter().enumerate() {
            progress.batch_started(index + 1, batches.len(), batch.len());
            debug!(batch = index + 1, size = batch.len(), "dispatching batch");

            let semaphore = Arc::new(Semaphore::new(workers));
            let mut units = JoinSet::new();
            for entity in batch.iter().cloned() {
                let semaphore = semaphore.clone();
                let search = self.search.clone();
                let fetch = self.fetch.clone();
                units.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return UnitResult::empty(entity, false);
                    };
                    harvest_entity(&search, &fetch, entity).await
                });
            }

            // Completion order: a slow entity never holds up persisting the others.
            while let Some(joined) = units.join_next().await {
                let unit = match joined {
                    Ok(unit) => unit,
                    Err(e) => {
                        // The entity's name is lost with the task; it still counts as failed.
                        warn!(error = %e, "entity unit did not complete");
                        entities_failed += 1;
                        continue;
                    }
                };

                let stats = self.persist(&unit).await;
                totals.merge(stats);
                urls_processed += unit.urls_attempted as u64;
                if unit.search_failed {
                    entities_failed += 1;
                }

                progress.entity_finished(&unit.entity, stats.inserted, unit.failures.len());
                failed_urls.extend(unit.failures);
            }

            // Checkpoint only after every unit of the batch has been persisted.
            let checkpoint = JobUpdate::progress(totals.inserted, urls_processed);
            if let Err(e) = self.store.update_job(&run.job_id, checkpoint).await {
                warn!(error = %e, batch = index + 1, "failed to checkpoint job progress");
            }
        }

        if let Err(e) = self
            .store
            .update_job(&run.job_id, JobUpdate::status(JobStatus::Completed))
            .await
        {
            warn!(error = %e, "failed to mark job completed");
        }

        let summary = RunSummary {
            job_id: run.job_id.clone(),
            entities: run.roster.len(),
            batches: batches.len(),
            entities_failed,
            mentions_inserted: totals.inserted,
            mentions_skipped: totals.skipped,
            urls_processed,
            failed_urls,
            elapsed: start.elapsed(),
        };

        info!(
            mentions_inserted = summary.mentions_inserted,
            mentions_skipped = summary.mentions_skipped,
            urls_processed = summary.urls_processed,
            failed_urls = summary.failed_urls.len(),
            entities_failed = summary.entities_failed,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "harvest completed"
        );
        progress.done(&summary);
        summary
    }

    /// Mark a prepared run as failed, e.g. after an interrupt.
    pub async fn abort(&self, run: &PreparedRun, message: &str) -> Result<()> {
        warn!(job_id = %run.job_id, message, "aborting run");
        self.store
            .update_job(&run.job_id, JobUpdate::failed(message))
            .await
    }

    /// Store one unit's mentions. A store failure is counted as skipped.
    async fn persist(&self, unit: &UnitResult) -> InsertStats {
        match self.store.batch_insert(&unit.mentions).await {
            Ok(stats) => {
                debug!(
                    entity_id = unit.entity.id,
                    inserted = stats.inserted,
                    skipped = stats.skipped,
                    "mentions persisted"
                );
                stats
            }
            Err(e) => {
                warn!(
                    entity_id = unit.entity.id,
                    mentions = unit.mentions.len(),
                    error = %e,
                    "failed to persist mentions"
                );
                InsertStats {
                    inserted: 0,
                    skipped: unit.mentions.len() as u64,
                }
            }
        }
    }
}

/// search → fetch all → build mentions, for one entity.
#[instrument(skip_all, fields(entity_id = entity.id, entity = %entity.name))]
async fn harvest_entity(search: &SearchClient, fetch: &FetchEngine, entity: Entity) -> UnitResult {
    let urls = match search.search(&entity.name).await {
        Ok(urls) => urls,
        Err(e) => {
            warn!(error = %e, "search failed, entity yields no mentions");
            return UnitResult::empty(entity, true);
        }
    };

    if urls.is_empty() {
        info!("search returned no candidate URLs");
        return UnitResult::empty(entity, false);
    }

    let report = fetch.fetch_all(urls).await;
    let urls_attempted = report.attempted();
    let mentions = build_mentions(&entity, report.successes);

    info!(
        mentions = mentions.len(),
        failed = report.failures.len(),
        "entity harvested"
    );

    UnitResult {
        entity,
        mentions,
        failures: report.failures,
        urls_attempted,
        search_failed: false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use url::Url;
    use uuid::Uuid;

    use harvester_fetch::{PageFetcher, RawPage};
    use harvester_search::{KeyRotator, SearchProvider};
    use harvester_shared::{FetchConfig, SearchConfig};
    use harvester_storage::Storage;

    use super::*;

    const ARTICLE: &str = "<html><body><nav>首頁</nav><p>今晚在台北舉行演唱會，現場歌迷熱情支持，\
        氣氛非常熱烈，主辦單位表示門票在開賣十分鐘內全數售罄，創下場館新紀錄。</p></body></html>";

    /// Returns `per_entity` URLs under the entity's name, or an error for
    /// names listed in `quota_exhausted`.
    struct FakeSearch {
        per_entity: usize,
        quota_exhausted: Vec<&'static str>,
    }

    #[async_trait]
    impl SearchProvider for FakeSearch {
        async fn query(
            &self,
            text: &str,
            _credential: &Credential,
            page_start: usize,
            page_size: usize,
        ) -> Result<Vec<String>> {
            if self.quota_exhausted.contains(&text) {
                return Err(HarvestError::Provider("Quota exceeded".into()));
            }
            let first = page_start - 1;
            let last = (first + page_size).min(self.per_entity);
            Ok((first..last)
                .map(|i| format!("https://news.example/{text}/{i}"))
                .collect())
        }
    }

    /// Records which API key each query used. Finds nothing, after a short
    /// pause so that every unit of a batch is in flight at once.
    #[derive(Default)]
    struct KeyCountingSearch {
        per_key: Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl SearchProvider for KeyCountingSearch {
        async fn query(&self, _: &str, credential: &Credential, _: usize, _: usize) -> Result<Vec<String>> {
            *self
                .per_key
                .lock()
                .unwrap()
                .entry(credential.api_key.clone())
                .or_default() += 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Vec::new())
        }
    }

    /// Panics when asked about `name`; finds nothing for everyone else.
    struct PanickingSearch {
        name: &'static str,
    }

    #[async_trait]
    impl SearchProvider for PanickingSearch {
        async fn query(&self, text: &str, _: &Credential, _: usize, _: usize) -> Result<Vec<String>> {
            if text == self.name {
                panic!("provider client bug");
            }
            Ok(Vec::new())
        }
    }

    /// Serves the article for every URL except the second result (`.../1`),
    /// which is a 404.
    struct FakeFetcher;

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch(&self, url: &Url, _timeout: Duration) -> Result<RawPage> {
            if url.path().ends_with("/1") {
                return Ok(RawPage {
                    status_code: 404,
                    content_type: "text/html".into(),
                    body: String::new(),
                });
            }
            Ok(RawPage {
                status_code: 200,
                content_type: "text/html; charset=utf-8".into(),
                body: ARTICLE.into(),
            })
        }
    }

    /// Delegates to a real store but can fail chosen operations.
    struct FlakyStore {
        inner: Storage,
        fail_roster: bool,
        fail_inserts: bool,
        fail_running: bool,
        created: Mutex<Vec<JobId>>,
    }

    impl FlakyStore {
        fn new(inner: Storage) -> Self {
            Self {
                inner,
                fail_roster: false,
                fail_inserts: false,
                fail_running: false,
                created: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MentionStore for FlakyStore {
        async fn list_entities(&self) -> Result<Vec<Entity>> {
            if self.fail_roster {
                return Err(HarvestError::Storage("connection refused".into()));
            }
            self.inner.list_entities().await
        }
        async fn create_job(&self, entity_id: Option<i64>) -> Result<JobId> {
            let job_id = self.inner.create_job(entity_id).await?;
            self.created.lock().unwrap().push(job_id.clone());
            Ok(job_id)
        }
        async fn update_job(&self, job_id: &JobId, update: JobUpdate) -> Result<()> {
            if self.fail_running && update.status == Some(JobStatus::Running) {
                return Err(HarvestError::Storage("database is locked".into()));
            }
            self.inner.update_job(job_id, update).await
        }
        async fn batch_insert(&self, mentions: &[Mention]) -> Result<InsertStats> {
            if self.fail_inserts {
                return Err(HarvestError::Storage("disk I/O error".into()));
            }
            self.inner.batch_insert(mentions).await
        }
        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        batches: AtomicUsize,
        finished: Mutex<HashMap<i64, u64>>,
    }

    impl ProgressReporter for RecordingProgress {
        fn run_started(&self, _job_id: &JobId, _entities: usize, _batches: usize) {}
        fn batch_started(&self, _index: usize, _total: usize, _size: usize) {
            self.batches.fetch_add(1, Ordering::SeqCst);
        }
        fn entity_finished(&self, entity: &Entity, inserted: u64, _failed_urls: usize) {
            self.finished.lock().unwrap().insert(entity.id, inserted);
        }
        fn done(&self, _summary: &RunSummary) {}
    }

    async fn test_storage(roster: &[Entity]) -> Storage {
        let tmp = std::env::temp_dir().join(format!("harvester_core_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.expect("open test db");
        storage.import_entities(roster).await.unwrap();
        storage
    }

    fn harvester(store: Arc<dyn MentionStore>, search: FakeSearch, batch_size: usize) -> Harvester {
        harvester_with(store, Arc::new(search), 1, batch_size, 4)
    }

    fn harvester_with(
        store: Arc<dyn MentionStore>,
        search: Arc<dyn SearchProvider>,
        keys: usize,
        batch_size: usize,
        worker_count: usize,
    ) -> Harvester {
        let credentials = (0..keys)
            .map(|i| Credential::new(format!("key-{i}"), format!("cx-{i}")))
            .collect();
        let search = SearchClient::new(
            search,
            Arc::new(KeyRotator::new(credentials).unwrap()),
            RetryPolicy::immediate(2),
            &SearchConfig::default(),
        );
        let fetch = FetchEngine::new(
            Arc::new(FakeFetcher),
            RetryPolicy::immediate(2),
            ExtractOptions::default(),
            &FetchConfig::default(),
        );
        Harvester::new(
            store,
            Arc::new(search),
            Arc::new(fetch),
            PipelineConfig {
                worker_count,
                batch_size,
            },
        )
    }

    fn two_stars() -> Vec<Entity> {
        vec![Entity::new(1, "周杰倫"), Entity::new(2, "林志玲")]
    }

    #[test]
    fn batches_cover_roster_in_order() {
        let roster: Vec<Entity> = (1..=47).map(|i| Entity::new(i, format!("e{i}"))).collect();
        for size in [1, 2, 5, 20, 46, 47, 48, 100] {
            let batches = split_into_batches(&roster, size);
            assert_eq!(batches.len(), roster.len().div_ceil(size), "size {size}");
            assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= size));
            let flat: Vec<Entity> = batches.into_iter().flatten().collect();
            assert_eq!(flat, roster);
        }
    }

    #[test]
    fn batching_edge_cases() {
        assert!(split_into_batches(&[], 20).is_empty());
        let one = vec![Entity::new(1, "a")];
        assert_eq!(split_into_batches(&one, 0).len(), 1);
    }

    #[test]
    fn scope_selection() {
        let roster: Vec<Entity> = (1..=5).map(|i| Entity::new(i, format!("e{i}"))).collect();

        let from = RunScope::FromEntity(3).select(roster.clone()).unwrap();
        assert_eq!(from.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4, 5]);

        let single = RunScope::Entity(2).select(roster.clone()).unwrap();
        assert_eq!(single, vec![Entity::new(2, "e2")]);

        assert!(RunScope::Entity(9).select(roster.clone()).is_err());
        assert!(RunScope::FromEntity(6).select(roster).is_err());
        assert!(RunScope::All.select(Vec::new()).is_err());

        assert_eq!(RunScope::Entity(2).job_entity(), Some(2));
        assert_eq!(RunScope::All.job_entity(), None);
    }

    #[tokio::test]
    async fn quota_error_for_one_entity_does_not_block_the_next() {
        let storage = Arc::new(test_storage(&two_stars()).await);
        let search = FakeSearch {
            per_entity: 3,
            quota_exhausted: vec!["周杰倫"],
        };
        let harvester = harvester(storage.clone(), search, 1);
        let progress = RecordingProgress::default();

        let run = harvester.prepare(RunScope::All).await.unwrap();
        let summary = harvester.execute(&run, &progress).await;

        assert_eq!(summary.batches, 2);
        assert!(!summary.is_total_failure());
        assert_eq!(progress.batches.load(Ordering::SeqCst), 2);
        assert_eq!(summary.entities_failed, 1);
        // 林志玲: URLs 0 and 2 stored, URL 1 is a 404.
        assert_eq!(summary.mentions_inserted, 2);
        assert_eq!(summary.urls_processed, 3);
        assert_eq!(summary.failed_urls.len(), 1);
        assert!(summary.failed_urls[0].url.ends_with("/1"));

        assert_eq!(storage.count_mentions(1).await.unwrap(), 0);
        assert_eq!(storage.count_mentions(2).await.unwrap(), 2);
        let finished = progress.finished.lock().unwrap().clone();
        assert_eq!(finished.get(&1), Some(&0));
        assert_eq!(finished.get(&2), Some(&2));

        let job = storage.get_job(&run.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.entity_id, None);
        assert_eq!(job.mentions_found, 2);
        assert_eq!(job.urls_processed, 3);
        assert!(job.end_time.is_some());
    }

    #[tokio::test]
    async fn rerun_skips_stored_mentions() {
        let storage = Arc::new(test_storage(&two_stars()).await);
        let make = || FakeSearch {
            per_entity: 4,
            quota_exhausted: Vec::new(),
        };

        let first = harvester(storage.clone(), make(), 20);
        let run = first.prepare(RunScope::All).await.unwrap();
        let summary = first.execute(&run, &SilentProgress).await;
        assert_eq!(summary.mentions_inserted, 6);
        assert_eq!(summary.mentions_skipped, 0);

        let second = harvester(storage.clone(), make(), 20);
        let run = second.prepare(RunScope::All).await.unwrap();
        let summary = second.execute(&run, &SilentProgress).await;
        assert_eq!(summary.mentions_inserted, 0);
        assert_eq!(summary.mentions_skipped, 6);
        assert_eq!(storage.count_mentions(1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn mentions_carry_page_metadata() {
        let storage = Arc::new(test_storage(&two_stars()).await);
        let search = FakeSearch {
            per_entity: 1,
            quota_exhausted: Vec::new(),
        };
        let harvester = harvester(storage.clone(), search, 20);

        let run = harvester.prepare(RunScope::Entity(2)).await.unwrap();
        assert_eq!(run.roster, vec![Entity::new(2, "林志玲")]);
        harvester.execute(&run, &SilentProgress).await;

        let stored = storage.list_mentions(2).await.unwrap();
        assert_eq!(stored.len(), 1);
        let m = &stored[0];
        assert_eq!(m.original_url, "https://news.example/林志玲/0");
        assert_eq!(m.domain, "news.example");
        assert!(m.cleaned_text.contains("演唱會"));
        assert!(!m.cleaned_text.contains("首頁"));
        assert_eq!(m.content_length, m.cleaned_text.chars().count());
        assert!((0.0..=1.0).contains(&m.extraction_confidence));

        let job = storage.get_job(&run.job_id).await.unwrap().unwrap();
        assert_eq!(job.entity_id, Some(2));
    }

    #[tokio::test]
    async fn store_failures_mid_run_are_counted_not_fatal() {
        let inner = test_storage(&two_stars()).await;
        let store = Arc::new(FlakyStore {
            fail_inserts: true,
            ..FlakyStore::new(inner)
        });
        let search = FakeSearch {
            per_entity: 3,
            quota_exhausted: Vec::new(),
        };
        let harvester = harvester(store.clone(), search, 1);

        let run = harvester.prepare(RunScope::All).await.unwrap();
        let summary = harvester.execute(&run, &SilentProgress).await;

        assert_eq!(summary.mentions_inserted, 0);
        assert_eq!(summary.mentions_skipped, 4);
        assert!(!summary.is_total_failure());
        let job = store.inner.get_job(&run.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn roster_failure_is_fatal_before_job_creation() {
        let inner = test_storage(&two_stars()).await;
        let store = Arc::new(FlakyStore {
            fail_roster: true,
            ..FlakyStore::new(inner)
        });
        let search = FakeSearch {
            per_entity: 3,
            quota_exhausted: Vec::new(),
        };
        let harvester = harvester(store, search, 1);

        let err = harvester.prepare(RunScope::All).await.unwrap_err();
        assert!(matches!(err, HarvestError::Storage(_)));
    }

    #[tokio::test]
    async fn unknown_entity_is_rejected() {
        let storage = Arc::new(test_storage(&two_stars()).await);
        let search = FakeSearch {
            per_entity: 3,
            quota_exhausted: Vec::new(),
        };
        let harvester = harvester(storage, search, 1);

        let err = harvester.prepare(RunScope::Entity(42)).await.unwrap_err();
        assert!(matches!(err, HarvestError::Validation { .. }));
    }

    #[tokio::test]
    async fn every_search_failing_is_total_failure() {
        let storage = Arc::new(test_storage(&two_stars()).await);
        let search = FakeSearch {
            per_entity: 3,
            quota_exhausted: vec!["周杰倫", "林志玲"],
        };
        let harvester = harvester(storage.clone(), search, 20);

        let run = harvester.prepare(RunScope::All).await.unwrap();
        let summary = harvester.execute(&run, &SilentProgress).await;

        assert_eq!(summary.entities_failed, 2);
        assert!(summary.is_total_failure());
        // The run itself still completes; the outcome is reported, not raised.
        let job = storage.get_job(&run.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn abort_marks_job_failed() {
        let storage = Arc::new(test_storage(&two_stars()).await);
        let search = FakeSearch {
            per_entity: 3,
            quota_exhausted: Vec::new(),
        };
        let harvester = harvester(storage.clone(), search, 1);

        let run = harvester.prepare(RunScope::FromEntity(2)).await.unwrap();
        assert_eq!(run.roster.len(), 1);
        harvester.abort(&run, "interrupted").await.unwrap();

        let job = storage.get_job(&run.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("interrupted"));
        assert!(job.end_time.is_some());
    }

    fn roster(n: i64) -> Vec<Entity> {
        (1..=n).map(|i| Entity::new(i, format!("entity-{i}"))).collect()
    }

    #[tokio::test]
    async fn concurrent_units_spread_queries_over_all_keys() {
        let storage = Arc::new(test_storage(&roster(10)).await);
        let search = Arc::new(KeyCountingSearch::default());
        let harvester = harvester_with(storage, search.clone(), 5, 10, 20);

        let run = harvester.prepare(RunScope::All).await.unwrap();
        harvester.execute(&run, &SilentProgress).await;

        let per_key = search.per_key.lock().unwrap().clone();
        assert_eq!(per_key.len(), 5, "{per_key:?}");
        assert!(per_key.values().all(|&n| n == 2), "{per_key:?}");
    }

    #[tokio::test]
    async fn uneven_rosters_stay_within_one_query_per_key() {
        // 7 entities over 3 keys in batches of 4: each key gets 2 or 3 queries.
        let storage = Arc::new(test_storage(&roster(7)).await);
        let search = Arc::new(KeyCountingSearch::default());
        let harvester = harvester_with(storage, search.clone(), 3, 4, 20);

        let run = harvester.prepare(RunScope::All).await.unwrap();
        harvester.execute(&run, &SilentProgress).await;

        let per_key = search.per_key.lock().unwrap().clone();
        assert_eq!(per_key.len(), 3, "{per_key:?}");
        assert_eq!(per_key.values().sum::<usize>(), 7);
        assert!(per_key.values().all(|&n| (2..=3).contains(&n)), "{per_key:?}");
    }

    #[tokio::test]
    async fn panicking_unit_counts_as_failed_entity() {
        let storage = Arc::new(test_storage(&two_stars()).await);
        let harvester = harvester_with(
            storage.clone(),
            Arc::new(PanickingSearch { name: "周杰倫" }),
            1,
            20,
            4,
        );

        let run = harvester.prepare(RunScope::All).await.unwrap();
        let summary = harvester.execute(&run, &SilentProgress).await;

        assert_eq!(summary.entities, 2);
        assert_eq!(summary.entities_failed, 1);
        assert!(summary.is_total_failure());
        let job = storage.get_job(&run.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn job_that_cannot_start_is_closed_as_failed() {
        let inner = test_storage(&two_stars()).await;
        let store = Arc::new(FlakyStore {
            fail_running: true,
            ..FlakyStore::new(inner)
        });
        let search = FakeSearch {
            per_entity: 3,
            quota_exhausted: Vec::new(),
        };
        let harvester = harvester(store.clone(), search, 1);

        let err = harvester.prepare(RunScope::All).await.unwrap_err();
        assert!(matches!(err, HarvestError::Storage(_)));

        let job_id = store.created.lock().unwrap()[0].clone();
        let job = store.inner.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("database is locked"));
        assert!(job.end_time.is_some());
    }
}
