use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::errors::EngineError;
use crate::app::scheduler::{TaskKind, TaskRunner};
use crate::app::selector::{Recommendation, RecommendationSelector};
use crate::app::status::{StateStore, TaskRecord};
use crate::clock::Clock;
use crate::config::Config;
use crate::content::{
    ContentItem, ContentStore, EmbeddingStatus, InteractionLog, Module, ModuleDefinition, ModuleStore,
    RelevanceStore, StoreError, SyncReport,
};
use crate::ingest::{IngestionOrchestrator, IngestionReport};
use crate::semantic::{Embedder, EmbeddingRefresher, RecomputeReport, RefreshReport, RelevanceScorer};
use crate::sources::{arxiv, news, RateLimiter, ResponseCache, SourceBudget, SourceClient, SourceGateway};
use crate::storage::{BackendLocal, StorageManager};

/// What a manual ingestion run targets.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum IngestTarget {
    Module { module_id: u64 },
    Keywords { keywords: Vec<String> },
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    pub last_run_times: BTreeMap<TaskKind, Option<DateTime<Utc>>>,
    pub tasks: BTreeMap<TaskKind, TaskRecord>,
    pub cache_size: usize,
    pub quota_used: BTreeMap<String, u32>,
    pub sources: Vec<String>,
    pub modules: usize,
    pub contents: usize,
    pub embedded_contents: usize,
    pub relevance_records: usize,
    pub full_recompute_checkpoint: Option<(DateTime<Utc>, u64)>,
    pub last_full_pass: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ModuleView {
    #[serde(flatten)]
    pub module: Module,
    pub embedding_status: EmbeddingStatus,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrendingContent {
    #[serde(flatten)]
    pub content: ContentItem,
    pub interactions: usize,
    pub last_interaction: DateTime<Utc>,
}

/// The relevance engine: stores, sources, embedding and scoring wired
/// together behind the operations the outside world calls.
pub struct Engine {
    config: Config,
    clock: Arc<dyn Clock>,
    modules: Arc<ModuleStore>,
    contents: Arc<ContentStore>,
    relevance: Arc<RelevanceStore>,
    interactions: Arc<InteractionLog>,
    gateway: Arc<SourceGateway>,
    orchestrator: IngestionOrchestrator,
    refresher: EmbeddingRefresher,
    scorer: RelevanceScorer,
    selector: RecommendationSelector,
    state: Arc<StateStore>,
}

impl Engine {
    pub fn open(
        config: Config,
        clients: Vec<Arc<dyn SourceClient>>,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let backend = BackendLocal::new(config.base_path()).map_err(StoreError::from)?;
        let storage: Arc<dyn StorageManager> = Arc::new(backend);
        let model_id = embedder.model_id_hash();

        let modules = Arc::new(ModuleStore::open(storage.clone(), model_id)?);
        let contents = Arc::new(ContentStore::open(storage.clone(), model_id)?);
        let relevance = Arc::new(RelevanceStore::open(storage.clone())?);
        let interactions = Arc::new(InteractionLog::new(storage.clone()));
        let state = Arc::new(StateStore::load(storage));

        let sources = &config.sources;
        let cache = Arc::new(ResponseCache::new(
            clock.clone(),
            Duration::from_secs(sources.cache_ttl_secs),
            sources.cache_max_entries,
        ));
        let limiter = Arc::new(RateLimiter::new(clock.clone()));
        limiter.register(
            news::NAME,
            SourceBudget {
                daily_quota: sources.news.daily_quota,
                min_interval: Duration::from_millis(sources.news.min_interval_ms),
            },
        );
        limiter.register(
            arxiv::NAME,
            SourceBudget {
                daily_quota: sources.arxiv.daily_quota,
                min_interval: Duration::from_millis(sources.arxiv.min_interval_ms),
            },
        );
        limiter.restore(&state.get().quota);
        let gateway = Arc::new(SourceGateway::new(
            cache,
            limiter,
            clock.clone(),
            sources.max_retries,
        ));

        let orchestrator = IngestionOrchestrator::new(
            gateway.clone(),
            clients,
            contents.clone(),
            interactions.clone(),
            clock.clone(),
            config.ingestion.clone(),
        );
        let refresher = EmbeddingRefresher::new(
            embedder,
            modules.clone(),
            contents.clone(),
            clock.clone(),
            config.embedding.clone(),
        );
        let scorer = RelevanceScorer::new(modules.clone(), contents.clone(), relevance.clone(), clock.clone());
        let selector = RecommendationSelector::new(
            modules.clone(),
            contents.clone(),
            relevance.clone(),
            config.relevance.threshold,
        );

        log::info!(
            "engine opened at {}: modules={} contents={} relevance_records={} sources={:?}",
            config.base_path().display(),
            modules.len(),
            contents.len(),
            relevance.count(),
            orchestrator.client_names()
        );

        Ok(Self {
            config,
            clock,
            modules,
            contents,
            relevance,
            interactions,
            gateway,
            orchestrator,
            refresher,
            scorer,
            selector,
            state,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn modules(&self) -> &Arc<ModuleStore> {
        &self.modules
    }

    pub fn contents(&self) -> &Arc<ContentStore> {
        &self.contents
    }

    pub fn relevance(&self) -> &Arc<RelevanceStore> {
        &self.relevance
    }

    pub fn state_store(&self) -> Arc<StateStore> {
        self.state.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Numeric id, else module code.
    pub fn resolve_module(&self, id_or_code: &str) -> Result<Module, EngineError> {
        let found = match id_or_code.trim().parse::<u64>() {
            Ok(id) => self.modules.get(id),
            Err(_) => None,
        };
        found
            .or_else(|| self.modules.get_by_code(id_or_code.trim()))
            .ok_or_else(|| EngineError::ModuleNotFound(id_or_code.to_string()))
    }

    pub fn list_modules(&self) -> Vec<ModuleView> {
        self.modules
            .list()
            .into_iter()
            .map(|module| ModuleView {
                embedding_status: self.modules.embedding_status(module.id).unwrap_or(EmbeddingStatus::Missing),
                module,
            })
            .collect()
    }

    pub fn sync_modules(&self, definitions: Vec<ModuleDefinition>) -> Result<SyncReport, EngineError> {
        let report = self.modules.sync_definitions(definitions, self.clock.now())?;
        log::info!(
            "modules synced: created={} updated={} unchanged={} invalidated={}",
            report.created,
            report.updated,
            report.unchanged,
            report.invalidated
        );
        Ok(report)
    }

    pub fn recommend_for_module(
        &self,
        module_id: u64,
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<Recommendation>, EngineError> {
        if self.modules.get(module_id).is_none() {
            return Err(EngineError::ModuleNotFound(module_id.to_string()));
        }
        Ok(self.selector.recommend_for_module(module_id, limit, threshold))
    }

    pub fn recommend_for_user(&self, module_ids: &[u64], limit: usize) -> Vec<Recommendation> {
        self.selector.recommend_for_user(module_ids, limit, None)
    }

    /// Manual ingestion run, outside the schedule.
    pub fn trigger_ingestion(&self, target: IngestTarget) -> Result<IngestionReport, EngineError> {
        self.refresh_modules_from_disk();

        let report = match target {
            IngestTarget::Module { module_id } => {
                let module = self
                    .modules
                    .get(module_id)
                    .ok_or_else(|| EngineError::ModuleNotFound(module_id.to_string()))?;
                self.orchestrator.ingest_module(&module)?
            }
            IngestTarget::Keywords { keywords } => self
                .orchestrator
                .ingest_keywords(&keywords, self.config.ingestion.keyword_fetch_count)?,
        };

        self.save_quota();
        log::info!("manual ingestion: {report}");
        Ok(report)
    }

    pub fn get_engine_status(&self) -> EngineStatus {
        let state = self.state.get();
        let last_run_times = TaskKind::ALL
            .iter()
            .map(|kind| {
                let last = state
                    .tasks
                    .get(kind)
                    .and_then(|t| t.last_run.as_ref())
                    .map(|r| r.started_at);
                (*kind, last)
            })
            .collect();

        EngineStatus {
            last_run_times,
            tasks: state.tasks,
            cache_size: self.gateway.cache().len(),
            quota_used: self.gateway.limiter().snapshot().used,
            sources: self.orchestrator.client_names(),
            modules: self.modules.len(),
            contents: self.contents.len(),
            embedded_contents: self.contents.embedded_count(),
            relevance_records: self.relevance.count(),
            full_recompute_checkpoint: state.checkpoint,
            last_full_pass: state.last_full_pass,
        }
    }

    /// Most-interacted content within the trending window.
    pub fn trending_content(&self, limit: usize) -> Result<Vec<TrendingContent>, EngineError> {
        let since = self.clock.now() - chrono::Duration::days(self.config.ingestion.trending_window_days);
        let top = self.interactions.top_content(since, limit)?;

        Ok(top
            .into_iter()
            .filter_map(|entry| {
                self.contents.get(entry.content_id).map(|content| TrendingContent {
                    content,
                    interactions: entry.interactions,
                    last_interaction: entry.last_interaction,
                })
            })
            .collect())
    }

    pub fn refresh_embeddings(&self) -> Result<(RefreshReport, RefreshReport), EngineError> {
        let modules = self.refresher.refresh_modules()?;
        let contents = self.refresher.refresh_contents()?;
        Ok((modules, contents))
    }

    pub fn recompute_incremental(&self) -> Result<RecomputeReport, EngineError> {
        Ok(self.scorer.recompute_pending(self.config.embedding.refresh_limit)?)
    }

    /// One bounded step of the rolling full recompute. A new pass starts
    /// only once the configured interval since the last one has elapsed.
    pub fn recompute_maintenance_step(&self) -> Result<Option<RecomputeReport>, EngineError> {
        let state = self.state.get();
        let now = self.clock.now();
        let interval = chrono::Duration::hours(self.config.relevance.full_recompute_interval_hours as i64);

        if state.checkpoint.is_none() {
            if let Some(last) = state.last_full_pass {
                if now - last < interval {
                    return Ok(None);
                }
            }
        }

        let (report, next) = self
            .scorer
            .recompute_chunk(state.checkpoint, self.config.relevance.full_recompute_chunk)?;

        self.state.update(|s| match next {
            Some(checkpoint) => s.checkpoint = Some(checkpoint),
            None => {
                s.checkpoint = None;
                s.last_full_pass = Some(now);
            }
        });
        if next.is_none() {
            log::info!("full recompute pass complete");
        }

        Ok(Some(report))
    }

    /// Complete full recompute in one go, chunked.
    pub fn recompute_full(&self, on_chunk: impl FnMut(&RecomputeReport)) -> Result<RecomputeReport, EngineError> {
        let report = self
            .scorer
            .recompute_all(self.config.relevance.full_recompute_chunk, on_chunk)?;
        let now = self.clock.now();
        self.state.update(|s| {
            s.checkpoint = None;
            s.last_full_pass = Some(now);
        });
        Ok(report)
    }

    fn refresh_modules_from_disk(&self) {
        match self.modules.refresh_if_changed() {
            Ok(true) => log::info!("modules reloaded from disk: {} modules", self.modules.len()),
            Ok(false) => {}
            Err(e) => log::error!("failed to reload modules: {e}"),
        }
    }

    fn save_quota(&self) {
        let snapshot = self.gateway.limiter().snapshot();
        self.state.update(|s| s.quota = snapshot);
    }

    fn run_module_ingestion(&self) -> anyhow::Result<IngestionReport> {
        let modules = self.modules.list();
        let mut report = IngestionReport::default();
        let mut failed = 0;

        for module in &modules {
            match self.orchestrator.ingest_module(module) {
                Ok(r) => report.merge(r),
                Err(e) => {
                    failed += 1;
                    log::error!("module {} ({}): ingestion failed: {e}", module.id, module.code);
                }
            }
        }

        if failed > 0 && failed == modules.len() {
            anyhow::bail!("ingestion failed for all {failed} modules");
        }
        Ok(report)
    }
}

impl TaskRunner for Engine {
    fn run_task(&self, kind: TaskKind) -> anyhow::Result<String> {
        let summary = match kind {
            TaskKind::BroadIngestion => {
                let report = self.orchestrator.ingest_broad();
                self.save_quota();
                report?.to_string()
            }
            TaskKind::ModuleIngestion => {
                let report = self.run_module_ingestion();
                self.save_quota();
                format!("modules={} {}", self.modules.len(), report?)
            }
            TaskKind::EmbeddingRefresh => {
                let (modules, contents) = self.refresh_embeddings()?;
                format!(
                    "modules_embedded={} contents_embedded={} skipped_empty={} discarded={}",
                    modules.embedded,
                    contents.embedded,
                    modules.skipped_empty + contents.skipped_empty,
                    modules.discarded + contents.discarded
                )
            }
            TaskKind::RelevanceIncremental => {
                let r = self.recompute_incremental()?;
                format!(
                    "modules={} contents={} pairs_scored={} skipped={}",
                    r.modules, r.contents, r.pairs_scored, r.skipped
                )
            }
            TaskKind::RelevanceMaintenance => match self.recompute_maintenance_step()? {
                Some(r) => format!("contents={} pairs_scored={}", r.contents, r.pairs_scored),
                None => "full pass not due".to_string(),
            },
        };
        Ok(summary)
    }

    fn on_tick(&self, now: DateTime<Utc>) {
        if self.gateway.limiter().roll_over(now) {
            log::info!("daily quota reset for {}", now.date_naive());
            self.save_quota();
        }
        self.refresh_modules_from_disk();
    }
}
