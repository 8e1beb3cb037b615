use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::config::IngestionConfig;
use crate::content::{ContentStore, InteractionLog, Module, SourceType, StoreError};
use crate::ingest::keywords::{keyword_groups, rank_module_keywords, trending_keywords};
use crate::ingest::normalize::normalize;
use crate::sources::{FetchQuery, Provenance, SourceClient, SourceError, SourceGateway};

/// Keywords used when the grouped queries come back thin.
const FALLBACK_KEYWORDS: usize = 7;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestionReport {
    pub queries: usize,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    /// Queries answered from the cache, fresh or stale
    pub cached: usize,
    pub failed: usize,
    pub quota_denied: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trending_keywords: Vec<String>,
}

impl IngestionReport {
    pub fn merge(&mut self, other: IngestionReport) {
        self.queries += other.queries;
        self.fetched += other.fetched;
        self.created += other.created;
        self.updated += other.updated;
        self.cached += other.cached;
        self.failed += other.failed;
        self.quota_denied += other.quota_denied;
        self.trending_keywords.extend(other.trending_keywords);
    }
}

impl std::fmt::Display for IngestionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "queries={} fetched={} created={} updated={} cached={} failed={} quota_denied={}",
            self.queries, self.fetched, self.created, self.updated, self.cached, self.failed, self.quota_denied
        )
    }
}

/// Turns keyword sets into fetches and fetched items into stored content.
pub struct IngestionOrchestrator {
    gateway: Arc<SourceGateway>,
    clients: Vec<Arc<dyn SourceClient>>,
    contents: Arc<ContentStore>,
    interactions: Arc<InteractionLog>,
    clock: Arc<dyn Clock>,
    config: IngestionConfig,
}

impl IngestionOrchestrator {
    pub fn new(
        gateway: Arc<SourceGateway>,
        clients: Vec<Arc<dyn SourceClient>>,
        contents: Arc<ContentStore>,
        interactions: Arc<InteractionLog>,
        clock: Arc<dyn Clock>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            gateway,
            clients,
            contents,
            interactions,
            clock,
            config,
        }
    }

    pub fn client_names(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.name().to_string()).collect()
    }

    /// One fetch through the gateway, normalized and upserted.
    /// Returns the number of items stored.
    fn fetch_and_store(
        &self,
        client: &dyn SourceClient,
        query: FetchQuery,
        category: Option<&str>,
        report: &mut IngestionReport,
    ) -> Result<usize, StoreError> {
        report.queries += 1;
        let outcome = self.gateway.fetch(client, &query);

        match outcome.provenance {
            Provenance::Cached | Provenance::StaleFallback => report.cached += 1,
            Provenance::Fresh | Provenance::Empty => {}
        }
        match outcome.error {
            Some(SourceError::QuotaExceeded { .. }) => report.quota_denied += 1,
            Some(SourceError::SourceUnavailable { .. }) => report.failed += 1,
            None => {}
        }

        report.fetched += outcome.items.len();
        let batch: Vec<_> = outcome
            .items
            .into_iter()
            .filter_map(|item| normalize(item, category))
            .collect();

        let outcomes = self.contents.upsert_many(batch, self.clock.now())?;
        for o in &outcomes {
            if o.created {
                report.created += 1;
            } else {
                report.updated += 1;
            }
        }
        Ok(outcomes.len())
    }

    /// Targeted ingestion for one module.
    ///
    /// Each source gets one query per keyword group. If a source returns
    /// less than half the target, one more query with the top keywords
    /// tops it up.
    pub fn ingest_module(&self, module: &Module) -> Result<IngestionReport, StoreError> {
        let ranked = rank_module_keywords(module, self.config.module_top_keywords);
        let groups = keyword_groups(&module.name, &ranked);
        let target = self.config.module_fetch_count;
        let per_group = (target / groups.len().max(1)).max(1);

        log::info!(
            "ingesting module {} ({}): keywords={:?} groups={}",
            module.id,
            module.code,
            ranked,
            groups.len()
        );

        let mut report = IngestionReport::default();
        for client in &self.clients {
            let mut stored = 0;
            for group in &groups {
                let query = FetchQuery::new(client.build_query(group), per_group);
                stored += self.fetch_and_store(client.as_ref(), query, None, &mut report)?;
            }

            if stored < target / 2 && !ranked.is_empty() {
                let top = &ranked[..ranked.len().min(FALLBACK_KEYWORDS)];
                log::debug!(
                    "module {}: source={} returned {stored}/{target}, retrying with top keywords",
                    module.code,
                    client.name()
                );
                let query = FetchQuery::new(client.build_query(top), target - stored);
                self.fetch_and_store(client.as_ref(), query, None, &mut report)?;
            }
        }

        Ok(report)
    }

    /// One query per source for an explicit keyword set.
    pub fn ingest_keywords(&self, keywords: &[String], count: usize) -> Result<IngestionReport, StoreError> {
        let mut report = IngestionReport::default();
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Ok(report);
        }

        for client in &self.clients {
            let query = FetchQuery::new(client.build_query(&keywords), count);
            self.fetch_and_store(client.as_ref(), query, None, &mut report)?;
        }
        Ok(report)
    }

    /// Broad coverage: news categories, arXiv categories, general keywords,
    /// then the trending pass.
    pub fn ingest_broad(&self) -> Result<IngestionReport, StoreError> {
        let mut report = IngestionReport::default();

        for client in &self.clients {
            match client.source_type() {
                SourceType::News => {
                    for category in &self.config.news_categories {
                        let query = FetchQuery::category(category.clone(), self.config.category_fetch_count);
                        self.fetch_and_store(client.as_ref(), query, Some(category), &mut report)?;
                    }
                }
                SourceType::Academic => {
                    for code in &self.config.arxiv_categories {
                        let query = FetchQuery::new(code.clone(), self.config.arxiv_category_fetch_count);
                        self.fetch_and_store(client.as_ref(), query, None, &mut report)?;
                    }
                }
            }
        }

        for keyword in &self.config.general_keywords {
            report.merge(self.ingest_keywords(
                std::slice::from_ref(keyword),
                self.config.keyword_fetch_count,
            )?);
        }

        if self.config.trending_enabled {
            report.merge(self.ingest_trending()?);
        }

        Ok(report)
    }

    /// Keywords extracted from the most-interacted content, fetched as one
    /// extra query per source.
    pub fn ingest_trending(&self) -> Result<IngestionReport, StoreError> {
        let since = self.clock.now() - chrono::Duration::days(self.config.trending_window_days);
        let top = match self.interactions.top_content(since, self.config.trending_top_content) {
            Ok(top) => top,
            Err(e) => {
                log::warn!("trending: failed to read interactions: {e}");
                return Ok(IngestionReport::default());
            }
        };

        let ids: Vec<u64> = top.iter().map(|t| t.content_id).collect();
        let items = self.contents.get_many(&ids);
        let keywords = trending_keywords(&items, self.config.trending_keywords);
        if keywords.is_empty() {
            log::debug!("trending: no interactions in the last {} days", self.config.trending_window_days);
            return Ok(IngestionReport::default());
        }

        log::info!("trending keywords: {keywords:?}");
        let mut report = self.ingest_keywords(&keywords, self.config.trending_fetch_count)?;
        report.trending_keywords = keywords;
        Ok(report)
    }
}
