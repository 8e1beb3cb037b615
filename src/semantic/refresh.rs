//! Embedding refresh for modules and content items lacking current vectors.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::config::EmbeddingConfig;
use crate::content::{ContentStore, ModuleStore, NewEmbedding, StoreError};
use crate::semantic::embeddings::{Embedder, EmbeddingError};

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub embedded: usize,
    /// Items with no text to embed
    pub skipped_empty: usize,
    /// Items whose text changed while the batch was being embedded
    pub discarded: usize,
}

pub struct EmbeddingRefresher {
    embedder: Arc<dyn Embedder>,
    modules: Arc<ModuleStore>,
    contents: Arc<ContentStore>,
    clock: Arc<dyn Clock>,
    config: EmbeddingConfig,
}

/// (id, text_hash at read time, text)
type Pending = (u64, u64, String);

impl EmbeddingRefresher {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        modules: Arc<ModuleStore>,
        contents: Arc<ContentStore>,
        clock: Arc<dyn Clock>,
        config: EmbeddingConfig,
    ) -> Self {
        Self {
            embedder,
            modules,
            contents,
            clock,
            config,
        }
    }

    /// Embed every module without a current vector.
    pub fn refresh_modules(&self) -> Result<RefreshReport, RefreshError> {
        let mut report = RefreshReport::default();
        let mut pending = vec![];

        for module in self.modules.needing_embedding() {
            match module.embedding_text() {
                Some(text) => pending.push((module.id, module.embedding.text_hash, text)),
                None => {
                    log::debug!("module {} ({}) has no text to embed", module.id, module.code);
                    report.skipped_empty += 1;
                }
            }
        }

        self.embed_in_batches(pending, &mut report, |batch| {
            self.modules.set_embeddings(batch, self.clock.now())
        })?;

        Ok(report)
    }

    /// Embed stale and recently touched content first, then backfill the
    /// oldest never-embedded items up to the configured limit.
    pub fn refresh_contents(&self) -> Result<RefreshReport, RefreshError> {
        let limit = self.config.refresh_limit;
        let window = chrono::Duration::days(self.config.refresh_window_days);

        let mut items = self.contents.find_stale_or_recent(window, self.clock.now(), limit);
        if items.len() < limit {
            let seen: HashSet<u64> = items.iter().map(|i| i.id).collect();
            let backfill = self
                .contents
                .find_missing_embeddings(limit)
                .into_iter()
                .filter(|i| !seen.contains(&i.id))
                .take(limit - items.len());
            items.extend(backfill);
        }

        let mut report = RefreshReport::default();
        let mut pending = vec![];
        for item in items {
            match item.embedding_text(self.config.max_body_chars) {
                Some(text) => pending.push((item.id, item.embedding.text_hash, text)),
                None => {
                    log::debug!("content {} has no text to embed", item.id);
                    report.skipped_empty += 1;
                }
            }
        }

        self.embed_in_batches(pending, &mut report, |batch| {
            self.contents.set_embeddings(batch, self.clock.now())
        })?;

        Ok(report)
    }

    fn embed_in_batches(
        &self,
        pending: Vec<Pending>,
        report: &mut RefreshReport,
        mut apply: impl FnMut(Vec<NewEmbedding>) -> Result<usize, StoreError>,
    ) -> Result<(), RefreshError> {
        for chunk in pending.chunks(self.config.batch_size.max(1)) {
            let texts: Vec<String> = chunk.iter().map(|(_, _, text)| text.clone()).collect();
            let vectors = self.embedder.embed_many(&texts)?;

            let batch: Vec<NewEmbedding> = chunk
                .iter()
                .zip(vectors)
                .map(|((id, text_hash, _), vector)| NewEmbedding {
                    id: *id,
                    text_hash: *text_hash,
                    vector,
                })
                .collect();

            let applied = apply(batch)?;
            report.embedded += applied;
            report.discarded += chunk.len() - applied;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::content::{EmbeddingStatus, ModuleDefinition, NewContent, SourceType};
    use crate::semantic::embeddings::{FailingEmbedder, HashingEmbedder};
    use crate::storage::{BackendLocal, StorageManager};

    struct Fixture {
        _tmp: tempfile::TempDir,
        clock: Arc<ManualClock>,
        modules: Arc<ModuleStore>,
        contents: Arc<ContentStore>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(tmp.path()).unwrap());
        let embedder = HashingEmbedder::new(32);
        Fixture {
            clock: Arc::new(ManualClock::at("2024-05-01T10:00:00Z")),
            modules: Arc::new(ModuleStore::open(storage.clone(), embedder.model_id_hash()).unwrap()),
            contents: Arc::new(ContentStore::open(storage, embedder.model_id_hash()).unwrap()),
            _tmp: tmp,
        }
    }

    impl Fixture {
        fn refresher(&self, embedder: Arc<dyn Embedder>, config: EmbeddingConfig) -> EmbeddingRefresher {
            EmbeddingRefresher::new(
                embedder,
                self.modules.clone(),
                self.contents.clone(),
                self.clock.clone(),
                config,
            )
        }

        fn add_content(&self, key: &str, title: &str) -> u64 {
            self.contents
                .upsert(
                    NewContent {
                        natural_key: key.to_string(),
                        title: title.to_string(),
                        description: "about software".to_string(),
                        body_excerpt: String::new(),
                        url: String::new(),
                        source_name: "test".to_string(),
                        source_type: SourceType::News,
                        categories: Default::default(),
                        authors: vec![],
                        published_at: None,
                    },
                    self.clock.now(),
                )
                .unwrap()
                .id
        }
    }

    #[test]
    fn test_refresh_embeds_modules_and_skips_blank() {
        let f = fixture();
        f.modules
            .sync_definitions(
                vec![
                    ModuleDefinition {
                        code: "CS1".to_string(),
                        name: "Algorithms".to_string(),
                        description: "Sorting and searching".to_string(),
                        keywords: vec!["graphs".to_string()],
                    },
                    ModuleDefinition {
                        code: "EMPTY".to_string(),
                        name: "Placeholder".to_string(),
                        description: String::new(),
                        keywords: vec![],
                    },
                ],
                f.clock.now(),
            )
            .unwrap();

        let refresher = f.refresher(Arc::new(HashingEmbedder::new(32)), EmbeddingConfig::default());
        let report = refresher.refresh_modules().unwrap();

        assert_eq!(report.embedded, 1);
        assert_eq!(report.skipped_empty, 1);
        let cs1 = f.modules.get_by_code("CS1").unwrap();
        assert_eq!(f.modules.embedding_status(cs1.id), Some(EmbeddingStatus::Current));

        // nothing left to do
        assert_eq!(refresher.refresh_modules().unwrap().embedded, 0);
    }

    #[test]
    fn test_refresh_contents_respects_limit_and_batches() {
        let f = fixture();
        for i in 0..5 {
            f.add_content(&format!("k{i}"), &format!("Story {i}"));
        }

        let embedder = Arc::new(HashingEmbedder::new(32));
        let config = EmbeddingConfig {
            refresh_limit: 3,
            batch_size: 2,
            ..Default::default()
        };
        let refresher = f.refresher(embedder.clone(), config);

        assert_eq!(refresher.refresh_contents().unwrap().embedded, 3);
        assert_eq!(f.contents.embedded_count(), 3);
        assert_eq!(embedder.call_count(), 3);

        assert_eq!(refresher.refresh_contents().unwrap().embedded, 2);
        assert!(f.contents.find_missing_embeddings(10).is_empty());
    }

    #[test]
    fn test_edited_content_is_reembedded() {
        let f = fixture();
        let id = f.add_content("k1", "Original");
        let refresher = f.refresher(Arc::new(HashingEmbedder::new(32)), EmbeddingConfig::default());
        refresher.refresh_contents().unwrap();
        let before = f.contents.embedding(id).unwrap();

        f.add_content("k1", "Rewritten headline");
        assert_eq!(f.contents.embedding_status(id), Some(EmbeddingStatus::Stale));

        assert_eq!(refresher.refresh_contents().unwrap().embedded, 1);
        assert_ne!(f.contents.embedding(id).unwrap(), before);
    }

    #[test]
    fn test_model_failure_is_reported() {
        let f = fixture();
        f.add_content("k1", "Story");
        let refresher = f.refresher(Arc::new(FailingEmbedder), EmbeddingConfig::default());

        let err = refresher.refresh_contents().unwrap_err();
        assert!(matches!(err, RefreshError::Embedding(EmbeddingError::ModelFailure(_))));
        assert_eq!(f.contents.embedded_count(), 0);
    }
}
