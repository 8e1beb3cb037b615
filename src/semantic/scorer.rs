//! Module x content relevance scoring.
//!
//! Scores are cosine similarities between stored embeddings. The scorer
//! never embeds anything itself: a pair with a missing side is counted as
//! skipped and picked up again once the embedding lands.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::clock::Clock;
use crate::content::{ContentStore, ModuleStore, RelevanceRecord, RelevanceStore, StoreError};
use crate::semantic::index::{cosine_similarity, VectorIndex};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecomputeReport {
    pub modules: usize,
    pub contents: usize,
    pub pairs_scored: usize,
    /// Pairs with at least one embedding missing
    pub skipped: usize,
}

impl RecomputeReport {
    fn absorb(&mut self, other: RecomputeReport) {
        self.modules = self.modules.max(other.modules);
        self.contents += other.contents;
        self.pairs_scored += other.pairs_scored;
        self.skipped += other.skipped;
    }
}

/// Position in a full-recompute pass: the last `(embedded_at, content_id)`
/// that was scored.
pub type Checkpoint = (DateTime<Utc>, u64);

pub struct RelevanceScorer {
    modules: Arc<ModuleStore>,
    contents: Arc<ContentStore>,
    relevance: Arc<RelevanceStore>,
    clock: Arc<dyn Clock>,
}

impl RelevanceScorer {
    pub fn new(
        modules: Arc<ModuleStore>,
        contents: Arc<ContentStore>,
        relevance: Arc<RelevanceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            modules,
            contents,
            relevance,
            clock,
        }
    }

    /// Cosine similarity of the pair, 0.0 when either embedding is absent.
    pub fn score_pair(&self, module_id: u64, content_id: u64) -> f32 {
        match (self.modules.embedding(module_id), self.contents.embedding(content_id)) {
            (Some(m), Some(c)) => cosine_similarity(&m, &c),
            _ => 0.0,
        }
    }

    /// Score the full cross-product of the given ids and upsert every pair
    /// where both sides are embedded.
    pub fn recompute_batch(
        &self,
        module_ids: &[u64],
        content_ids: &[u64],
    ) -> Result<RecomputeReport, StoreError> {
        let module_rows = self.modules.with_vectors(|v| v.subset(module_ids));
        let content_rows = self.contents.with_vectors(|v| v.subset(content_ids));

        let total = module_ids.len() * content_ids.len();
        let scorable = module_rows.len() * content_rows.len();
        let report = RecomputeReport {
            modules: module_ids.len(),
            contents: content_ids.len(),
            pairs_scored: scorable,
            skipped: total.saturating_sub(scorable),
        };

        if report.skipped > 0 {
            log::debug!(
                "relevance: {} pairs skipped for missing embeddings",
                report.skipped
            );
        }
        if scorable == 0 {
            return Ok(report);
        }

        let records = score_cross_product(&module_rows, &content_rows, self.clock.now());
        self.relevance.upsert_many(records)?;

        Ok(report)
    }

    /// Score changed content against every module. The default path after
    /// ingestion: cost is linear in the number of changed items.
    pub fn recompute_incremental(&self, changed_content_ids: &[u64]) -> Result<RecomputeReport, StoreError> {
        if changed_content_ids.is_empty() {
            return Ok(RecomputeReport::default());
        }

        let module_ids = self.modules.ids();
        let report = self.recompute_batch(&module_ids, changed_content_ids)?;

        let scored: Vec<u64> = self
            .contents
            .with_vectors(|v| changed_content_ids.iter().copied().filter(|id| v.contains(*id)).collect());
        self.contents.mark_scored(&scored, self.clock.now())?;

        Ok(report)
    }

    /// Score re-embedded modules against every embedded content item.
    pub fn recompute_for_modules(&self, module_ids: &[u64]) -> Result<RecomputeReport, StoreError> {
        if module_ids.is_empty() {
            return Ok(RecomputeReport::default());
        }

        let content_ids = self.contents.embedded_ids();
        let report = self.recompute_batch(module_ids, &content_ids)?;

        let scored: Vec<u64> = self
            .modules
            .with_vectors(|v| module_ids.iter().copied().filter(|id| v.contains(*id)).collect());
        self.modules.mark_scored(&scored, self.clock.now())?;

        Ok(report)
    }

    /// Modules and content embedded since their last scoring, both sides.
    pub fn recompute_pending(&self, content_limit: usize) -> Result<RecomputeReport, StoreError> {
        let mut report = RecomputeReport::default();

        let modules = self.modules.find_unscored();
        if !modules.is_empty() {
            report.absorb(self.recompute_for_modules(&modules)?);
        }

        let contents = self.contents.find_unscored(content_limit);
        if !contents.is_empty() {
            report.absorb(self.recompute_incremental(&contents)?);
        }

        Ok(report)
    }

    /// One bounded step of a full recompute: the next `chunk_size` embedded
    /// items after `checkpoint`, oldest first, against every module.
    ///
    /// Returns the new checkpoint, or `None` once the pass is complete.
    pub fn recompute_chunk(
        &self,
        checkpoint: Option<Checkpoint>,
        chunk_size: usize,
    ) -> Result<(RecomputeReport, Option<Checkpoint>), StoreError> {
        let frontier = self.contents.embedded_after(checkpoint, chunk_size);
        let Some(last) = frontier.last().copied() else {
            return Ok((RecomputeReport::default(), None));
        };

        let content_ids: Vec<u64> = frontier.iter().map(|(_, id)| *id).collect();
        let report = self.recompute_incremental(&content_ids)?;

        Ok((report, Some(last)))
    }

    /// Drive `recompute_chunk` to the end of the corpus.
    pub fn recompute_all(
        &self,
        chunk_size: usize,
        mut on_chunk: impl FnMut(&RecomputeReport),
    ) -> Result<RecomputeReport, StoreError> {
        let mut total = RecomputeReport::default();
        let mut checkpoint = None;

        loop {
            let (report, next) = self.recompute_chunk(checkpoint, chunk_size)?;
            let Some(next) = next else {
                break;
            };
            on_chunk(&report);
            total.absorb(report);
            checkpoint = Some(next);
        }

        Ok(total)
    }
}

fn score_cross_product(
    modules: &VectorIndex,
    contents: &VectorIndex,
    now: DateTime<Utc>,
) -> Vec<RelevanceRecord> {
    let content_rows: Vec<_> = contents.iter().collect();

    content_rows
        .par_iter()
        .flat_map_iter(|content| {
            modules.iter().map(move |module| RelevanceRecord {
                module_id: module.id,
                content_id: content.id,
                score: cosine_similarity(module.embedding, content.embedding),
                updated_at: now,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::content::{ModuleDefinition, NewContent, NewEmbedding, SourceType};
    use crate::storage::{BackendLocal, StorageManager};

    struct Fixture {
        _tmp: tempfile::TempDir,
        clock: Arc<ManualClock>,
        modules: Arc<ModuleStore>,
        contents: Arc<ContentStore>,
        relevance: Arc<RelevanceStore>,
        scorer: RelevanceScorer,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(tmp.path()).unwrap());
        let clock = Arc::new(ManualClock::at("2024-05-01T10:00:00Z"));
        let modules = Arc::new(ModuleStore::open(storage.clone(), [1; 32]).unwrap());
        let contents = Arc::new(ContentStore::open(storage.clone(), [1; 32]).unwrap());
        let relevance = Arc::new(RelevanceStore::open(storage).unwrap());
        let scorer = RelevanceScorer::new(
            modules.clone(),
            contents.clone(),
            relevance.clone(),
            clock.clone(),
        );
        Fixture {
            _tmp: tmp,
            clock,
            modules,
            contents,
            relevance,
            scorer,
        }
    }

    impl Fixture {
        fn module(&self, code: &str, vector: Option<Vec<f32>>) -> u64 {
            self.modules
                .sync_definitions(
                    vec![ModuleDefinition {
                        code: code.to_string(),
                        name: code.to_string(),
                        description: format!("{code} description"),
                        keywords: vec![],
                    }],
                    self.clock.now(),
                )
                .unwrap();
            let module = self.modules.get_by_code(code).unwrap();
            if let Some(vector) = vector {
                self.modules
                    .set_embeddings(
                        vec![NewEmbedding {
                            id: module.id,
                            text_hash: module.embedding.text_hash,
                            vector,
                        }],
                        self.clock.now(),
                    )
                    .unwrap();
            }
            module.id
        }

        fn content(&self, key: &str, vector: Option<Vec<f32>>) -> u64 {
            let outcome = self
                .contents
                .upsert(
                    NewContent {
                        natural_key: key.to_string(),
                        title: key.to_string(),
                        description: String::new(),
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
                .unwrap();
            if let Some(vector) = vector {
                let text_hash = self.contents.get(outcome.id).unwrap().embedding.text_hash;
                self.contents
                    .set_embeddings(
                        vec![NewEmbedding {
                            id: outcome.id,
                            text_hash,
                            vector,
                        }],
                        self.clock.now(),
                    )
                    .unwrap();
            }
            outcome.id
        }
    }

    #[test]
    fn test_score_pair_without_embedding_is_zero() {
        let f = fixture();
        let m = f.module("M", Some(vec![1.0, 0.0]));
        let a = f.content("A", Some(vec![1.0, 0.0]));
        let c = f.content("C", None);

        assert!((f.scorer.score_pair(m, a) - 1.0).abs() < 1e-6);
        assert_eq!(f.scorer.score_pair(m, c), 0.0);
        assert_eq!(f.scorer.score_pair(99, a), 0.0);
    }

    #[test]
    fn test_batch_skips_missing_pairs() {
        let f = fixture();
        let m1 = f.module("M1", Some(vec![1.0, 0.0]));
        let m2 = f.module("M2", None);
        let a = f.content("A", Some(vec![1.0, 0.0]));
        let b = f.content("B", Some(vec![0.0, 1.0]));
        let c = f.content("C", None);

        let report = f.scorer.recompute_batch(&[m1, m2], &[a, b, c]).unwrap();
        assert_eq!(report.pairs_scored, 2);
        assert_eq!(report.skipped, 4);
        assert_eq!(f.relevance.count(), 2);
        assert!(f.relevance.get(m1, c).is_none());
        assert_eq!(f.relevance.get(m1, b).unwrap().score, 0.0);
    }

    #[test]
    fn test_incremental_matches_full_recompute() {
        let f = fixture();
        let m1 = f.module("M1", Some(vec![1.0, 0.0, 0.0]));
        let m2 = f.module("M2", Some(vec![0.2, 0.9, 0.1]));
        let a = f.content("A", Some(vec![0.5, 0.5, 0.0]));
        let b = f.content("B", Some(vec![0.0, 0.3, 0.9]));

        f.scorer.recompute_incremental(&[a, b]).unwrap();
        let incremental: Vec<f32> = [(m1, a), (m1, b), (m2, a), (m2, b)]
            .iter()
            .map(|(m, c)| f.relevance.get(*m, *c).unwrap().score)
            .collect();

        f.clock.advance(chrono::Duration::minutes(5));
        f.scorer.recompute_batch(&[m1, m2], &[a, b]).unwrap();
        let full: Vec<f32> = [(m1, a), (m1, b), (m2, a), (m2, b)]
            .iter()
            .map(|(m, c)| f.relevance.get(*m, *c).unwrap().score)
            .collect();

        assert_eq!(incremental, full);
        for ((m, c), score) in [(m1, a), (m1, b), (m2, a), (m2, b)].iter().zip(&full) {
            assert_eq!(f.scorer.score_pair(*m, *c), *score);
        }
    }

    #[test]
    fn test_pending_scores_new_content_once() {
        let f = fixture();
        f.module("M", Some(vec![1.0, 0.0]));
        f.content("A", Some(vec![1.0, 0.0]));

        // cold start: the module pass and the content pass both cover (M, A)
        let first = f.scorer.recompute_pending(100).unwrap();
        assert_eq!(first.pairs_scored, 2);

        let second = f.scorer.recompute_pending(100).unwrap();
        assert_eq!(second, RecomputeReport::default());

        // a module embedded later is scored against the existing corpus
        f.clock.advance(chrono::Duration::minutes(1));
        let late = f.module("LATE", Some(vec![0.0, 1.0]));
        let third = f.scorer.recompute_pending(100).unwrap();
        assert_eq!(third.pairs_scored, 1);
        assert!(f.relevance.for_module(late, -1.0).len() == 1);
    }

    #[test]
    fn test_chunked_full_recompute_walks_oldest_first() {
        let f = fixture();
        f.module("M", Some(vec![1.0, 0.0]));
        let mut ids = vec![];
        for i in 0..5 {
            ids.push(f.content(&format!("item-{i}"), Some(vec![1.0, i as f32])));
            f.clock.advance(chrono::Duration::seconds(1));
        }

        let (r1, cp1) = f.scorer.recompute_chunk(None, 2).unwrap();
        assert_eq!(r1.pairs_scored, 2);
        assert_eq!(cp1.unwrap().1, ids[1]);

        let (_, cp2) = f.scorer.recompute_chunk(cp1, 2).unwrap();
        assert_eq!(cp2.unwrap().1, ids[3]);

        let (r3, cp3) = f.scorer.recompute_chunk(cp2, 2).unwrap();
        assert_eq!(r3.pairs_scored, 1);
        assert_eq!(cp3.unwrap().1, ids[4]);

        let (r4, done) = f.scorer.recompute_chunk(cp3, 2).unwrap();
        assert_eq!(r4, RecomputeReport::default());
        assert!(done.is_none());

        let mut chunks = 0;
        let total = f.scorer.recompute_all(2, |_| chunks += 1).unwrap();
        assert_eq!(chunks, 3);
        assert_eq!(total.pairs_scored, 5);
        assert_eq!(f.relevance.count(), 5);
    }
}
