use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::content::{ContentItem, ContentStore, EmbeddingStatus, Module, ModuleStore, RelevanceRecord, RelevanceStore};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Recommendation {
    #[serde(flatten)]
    pub content: ContentItem,
    pub module_id: u64,
    pub score: f32,
}

/// Ranked content per module or per set of modules, read from persisted
/// relevance records.
pub struct RecommendationSelector {
    modules: Arc<ModuleStore>,
    contents: Arc<ContentStore>,
    relevance: Arc<RelevanceStore>,
    threshold: f32,
}

/// Score descending, then newer content first. Undated content sorts last.
fn rank(a: &Recommendation, b: &Recommendation) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| match (a.content.published_at, b.content.published_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then(a.content.id.cmp(&b.content.id))
}

impl RecommendationSelector {
    pub fn new(
        modules: Arc<ModuleStore>,
        contents: Arc<ContentStore>,
        relevance: Arc<RelevanceStore>,
        threshold: f32,
    ) -> Self {
        Self {
            modules,
            contents,
            relevance,
            threshold,
        }
    }

    /// A record is trusted only if both embeddings are current and it was
    /// written after the newer of the two.
    fn is_valid(&self, module: &Module, record: &RelevanceRecord, content: &ContentItem) -> bool {
        if self.modules.embedding_status(module.id) != Some(EmbeddingStatus::Current)
            || self.contents.embedding_status(content.id) != Some(EmbeddingStatus::Current)
        {
            return false;
        }
        [module.embedding.embedded_at, content.embedding.embedded_at]
            .into_iter()
            .flatten()
            .all(|embedded_at| record.updated_at >= embedded_at)
    }

    fn candidates(&self, module_id: u64, threshold: f32) -> Vec<Recommendation> {
        let Some(module) = self.modules.get(module_id) else {
            return vec![];
        };

        let records = self.relevance.for_module(module_id, threshold);
        let mut out = Vec::with_capacity(records.len());
        let mut invalid = 0;

        for record in records {
            let Some(content) = self.contents.get(record.content_id) else {
                continue;
            };
            if !self.is_valid(&module, &record, &content) {
                invalid += 1;
                continue;
            }
            out.push(Recommendation {
                content,
                module_id,
                score: record.score,
            });
        }

        if invalid > 0 {
            log::debug!("module {module_id}: ignored {invalid} outdated relevance records");
        }

        out.sort_by(rank);
        out
    }

    /// Top `limit` items for one module with score at or above the threshold.
    /// Unknown modules and modules without scores yield an empty list.
    pub fn recommend_for_module(&self, module_id: u64, limit: usize, threshold: Option<f32>) -> Vec<Recommendation> {
        let mut out = self.candidates(module_id, threshold.unwrap_or(self.threshold));
        out.truncate(limit);
        out
    }

    /// Union across modules, one entry per content item carrying its best
    /// module relationship.
    pub fn recommend_for_user(&self, module_ids: &[u64], limit: usize, threshold: Option<f32>) -> Vec<Recommendation> {
        let threshold = threshold.unwrap_or(self.threshold);
        let mut all: Vec<Recommendation> = module_ids
            .iter()
            .flat_map(|id| self.candidates(*id, threshold))
            .collect();
        all.sort_by(rank);

        let mut seen = HashSet::new();
        all.retain(|r| seen.insert(r.content.id));
        all.truncate(limit);
        all
    }
}
