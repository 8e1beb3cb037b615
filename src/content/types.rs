use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::semantic::{content_text, module_text, text_hash};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    News,
    Academic,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::News => write!(f, "news"),
            SourceType::Academic => write!(f, "academic"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    /// Never embedded
    Missing,
    /// Embedded once, text changed since
    Stale,
    Current,
}

/// Embedding bookkeeping shared by modules and content items.
///
/// The vector itself lives in the owning store's `VectorIndex`; these fields
/// record which text it was produced from and when it was last scored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingState {
    /// Hash of the current text fields, recomputed on load
    #[serde(default)]
    pub text_hash: u64,
    /// Hash of the text the stored vector was produced from
    #[serde(default)]
    pub embedded_hash: Option<u64>,
    #[serde(default)]
    pub embedded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scored_at: Option<DateTime<Utc>>,
}

impl EmbeddingState {
    /// `has_vector` tells whether the store holds a vector for the current hash.
    pub fn status(&self, has_vector: bool) -> EmbeddingStatus {
        match self.embedded_hash {
            Some(hash) if hash == self.text_hash && has_vector => EmbeddingStatus::Current,
            Some(hash) if hash != self.text_hash => EmbeddingStatus::Stale,
            // hash matches but the vector file was discarded
            Some(_) => EmbeddingStatus::Missing,
            None => EmbeddingStatus::Missing,
        }
    }

    /// Embedded after the last scoring pass that covered it.
    pub fn needs_scoring(&self) -> bool {
        match (self.embedded_at, self.scored_at) {
            (Some(embedded), Some(scored)) => scored < embedded,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: u64,
    /// Source URL or source-native id, unique across the store
    pub natural_key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub body_excerpt: String,
    #[serde(default)]
    pub url: String,
    pub source_name: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub embedding: EmbeddingState,
}

impl ContentItem {
    pub fn compute_text_hash(&self) -> u64 {
        text_hash(&[&self.title, &self.description, &self.body_excerpt])
    }

    pub fn embedding_text(&self, max_body_chars: usize) -> Option<String> {
        content_text(&self.title, &self.description, &self.body_excerpt, max_body_chars)
    }
}

/// Normalized item produced by ingestion, before it has an id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewContent {
    pub natural_key: String,
    pub title: String,
    pub description: String,
    pub body_excerpt: String,
    pub url: String,
    pub source_name: String,
    pub source_type: SourceType,
    pub categories: BTreeSet<String>,
    pub authors: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub id: u64,
    pub created: bool,
    /// Embedding-relevant text changed, the old vector was dropped
    pub text_changed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: u64,
    /// Curriculum code, the key used by definition sync
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub embedding: EmbeddingState,
}

impl Module {
    /// Only description and keywords feed the embedding; renaming a module
    /// does not invalidate it.
    pub fn compute_text_hash(&self) -> u64 {
        text_hash(&[&self.description, &self.keywords.join("\u{1e}")])
    }

    pub fn embedding_text(&self) -> Option<String> {
        module_text(&self.description, &self.keywords)
    }
}

/// Module as written by curriculum setup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelevanceRecord {
    pub module_id: u64,
    pub content_id: u64,
    pub score: f32,
    pub updated_at: DateTime<Utc>,
}

/// Engagement event written by the presentation layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub user_id: String,
    pub content_id: u64,
    #[serde(default)]
    pub module_id: Option<u64>,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_status_transitions() {
        let mut state = EmbeddingState {
            text_hash: 1,
            ..Default::default()
        };
        assert_eq!(state.status(false), EmbeddingStatus::Missing);

        state.embedded_hash = Some(1);
        assert_eq!(state.status(true), EmbeddingStatus::Current);
        assert_eq!(state.status(false), EmbeddingStatus::Missing);

        state.text_hash = 2;
        assert_eq!(state.status(true), EmbeddingStatus::Stale);
    }

    #[test]
    fn test_needs_scoring() {
        let mut state = EmbeddingState::default();
        assert!(!state.needs_scoring());

        state.embedded_at = Some(ts("2024-05-01T10:00:00Z"));
        assert!(state.needs_scoring());

        state.scored_at = Some(ts("2024-05-01T11:00:00Z"));
        assert!(!state.needs_scoring());

        state.embedded_at = Some(ts("2024-05-02T10:00:00Z"));
        assert!(state.needs_scoring());
    }

    #[test]
    fn test_module_hash_ignores_name() {
        let now = ts("2024-05-01T10:00:00Z");
        let mut module = Module {
            id: 1,
            code: "CS101".to_string(),
            name: "Intro".to_string(),
            description: "Programming basics".to_string(),
            keywords: vec!["loops".to_string()],
            created_at: now,
            updated_at: now,
            embedding: EmbeddingState::default(),
        };
        let before = module.compute_text_hash();

        module.name = "Introduction".to_string();
        assert_eq!(module.compute_text_hash(), before);

        module.description = "Programming fundamentals".to_string();
        assert_ne!(module.compute_text_hash(), before);
    }

    #[test]
    fn test_interaction_event_type_field() {
        let json = r#"{"user_id":"u1","content_id":4,"type":"view","created_at":"2024-05-01T10:00:00Z"}"#;
        let event: InteractionEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, "view");
        assert_eq!(event.module_id, None);
    }
}
