//! Persistent collections owned by the engine: content items, modules,
//! relevance records, plus the read-only interaction log.

mod interactions;
mod modules;
mod relevance;
mod store;
mod types;

pub use interactions::{InteractionLog, TrendingEntry};
pub use modules::{ModuleStore, SyncReport};
pub use relevance::RelevanceStore;
pub use store::ContentStore;
pub use types::{
    ContentItem, EmbeddingState, EmbeddingStatus, InteractionEvent, Module, ModuleDefinition,
    NewContent, RelevanceRecord, SourceType, UpsertOutcome,
};

use crate::semantic::VectorStorageError;

pub const CONTENTS_FILE: &str = "contents.json";
pub const CONTENTS_JOURNAL_FILE: &str = "contents.journal.jsonl";
pub const CONTENT_VECTORS_FILE: &str = "content_vectors.bin";
pub const MODULES_FILE: &str = "modules.json";
pub const MODULE_VECTORS_FILE: &str = "module_vectors.bin";
pub const MODULE_MARKS_FILE: &str = "module_marks.json";
pub const RELEVANCE_FILE: &str = "relevance.csv";
pub const RELEVANCE_JOURNAL_FILE: &str = "relevance.journal.csv";
pub const INTERACTIONS_FILE: &str = "interactions.csv";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Vector storage error: {0}")]
    Vectors(#[from] VectorStorageError),

    #[error("{0} not found")]
    NotFound(String),
}

/// A journal is folded into its snapshot once it holds more entries than
/// this and more than the snapshot has live records.
pub const COMPACT_MIN_ENTRIES: usize = 1000;

/// One embedding ready to be attached, tagged with the text hash it was
/// computed from so late results for edited text are dropped.
#[derive(Clone, Debug)]
pub struct NewEmbedding {
    pub id: u64,
    pub text_hash: u64,
    pub vector: Vec<f32>,
}
