//! Keyword-driven ingestion: which queries to issue, and how fetched items
//! become stored content.

pub mod keywords;
mod normalize;
mod orchestrator;

pub use normalize::{canonical_url, normalize};
pub use orchestrator::{IngestionOrchestrator, IngestionReport};
