//! Embedding generation, storage and relevance scoring.
//!
//! # Architecture
//!
//! - `embeddings`: `Embedder` seam and the fastembed-backed implementation
//! - `index`: dense in-memory embedding arena and cosine similarity
//! - `storage`: binary file I/O for `*_vectors.bin`
//! - `preprocess`: embedding input text and change-detection hashes
//! - `refresh`: regenerates missing and stale embeddings
//! - `scorer`: module x content relevance, full and incremental

pub mod embeddings;
mod index;
mod preprocess;
mod refresh;
mod scorer;
mod storage;

pub use embeddings::{Embedder, EmbeddingError, FastEmbedder};
pub use index::{cosine_similarity, IndexError, VectorIndex, VectorRef};
pub use preprocess::{content_text, module_text, text_hash, truncate_with_ellipsis};
pub use refresh::{EmbeddingRefresher, RefreshError, RefreshReport};
pub use scorer::{Checkpoint, RecomputeReport, RelevanceScorer};
pub use storage::{VectorStorage, VectorStorageError};
