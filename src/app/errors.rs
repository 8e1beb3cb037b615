use crate::content::StoreError;
use crate::semantic::{EmbeddingError, RefreshError};
use crate::sources::SourceError;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("{source_name} unavailable: {message}")]
    SourceUnavailable { source_name: String, message: String },

    #[error("{source_name} daily quota exceeded")]
    QuotaExceeded { source_name: String },

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("module {0} not found")]
    ModuleNotFound(String),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<SourceError> for EngineError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::SourceUnavailable { source_name, message } => {
                EngineError::SourceUnavailable { source_name, message }
            }
            SourceError::QuotaExceeded { source_name } => EngineError::QuotaExceeded { source_name },
        }
    }
}

impl From<RefreshError> for EngineError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Embedding(e) => EngineError::Embedding(e),
            RefreshError::Store(e) => EngineError::Store(e),
        }
    }
}
