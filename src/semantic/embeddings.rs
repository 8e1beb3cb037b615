//! Embedding generation.
//!
//! `Embedder` is the seam the engine embeds through; `FastEmbedder` wraps
//! fastembed and loads the model on first use, downloading it if needed.

use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::time::Duration;

use fastembed::{InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Cannot embed empty text")]
    EmptyInput,

    #[error("Embedding generation failed: {0}")]
    ModelFailure(String),

    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// Embed one text. Blank text is `EmptyInput`, never a zero vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a batch; output order matches input order.
    fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// SHA256 of the model name, stamped into vector files.
    fn model_id_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.model_name().as_bytes());
        hasher.finalize().into()
    }
}

fn ensure_not_blank<S: AsRef<str>>(texts: &[S]) -> Result<(), EmbeddingError> {
    if texts.iter().any(|t| t.as_ref().trim().is_empty()) {
        return Err(EmbeddingError::EmptyInput);
    }
    Ok(())
}

/// fastembed-backed embedder.
/// The model sits behind a Mutex because fastembed's embed() requires &mut self.
pub struct FastEmbedder {
    model_name: String,
    model_enum: fastembed::EmbeddingModel,
    cache_dir: PathBuf,
    download_timeout: Duration,
    batch_size: usize,
    model: Mutex<ModelSlot<TextEmbedding>>,
}

/// Model loading state. A load that outlives the download timeout keeps
/// running on its thread and is picked up by a later call.
enum ModelSlot<M> {
    Empty,
    Loading(mpsc::Receiver<Result<M, EmbeddingError>>),
    Ready(M),
}

impl<M: Send + 'static> ModelSlot<M> {
    fn ready(
        &mut self,
        timeout: Duration,
        load: impl FnOnce() -> Result<M, EmbeddingError> + Send + 'static,
    ) -> Result<&mut M, EmbeddingError> {
        if let ModelSlot::Empty = self {
            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                let _ = tx.send(load());
            });
            *self = ModelSlot::Loading(rx);
        }

        if let ModelSlot::Loading(rx) = self {
            match rx.recv_timeout(timeout) {
                Ok(Ok(model)) => *self = ModelSlot::Ready(model),
                Ok(Err(err)) => {
                    *self = ModelSlot::Empty;
                    return Err(err);
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(EmbeddingError::InitFailed(format!(
                        "model not ready after {}s, still loading",
                        timeout.as_secs()
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    *self = ModelSlot::Empty;
                    return Err(EmbeddingError::InitFailed("model loader exited".to_string()));
                }
            }
        }

        match self {
            ModelSlot::Ready(model) => Ok(model),
            _ => Err(EmbeddingError::InitFailed("model not loaded".to_string())),
        }
    }
}

impl FastEmbedder {
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    /// Nothing is loaded until the first embed call.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Duration,
        batch_size: usize,
    ) -> Result<Self, EmbeddingError> {
        Ok(Self {
            model_name: model_name.to_string(),
            model_enum: parse_model_name(model_name)?,
            cache_dir,
            download_timeout,
            batch_size,
            model: Mutex::new(ModelSlot::Empty),
        })
    }

    fn with_model<T>(
        &self,
        f: impl FnOnce(&mut TextEmbedding) -> Result<T, EmbeddingError>,
    ) -> Result<T, EmbeddingError> {
        let mut guard = self
            .model
            .lock()
            .map_err(|e| EmbeddingError::ModelFailure(format!("Failed to acquire model lock: {e}")))?;

        let model_enum = self.model_enum.clone();
        let model_name = self.model_name.clone();
        let models_dir = self.cache_dir.join("models");
        let model = guard.ready(self.download_timeout, move || {
            load_model(model_enum, &model_name, models_dir)
        })?;
        f(model)
    }
}

fn load_model(
    model_enum: fastembed::EmbeddingModel,
    model_name: &str,
    models_dir: PathBuf,
) -> Result<TextEmbedding, EmbeddingError> {
    std::fs::create_dir_all(&models_dir).map_err(|e| {
        EmbeddingError::InitFailed(format!("Failed to create models directory: {e}"))
    })?;

    log::info!("loading embedding model {model_name}");

    let options = InitOptions::new(model_enum)
        .with_cache_dir(models_dir)
        .with_show_download_progress(true);

    TextEmbedding::try_new(options).map_err(|e| EmbeddingError::InitFailed(e.to_string()))
}

impl Embedder for FastEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        ensure_not_blank(&[text])?;

        let embeddings = self.with_model(|model| {
            model
                .embed(vec![text], None)
                .map_err(|e| EmbeddingError::ModelFailure(e.to_string()))
        })?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::ModelFailure("No embedding returned".to_string()))
    }

    fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        ensure_not_blank(texts)?;

        let embeddings = self.with_model(|model| {
            model
                .embed(texts.to_vec(), Some(self.batch_size))
                .map_err(|e| EmbeddingError::ModelFailure(e.to_string()))
        })?;

        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::ModelFailure(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }

        Ok(embeddings)
    }
}

fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l6-v2-q" | "allminiml6v2q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
        "all-minilm-l12-v2" | "allminilml12v2" => Ok(fastembed::EmbeddingModel::AllMiniLML12V2),
        "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {name}. Supported models: all-MiniLM-L6-v2, all-MiniLM-L12-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5"
        ))),
    }
}

/// Deterministic bag-of-words embedder for tests.
///
/// Each lowercase token lands in one of `dims` buckets picked by its SHA256,
/// so texts sharing words score high and unrelated texts score near zero.
#[cfg(test)]
pub struct HashingEmbedder {
    pub dims: usize,
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing-test"
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        ensure_not_blank(&[text])?;
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let mut v = vec![0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u16::from_le_bytes([digest[0], digest[1]]) as usize % self.dims;
            v[bucket] += 1.0;
        }

        let norm = crate::semantic::index::l2_norm(&v);
        if norm < f32::EPSILON {
            // punctuation-only text still needs a direction
            v[0] = 1.0;
        } else {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }

    fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        ensure_not_blank(texts)?;
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Embedder that always fails, for error-isolation tests.
#[cfg(test)]
pub struct FailingEmbedder;

#[cfg(test)]
impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing-test"
    }

    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::ModelFailure("model offline".to_string()))
    }

    fn embed_many(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::ModelFailure("model offline".to_string()))
    }
}
