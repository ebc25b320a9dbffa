//! - `Embedder`: the `embed(texts) -> vectors` seam the store uses
//! - `EmbeddingModel`: local fastembed model, cached under the base path

use fastembed::{InitOptions, TextEmbedding};
use std::path::Path;
use std::sync::Mutex;

use crate::errors::StoreError;

/// Turns text into vectors. Implementations must be deterministic for a
/// given model so that re-ingesting the same document is idempotent.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// SHA256 of the model name, stamped into the collection file.
    fn model_id_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.name().as_bytes());
        hasher.finalize().into()
    }
}

/// fastembed's `embed` takes `&mut self`, hence the mutex.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding model failed to load: {0}")]
    InitFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    /// The embedding service could not be reached; worth retrying.
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),

    /// The embedding service refused the call (auth, quota).
    #[error("embedding request rejected: {0}")]
    Rejected(String),

    #[error("unknown embedding model {0}")]
    InvalidModel(String),
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Unavailable(_))
    }
}

impl From<EmbeddingError> for StoreError {
    fn from(err: EmbeddingError) -> Self {
        if err.is_transient() {
            StoreError::Transient(err.to_string())
        } else {
            StoreError::Permanent(err.to_string())
        }
    }
}

impl EmbeddingModel {
    /// Load `model_name`, downloading it into `<base>/models` on first use.
    pub fn new(model_name: &str, base: &Path) -> Result<Self, EmbeddingError> {
        let model = lookup(model_name)?;

        let models_dir = base.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("cannot create {}: {e}", models_dir.display()))
        })?;

        let options = InitOptions::new(model)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);
        let mut model =
            TextEmbedding::try_new(options).map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        // the collection file records dimensions, so learn them up front
        let dimensions = model
            .embed(vec!["dimension check"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("dimension check failed: {e}")))?
            .first()
            .map(Vec::len)
            .ok_or_else(|| EmbeddingError::InitFailed("model returned no embedding".to_string()))?;

        log::info!("loaded embedding model {model_name} ({dimensions} dimensions)");

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }
}

/// Accepted spellings for each supported model.
const SUPPORTED: &[(&str, &[&str])] = &[
    ("all-MiniLM-L6-v2", &["all-minilm-l6-v2", "sentence-transformers/all-minilm-l6-v2"]),
    ("bge-small-en-v1.5", &["bge-small-en-v1.5", "baai/bge-small-en-v1.5"]),
    ("bge-base-en-v1.5", &["bge-base-en-v1.5", "baai/bge-base-en-v1.5"]),
    (
        "paraphrase-multilingual-MiniLM-L12-v2",
        &[
            "paraphrase-multilingual-minilm-l12-v2",
            "sentence-transformers/paraphrase-multilingual-minilm-l12-v2",
        ],
    ),
];

fn lookup(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    let wanted = name.to_lowercase();
    let canonical = SUPPORTED
        .iter()
        .find(|(_, aliases)| aliases.contains(&wanted.as_str()))
        .map(|(canonical, _)| *canonical);

    match canonical {
        Some("all-MiniLM-L6-v2") => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        Some("bge-small-en-v1.5") => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        Some("bge-base-en-v1.5") => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        Some("paraphrase-multilingual-MiniLM-L12-v2") => {
            Ok(fastembed::EmbeddingModel::ParaphraseMLMiniLML12V2)
        }
        _ => {
            let names: Vec<&str> = SUPPORTED.iter().map(|(canonical, _)| *canonical).collect();
            Err(EmbeddingError::InvalidModel(format!(
                "{name}, expected one of {}",
                names.join(", ")
            )))
        }
    }
}

impl Embedder for EmbeddingModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| EmbeddingError::EmbeddingFailed("model lock poisoned".to_string()))?;

        model
            .embed(texts, None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}
