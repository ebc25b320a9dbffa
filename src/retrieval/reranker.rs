//! Cross-encoder relevance model for the precision stage.

use std::path::Path;
use std::sync::Mutex;

use fastembed::{RerankInitOptions, RerankerModel, TextRerank};

#[derive(Debug, thiserror::Error)]
pub enum RerankError {
    #[error("Reranker initialization failed: {0}")]
    InitFailed(String),

    #[error("Reranking failed: {0}")]
    Failed(String),

    #[error("Invalid reranker model: {0}")]
    InvalidModel(String),
}

/// Scores how relevant each document is to a query. Higher is more
/// relevant; the returned scores line up with `documents`.
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError>;
}

/// fastembed cross-encoder. Scores are raw logits.
pub struct FastReranker {
    model: Mutex<TextRerank>,
    model_name: String,
}

impl FastReranker {
    pub fn new(model_name: &str, cache_dir: &Path) -> Result<Self, RerankError> {
        let model = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            RerankError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = RerankInitOptions::new(model)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);
        let model = TextRerank::try_new(options).map_err(|e| RerankError::InitFailed(e.to_string()))?;

        log::info!("loaded reranker model {model_name}");

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
        })
    }

    fn parse_model_name(name: &str) -> Result<RerankerModel, RerankError> {
        match name.to_lowercase().as_str() {
            "bge-reranker-base" | "baai/bge-reranker-base" => Ok(RerankerModel::BGERerankerBase),
            "bge-reranker-v2-m3" | "rozgo/bge-reranker-v2-m3" => Ok(RerankerModel::BGERerankerV2M3),
            _ => Err(RerankError::InvalidModel(format!(
                "Unknown reranker model: {}. Supported: bge-reranker-base, bge-reranker-v2-m3",
                name
            ))),
        }
    }
}

impl Reranker for FastReranker {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError> {
        if documents.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self
            .model
            .lock()
            .map_err(|e| RerankError::Failed(format!("Failed to acquire model lock: {}", e)))?;

        let docs: Vec<&str> = documents.iter().map(String::as_str).collect();
        let results = model
            .rerank(query, docs.as_slice(), false, None)
            .map_err(|e| RerankError::Failed(e.to_string()))?;

        // results come back sorted by score; put them back in input order
        let mut scores = vec![f32::NEG_INFINITY; documents.len()];
        for result in results {
            match scores.get_mut(result.index) {
                Some(slot) => *slot = result.score,
                None => {
                    return Err(RerankError::Failed(format!(
                        "reranker returned index {} for {} documents",
                        result.index,
                        documents.len()
                    )))
                }
            }
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_name() {
        assert!(FastReranker::parse_model_name("bge-reranker-base").is_ok());
        assert!(FastReranker::parse_model_name("BGE-Reranker-Base").is_ok());
        assert!(matches!(
            FastReranker::parse_model_name("nope"),
            Err(RerankError::InvalidModel(_))
        ));
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_relevant_document_scores_higher() {
        let tmp = tempfile::tempdir().unwrap();
        let reranker = FastReranker::new("bge-reranker-base", tmp.path()).unwrap();
        let scores = reranker
            .rerank(
                "protein folding researcher",
                &[
                    "Pastry chef in Lyon".to_string(),
                    "Structural biologist working on protein folding".to_string(),
                ],
            )
            .unwrap();
        assert!(scores[1] > scores[0]);
    }
}
