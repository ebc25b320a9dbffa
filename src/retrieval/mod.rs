//! Retrieval Engine.
//!
//! Two stages:
//! 1. recall: embed the query and fetch the `initial_k` nearest documents
//!    matching the filters;
//! 2. precision: rescore each candidate with the cross-encoder, blended
//!    with the candidate's credibility tier, and keep the best `final_k`.
//!
//! When the cross-encoder is missing or fails, the recall order is returned
//! as is and the response is flagged `degraded`.

mod reranker;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use reranker::{FastReranker, RerankError, Reranker};

use crate::config::RetrievalConfig;
use crate::credibility::{CredibilityEngine, CredibilityProfile, EntityMetrics};
use crate::document::{DocumentMetadata, MetadataFilter};
use crate::errors::StoreError;
use crate::pool::{CancelFlag, WorkerPool};
use crate::store::{DocumentStore, QueryMatch};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub initial_k: Option<usize>,
    #[serde(default)]
    pub final_k: Option<usize>,
    #[serde(default)]
    pub filters: MetadataFilter,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub metadata: Option<DocumentMetadata>,
    pub score: f64,
    pub distance: f32,
    /// Cross-encoder logit; absent in degraded mode
    pub rerank_score: Option<f32>,
    pub credibility_tier: u8,
    pub credibility_percentile: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub degraded: bool,
    pub stale_statistics: bool,
    pub low_confidence: bool,
}

struct Candidate {
    hit: QueryMatch,
    credibility: CredibilityProfile,
}

pub struct RetrievalEngine {
    config: RetrievalConfig,
    reranker: Option<Arc<dyn Reranker>>,
    pool: Arc<WorkerPool>,
    rerank_timeout: Duration,
}

impl RetrievalEngine {
    pub fn new(config: RetrievalConfig, reranker: Option<Arc<dyn Reranker>>, pool: Arc<WorkerPool>) -> Self {
        let rerank_timeout = Duration::from_secs(config.rerank_timeout_secs);
        Self {
            config,
            reranker,
            pool,
            rerank_timeout,
        }
    }

    pub fn search(
        &self,
        store: &DocumentStore,
        credibility: &CredibilityEngine,
        request: &SearchRequest,
        cancel: &CancelFlag,
    ) -> Result<SearchResponse, StoreError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(StoreError::validation("query must not be empty"));
        }
        let final_k = request.final_k.unwrap_or(self.config.final_k);
        if final_k == 0 {
            return Err(StoreError::validation("final_k must be at least 1"));
        }
        let initial_k = request.initial_k.unwrap_or(self.config.initial_k).max(final_k);

        let vector = store.gateway().embed(query, cancel)?;
        let matches = store.query(&vector, initial_k, &request.filters, cancel)?;

        let snapshot = credibility.snapshot(store)?;
        let stale = snapshot.is_stale(store.generation());
        let low_confidence = snapshot.corpus_size() < credibility.config().min_corpus;

        let candidates: Vec<Candidate> = matches
            .into_iter()
            .map(|hit| {
                let metrics = hit.metadata.as_ref().and_then(EntityMetrics::from_metadata);
                let credibility = credibility.score(&hit.id, metrics, &snapshot, stale);
                Candidate { hit, credibility }
            })
            .collect();

        let (results, degraded) = if candidates.is_empty() {
            (vec![], false)
        } else {
            match self.rerank(query, &candidates, cancel)? {
                Some(scores) => (self.blend(candidates, &scores, final_k), false),
                None => (recall_order(candidates, final_k), true),
            }
        };

        Ok(SearchResponse {
            results,
            degraded,
            stale_statistics: stale,
            low_confidence,
        })
    }

    /// Cross-encoder scores, or `None` when the model cannot be used.
    /// Only cancellation is an error.
    fn rerank(
        &self,
        query: &str,
        candidates: &[Candidate],
        cancel: &CancelFlag,
    ) -> Result<Option<Vec<f32>>, StoreError> {
        let Some(reranker) = self.reranker.clone() else {
            log::warn!("no reranker available, serving recall order");
            return Ok(None);
        };

        let query = query.to_string();
        let documents: Vec<String> = candidates.iter().map(|c| c.hit.content.clone()).collect();
        let expected = documents.len();

        let result = self.pool.run("rerank", self.rerank_timeout, Some(cancel), move || {
            reranker
                .rerank(&query, &documents)
                .map_err(|e| StoreError::Transient(e.to_string()))
        });

        match result {
            Ok(scores) if scores.len() == expected => Ok(Some(scores)),
            Ok(scores) => {
                log::warn!(
                    "reranker returned {} scores for {expected} candidates, serving recall order",
                    scores.len()
                );
                Ok(None)
            }
            Err(StoreError::Cancelled) => Err(StoreError::Cancelled),
            Err(err) => {
                log::warn!("reranker unavailable, serving recall order: {err}");
                Ok(None)
            }
        }
    }

    fn blend(&self, candidates: Vec<Candidate>, scores: &[f32], final_k: usize) -> Vec<SearchHit> {
        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .zip(scores)
            .map(|(c, &logit)| {
                let score = self.config.rerank_weight * sigmoid(logit)
                    + self.config.credibility_weight * c.credibility.normalized();
                to_hit(c, score, Some(logit))
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.credibility_tier.cmp(&a.credibility_tier))
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(final_k);
        hits
    }
}

/// Recall order, scored by similarity.
fn recall_order(candidates: Vec<Candidate>, final_k: usize) -> Vec<SearchHit> {
    candidates
        .into_iter()
        .take(final_k)
        .map(|c| {
            let score = 1.0 - f64::from(c.hit.distance);
            to_hit(c, score, None)
        })
        .collect()
}

fn to_hit(candidate: Candidate, score: f64, rerank_score: Option<f32>) -> SearchHit {
    let Candidate { hit, credibility } = candidate;
    SearchHit {
        id: hit.id,
        content: hit.content,
        metadata: hit.metadata,
        score,
        distance: hit.distance,
        rerank_score,
        credibility_tier: credibility.tier,
        credibility_percentile: credibility.percentile,
    }
}

fn sigmoid(logit: f32) -> f64 {
    1.0 / (1.0 + (-f64::from(logit)).exp())
}
