//! Credibility Scoring Engine.
//!
//! Ranks an entity against the whole corpus: every profile's raw score is
//! collected into a sorted `StatisticsSnapshot`, and an entity's percentile
//! is its position in that distribution. Percentiles map onto tiers 1..=5.
//!
//! Snapshots are expensive to build, so they are built on demand and cached
//! in memory and in `credibility_stats.json`. A snapshot built before the
//! latest change to the collection is still served, flagged as stale.

mod metrics;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use metrics::{Distribution, EducationHistogram, EntityMetrics, ExperienceHistogram};

use crate::config::CredibilityConfig;
use crate::document::Document;
use crate::errors::StoreError;
use crate::store::DocumentStore;

pub const STATS_FILE: &str = "credibility_stats.json";

/// Tier given when the corpus is too small or the entity has no metrics
pub const NEUTRAL_TIER: u8 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Raw scores, ascending
    pub scores: Vec<f64>,
    pub computed_at: DateTime<Utc>,
    pub distribution: Distribution,
    /// Collection generation the snapshot was built at. Unknown for
    /// snapshots loaded from disk.
    #[serde(skip)]
    pub generation: Option<u64>,
}

impl StatisticsSnapshot {
    pub fn build(documents: &[Document], config: &CredibilityConfig, generation: u64) -> Self {
        let metrics: Vec<EntityMetrics> = documents
            .iter()
            .filter_map(|d| d.metadata.as_ref().and_then(EntityMetrics::from_metadata))
            .collect();

        let mut scores: Vec<f64> = metrics.iter().map(|m| m.raw_score(&config.weights)).collect();
        scores.sort_by(f64::total_cmp);

        Self {
            scores,
            computed_at: Utc::now(),
            distribution: Distribution::from_metrics(&metrics),
            generation: Some(generation),
        }
    }

    pub fn corpus_size(&self) -> usize {
        self.scores.len()
    }

    /// Share of the corpus scoring at or below `raw_score`, in [0, 100].
    pub fn percentile(&self, raw_score: f64) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        let rank = self.scores.partition_point(|s| s.total_cmp(&raw_score).is_le());
        100.0 * rank as f64 / self.scores.len() as f64
    }

    pub fn is_stale(&self, generation: u64) -> bool {
        self.generation != Some(generation)
    }
}

/// Map a percentile to a tier. A percentile sitting exactly on a threshold
/// gets the higher tier.
pub fn tier_for(percentile: f64, thresholds: &[f64; 4]) -> u8 {
    thresholds
        .iter()
        .zip([5u8, 4, 3, 2])
        .find(|(threshold, _)| percentile >= **threshold)
        .map(|(_, tier)| tier)
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredibilityProfile {
    pub entity_id: String,
    pub raw_metrics: Option<EntityMetrics>,
    pub raw_score: Option<f64>,
    pub percentile: Option<f64>,
    pub tier: u8,
    pub low_confidence: bool,
    pub stale: bool,
}

impl CredibilityProfile {
    /// Tier scaled to [0, 1].
    pub fn normalized(&self) -> f64 {
        f64::from(self.tier.clamp(1, 5) - 1) / 4.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSummary {
    pub corpus_size: usize,
    pub computed_at: DateTime<Utc>,
    pub low_confidence: bool,
    pub stale: bool,
    pub distribution: Distribution,
}

pub struct CredibilityEngine {
    config: CredibilityConfig,
    path: PathBuf,
    cached: Mutex<Option<Arc<StatisticsSnapshot>>>,
}

impl CredibilityEngine {
    /// Engine caching its statistics in `base/credibility_stats.json`.
    pub fn open(config: CredibilityConfig, base: &Path) -> Self {
        let path = base.join(STATS_FILE);
        let cached = match load_snapshot(&path) {
            Ok(snapshot) => snapshot.map(Arc::new),
            Err(err) => {
                log::warn!("ignoring unreadable {}: {err}", path.display());
                None
            }
        };
        Self {
            config,
            path,
            cached: Mutex::new(cached),
        }
    }

    pub fn config(&self) -> &CredibilityConfig {
        &self.config
    }

    fn cached(&self) -> Option<Arc<StatisticsSnapshot>> {
        match self.cached.lock() {
            Ok(cached) => cached.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_cached(&self, snapshot: Option<Arc<StatisticsSnapshot>>) {
        match self.cached.lock() {
            Ok(mut cached) => *cached = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    /// Rebuild the snapshot from the current collection.
    pub fn refresh_statistics(&self, store: &DocumentStore) -> Result<Arc<StatisticsSnapshot>, StoreError> {
        // read the generation first so a concurrent write marks us stale
        let generation = store.generation();
        let documents = store.documents()?;
        let snapshot = Arc::new(StatisticsSnapshot::build(&documents, &self.config, generation));

        if let Err(err) = save_snapshot(&self.path, &snapshot) {
            log::warn!("failed to persist credibility statistics: {err}");
        }
        log::info!(
            "credibility statistics refreshed over {} entities",
            snapshot.corpus_size()
        );

        self.set_cached(Some(snapshot.clone()));
        Ok(snapshot)
    }

    /// Cached snapshot, built now if there is none.
    pub fn snapshot(&self, store: &DocumentStore) -> Result<Arc<StatisticsSnapshot>, StoreError> {
        match self.cached() {
            Some(snapshot) => Ok(snapshot),
            None => self.refresh_statistics(store),
        }
    }

    /// Drop the cached snapshot so the next read rebuilds it.
    pub fn invalidate(&self) {
        self.set_cached(None);
    }

    pub fn summary(&self, snapshot: &StatisticsSnapshot, generation: u64) -> StatisticsSummary {
        StatisticsSummary {
            corpus_size: snapshot.corpus_size(),
            computed_at: snapshot.computed_at,
            low_confidence: snapshot.corpus_size() < self.config.min_corpus,
            stale: snapshot.is_stale(generation),
            distribution: snapshot.distribution.clone(),
        }
    }

    pub fn score(
        &self,
        entity_id: &str,
        metrics: Option<EntityMetrics>,
        snapshot: &StatisticsSnapshot,
        stale: bool,
    ) -> CredibilityProfile {
        let low_confidence = snapshot.corpus_size() < self.config.min_corpus;

        let Some(metrics) = metrics else {
            return CredibilityProfile {
                entity_id: entity_id.to_string(),
                raw_metrics: None,
                raw_score: None,
                percentile: None,
                tier: NEUTRAL_TIER,
                low_confidence,
                stale,
            };
        };

        let raw_score = metrics.raw_score(&self.config.weights);
        let (percentile, tier) = if low_confidence {
            (None, NEUTRAL_TIER)
        } else {
            let percentile = snapshot.percentile(raw_score);
            (Some(percentile), tier_for(percentile, &self.config.tier_thresholds))
        };

        CredibilityProfile {
            entity_id: entity_id.to_string(),
            raw_metrics: Some(metrics),
            raw_score: Some(raw_score),
            percentile,
            tier,
            low_confidence,
            stale,
        }
    }

    pub fn score_document(
        &self,
        document: &Document,
        snapshot: &StatisticsSnapshot,
        stale: bool,
    ) -> CredibilityProfile {
        let metrics = document.metadata.as_ref().and_then(EntityMetrics::from_metadata);
        self.score(&document.id, metrics, snapshot, stale)
    }
}

fn load_snapshot(path: &Path) -> Result<Option<StatisticsSnapshot>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    let snapshot: StatisticsSnapshot = serde_json::from_slice(&data)?;
    Ok(Some(snapshot))
}

fn save_snapshot(path: &Path, snapshot: &StatisticsSnapshot) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Internal(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, snapshot)?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}
