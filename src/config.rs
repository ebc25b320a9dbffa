use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.yaml";

/// Default embedding model
const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";
/// Default cross-encoder used for the precision stage
const DEFAULT_RERANKER_MODEL: &str = "bge-reranker-base";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Largest number of documents embedded and written as one unit
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Live collection directory, relative to the base path
    #[serde(default = "default_collection_dir")]
    pub collection_dir: String,

    /// Snapshot history directory, relative to the base path
    #[serde(default = "default_history_dir")]
    pub history_dir: String,

    /// Timeout for a single backend write
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            collection_dir: default_collection_dir(),
            history_dir: default_history_dir(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

fn default_max_batch_size() -> usize {
    500
}

fn default_collection_dir() -> String {
    "collection".to_string()
}

fn default_history_dir() -> String {
    "history".to_string()
}

fn default_write_timeout_secs() -> u64 {
    15
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_embedding_timeout_secs() -> u64 {
    10
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    #[default]
    None,
    Dir,
    Http,
}

/// Durable blob store that snapshots are pushed to after each commit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    #[serde(default)]
    pub kind: RemoteKind,

    /// Directory path for `dir`, base URL for `http`
    #[serde(default)]
    pub location: Option<String>,

    /// Bearer token sent to an `http` remote
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            kind: RemoteKind::None,
            location: None,
            token: None,
            timeout_secs: default_remote_timeout_secs(),
        }
    }
}

fn default_remote_timeout_secs() -> u64 {
    30
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_factor() -> u32 {
    2
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyConfig {
    /// Worker pool size for network calls: "auto" or a positive integer
    #[serde(default = "default_pool_size")]
    pub pool_size: String,

    /// How long a caller waits for a contended lock
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

fn default_pool_size() -> String {
    "auto".to_string()
}

fn default_lock_timeout_secs() -> u64 {
    30
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CredibilityWeights {
    #[serde(default = "default_weight")]
    pub years_experience: f64,
    #[serde(default = "default_weight")]
    pub education: f64,
    #[serde(default = "default_weight")]
    pub seniority: f64,
}

impl Default for CredibilityWeights {
    fn default() -> Self {
        Self {
            years_experience: default_weight(),
            education: default_weight(),
            seniority: default_weight(),
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CredibilityConfig {
    #[serde(default)]
    pub weights: CredibilityWeights,

    /// Smallest corpus that produces real percentiles
    #[serde(default = "default_min_corpus")]
    pub min_corpus: usize,

    /// Lower percentile bounds of tiers 5, 4, 3 and 2
    #[serde(default = "default_tier_thresholds")]
    pub tier_thresholds: [f64; 4],
}

impl Default for CredibilityConfig {
    fn default() -> Self {
        Self {
            weights: CredibilityWeights::default(),
            min_corpus: default_min_corpus(),
            tier_thresholds: default_tier_thresholds(),
        }
    }
}

fn default_min_corpus() -> usize {
    5
}

fn default_tier_thresholds() -> [f64; 4] {
    [95.0, 80.0, 50.0, 20.0]
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    #[serde(default = "default_initial_k")]
    pub initial_k: usize,

    #[serde(default = "default_final_k")]
    pub final_k: usize,

    #[serde(default = "default_rerank_weight")]
    pub rerank_weight: f64,

    #[serde(default = "default_credibility_weight")]
    pub credibility_weight: f64,

    /// Load the cross-encoder for the precision stage
    #[serde(default = "default_true")]
    pub reranker_enabled: bool,

    #[serde(default = "default_reranker_model")]
    pub reranker_model: String,

    #[serde(default = "default_rerank_timeout_secs")]
    pub rerank_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            initial_k: default_initial_k(),
            final_k: default_final_k(),
            rerank_weight: default_rerank_weight(),
            credibility_weight: default_credibility_weight(),
            reranker_enabled: default_true(),
            reranker_model: default_reranker_model(),
            rerank_timeout_secs: default_rerank_timeout_secs(),
        }
    }
}

fn default_initial_k() -> usize {
    20
}

fn default_final_k() -> usize {
    5
}

fn default_rerank_weight() -> f64 {
    0.8
}

fn default_credibility_weight() -> f64 {
    0.2
}

fn default_true() -> bool {
    true
}

fn default_reranker_model() -> String {
    DEFAULT_RERANKER_MODEL.to_string()
}

fn default_rerank_timeout_secs() -> u64 {
    10
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub credibility: CredibilityConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store.max_batch_size == 0 {
            bail!("store.max_batch_size must be greater than 0");
        }
        if self.store.collection_dir.trim().is_empty() || self.store.history_dir.trim().is_empty() {
            bail!("store.collection_dir and store.history_dir must not be empty");
        }
        if self.store.collection_dir == self.store.history_dir {
            bail!("store.collection_dir and store.history_dir must differ");
        }

        for (name, secs) in [
            ("store.write_timeout_secs", self.store.write_timeout_secs),
            ("embedding.timeout_secs", self.embedding.timeout_secs),
            ("remote.timeout_secs", self.remote.timeout_secs),
            ("concurrency.lock_timeout_secs", self.concurrency.lock_timeout_secs),
            ("retrieval.rerank_timeout_secs", self.retrieval.rerank_timeout_secs),
        ] {
            if secs == 0 {
                bail!("{name} must be greater than 0");
            }
        }

        if self.remote.kind != RemoteKind::None && self.remote.location.is_none() {
            bail!("remote.location is required when remote.kind is set");
        }

        // "auto" or positive integer
        if self.concurrency.pool_size != "auto" {
            match self.concurrency.pool_size.parse::<usize>() {
                Ok(0) | Err(_) => bail!(
                    "concurrency.pool_size must be 'auto' or a positive integer, got '{}'",
                    self.concurrency.pool_size
                ),
                Ok(_) => {}
            }
        }

        let weights = &self.credibility.weights;
        for (name, w) in [
            ("years_experience", weights.years_experience),
            ("education", weights.education),
            ("seniority", weights.seniority),
        ] {
            if !w.is_finite() || w < 0.0 {
                bail!("credibility.weights.{name} must be a non-negative number, got {w}");
            }
        }

        let thresholds = &self.credibility.tier_thresholds;
        if thresholds.windows(2).any(|w| w[0] <= w[1])
            || thresholds.iter().any(|t| !(*t > 0.0 && *t <= 100.0))
        {
            bail!(
                "credibility.tier_thresholds must be strictly descending within (0, 100], got {:?}",
                thresholds
            );
        }

        let retrieval = &self.retrieval;
        if retrieval.final_k == 0 || retrieval.initial_k < retrieval.final_k {
            bail!(
                "retrieval.initial_k ({}) must be >= retrieval.final_k ({}) and final_k > 0",
                retrieval.initial_k,
                retrieval.final_k
            );
        }
        if retrieval.rerank_weight < 0.0
            || retrieval.credibility_weight < 0.0
            || (retrieval.rerank_weight + retrieval.credibility_weight - 1.0).abs() > 1e-6
        {
            bail!("retrieval.rerank_weight and retrieval.credibility_weight must be non-negative and sum to 1.0");
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, writing defaults when it is missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&path, defaults)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("{} is malformed", path.display()))?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = self.base_path.join(CONFIG_FILE);
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(&path, config_str)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn with_base_path(mut self, base_path: &Path) -> Self {
        self.base_path = base_path.to_path_buf();
        self
    }

    pub fn collection_path(&self) -> PathBuf {
        self.base_path.join(&self.store.collection_dir)
    }

    pub fn history_path(&self) -> PathBuf {
        self.base_path.join(&self.store.history_dir)
    }

    pub fn pool_size(&self) -> usize {
        match self.concurrency.pool_size.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => crate::pool::WorkerPool::default_size(),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.concurrency.lock_timeout_secs)
    }
}
