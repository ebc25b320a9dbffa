//! Cross-module tests driving `ExpertService` end to end with in-process
//! stand-ins for the embedding model, the reranker and the remote.

mod ingest;
mod search;
mod versioning;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::document::{Document, DocumentMetadata, LinkedinProfile};
use crate::retrieval::{RerankError, Reranker};
use crate::semantic::{Embedder, EmbeddingError};
use crate::service::ExpertService;
use crate::versioning::{RemoteError, RemoteStore};

const DIMENSIONS: usize = 64;

/// Bag-of-words hashing embedder. Texts sharing words end up close.
pub struct HashEmbedder {
    /// Texts containing this word fail with a transient error
    pub unavailable_on: Option<String>,
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            unavailable_on: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(word: &str) -> Self {
        Self {
            unavailable_on: Some(word.to_string()),
            calls: AtomicUsize::new(0),
        }
    }
}

fn bucket(word: &str) -> usize {
    // FNV-1a
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    1 + (hash % (DIMENSIONS as u64 - 1)) as usize
}

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; DIMENSIONS];
    vector[0] = 0.1;
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        vector[bucket(word)] += 1.0;
    }
    vector
}

impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash-test"
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(word) = &self.unavailable_on {
            if texts.iter().any(|t| t.contains(word.as_str())) {
                return Err(EmbeddingError::Unavailable("connection reset".into()));
            }
        }
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }
}

/// Scores documents by how many query words they contain.
pub struct KeywordReranker;

impl Reranker for KeywordReranker {
    fn name(&self) -> &str {
        "keyword"
    }

    fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError> {
        let words: Vec<String> = query.to_lowercase().split_whitespace().map(String::from).collect();
        Ok(documents
            .iter()
            .map(|doc| {
                let doc = doc.to_lowercase();
                words.iter().filter(|w| doc.contains(w.as_str())).count() as f32 * 4.0 - 2.0
            })
            .collect())
    }
}

pub struct BrokenReranker;

impl Reranker for BrokenReranker {
    fn name(&self) -> &str {
        "broken"
    }

    fn rerank(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>, RerankError> {
        Err(RerankError::Failed("model crashed".into()))
    }
}

/// In-memory remote that can be switched offline.
#[derive(Default)]
pub struct MemoryRemote {
    pub objects: Mutex<std::collections::HashMap<String, Vec<u8>>>,
    pub offline: std::sync::atomic::AtomicBool,
    pub pushes: AtomicUsize,
}

impl MemoryRemote {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("connection refused".into()));
        }
        Ok(())
    }
}

impl RemoteStore for MemoryRemote {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn push(&self, snapshot_id: &str, archive: &Path) -> Result<(), RemoteError> {
        self.check()?;
        let bytes = std::fs::read(archive)?;
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .insert(snapshot_id.to_string(), bytes);
        Ok(())
    }

    fn pull(&self, snapshot_id: &str, dest: &Path) -> Result<(), RemoteError> {
        self.check()?;
        let objects = self.objects.lock().unwrap();
        let bytes = objects
            .get(snapshot_id)
            .ok_or_else(|| RemoteError::NotFound(snapshot_id.to_string()))?;
        std::fs::write(dest, bytes)?;
        Ok(())
    }
}

pub fn test_config(base: &Path) -> Config {
    let mut config = Config::default().with_base_path(base);
    config.retry.base_delay_ms = 0;
    config.concurrency.pool_size = "4".to_string();
    config
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub service: ExpertService,
}

pub struct HarnessBuilder {
    config: Option<Config>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    remote: Option<Arc<dyn RemoteStore>>,
}

impl HarnessBuilder {
    pub fn configure(mut self, f: impl FnOnce(&mut Config)) -> Self {
        let mut config = self.config.take().unwrap_or_default();
        f(&mut config);
        self.config = Some(config);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn reranker(mut self, reranker: Option<Arc<dyn Reranker>>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        if let Some(custom) = self.config {
            config.store = custom.store;
            config.retrieval = custom.retrieval;
            config.credibility = custom.credibility;
        }
        let service = ExpertService::with_components(config, self.embedder, self.reranker, self.remote).unwrap();
        Harness { dir, service }
    }
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder {
        config: None,
        embedder: Arc::new(HashEmbedder::new()),
        reranker: Some(Arc::new(KeywordReranker)),
        remote: None,
    }
}

pub fn doc(id: &str, content: &str) -> Document {
    Document::new(id, content, None)
}

pub fn profile(id: &str, content: &str, years: f64) -> Document {
    Document::new(
        id,
        content,
        Some(DocumentMetadata::LinkedinProfile(LinkedinProfile {
            urn_id: Some(id.to_string()),
            years_experience: Some(years),
            ..Default::default()
        })),
    )
}
