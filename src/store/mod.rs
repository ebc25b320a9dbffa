//! Document Store Adapter.
//!
//! Owns the live collection: batched, validated upserts; metadata filtered
//! k-NN queries; count and reset.
//!
//! - `index`: in-memory vector index with cosine distance search
//! - `storage`: `vectors.bin` persistence
//! - `backend`: the `VectorBackend` seam and the local implementation

mod backend;
mod index;
mod storage;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use backend::{BackendEntry, BackendHit, LocalBackend, VectorBackend};
pub use index::{IndexEntry, IndexError, VectorIndex};
pub use storage::{VectorStorage, VectorStorageError, VECTORS_FILE};

use crate::document::{self, Document, DocumentMetadata, MetadataFilter, MetadataValue};
use crate::errors::StoreError;
use crate::lock::acquire_mutex;
use crate::pool::{CancelFlag, WorkerPool};
use crate::retry::RetryPolicy;
use crate::semantic::EmbeddingGateway;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedDocument {
    pub id: String,
    pub reason: String,
}

/// Outcome of an upsert. Chunks fail independently, so a report can hold
/// both written and failed documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertReport {
    pub written: usize,
    pub failed: Vec<FailedDocument>,
}

impl UpsertReport {
    fn fail_all(&mut self, documents: &[Document], reason: &str) {
        self.failed.extend(documents.iter().map(|d| FailedDocument {
            id: d.id.clone(),
            reason: reason.to_string(),
        }));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMatch {
    pub id: String,
    pub content: String,
    pub metadata: Option<DocumentMetadata>,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub count: usize,
    pub dimensions: usize,
    pub model: String,
    pub path: PathBuf,
}

pub struct StoreOptions {
    pub max_batch_size: usize,
    pub write_timeout: Duration,
    pub lock_timeout: Duration,
}

pub struct DocumentStore {
    backend: Arc<dyn VectorBackend>,
    gateway: EmbeddingGateway,
    pool: Arc<WorkerPool>,
    retry: RetryPolicy,
    options: StoreOptions,
    /// Serializes upsert batches and reset
    batch_lock: Mutex<()>,
    /// Bumped on every change to the collection, including writes that
    /// land after their caller timed out
    generation: Arc<AtomicU64>,
}

impl DocumentStore {
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        gateway: EmbeddingGateway,
        pool: Arc<WorkerPool>,
        retry: RetryPolicy,
        options: StoreOptions,
    ) -> Self {
        Self {
            backend,
            gateway,
            pool,
            retry,
            options,
            batch_lock: Mutex::new(()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn gateway(&self) -> &EmbeddingGateway {
        &self.gateway
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn persist_dir(&self) -> &Path {
        self.backend.persist_dir()
    }

    /// Upsert parallel `ids` / `contents` / `metadatas`.
    pub fn upsert(
        &self,
        ids: Vec<String>,
        contents: Vec<String>,
        metadatas: Option<Vec<DocumentMetadata>>,
        cancel: &CancelFlag,
    ) -> Result<UpsertReport, StoreError> {
        let documents = document::assemble(ids, contents, metadatas)?;
        self.upsert_documents(documents, cancel)
    }

    /// Embed and write documents, overwriting existing ids.
    ///
    /// Input is validated before any network call. Batches larger than the
    /// configured maximum are split into chunks that succeed or fail on
    /// their own; already written chunks stay written. A transient failure
    /// that outlives its retries fails only its chunk. A permanent failure
    /// aborts the remaining chunks, and is returned as an error when nothing
    /// was written yet.
    pub fn upsert_documents(
        &self,
        documents: Vec<Document>,
        cancel: &CancelFlag,
    ) -> Result<UpsertReport, StoreError> {
        document::validate(&documents)?;
        let documents = dedup_last_wins(documents);

        let _batch = acquire_mutex(&self.batch_lock, "batch", self.options.lock_timeout)?;

        let mut report = UpsertReport::default();
        let chunks: Vec<&[Document]> = documents.chunks(self.options.max_batch_size).collect();
        let total = chunks.len();

        for (n, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                if n == 0 {
                    return Err(StoreError::Cancelled);
                }
                report.fail_all(chunk, "cancelled before the write started");
                continue;
            }

            match self.write_chunk(chunk, cancel) {
                Ok(rejected) => {
                    let written = chunk.len() - rejected.len();
                    report.written += written;
                    report
                        .failed
                        .extend(rejected.into_iter().map(|(id, reason)| FailedDocument { id, reason }));
                    log::debug!("chunk {}/{} written ({} documents)", n + 1, total, written);
                }
                Err(StoreError::Cancelled) => {
                    report.fail_all(chunk, "cancelled before the write started");
                }
                Err(err @ (StoreError::BackendUnavailable { .. } | StoreError::ConcurrencyTimeout { .. })) => {
                    log::warn!("chunk {}/{} failed: {err}", n + 1, total);
                    report.fail_all(chunk, &err.to_string());
                }
                Err(err) => {
                    if report.written == 0 && report.failed.is_empty() {
                        return Err(err);
                    }
                    log::error!("chunk {}/{} failed, aborting the batch: {err}", n + 1, total);
                    report.fail_all(chunk, &err.to_string());
                    for rest in &chunks[n + 1..] {
                        report.fail_all(rest, &format!("aborted after earlier failure: {err}"));
                    }
                    break;
                }
            }
        }

        Ok(report)
    }

    fn write_chunk(
        &self,
        chunk: &[Document],
        cancel: &CancelFlag,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let texts = chunk.iter().map(|d| d.content.clone()).collect();
        let vectors = self.gateway.embed_batch(texts, cancel)?;

        let entries: Arc<Vec<BackendEntry>> = Arc::new(
            chunk
                .iter()
                .zip(vectors)
                .map(|(doc, embedding)| BackendEntry {
                    id: doc.id.clone(),
                    content: doc.content.clone(),
                    metadata: doc.metadata.clone(),
                    embedding,
                })
                .collect(),
        );

        // last point where cancelling leaves the collection untouched
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        self.retry.run("backend write", || {
            let backend = self.backend.clone();
            let entries = entries.clone();
            let generation = self.generation.clone();
            self.pool
                .run("backend write", self.options.write_timeout, None, move || {
                    let rejected = backend.upsert(&entries)?;
                    // counted here so a write that outlives its timeout still shows up
                    if rejected.len() < entries.len() {
                        generation.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(rejected)
                })
        })
    }

    /// The `k` nearest documents matching `filter`. Returns fewer than `k`
    /// when fewer documents match.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
        cancel: &CancelFlag,
    ) -> Result<Vec<QueryMatch>, StoreError> {
        let vector = Arc::new(vector.to_vec());
        let filter = Arc::new(filter.clone());

        let hits = self.retry.run("vector query", || {
            let backend = self.backend.clone();
            let vector = vector.clone();
            let filter = filter.clone();
            self.pool
                .run("vector query", self.options.write_timeout, Some(cancel), move || {
                    backend.query(&vector, k, &filter)
                })
        })?;

        Ok(hits
            .into_iter()
            .map(|hit| QueryMatch {
                id: hit.document.id,
                content: hit.document.content,
                metadata: hit.document.metadata,
                distance: hit.distance,
            })
            .collect())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.backend.count()
    }

    pub fn documents(&self) -> Result<Vec<Document>, StoreError> {
        self.backend.documents()
    }

    /// Distinct values of one metadata field across the collection.
    pub fn distinct_values(&self, field: &str) -> Result<Vec<MetadataValue>, StoreError> {
        let mut seen = BTreeSet::new();
        let mut values = Vec::new();
        for doc in self.backend.documents()? {
            if let Some(value) = doc.fields().remove(field) {
                if seen.insert(value.to_string()) {
                    values.push(value);
                }
            }
        }
        values.sort_by_key(|v| v.to_string());
        Ok(values)
    }

    pub fn stats(&self) -> Result<CollectionStats, StoreError> {
        Ok(CollectionStats {
            count: self.backend.count()?,
            dimensions: self.backend.dimensions(),
            model: self.gateway.model_name().to_string(),
            path: self.backend.persist_dir().to_path_buf(),
        })
    }

    /// Delete every document.
    pub fn reset(&self) -> Result<(), StoreError> {
        let _batch = acquire_mutex(&self.batch_lock, "batch", self.options.lock_timeout)?;
        self.backend.reset()?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        log::info!("collection reset");
        Ok(())
    }

    /// Swap in a collection materialized in `staged`.
    pub fn replace_from(&self, staged: &Path) -> Result<(), StoreError> {
        let _batch = acquire_mutex(&self.batch_lock, "batch", self.options.lock_timeout)?;
        self.backend.replace_from(staged)?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Keep the last occurrence of each id, in first-seen order.
fn dedup_last_wins(documents: Vec<Document>) -> Vec<Document> {
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Document> = Vec::with_capacity(documents.len());
    for doc in documents {
        match position.get(&doc.id) {
            Some(&idx) => out[idx] = doc,
            None => {
                position.insert(doc.id.clone(), out.len());
                out.push(doc);
            }
        }
    }
    out
}
