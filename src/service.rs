//! `ExpertService`: the operations exposed to the CLI and HTTP layers.
//!
//! Lock discipline, always taken in this order:
//! - `structural` (mutex): commit, restore and reset
//! - `gate` (rwlock): read for upserts and reads, write for structural work
//! - the store's batch lock, then the backend's collection lock
//!
//! Upserts from different callers share the gate but are serialized by the
//! batch lock. Structural operations hold the gate for writing, so no new
//! upsert starts until they are done.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::credibility::{CredibilityEngine, StatisticsSummary};
use crate::document::{self, Document, DocumentMetadata, MetadataValue};
use crate::errors::StoreError;
use crate::lock::{acquire_mutex, acquire_read, acquire_write, ProcessLock};
use crate::pool::{CancelFlag, WorkerPool};
use crate::retrieval::{FastReranker, Reranker, RetrievalEngine, SearchRequest, SearchResponse};
use crate::retry::RetryPolicy;
use crate::semantic::{Embedder, EmbeddingGateway, EmbeddingModel};
use crate::store::{CollectionStats, DocumentStore, FailedDocument, LocalBackend, StoreOptions};
use crate::versioning::{
    self, ContentStore, RemoteSettings, RemoteStore, RestoreOutcome, VersionControl, VersionMessage,
    VersionRecord, VersionState, DEFAULT_HISTORY_ENTRIES,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub ids: Vec<String>,
    pub documents: Vec<String>,
    #[serde(default)]
    pub metadatas: Option<Vec<DocumentMetadata>>,
    #[serde(default)]
    pub version_after_batch: bool,
    #[serde(default)]
    pub version_message: VersionMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub written: usize,
    pub failed: Vec<FailedDocument>,
    pub version: Option<VersionRecord>,
}

pub struct ExpertService {
    config: Config,
    store: DocumentStore,
    versions: VersionControl,
    credibility: CredibilityEngine,
    retrieval: RetrievalEngine,
    structural: Mutex<()>,
    gate: RwLock<()>,
    lock_timeout: Duration,
    _process_lock: Option<ProcessLock>,
}

impl ExpertService {
    /// Open the store under the configured base path with the fastembed
    /// models and the configured remote.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let base = config.base_path().to_path_buf();
        std::fs::create_dir_all(&base)?;
        let process_lock = ProcessLock::acquire(&base)
            .with_context(|| format!("cannot lock {}", base.display()))?;

        let embedder = EmbeddingModel::new(&config.embedding.model, &base)?;

        let reranker: Option<Arc<dyn Reranker>> = if config.retrieval.reranker_enabled {
            match FastReranker::new(&config.retrieval.reranker_model, &base) {
                Ok(reranker) => Some(Arc::new(reranker)),
                Err(err) => {
                    log::warn!("reranker unavailable, searches will run degraded: {err}");
                    None
                }
            }
        } else {
            None
        };

        let remote = versioning::remote_from_config(&config.remote)?;
        if remote.is_none() {
            log::warn!("no remote configured, snapshots stay local-only");
        }

        let mut service = Self::with_components(config, Arc::new(embedder), reranker, remote)?;
        service._process_lock = Some(process_lock);
        Ok(service)
    }

    /// Build the service around the given collaborators.
    pub fn with_components(
        config: Config,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        remote: Option<Arc<dyn RemoteStore>>,
    ) -> Result<Self, StoreError> {
        config
            .validate()
            .map_err(|err| StoreError::validation(format!("invalid config: {err}")))?;
        let pool = Arc::new(WorkerPool::new(config.pool_size())?);
        log::debug!("worker pool with {} threads", pool.size());
        let retry = RetryPolicy::from_config(&config.retry);
        let lock_timeout = config.lock_timeout();

        let gateway = EmbeddingGateway::new(
            embedder,
            pool.clone(),
            retry.clone(),
            Duration::from_secs(config.embedding.timeout_secs),
        );

        let backend = LocalBackend::open(
            &config.collection_path(),
            gateway.model_id_hash(),
            gateway.dimensions(),
            lock_timeout,
        )?;

        let store = DocumentStore::new(
            Arc::new(backend),
            gateway,
            pool.clone(),
            retry.clone(),
            StoreOptions {
                max_batch_size: config.store.max_batch_size,
                write_timeout: Duration::from_secs(config.store.write_timeout_secs),
                lock_timeout,
            },
        );

        let remote = remote.map(|remote| RemoteSettings {
            remote,
            pool: pool.clone(),
            retry: retry.clone(),
            timeout: Duration::from_secs(config.remote.timeout_secs),
        });
        let repo = Arc::new(ContentStore::new(config.history_path()));
        let versions = VersionControl::new(repo, remote, config.history_path())?;

        let credibility = CredibilityEngine::open(config.credibility.clone(), config.base_path());
        let retrieval = RetrievalEngine::new(config.retrieval.clone(), reranker, pool);

        Ok(Self {
            config,
            store,
            versions,
            credibility,
            retrieval,
            structural: Mutex::new(()),
            gate: RwLock::new(()),
            lock_timeout,
            _process_lock: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ingest(&self, request: IngestRequest, cancel: &CancelFlag) -> Result<IngestOutcome, StoreError> {
        let documents = document::assemble(request.ids, request.documents, request.metadatas)?;
        self.ingest_documents(
            documents,
            request.version_after_batch,
            &request.version_message,
            cancel,
        )
    }

    /// Upsert documents, then commit a version when asked to and something
    /// was written. The write and the commit run under one structural lock
    /// so the commit captures exactly this batch.
    pub fn ingest_documents(
        &self,
        documents: Vec<Document>,
        version_after_batch: bool,
        message: &VersionMessage,
        cancel: &CancelFlag,
    ) -> Result<IngestOutcome, StoreError> {
        document::validate(&documents)?;

        if !version_after_batch {
            let _gate = acquire_read(&self.gate, "gate", self.lock_timeout)?;
            let report = self.store.upsert_documents(documents, cancel)?;
            if report.written > 0 {
                self.versions.mark_dirty();
            }
            return Ok(IngestOutcome {
                written: report.written,
                failed: report.failed,
                version: None,
            });
        }

        let _structural = acquire_mutex(&self.structural, "structural", self.lock_timeout)?;
        let _gate = acquire_write(&self.gate, "gate", self.lock_timeout)?;

        let report = self.store.upsert_documents(documents, cancel)?;
        let version = if report.written > 0 {
            self.versions.mark_dirty();
            Some(self.versions.commit(&self.store, message, report.written)?)
        } else {
            log::info!("nothing written, skipping version commit");
            None
        };
        self.credibility.invalidate();

        Ok(IngestOutcome {
            written: report.written,
            failed: report.failed,
            version,
        })
    }

    pub fn search(&self, request: &SearchRequest, cancel: &CancelFlag) -> Result<SearchResponse, StoreError> {
        let _gate = acquire_read(&self.gate, "gate", self.lock_timeout)?;
        self.retrieval.search(&self.store, &self.credibility, request, cancel)
    }

    pub fn list_versions(&self, max_entries: Option<usize>) -> Result<Vec<VersionRecord>, StoreError> {
        let _gate = acquire_read(&self.gate, "gate", self.lock_timeout)?;
        self.versions
            .history(max_entries.unwrap_or(DEFAULT_HISTORY_ENTRIES))
    }

    pub fn restore_to(&self, commit_id: &str) -> Result<RestoreOutcome, StoreError> {
        let _structural = acquire_mutex(&self.structural, "structural", self.lock_timeout)?;
        let _gate = acquire_write(&self.gate, "gate", self.lock_timeout)?;
        self.versions.restore(&self.store, commit_id)
    }

    pub fn refresh_credibility_statistics(&self) -> Result<StatisticsSummary, StoreError> {
        let _gate = acquire_read(&self.gate, "gate", self.lock_timeout)?;
        let snapshot = self.credibility.refresh_statistics(&self.store)?;
        Ok(self.credibility.summary(&snapshot, self.store.generation()))
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let _gate = acquire_read(&self.gate, "gate", self.lock_timeout)?;
        self.store.count()
    }

    /// Delete every document. History is kept, so a reset can be undone
    /// with a restore.
    pub fn reset(&self) -> Result<(), StoreError> {
        let _structural = acquire_mutex(&self.structural, "structural", self.lock_timeout)?;
        let _gate = acquire_write(&self.gate, "gate", self.lock_timeout)?;
        self.store.reset()?;
        self.versions.mark_dirty();
        Ok(())
    }

    pub fn collection_stats(&self) -> Result<CollectionStats, StoreError> {
        let _gate = acquire_read(&self.gate, "gate", self.lock_timeout)?;
        self.store.stats()
    }

    pub fn metadata_values(&self, field: &str) -> Result<Vec<MetadataValue>, StoreError> {
        let _gate = acquire_read(&self.gate, "gate", self.lock_timeout)?;
        self.store.distinct_values(field)
    }

    pub fn version_state(&self) -> VersionState {
        self.versions.state()
    }

    pub fn active_commit(&self) -> Option<String> {
        self.versions.active_commit(&self.store)
    }
}
