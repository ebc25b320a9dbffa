use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use crate::document::{Document, DocumentMetadata, MetadataFilter};
use crate::errors::StoreError;
use crate::lock::{acquire_read, acquire_write};
use crate::store::index::{IndexEntry, VectorIndex};
use crate::store::storage::VectorStorage;

#[derive(Debug, Clone)]
pub struct BackendEntry {
    pub id: String,
    pub content: String,
    pub metadata: Option<DocumentMetadata>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct BackendHit {
    pub document: Document,
    pub distance: f32,
}

/// Nearest-neighbour backend holding the live collection.
///
/// Implementations persist under `persist_dir()`; that directory is what the
/// version control layer snapshots and swaps on restore.
pub trait VectorBackend: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Write entries, replacing existing ids. Entries the backend cannot
    /// store are returned with a reason; the rest are written together.
    fn upsert(&self, entries: &[BackendEntry]) -> Result<Vec<(String, String)>, StoreError>;

    fn query(&self, vector: &[f32], k: usize, filter: &MetadataFilter) -> Result<Vec<BackendHit>, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;

    fn documents(&self) -> Result<Vec<Document>, StoreError>;

    fn reset(&self) -> Result<(), StoreError>;

    fn persist_dir(&self) -> &Path;

    /// Make the collection persisted in `staged` the active one. On error the
    /// previous collection stays active.
    fn replace_from(&self, staged: &Path) -> Result<(), StoreError>;
}

/// In-process backend: the whole collection in memory, persisted to
/// `vectors.bin` after every write.
pub struct LocalBackend {
    dir: PathBuf,
    storage: VectorStorage,
    model_id: [u8; 32],
    index: RwLock<VectorIndex>,
    lock_timeout: Duration,
}

impl LocalBackend {
    pub fn open(
        dir: &Path,
        model_id: [u8; 32],
        dimensions: usize,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let storage = VectorStorage::in_dir(dir);
        let index = storage.load(&model_id, dimensions)?;
        log::info!("opened collection at {} with {} documents", dir.display(), index.len());

        Ok(Self {
            dir: dir.to_path_buf(),
            storage,
            model_id,
            index: RwLock::new(index),
            lock_timeout,
        })
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "collection".to_string());
        self.dir.with_file_name(format!(".{name}.{suffix}-{}", rusty_ulid::Ulid::generate()))
    }
}

impl VectorBackend for LocalBackend {
    fn dimensions(&self) -> usize {
        match self.index.read() {
            Ok(index) => index.dimensions(),
            Err(poisoned) => poisoned.into_inner().dimensions(),
        }
    }

    fn upsert(&self, entries: &[BackendEntry]) -> Result<Vec<(String, String)>, StoreError> {
        let mut index = acquire_write(&self.index, "collection", self.lock_timeout)?;

        let mut rejected = Vec::new();
        let mut previous = Vec::new();
        for entry in entries {
            let new_entry = IndexEntry::new(
                entry.content.clone(),
                entry.metadata.clone(),
                entry.embedding.clone(),
            );
            match index.insert(entry.id.clone(), new_entry) {
                Ok(old) => previous.push((entry.id.clone(), old)),
                Err(e) => rejected.push((entry.id.clone(), e.to_string())),
            }
        }

        if let Err(err) = self.storage.save(&index, &self.model_id) {
            // keep memory in step with disk
            for (id, old) in previous.into_iter().rev() {
                match old {
                    Some(old) => {
                        let _ = index.insert(id, old);
                    }
                    None => {
                        index.remove(&id);
                    }
                }
            }
            return Err(err.into());
        }

        Ok(rejected)
    }

    fn query(&self, vector: &[f32], k: usize, filter: &MetadataFilter) -> Result<Vec<BackendHit>, StoreError> {
        let index = acquire_read(&self.index, "collection", self.lock_timeout)?;
        let hits = index
            .search(vector, k, filter)
            .map_err(|e| StoreError::validation(format!("query vector: {e}")))?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                index.document(&hit.id).map(|document| BackendHit {
                    document,
                    distance: hit.distance,
                })
            })
            .collect())
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(acquire_read(&self.index, "collection", self.lock_timeout)?.len())
    }

    fn documents(&self) -> Result<Vec<Document>, StoreError> {
        let index = acquire_read(&self.index, "collection", self.lock_timeout)?;
        Ok(index
            .sorted()
            .into_iter()
            .map(|(id, entry)| Document {
                id: id.clone(),
                content: entry.content.clone(),
                metadata: entry.metadata.clone(),
            })
            .collect())
    }

    fn reset(&self) -> Result<(), StoreError> {
        let mut index = acquire_write(&self.index, "collection", self.lock_timeout)?;
        let dimensions = index.dimensions();
        let empty = VectorIndex::new(dimensions);
        self.storage.save(&empty, &self.model_id)?;
        *index = empty;
        Ok(())
    }

    fn persist_dir(&self) -> &Path {
        &self.dir
    }

    fn replace_from(&self, staged: &Path) -> Result<(), StoreError> {
        let mut index = acquire_write(&self.index, "collection", self.lock_timeout)?;

        // refuse to swap in anything we could not serve
        let staged_index = VectorStorage::in_dir(staged).load(&self.model_id, index.dimensions())?;

        let retired = self.sibling("retired");
        std::fs::rename(&self.dir, &retired)?;
        if let Err(err) = std::fs::rename(staged, &self.dir) {
            log::error!("failed to move restored collection into place: {err}");
            std::fs::rename(&retired, &self.dir)?;
            return Err(err.into());
        }

        *index = staged_index;
        drop(index);

        if let Err(err) = std::fs::remove_dir_all(&retired) {
            log::warn!("could not remove retired collection {}: {err}", retired.display());
        }
        Ok(())
    }
}
