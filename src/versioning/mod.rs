//! Version Control Layer.
//!
//! Gives the collection point-in-time recoverability: significant batches
//! are committed as immutable snapshots of the persisted collection, pushed
//! to a durable remote, and can be restored by commit id.
//!
//! State machine: `Uninitialized -> Initialized -> Committed <-> Restoring`.
//! Callers hold the service's structural lock around `commit` and `restore`.

mod remote;
mod repository;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use remote::{from_config as remote_from_config, DirRemote, HttpRemote, RemoteError, RemoteStore};
pub use repository::{ContentStore, Durability, SnapshotRepository, VersionMetadata, VersionRecord};

use crate::errors::StoreError;
use crate::pool::WorkerPool;
use crate::retry::RetryPolicy;
use crate::store::DocumentStore;

const HEAD_FILE: &str = "HEAD";

/// History entries returned when the caller does not say otherwise
pub const DEFAULT_HISTORY_ENTRIES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    Uninitialized,
    Initialized,
    Committed,
    Restoring,
}

/// Caller supplied description of a commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionMessage {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Full commit message; generated from the other fields when absent
    #[serde(default)]
    pub message: Option<String>,
}

impl VersionMessage {
    fn render(&self, count_added: usize) -> (String, VersionMetadata) {
        let source = self.source.clone().unwrap_or_else(|| "manual".to_string());
        let message = self.message.clone().unwrap_or_else(|| {
            format!(
                "Update vector database with {count_added} profiles from {source} - {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
            )
        });
        let metadata = VersionMetadata {
            source,
            count_added,
            description: self.description.clone(),
        };
        (message, metadata)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub commit_id: String,
    /// The collection already matched the commit; nothing was swapped
    pub already_active: bool,
    pub document_count: usize,
}

pub struct RemoteSettings {
    pub remote: Arc<dyn RemoteStore>,
    pub pool: Arc<WorkerPool>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

pub struct VersionControl {
    repo: Arc<dyn SnapshotRepository>,
    remote: Option<RemoteSettings>,
    history_dir: PathBuf,
    state: Mutex<VersionState>,
    /// Store generation HEAD was written at. Stores open at generation 0.
    head_generation: AtomicU64,
}

impl VersionControl {
    pub fn new(
        repo: Arc<dyn SnapshotRepository>,
        remote: Option<RemoteSettings>,
        history_dir: PathBuf,
    ) -> Result<Self, StoreError> {
        let state = if !repo.is_initialized() {
            VersionState::Uninitialized
        } else if repo.history()?.is_empty() {
            VersionState::Initialized
        } else {
            VersionState::Committed
        };

        Ok(Self {
            repo,
            remote,
            history_dir,
            state: Mutex::new(state),
            head_generation: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> VersionState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: VersionState) {
        match self.state.lock() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn ensure_initialized(&self) -> Result<(), StoreError> {
        if self.state() == VersionState::Uninitialized {
            std::fs::create_dir_all(&self.history_dir)?;
            self.repo.init()?;
            self.set_state(VersionState::Initialized);
        }
        Ok(())
    }

    fn head_path(&self) -> PathBuf {
        self.history_dir.join(HEAD_FILE)
    }

    /// Commit the collection currently equals, if it has not changed since.
    ///
    /// A write applied after its caller gave up never reaches `mark_dirty`,
    /// so HEAD is also dropped once the store generation has moved on.
    pub fn active_commit(&self, store: &DocumentStore) -> Option<String> {
        let head = std::fs::read_to_string(self.head_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())?;

        if self.head_generation.load(Ordering::SeqCst) != store.generation() {
            log::info!("collection changed since {head}, clearing HEAD");
            self.mark_dirty();
            return None;
        }
        Some(head)
    }

    fn set_head(&self, commit_id: &str, generation: u64) -> Result<(), StoreError> {
        std::fs::write(self.head_path(), commit_id)?;
        self.head_generation.store(generation, Ordering::SeqCst);
        Ok(())
    }

    /// Forget the active commit after the collection changed.
    pub fn mark_dirty(&self) {
        let head = self.head_path();
        if head.exists() {
            if let Err(err) = std::fs::remove_file(&head) {
                log::warn!("failed to clear {}: {err}", head.display());
            }
        }
    }

    /// Snapshot the persisted collection and push it to the remote.
    ///
    /// A failed push does not fail the commit: the record comes back
    /// `LocalOnly` and the push is retried on the next commit.
    pub fn commit(
        &self,
        store: &DocumentStore,
        message: &VersionMessage,
        count_added: usize,
    ) -> Result<VersionRecord, StoreError> {
        self.ensure_initialized()?;

        let (message, metadata) = message.render(count_added);
        // read before the snapshot so a write landing mid-commit dirties HEAD
        let generation = store.generation();
        let document_count = store.count()?;
        let record = self
            .repo
            .commit(store.persist_dir(), &message, &metadata, document_count)
            .map_err(|err| match err {
                StoreError::Commit(_) => err,
                other => StoreError::Commit(other.to_string()),
            })?;
        self.set_head(&record.commit_id, generation)?;
        self.set_state(VersionState::Committed);
        log::info!(
            "committed {} ({} documents, snapshot {})",
            record.commit_id,
            document_count,
            record.snapshot_id
        );

        self.push_pending();

        Ok(self
            .repo
            .history()?
            .into_iter()
            .find(|r| r.commit_id == record.commit_id)
            .unwrap_or(record))
    }

    /// Push every local-only snapshot, oldest first. Stops at the first
    /// failure so the rest are retried together next time.
    fn push_pending(&self) {
        let Some(settings) = &self.remote else {
            return;
        };

        let history = match self.repo.history() {
            Ok(history) => history,
            Err(err) => {
                log::error!("cannot list snapshots to push: {err}");
                return;
            }
        };

        let mut pending: Vec<String> = Vec::new();
        for record in history.iter().rev() {
            if record.durability == Durability::LocalOnly && !pending.contains(&record.snapshot_id) {
                pending.push(record.snapshot_id.clone());
            }
        }

        for snapshot_id in pending {
            let archive = self.repo.snapshot_path(&snapshot_id);
            let result = settings.retry.run("snapshot push", || {
                let remote = settings.remote.clone();
                let archive = archive.clone();
                let snapshot_id = snapshot_id.clone();
                settings.pool.run("snapshot push", settings.timeout, None, move || {
                    remote.push(&snapshot_id, &archive).map_err(StoreError::from)
                })
            });

            match result.and_then(|_| self.repo.mark_pushed(&snapshot_id)) {
                Ok(()) => log::info!("snapshot {snapshot_id} pushed to {}", settings.remote.describe()),
                Err(err) => {
                    log::warn!("snapshot {snapshot_id} stays local-only: {err}");
                    return;
                }
            }
        }
    }

    /// Records newest first, at most `max_entries`.
    pub fn history(&self, max_entries: usize) -> Result<Vec<VersionRecord>, StoreError> {
        if self.state() == VersionState::Uninitialized {
            return Ok(vec![]);
        }
        let mut records = self.repo.history()?;
        records.truncate(max_entries);
        Ok(records)
    }

    /// Make the collection equal to what it was right after `commit_id`.
    pub fn restore(&self, store: &DocumentStore, commit_id: &str) -> Result<RestoreOutcome, StoreError> {
        let record = self
            .history(usize::MAX)?
            .into_iter()
            .find(|r| r.commit_id == commit_id)
            .ok_or_else(|| StoreError::VersionNotFound(commit_id.to_string()))?;

        if self.active_commit(store).as_deref() == Some(commit_id) {
            log::info!("collection already at {commit_id}, nothing to restore");
            return Ok(RestoreOutcome {
                commit_id: commit_id.to_string(),
                already_active: true,
                document_count: store.count()?,
            });
        }

        let previous = self.state();
        self.set_state(VersionState::Restoring);
        let result = self.swap_in(store, &record);
        self.set_state(if result.is_ok() { VersionState::Committed } else { previous });
        result?;

        self.set_head(commit_id, store.generation())?;
        let document_count = store.count()?;
        log::info!("restored {commit_id} ({document_count} documents)");

        Ok(RestoreOutcome {
            commit_id: commit_id.to_string(),
            already_active: false,
            document_count,
        })
    }

    fn swap_in(&self, store: &DocumentStore, record: &VersionRecord) -> Result<(), StoreError> {
        if !self.repo.has_snapshot(&record.snapshot_id) {
            self.pull(&record.snapshot_id)?;
        }

        // stage next to the collection so the swap is a same-filesystem rename
        let parent = store
            .persist_dir()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let staging = tempfile::Builder::new()
            .prefix(".restore-")
            .tempdir_in(&parent)?;

        self.repo.checkout(&record.snapshot_id, staging.path())?;
        store.replace_from(staging.path())
    }

    fn pull(&self, snapshot_id: &str) -> Result<(), StoreError> {
        let settings = self.remote.as_ref().ok_or_else(|| {
            StoreError::HistoryRead(format!(
                "snapshot {snapshot_id} is missing locally and no remote is configured"
            ))
        })?;

        let dest = self.repo.snapshot_path(snapshot_id);
        settings.retry.run("snapshot pull", || {
            let remote = settings.remote.clone();
            let dest = dest.clone();
            let snapshot_id = snapshot_id.to_string();
            settings.pool.run("snapshot pull", settings.timeout, None, move || {
                remote.pull(&snapshot_id, &dest).map_err(StoreError::from)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_message_names_source_and_count() {
        let message = VersionMessage {
            source: Some("linkedin".into()),
            ..Default::default()
        };
        let (text, metadata) = message.render(12);
        assert!(text.starts_with("Update vector database with 12 profiles from linkedin - "));
        assert_eq!(metadata.source, "linkedin");
        assert_eq!(metadata.count_added, 12);
    }

    #[test]
    fn test_explicit_message_is_kept() {
        let message = VersionMessage {
            message: Some("nightly import".into()),
            ..Default::default()
        };
        let (text, metadata) = message.render(3);
        assert_eq!(text, "nightly import");
        assert_eq!(metadata.source, "manual");
    }

    #[test]
    fn test_state_follows_repository() {
        let tmp = tempfile::tempdir().unwrap();
        let history = tmp.path().join("history");
        let repo = Arc::new(ContentStore::new(history.clone()));

        let vc = VersionControl::new(repo.clone(), None, history.clone()).unwrap();
        assert_eq!(vc.state(), VersionState::Uninitialized);
        assert!(vc.history(10).unwrap().is_empty());

        vc.ensure_initialized().unwrap();
        assert_eq!(vc.state(), VersionState::Initialized);

        let reopened = VersionControl::new(repo, None, history).unwrap();
        assert_eq!(reopened.state(), VersionState::Initialized);
    }
}
