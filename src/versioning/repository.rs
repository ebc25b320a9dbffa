//! Content-addressed snapshot repository.
//!
//! Layout under the history directory:
//! - `objects/<sha256>.tar.gz`: one archive per distinct collection state
//! - `log.jsonl`: append-only event log (commits, completed pushes)
//!
//! Archives are built with deterministic tar headers, so the same
//! collection bytes always hash to the same snapshot id.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::{Archive, Builder, HeaderMode};

use crate::errors::StoreError;

const OBJECTS_DIR: &str = "objects";
const LOG_FILE: &str = "log.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub source: String,
    pub count_added: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Snapshot is stored on the remote
    Remote,
    /// Snapshot exists only in the local history store
    LocalOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub commit_id: String,
    pub snapshot_id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub metadata: VersionMetadata,
    pub document_count: usize,
    pub durability: Durability,
}

/// Snapshot storage behind the version control layer.
pub trait SnapshotRepository: Send + Sync {
    fn is_initialized(&self) -> bool;

    fn init(&self) -> Result<(), StoreError>;

    /// Snapshot everything under `source` and append a record for it.
    fn commit(
        &self,
        source: &Path,
        message: &str,
        metadata: &VersionMetadata,
        document_count: usize,
    ) -> Result<VersionRecord, StoreError>;

    /// Materialize a snapshot into the empty directory `target`.
    fn checkout(&self, snapshot_id: &str, target: &Path) -> Result<(), StoreError>;

    /// Every record, newest first.
    fn history(&self) -> Result<Vec<VersionRecord>, StoreError>;

    fn mark_pushed(&self, snapshot_id: &str) -> Result<(), StoreError>;

    fn has_snapshot(&self, snapshot_id: &str) -> bool;

    /// Where the archive for `snapshot_id` lives locally.
    fn snapshot_path(&self, snapshot_id: &str) -> PathBuf;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LogEvent {
    Commit(VersionRecord),
    Pushed { snapshot_id: String, at: DateTime<Utc> },
}

pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join(OBJECTS_DIR)
    }

    fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    fn read_events(&self) -> Result<Vec<LogEvent>, StoreError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(vec![]);
        }
        let file = File::open(&path)
            .map_err(|e| StoreError::HistoryRead(format!("{}: {e}", path.display())))?;

        let mut events = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| StoreError::HistoryRead(format!("{}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|e| {
                StoreError::HistoryRead(format!("{} line {}: {e}", path.display(), n + 1))
            })?;
            events.push(event);
        }
        Ok(events)
    }

    fn append(&self, event: &LogEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn last_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .read_events()?
            .into_iter()
            .filter_map(|event| match event {
                LogEvent::Commit(record) => Some(record.timestamp),
                LogEvent::Pushed { .. } => None,
            })
            .max())
    }
}

impl SnapshotRepository for ContentStore {
    fn is_initialized(&self) -> bool {
        self.log_path().exists() && self.objects_dir().is_dir()
    }

    fn init(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(self.objects_dir())?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        log::info!("initialized version history at {}", self.root.display());
        Ok(())
    }

    fn commit(
        &self,
        source: &Path,
        message: &str,
        metadata: &VersionMetadata,
        document_count: usize,
    ) -> Result<VersionRecord, StoreError> {
        let archive = pack(source).map_err(|e| StoreError::Commit(format!("staging failed: {e}")))?;
        let snapshot_id = hex_digest(&archive);

        let object = self.snapshot_path(&snapshot_id);
        if !object.exists() {
            let mut tmp = tempfile::NamedTempFile::new_in(self.objects_dir())?;
            tmp.write_all(&archive)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&object)
                .map_err(|e| StoreError::Commit(format!("failed to store snapshot: {e}")))?;
        }

        // history is ordered by timestamp, keep it strictly increasing
        let mut timestamp = Utc::now();
        if let Some(last) = self.last_timestamp()? {
            if timestamp <= last {
                timestamp = last + Duration::milliseconds(1);
            }
        }

        let record = VersionRecord {
            commit_id: rusty_ulid::Ulid::generate().to_string().to_lowercase(),
            snapshot_id,
            timestamp,
            message: message.to_string(),
            metadata: metadata.clone(),
            document_count,
            durability: Durability::LocalOnly,
        };
        self.append(&LogEvent::Commit(record.clone()))?;

        Ok(record)
    }

    fn checkout(&self, snapshot_id: &str, target: &Path) -> Result<(), StoreError> {
        let bytes = std::fs::read(self.snapshot_path(snapshot_id))?;
        if hex_digest(&bytes) != snapshot_id {
            return Err(StoreError::HistoryRead(format!(
                "snapshot {snapshot_id} is corrupted"
            )));
        }

        let mut archive = Archive::new(GzDecoder::new(bytes.as_slice()));
        archive.unpack(target)?;
        Ok(())
    }

    fn history(&self) -> Result<Vec<VersionRecord>, StoreError> {
        let events = self.read_events()?;

        let pushed: std::collections::HashSet<String> = events
            .iter()
            .filter_map(|event| match event {
                LogEvent::Pushed { snapshot_id, .. } => Some(snapshot_id.clone()),
                LogEvent::Commit(_) => None,
            })
            .collect();

        let mut records: Vec<VersionRecord> = events
            .into_iter()
            .filter_map(|event| match event {
                LogEvent::Commit(mut record) => {
                    if pushed.contains(&record.snapshot_id) {
                        record.durability = Durability::Remote;
                    }
                    Some(record)
                }
                LogEvent::Pushed { .. } => None,
            })
            .collect();

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    fn mark_pushed(&self, snapshot_id: &str) -> Result<(), StoreError> {
        self.append(&LogEvent::Pushed {
            snapshot_id: snapshot_id.to_string(),
            at: Utc::now(),
        })
    }

    fn has_snapshot(&self, snapshot_id: &str) -> bool {
        self.snapshot_path(snapshot_id).exists()
    }

    fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        self.objects_dir().join(format!("{snapshot_id}.tar.gz"))
    }
}

/// Deterministic tar.gz of every file under `source`.
fn pack(source: &Path) -> std::io::Result<Vec<u8>> {
    let mut files = Vec::new();
    collect_files(source, Path::new(""), &mut files)?;
    files.sort();

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.mode(HeaderMode::Deterministic);

    for rel in &files {
        builder.append_path_with_name(source.join(rel), rel)?;
    }

    builder.into_inner()?.finish()
}

fn collect_files(dir: &Path, prefix: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let rel = prefix.join(entry.file_name());

        if path.is_dir() {
            collect_files(&path, &rel, out)?;
        } else if path.extension().is_some_and(|ext| ext == "tmp") {
            // half-written file from an interrupted save
            continue;
        } else {
            out.push(rel);
        }
    }
    Ok(())
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
