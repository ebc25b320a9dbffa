//! Binary storage for the collection.
//!
//! File format: vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, ordered by id):
//! - id_len: u32, id: UTF-8 bytes
//! - content_len: u32, content: UTF-8 bytes
//! - metadata_len: u32, metadata: JSON bytes (0 length = no metadata)
//! - embedding: [f32; dimensions] (little-endian)
//!
//! Entries are written in id order, so two equal collections always
//! produce byte-identical files.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::errors::StoreError;
use crate::store::index::{IndexEntry, VectorIndex};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

pub const VECTORS_FILE: &str = "vectors.bin";

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed collection file: {0}")]
    InvalidFormat(String),

    #[error("collection file format {0} is newer than supported {1}")]
    VersionMismatch(u8, u8),

    #[error("collection was embedded with a different model")]
    ModelMismatch,

    #[error("collection header checksum does not match")]
    ChecksumMismatch,

    #[error("collection has {got}-dimensional vectors, model produces {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl From<VectorStorageError> for StoreError {
    fn from(err: VectorStorageError) -> Self {
        match err {
            VectorStorageError::Io(e) => StoreError::Io(e),
            other => StoreError::Permanent(format!("collection file: {other}")),
        }
    }
}

pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Storage for the collection living in `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(VECTORS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the collection. A missing file is an empty collection.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<VectorIndex, VectorStorageError> {
        if !self.exists() {
            return Ok(VectorIndex::new(expected_dimensions));
        }

        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        validate_header(&header, expected_model_id, expected_dimensions)?;

        // three length prefixes plus the embedding
        let min_entry = 12 + 4 * u64::from(header.dimensions);
        let fits = file_len.saturating_sub(HEADER_SIZE as u64) / min_entry;
        if header.entry_count > fits {
            return Err(VectorStorageError::InvalidFormat(format!(
                "header declares {} entries but the file holds at most {fits}",
                header.entry_count
            )));
        }

        let mut index =
            VectorIndex::with_capacity(header.dimensions as usize, header.entry_count as usize);

        for _ in 0..header.entry_count {
            let (id, entry) = read_entry(&mut reader, header.dimensions as usize)?;
            index
                .insert(id, entry)
                .map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))?;
        }

        Ok(index)
    }

    /// Write the collection next to the current file, then rename it over.
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat(format!("{} dimensions do not fit the header", index.dimensions()))
        })?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));

        // dropped, and so deleted, if anything below fails
        let temp = tempfile::NamedTempFile::new_in(dir)?;
        let mut writer = BufWriter::new(temp.as_file());

        write_header(
            &mut writer,
            &Header {
                version: FORMAT_VERSION,
                model_id: *model_id,
                dimensions,
                entry_count: index.len() as u64,
            },
        )?;
        for (id, entry) in index.sorted() {
            write_entry(&mut writer, id, entry)?;
        }
        writer.flush()?;
        drop(writer);

        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| VectorStorageError::Io(e.error))?;
        Ok(())
    }
}

fn read_header<R: Read>(reader: &mut R) -> Result<Header, VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version > FORMAT_VERSION {
        return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes(take(&header_bytes[43..47]));
    if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&header_bytes[1..33]);

    Ok(Header {
        version,
        model_id,
        dimensions: u16::from_le_bytes(take(&header_bytes[33..35])),
        entry_count: u64::from_le_bytes(take(&header_bytes[35..43])),
    })
}

fn take<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn validate_header(
    header: &Header,
    expected_model_id: &[u8; 32],
    expected_dimensions: usize,
) -> Result<(), VectorStorageError> {
    if header.model_id != *expected_model_id {
        return Err(VectorStorageError::ModelMismatch);
    }

    if header.dimensions as usize != expected_dimensions {
        return Err(VectorStorageError::DimensionMismatch {
            expected: expected_dimensions,
            got: header.dimensions as usize,
        });
    }

    Ok(())
}

fn write_header<W: Write>(writer: &mut W, header: &Header) -> Result<(), VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = header.version;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

fn read_chunk<R: Read>(reader: &mut R) -> Result<Vec<u8>, VectorStorageError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u64::from(u32::from_le_bytes(len_bytes));

    // grows with the bytes actually present, not the declared length
    let mut buf = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(VectorStorageError::InvalidFormat(format!(
            "entry field declares {len} bytes but only {} remain",
            buf.len()
        )));
    }
    Ok(buf)
}

fn write_chunk<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), VectorStorageError> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| VectorStorageError::InvalidFormat("entry field larger than 4GiB".to_string()))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

fn read_entry<R: Read>(reader: &mut R, dimensions: usize) -> Result<(String, IndexEntry), VectorStorageError> {
    let utf8 = |bytes: Vec<u8>| {
        String::from_utf8(bytes).map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))
    };

    let id = utf8(read_chunk(reader)?)?;
    let content = utf8(read_chunk(reader)?)?;
    let metadata_bytes = read_chunk(reader)?;
    let metadata = if metadata_bytes.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&metadata_bytes)
                .map_err(|e| VectorStorageError::InvalidFormat(format!("metadata of {id:?}: {e}")))?,
        )
    };

    let mut embedding = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        let mut float_bytes = [0u8; 4];
        reader.read_exact(&mut float_bytes)?;
        embedding.push(f32::from_le_bytes(float_bytes));
    }

    Ok((id, IndexEntry::new(content, metadata, embedding)))
}

fn write_entry<W: Write>(writer: &mut W, id: &str, entry: &IndexEntry) -> Result<(), VectorStorageError> {
    write_chunk(writer, id.as_bytes())?;
    write_chunk(writer, entry.content.as_bytes())?;
    let metadata = match &entry.metadata {
        Some(m) => serde_json::to_vec(m).map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))?,
        None => Vec::new(),
    };
    write_chunk(writer, &metadata)?;

    for &value in &entry.embedding {
        writer.write_all(&value.to_le_bytes())?;
    }

    Ok(())
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}
