//! In-memory vector index with cosine distance search.
//!
//! Holds every document of the collection next to its embedding.

use std::collections::{BTreeMap, HashMap};

use crate::document::{Document, DocumentMetadata, MetadataFilter, MetadataValue};

/// An entry in the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub content: String,
    pub metadata: Option<DocumentMetadata>,
    /// Flattened metadata, cached for filtering
    pub fields: BTreeMap<String, MetadataValue>,
    pub embedding: Vec<f32>,
}

impl IndexEntry {
    pub fn new(content: String, metadata: Option<DocumentMetadata>, embedding: Vec<f32>) -> Self {
        let fields = metadata.as_ref().map(|m| m.fields()).unwrap_or_default();
        Self {
            content,
            metadata,
            fields,
            embedding,
        }
    }
}

pub struct VectorIndex {
    /// Document ID -> entry
    entries: HashMap<String, IndexEntry>,
    /// Expected embedding dimensions
    dimensions: usize,
}

/// Search hit from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    /// Cosine distance, `1 - cosine similarity`
    pub distance: f32,
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
        }
    }

    /// Create an index with pre-allocated capacity.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that an entry can be stored without touching the index.
    pub fn check(&self, entry: &IndexEntry) -> Result<(), IndexError> {
        if entry.embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: entry.embedding.len(),
            });
        }
        if l2_norm(&entry.embedding) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }
        Ok(())
    }

    /// Insert or replace an entry, returning the previous one.
    pub fn insert(&mut self, id: String, entry: IndexEntry) -> Result<Option<IndexEntry>, IndexError> {
        self.check(&entry)?;
        Ok(self.entries.insert(id, entry))
    }

    pub fn remove(&mut self, id: &str) -> Option<IndexEntry> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&IndexEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &IndexEntry)> {
        self.entries.iter()
    }

    /// Entries ordered by id.
    pub fn sorted(&self) -> Vec<(&String, &IndexEntry)> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    pub fn document(&self, id: &str) -> Option<Document> {
        self.entries.get(id).map(|entry| Document {
            id: id.to_string(),
            content: entry.content.clone(),
            metadata: entry.metadata.clone(),
        })
    }

    /// The `k` nearest entries matching `filter`, by ascending cosine
    /// distance. Equal distances are ordered by id.
    pub fn search(&self, query: &[f32], k: usize, filter: &MetadataFilter) -> Result<Vec<Hit>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query_norm = l2_norm(query);
        if query_norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        if k == 0 {
            return Ok(vec![]);
        }

        let mut hits: Vec<Hit> = self
            .entries
            .iter()
            .filter(|(_, entry)| filter.matches(&entry.fields))
            .map(|(id, entry)| Hit {
                id: id.clone(),
                distance: 1.0 - cosine_similarity(query, &entry.embedding, query_norm),
            })
            .collect();

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);

        Ok(hits)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Compute L2 norm of a vector.
fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity with a precomputed query norm.
fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    let target_norm = l2_norm(target);
    if target_norm < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    dot_product / (query_norm * target_norm)
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,
}
