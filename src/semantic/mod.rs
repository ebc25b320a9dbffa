//! Embedding Gateway.
//!
//! - `embeddings`: the `Embedder` seam and its fastembed implementation
//! - `gateway`: pooled, retried, time-bounded calls into an `Embedder`

pub mod embeddings;
mod gateway;

pub use embeddings::{Embedder, EmbeddingError, EmbeddingModel};
pub use gateway::EmbeddingGateway;
