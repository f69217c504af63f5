//! Embedding Service (component A).
//!
//! Produces fixed-dimension vectors from text via a pluggable
//! [`EmbeddingBackend`], with an LRU cache, exact-duplicate detection, and
//! adaptive batch sizing in front of it.

pub mod backend;
pub mod service;

pub use backend::{EmbeddingBackend, HashingEmbeddingBackend};
pub use service::{
    cosine_similarity, dot_product, euclidean_distance, CacheStats, EmbedOpts, Embedding,
    EmbeddingError, EmbeddingQuality, EmbeddingService,
};
