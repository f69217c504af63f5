//! Hybrid Search (component C).
//!
//! Stage 1 (dense kNN) lives in [`vector`]; Stage 2 (lexical re-score) and
//! fusion live in [`hybrid`].

pub mod hybrid;
pub mod vector;

pub use hybrid::{
    hybrid_search, reciprocal_rank_fusion, weighted_fusion, ChunkCandidate, FusionMethod,
    HybridResult,
};
pub use vector::{
    VectorIndex, VectorIndexConfig, VectorIndexStats, VectorSearchError, DEFAULT_CONNECTIVITY,
    DEFAULT_DIMENSIONS,
};
