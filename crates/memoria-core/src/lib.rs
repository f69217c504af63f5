//! # Memoria Core
//!
//! Per-user multi-modal personal memory and retrieval-augmented generation
//! engine. Text, image, PDF, and audio content is ingested into timestamped
//! Memories, embedded and chunked for dense retrieval, classified into
//! episodic/semantic/procedural tiers, consolidated and forgotten over time,
//! and surfaced back through a RAG pipeline that blends local memory with
//! optional live web search before answering through a pluggable chat model.
//!
//! ## Components
//!
//! - [`embeddings`] — Embedding Service (A): pluggable backend, LRU cache, dedup.
//! - [`lexical`] — Lexical Ranker (B): BM25 over an ephemeral per-call corpus.
//! - [`search`] — Hybrid Search (C): dense kNN + lexical re-score + fusion.
//! - [`storage`] — Memory Store (D): SQLite-backed, atomic, transactional.
//! - [`memory_manager`] — Memory Manager (E): classification, importance,
//!   consolidation, forgetting, hierarchical retrieval.
//! - [`query`] — Query Analyzer (F): intent/shape classification, decomposition.
//! - [`context`] — Context Builder (G): token-budgeted context and prompt assembly.
//! - [`rag`] — RAG Orchestrator (H): ties F/E/G/the LM/web adapters together.
//! - [`rerank`] — Re-ranker (I): preference-driven boost/suppress.
//! - [`ingestion`] — Ingestion Coordinator (J): chunking, multimodal routing.
//! - [`llm`] — LM adapter: chat-completion seam plus a real Ollama client.
//! - [`web`] — Web search/scrape adapters.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use memoria_core::{Config, IngestInput, IngestionCoordinator, Storage};
//! use std::sync::Arc;
//!
//! let storage = Arc::new(Storage::new(None, 512)?);
//! let embeddings = Arc::new(memoria_core::EmbeddingService::new(backend, 512));
//! let coordinator = IngestionCoordinator::new(storage, embeddings, Config::default());
//!
//! let memory = coordinator
//!     .ingest(IngestInput {
//!         user_id,
//!         content_type: memoria_core::ContentType::Text,
//!         content: "The mitochondria is the powerhouse of the cell".to_string(),
//!         blob_ref: None,
//!         meta: serde_json::Value::Null,
//!         memory_type: None,
//!     })
//!     .await?;
//! ```
//!
//! ## Feature flags
//!
//! - `vector-search` (default): HNSW vector search via USearch.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod context;
pub mod error;
pub mod ingestion;
pub mod lexical;
pub mod llm;
pub mod memory_manager;
pub mod model;
pub mod query;
pub mod rag;
pub mod rerank;
pub mod storage;
pub mod web;

#[cfg(feature = "vector-search")]
#[cfg_attr(docsrs, doc(cfg(feature = "vector-search")))]
pub mod search;

pub mod embeddings;

pub use config::{Config, SearchOpts, DEFAULT_EMBEDDING_DIM};
pub use context::{
    build_context, build_prompt, extract_citations, ChatMessage, CharApproxTokenCounter, Citation,
    ContextSource, TokenCounter, DEFAULT_SYSTEM_PROMPT,
};
pub use embeddings::{
    cosine_similarity, dot_product, euclidean_distance, CacheStats, EmbedOpts, Embedding,
    EmbeddingBackend, EmbeddingError, EmbeddingQuality, EmbeddingService, HashingEmbeddingBackend,
};
pub use error::{MemoriaError, Result};
pub use ingestion::{
    chunk_text, AsrCollaborator, CollaboratorOutput, IngestionBackend, IngestionCoordinator,
    NullCollaborator, PdfCollaborator, VisionCollaborator,
};
pub use lexical::{tokenize, Doc, LexicalRanker};
pub use llm::{
    fallback_message, ChatClient, ChatOpts, FallbackChatClient, LlmError, OllamaChatClient,
};
pub use memory_manager::{
    build_summary_prompt, classify_memory, cluster_memories, embedding_variance,
    importance_score, importance_to_persisted, ConsolidationReport, HierarchicalMatch,
    MemoryBackend, MemoryManager, SummaryGenerator,
};
pub use model::{
    AccessKind, Chunk, ContentType, Conversation, IngestInput, Memory, MemoryAccess,
    MemorySummary, MemoryType, Message, RecallInput, Role, User, UserPreference, WebSource,
};
pub use query::{
    analyze, classify_intent, classify_question_type, extract_keywords, parse_sub_questions,
    rewrite_query, should_search_web, Intent, QueryAnalysis, QueryDecomposer, QuestionType,
    DECOMPOSITION_PROMPT,
};
pub use rag::{RagAnswer, RagBackend, RagOrchestrator, RagRequest};
pub use rerank::{rerank, RankedResult};
pub use storage::{Storage, StorageError};
pub use web::{
    BraveSearchProvider, FallbackSearchProvider, HttpWebScraper, NullWebScraper,
    NullWebSearchProvider, ScrapedPage, SearchHit, SerpApiSearchProvider, WebError,
    WebScraper, WebSearchProvider,
};

#[cfg(feature = "vector-search")]
pub use search::{
    hybrid_search, reciprocal_rank_fusion, weighted_fusion, ChunkCandidate, FusionMethod,
    HybridResult, VectorIndex, VectorIndexConfig, VectorIndexStats, VectorSearchError,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::{
        ChatClient, Config, ContentType, EmbeddingService, IngestInput, IngestionCoordinator,
        MemoriaError, Memory, MemoryManager, MemoryType, RagOrchestrator, RagRequest, Result,
        Storage,
    };
}
