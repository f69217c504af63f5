//! Runtime configuration.
//!
//! Holds exactly the keys enumerated in the external-interfaces contract,
//! loaded from environment variables with typed defaults. Constructed
//! explicitly by the caller (CLI, test harness, ...) rather than read from a
//! process-wide global, so tests can run several configurations side by side.

use std::env;
use std::time::Duration;

/// Canonical embedding dimension. Chunk and MemorySummary embeddings are
/// always zero-padded or produced at exactly this width.
pub const DEFAULT_EMBEDDING_DIM: usize = 512;

#[derive(Debug, Clone)]
pub struct Config {
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub rag_top_k: usize,
    pub rag_hybrid_alpha: f32,
    pub rag_min_similarity: f32,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_context_window: u32,
    pub web_search_results: usize,
    pub web_scrape_timeout: Duration,
    pub memory_episodic_days: i64,
    pub memory_consolidation_days: i64,
    pub memory_forget_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding_model: "memoria-hashing-v1".to_string(),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            chunk_size: 512,
            chunk_overlap: 50,
            rag_top_k: 5,
            rag_hybrid_alpha: 0.7,
            rag_min_similarity: 0.3,
            llm_temperature: 0.7,
            llm_max_tokens: 2048,
            llm_context_window: 4096,
            web_search_results: 5,
            web_scrape_timeout: Duration::from_secs(10),
            memory_episodic_days: 7,
            memory_consolidation_days: 30,
            memory_forget_threshold: 0.10,
        }
    }
}

impl Config {
    /// Load from the environment, falling back to defaults for unset or
    /// unparsable keys. Never panics; a malformed value is logged and the
    /// default is used instead.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            embedding_model: env_string("EMBEDDING_MODEL", defaults.embedding_model),
            embedding_dim: env_parsed("EMBEDDING_DIM", defaults.embedding_dim),
            chunk_size: env_parsed("CHUNK_SIZE", defaults.chunk_size),
            chunk_overlap: env_parsed("CHUNK_OVERLAP", defaults.chunk_overlap),
            rag_top_k: env_parsed("RAG_TOP_K", defaults.rag_top_k),
            rag_hybrid_alpha: env_parsed("RAG_HYBRID_ALPHA", defaults.rag_hybrid_alpha),
            rag_min_similarity: env_parsed("RAG_MIN_SIMILARITY", defaults.rag_min_similarity),
            llm_temperature: env_parsed("LLM_TEMPERATURE", defaults.llm_temperature),
            llm_max_tokens: env_parsed("LLM_MAX_TOKENS", defaults.llm_max_tokens),
            llm_context_window: env_parsed("LLM_CONTEXT_WINDOW", defaults.llm_context_window),
            web_search_results: env_parsed("WEB_SEARCH_RESULTS", defaults.web_search_results),
            web_scrape_timeout: Duration::from_secs(env_parsed(
                "WEB_SCRAPE_TIMEOUT",
                defaults.web_scrape_timeout.as_secs(),
            )),
            memory_episodic_days: env_parsed("MEMORY_EPISODIC_DAYS", defaults.memory_episodic_days),
            memory_consolidation_days: env_parsed(
                "MEMORY_CONSOLIDATION_DAYS",
                defaults.memory_consolidation_days,
            ),
            memory_forget_threshold: env_parsed(
                "MEMORY_FORGET_THRESHOLD",
                defaults.memory_forget_threshold,
            ),
        }
    }
}

fn env_string(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, raw, "failed to parse config value, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Recognized keys under `UserPreference.search_opts`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOpts {
    #[serde(default)]
    pub rerank_enabled: Option<bool>,
    #[serde(default)]
    pub temporal_weight: Option<f32>,
    #[serde(default)]
    pub prefer_content_types: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.embedding_dim, 512);
        assert_eq!(cfg.chunk_size, 512);
        assert_eq!(cfg.chunk_overlap, 50);
        assert_eq!(cfg.rag_top_k, 5);
        assert!((cfg.rag_hybrid_alpha - 0.7).abs() < f32::EPSILON);
        assert!((cfg.memory_forget_threshold - 0.10).abs() < f32::EPSILON);
    }

    #[test]
    fn env_parsed_falls_back_on_garbage() {
        // SAFETY: test-only, no other thread reads this var concurrently.
        unsafe { env::set_var("CHUNK_SIZE", "not-a-number") };
        let cfg = Config::from_env();
        assert_eq!(cfg.chunk_size, 512);
        unsafe { env::remove_var("CHUNK_SIZE") };
    }
}
