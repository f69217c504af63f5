//! Embedding Service (component A).
//!
//! Wraps a pluggable [`EmbeddingBackend`] with an LRU cache keyed by
//! `sha256(text) ⊕ model_tag`, exact-duplicate detection via MD5 over
//! normalized text, adaptive batch sizing, and zero-padding to the
//! canonical dimension.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};

use super::backend::EmbeddingBackend;

const DEFAULT_CACHE_SIZE: usize = 10_000;

#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum EmbeddingError {
    ModelInit(String),
    EmbeddingFailed(String),
    InvalidInput(String),
}

impl std::fmt::Display for EmbeddingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingError::ModelInit(e) => write!(f, "model initialization failed: {e}"),
            EmbeddingError::EmbeddingFailed(e) => write!(f, "embedding generation failed: {e}"),
            EmbeddingError::InvalidInput(e) => write!(f, "invalid input: {e}"),
        }
    }
}

impl std::error::Error for EmbeddingError {}

/// A semantic embedding vector, always exactly `target_dim` wide once it
/// leaves [`EmbeddingService`].
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub dimensions: usize,
    /// True unless the raw model output was NaN-contaminated or zero-norm.
    pub valid: bool,
}

impl Embedding {
    pub fn new(vector: Vec<f32>) -> Self {
        let dimensions = vector.len();
        let valid = is_valid(&vector);
        Self {
            vector,
            dimensions,
            valid,
        }
    }

    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.vector, &other.vector)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self::new(vector))
    }
}

fn is_valid(vector: &[f32]) -> bool {
    if vector.iter().any(|x| x.is_nan()) {
        return false;
    }
    vector.iter().any(|&x| x != 0.0)
}

/// Quality report produced by [`EmbeddingService::analyze`].
#[derive(Debug, Clone)]
pub struct EmbeddingQuality {
    pub dimensions: usize,
    pub norm: f32,
    pub mean: f32,
    pub stddev: f32,
    pub non_zero_ratio: f32,
    pub valid: bool,
}

fn analyze_vector(vector: &[f32]) -> EmbeddingQuality {
    let dimensions = vector.len();
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mean = if dimensions > 0 {
        vector.iter().sum::<f32>() / dimensions as f32
    } else {
        0.0
    };
    let variance = if dimensions > 0 {
        vector.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / dimensions as f32
    } else {
        0.0
    };
    let non_zero = vector.iter().filter(|&&x| x != 0.0).count();
    let non_zero_ratio = if dimensions > 0 {
        non_zero as f32 / dimensions as f32
    } else {
        0.0
    };
    EmbeddingQuality {
        dimensions,
        norm,
        mean,
        stddev: variance.sqrt(),
        non_zero_ratio,
        valid: is_valid(vector),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

struct Inner {
    cache: LruCache<String, Vec<f32>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Options recognized by [`EmbeddingService::embed`] / `embed_batch`.
#[derive(Debug, Clone, Copy)]
pub struct EmbedOpts {
    pub use_cache: bool,
    pub deduplicate: bool,
    pub target_dim: usize,
}

impl EmbedOpts {
    pub fn with_target_dim(target_dim: usize) -> Self {
        Self {
            use_cache: true,
            deduplicate: true,
            target_dim,
        }
    }
}

pub struct EmbeddingService {
    backend: std::sync::Arc<dyn EmbeddingBackend>,
    target_dim: usize,
    inner: Mutex<Inner>,
}

impl EmbeddingService {
    pub fn new(backend: std::sync::Arc<dyn EmbeddingBackend>, target_dim: usize) -> Self {
        Self::with_cache_size(backend, target_dim, DEFAULT_CACHE_SIZE)
    }

    pub fn with_cache_size(
        backend: std::sync::Arc<dyn EmbeddingBackend>,
        target_dim: usize,
        cache_size: usize,
    ) -> Self {
        let cap = NonZeroUsize::new(cache_size.max(1)).expect("cache_size clamped to >=1 above");
        Self {
            backend,
            target_dim,
            inner: Mutex::new(Inner {
                cache: LruCache::new(cap),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn model_tag(&self) -> String {
        self.backend.model_tag().to_string()
    }

    pub fn dimensions(&self) -> usize {
        self.target_dim
    }

    pub fn cache_stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("embedding cache lock poisoned");
        CacheStats {
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
        }
    }

    fn cache_key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        format!("{:x}:{}", digest, self.backend.model_tag())
    }

    pub fn embed(&self, text: &str, opts: EmbedOpts) -> Result<Embedding, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("text cannot be empty".into()));
        }
        let vectors = self.embed_batch(&[text], opts)?;
        Ok(vectors.into_iter().next().expect("one input yields one output"))
    }

    /// Embed a batch of texts. Applies dedup (normalize + MD5 grouping),
    /// adaptive batch sizing, per-text LRU caching, and zero-pads every
    /// output vector to `opts.target_dim`.
    pub fn embed_batch(
        &self,
        texts: &[&str],
        opts: EmbedOpts,
    ) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Step 1: resolve cache hits, collect the rest as distinct work.
        let mut resolved: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut to_embed_idx: Vec<usize> = Vec::new();

        if opts.use_cache {
            let mut inner = self.inner.lock().expect("embedding cache lock poisoned");
            for (i, text) in texts.iter().enumerate() {
                let key = self.cache_key(text);
                if let Some(v) = inner.cache.get(&key) {
                    inner.hits.fetch_add(1, Ordering::Relaxed);
                    resolved[i] = Some(v.clone());
                } else {
                    inner.misses.fetch_add(1, Ordering::Relaxed);
                    to_embed_idx.push(i);
                }
            }
        } else {
            to_embed_idx = (0..texts.len()).collect();
        }

        if !to_embed_idx.is_empty() {
            let fresh = self.embed_uncached(texts, &to_embed_idx, opts.deduplicate)?;
            if opts.use_cache {
                let mut inner = self.inner.lock().expect("embedding cache lock poisoned");
                for (&idx, vector) in to_embed_idx.iter().zip(fresh.iter()) {
                    let key = self.cache_key(texts[idx]);
                    inner.cache.put(key, vector.clone());
                }
            }
            for (idx, vector) in to_embed_idx.into_iter().zip(fresh.into_iter()) {
                resolved[idx] = Some(vector);
            }
        }

        Ok(resolved
            .into_iter()
            .map(|v| v.expect("every index resolved by cache hit or fresh embed"))
            .map(|v| Embedding::new(pad_to(v, opts.target_dim)))
            .collect())
    }

    /// Run dedup + adaptive batching against the backend for the given
    /// subset of `texts` (indices in `idxs`), returning one raw vector
    /// (backend-native width) per entry of `idxs`, in the same order.
    fn embed_uncached(
        &self,
        texts: &[&str],
        idxs: &[usize],
        deduplicate: bool,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let subset: Vec<&str> = idxs.iter().map(|&i| texts[i]).collect();

        if !deduplicate {
            return self.embed_adaptive(&subset);
        }

        // Normalize → group identical entries → embed only unique texts →
        // scatter results back to original positions.
        let mut first_seen: HashMap<String, usize> = HashMap::new();
        let mut unique_texts: Vec<&str> = Vec::new();
        let mut position_to_unique: Vec<usize> = Vec::with_capacity(subset.len());

        for &text in &subset {
            let norm = normalize(text);
            let digest = md5_hex(&norm);
            let unique_idx = *first_seen.entry(digest).or_insert_with(|| {
                unique_texts.push(text);
                unique_texts.len() - 1
            });
            position_to_unique.push(unique_idx);
        }

        let unique_vectors = self.embed_adaptive(&unique_texts)?;
        Ok(position_to_unique
            .into_iter()
            .map(|u| unique_vectors[u].clone())
            .collect())
    }

    /// Adaptive batch sizing: `avg_len > 2000 → 8`, `> 1000 → 16`, else `32`.
    fn embed_adaptive(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let total_len: usize = texts.iter().map(|t| t.len()).sum();
        let avg_len = total_len / texts.len();
        let batch_size = if avg_len > 2000 {
            8
        } else if avg_len > 1000 {
            16
        } else {
            32
        };

        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(batch_size) {
            let vectors = self.backend.embed_batch(chunk)?;
            for v in vectors {
                if v.iter().any(|x| x.is_nan()) || v.iter().all(|&x| x == 0.0) {
                    tracing::warn!("embedding flagged invalid (NaN or zero-norm)");
                }
                out.push(v);
            }
        }
        Ok(out)
    }

    pub fn analyze(&self, vector: &[f32]) -> EmbeddingQuality {
        analyze_vector(vector)
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn md5_hex(s: &str) -> String {
    use md5::Digest as _;
    format!("{:x}", md5::Md5::digest(s.as_bytes()))
}

fn pad_to(mut vector: Vec<f32>, target_dim: usize) -> Vec<f32> {
    if vector.len() < target_dim {
        vector.resize(target_dim, 0.0);
    } else if vector.len() > target_dim {
        vector.truncate(target_dim);
    }
    vector
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = (norm_a * norm_b).sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt()
}

pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::backend::HashingEmbeddingBackend;
    use std::sync::Arc;

    fn service(dim: usize) -> EmbeddingService {
        EmbeddingService::new(Arc::new(HashingEmbeddingBackend::new(dim)), dim)
    }

    #[test]
    fn embed_pads_to_target_dim() {
        let svc = service(16);
        let opts = EmbedOpts::with_target_dim(512);
        let emb = svc.embed("hello world", opts).unwrap();
        assert_eq!(emb.dimensions, 512);
        assert!(emb.vector[16..].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn cache_hit_returns_identical_vector_and_increments_hits() {
        let svc = service(32);
        let opts = EmbedOpts::with_target_dim(32);
        let first = svc.embed("some text", opts).unwrap();
        let stats_after_first = svc.cache_stats();
        let second = svc.embed("some text", opts).unwrap();
        let stats_after_second = svc.cache_stats();

        assert_eq!(first.vector, second.vector);
        assert_eq!(stats_after_first.misses, 1);
        assert_eq!(stats_after_second.hits, stats_after_first.hits + 1);
        assert_eq!(stats_after_second.misses, stats_after_first.misses);
    }

    #[test]
    fn dedup_scatters_equal_outputs_for_duplicate_inputs() {
        let svc = service(32);
        let opts = EmbedOpts::with_target_dim(32);
        let out = svc.embed_batch(&["hello", "HELLO", "hello"], opts).unwrap();
        assert_eq!(out[0].vector, out[1].vector);
        assert_eq!(out[0].vector, out[2].vector);
    }

    #[test]
    fn embed_batch_matches_individual_embed() {
        let svc = service(32);
        let opts = EmbedOpts::with_target_dim(32);
        let batch = svc.embed_batch(&["alpha", "beta"], opts).unwrap();
        let single_alpha = svc.embed("alpha", opts).unwrap();
        assert_eq!(batch[0].vector, single_alpha.vector);
    }

    #[test]
    fn cosine_similarity_identical_vectors() {
        let a = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&a, &a);
        assert!((sim - 1.0).abs() < 1e-4);
    }
}
