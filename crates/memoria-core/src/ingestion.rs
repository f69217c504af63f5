//! Ingestion Coordinator (component J).
//!
//! Text is chunked by a recursive splitter over `["\n\n","\n",". "," ",""]`
//! honoring a token-length budget (ground-up: `text_processor.py` chunks via
//! `RecursiveCharacterTextSplitter` with the same cascade, but the teacher
//! never chunked, so this is implemented fresh in its idiom — a small
//! recursive function over `&str` slices). Image/PDF/audio ingestion defers
//! to an external collaborator trait per modality; spec.md excludes their
//! implementation, so each has a `NullCollaborator` stub for tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::config::Config;
use crate::embeddings::{EmbedOpts, EmbeddingService};
use crate::error::{MemoriaError, Result};
use crate::memory_manager::{classify_memory, embedding_variance, importance_score, importance_to_persisted};
use crate::model::{Chunk, ContentType, IngestInput, Memory};

const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " ", ""];

fn approx_tokens(s: &str) -> usize {
    s.len().div_ceil(4)
}

/// Splits `text` on the first separator in `separators` present in it,
/// recursively re-splitting any resulting piece still over `chunk_size`
/// tokens with the next separator in the cascade.
fn split_recursive(text: &str, separators: &[&str], chunk_size: usize) -> Vec<String> {
    if approx_tokens(text) <= chunk_size {
        return vec![text.to_string()];
    }
    let Some((&sep, next_seps)) = separators.split_first() else {
        return vec![text.to_string()];
    };

    let pieces: Vec<String> = if sep.is_empty() {
        text.chars().map(|c| c.to_string()).collect()
    } else {
        let mut pieces = Vec::new();
        let mut rest = text;
        while let Some(idx) = rest.find(sep) {
            let end = idx + sep.len();
            pieces.push(rest[..end].to_string());
            rest = &rest[end..];
        }
        if !rest.is_empty() {
            pieces.push(rest.to_string());
        }
        pieces
    };

    pieces
        .into_iter()
        .flat_map(|piece| {
            if approx_tokens(&piece) > chunk_size && !next_seps.is_empty() {
                split_recursive(&piece, next_seps, chunk_size)
            } else {
                vec![piece]
            }
        })
        .collect()
}

/// Greedily packs `pieces` into chunks up to `chunk_size` tokens, carrying
/// roughly `overlap` tokens of trailing context into the next chunk.
fn merge_with_overlap(pieces: Vec<String>, chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        if !current.is_empty() && approx_tokens(&current) + approx_tokens(&piece) > chunk_size {
            chunks.push(current.trim().to_string());
            let overlap_bytes = (overlap * 4).min(current.len());
            let keep_from = current.len() - overlap_bytes;
            let safe_from = (keep_from..=current.len()).find(|&i| current.is_char_boundary(i)).unwrap_or(current.len());
            current = current[safe_from..].to_string();
        }
        current.push_str(&piece);
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks.into_iter().filter(|c| !c.is_empty()).collect()
}

/// §4.10's recursive splitter. Returns no chunks for blank input.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    merge_with_overlap(split_recursive(text, SEPARATORS, chunk_size), chunk_size, overlap)
}

/// What an external modality collaborator hands back to the coordinator.
#[derive(Debug, Clone)]
pub struct CollaboratorOutput {
    pub canonical_text: String,
    /// Pre-computed embeddings, one per chunk of `canonical_text` the
    /// collaborator has already produced (e.g. a vision model emitting a
    /// single chunk with its own vector). `None` routes through the normal
    /// chunk-then-embed path instead.
    pub per_chunk_embeddings: Option<Vec<Vec<f32>>>,
    pub meta: serde_json::Value,
}

#[async_trait]
pub trait VisionCollaborator: Send + Sync {
    async fn describe(&self, blob_ref: &str) -> Result<CollaboratorOutput>;
}

#[async_trait]
pub trait PdfCollaborator: Send + Sync {
    async fn extract(&self, blob_ref: &str) -> Result<CollaboratorOutput>;
}

#[async_trait]
pub trait AsrCollaborator: Send + Sync {
    async fn transcribe(&self, blob_ref: &str) -> Result<CollaboratorOutput>;
}

/// Out of scope per spec.md — every method reports the modality as
/// unavailable. Swap in a real collaborator to enable image/PDF/audio
/// ingestion.
pub struct NullCollaborator;

#[async_trait]
impl VisionCollaborator for NullCollaborator {
    async fn describe(&self, blob_ref: &str) -> Result<CollaboratorOutput> {
        Err(MemoriaError::DependencyUnavailable(format!("no vision collaborator configured for {blob_ref}")))
    }
}

#[async_trait]
impl PdfCollaborator for NullCollaborator {
    async fn extract(&self, blob_ref: &str) -> Result<CollaboratorOutput> {
        Err(MemoriaError::DependencyUnavailable(format!("no pdf collaborator configured for {blob_ref}")))
    }
}

#[async_trait]
impl AsrCollaborator for NullCollaborator {
    async fn transcribe(&self, blob_ref: &str) -> Result<CollaboratorOutput> {
        Err(MemoriaError::DependencyUnavailable(format!("no asr collaborator configured for {blob_ref}")))
    }
}

/// Storage seam the coordinator needs: one atomic insert of a Memory plus
/// its Chunks.
#[async_trait]
pub trait IngestionBackend: Send + Sync {
    async fn create_memory(&self, memory: &Memory, chunks: &[Chunk]) -> Result<()>;
}

#[async_trait]
impl<T: IngestionBackend + ?Sized> IngestionBackend for Arc<T> {
    async fn create_memory(&self, memory: &Memory, chunks: &[Chunk]) -> Result<()> {
        (**self).create_memory(memory, chunks).await
    }
}

fn pad(mut vector: Vec<f32>, target_dim: usize) -> Vec<f32> {
    vector.resize(target_dim, 0.0);
    vector
}

pub struct IngestionCoordinator<B: IngestionBackend> {
    backend: B,
    embeddings: Arc<EmbeddingService>,
    config: Config,
    vision: Arc<dyn VisionCollaborator>,
    pdf: Arc<dyn PdfCollaborator>,
    asr: Arc<dyn AsrCollaborator>,
}

impl<B: IngestionBackend> IngestionCoordinator<B> {
    pub fn new(backend: B, embeddings: Arc<EmbeddingService>, config: Config) -> Self {
        Self {
            backend,
            embeddings,
            config,
            vision: Arc::new(NullCollaborator),
            pdf: Arc::new(NullCollaborator),
            asr: Arc::new(NullCollaborator),
        }
    }

    pub fn with_collaborators(
        mut self,
        vision: Arc<dyn VisionCollaborator>,
        pdf: Arc<dyn PdfCollaborator>,
        asr: Arc<dyn AsrCollaborator>,
    ) -> Self {
        self.vision = vision;
        self.pdf = pdf;
        self.asr = asr;
        self
    }

    async fn resolve_content(&self, input: &IngestInput) -> Result<CollaboratorOutput> {
        match input.content_type {
            ContentType::Text | ContentType::Web => {
                Ok(CollaboratorOutput { canonical_text: input.content.clone(), per_chunk_embeddings: None, meta: input.meta.clone() })
            }
            ContentType::Image => {
                let blob_ref = input
                    .blob_ref
                    .as_deref()
                    .ok_or_else(|| MemoriaError::Validation("image memory requires blob_ref".to_string()))?;
                self.vision.describe(blob_ref).await
            }
            ContentType::Pdf => {
                let blob_ref = input
                    .blob_ref
                    .as_deref()
                    .ok_or_else(|| MemoriaError::Validation("pdf memory requires blob_ref".to_string()))?;
                self.pdf.extract(blob_ref).await
            }
            ContentType::Audio => {
                let blob_ref = input
                    .blob_ref
                    .as_deref()
                    .ok_or_else(|| MemoriaError::Validation("audio memory requires blob_ref".to_string()))?;
                self.asr.transcribe(blob_ref).await
            }
        }
    }

    /// §4.10 end to end: resolve content, chunk (or take pre-computed
    /// per-chunk embeddings), embed, classify, score, persist atomically.
    pub async fn ingest(&self, input: IngestInput) -> Result<Memory> {
        let resolved = self.resolve_content(&input).await?;
        if resolved.canonical_text.trim().is_empty() {
            return Err(MemoriaError::Validation("memory content is empty".to_string()));
        }

        let memory_id = Uuid::new_v4();
        let target_dim = self.config.embedding_dim;

        let (texts, vectors): (Vec<String>, Vec<Vec<f32>>) = match resolved.per_chunk_embeddings {
            Some(pre) => (vec![resolved.canonical_text.clone()], pre.into_iter().map(|v| pad(v, target_dim)).collect()),
            None => {
                let pieces = chunk_text(&resolved.canonical_text, self.config.chunk_size, self.config.chunk_overlap);
                if pieces.is_empty() {
                    return Err(MemoriaError::Validation("memory content is empty".to_string()));
                }
                let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
                let embedded = self.embeddings.embed_batch(&refs, EmbedOpts::with_target_dim(target_dim))?;
                (pieces, embedded.into_iter().map(|e| e.vector).collect())
            }
        };

        let chunks: Vec<Chunk> = texts
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, embedding))| Chunk { id: Uuid::new_v4(), memory_id, chunk_index: i as i64, text, embedding })
            .collect();

        let now = Utc::now();
        let variance = embedding_variance(&chunks.iter().map(|c| c.embedding.clone()).collect::<Vec<_>>());
        let importance = importance_score(now, None, 0, input.content_type, variance, now);
        let memory_type = classify_memory(&resolved.canonical_text, input.content_type, input.memory_type);

        let memory = Memory {
            id: memory_id,
            user_id: input.user_id,
            content_type: input.content_type,
            content: resolved.canonical_text,
            meta: resolved.meta,
            blob_ref: input.blob_ref,
            created_at: now,
            last_accessed: now,
            memory_type,
            importance: importance_to_persisted(importance),
        };

        self.backend.create_memory(&memory, &chunks).await?;
        Ok(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::backend::HashingEmbeddingBackend;
    use std::sync::Mutex;

    #[test]
    fn chunk_text_returns_empty_for_blank_input() {
        assert!(chunk_text("   \n  ", 512, 50).is_empty());
    }

    #[test]
    fn chunk_text_splits_on_paragraph_boundary_when_too_long() {
        let para_a = "alpha ".repeat(200);
        let para_b = "beta ".repeat(200);
        let text = format!("{para_a}\n\n{para_b}");
        let chunks = chunk_text(&text, 100, 10);
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn chunk_text_keeps_short_text_as_one_chunk() {
        let chunks = chunk_text("a short memory", 512, 50);
        assert_eq!(chunks, vec!["a short memory".to_string()]);
    }

    #[test]
    fn chunk_text_overlap_carries_trailing_words_forward() {
        let text = "one two three four five six seven eight nine ten ".repeat(20);
        let chunks = chunk_text(&text, 20, 10);
        assert!(chunks.len() >= 2);
        let tail_of_first: Vec<&str> = chunks[0].split_whitespace().rev().take(2).collect();
        assert!(tail_of_first.iter().any(|w| chunks[1].contains(w)));
    }

    struct RecordingBackend {
        calls: Mutex<Vec<(Memory, Vec<Chunk>)>>,
    }

    #[async_trait]
    impl IngestionBackend for RecordingBackend {
        async fn create_memory(&self, memory: &Memory, chunks: &[Chunk]) -> Result<()> {
            self.calls.lock().unwrap().push((memory.clone(), chunks.to_vec()));
            Ok(())
        }
    }

    fn coordinator(dim: usize) -> IngestionCoordinator<RecordingBackend> {
        let backend = RecordingBackend { calls: Mutex::new(Vec::new()) };
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(HashingEmbeddingBackend::new(dim)), dim));
        IngestionCoordinator::new(backend, embeddings, Config { embedding_dim: dim, chunk_size: 512, chunk_overlap: 50, ..Config::default() })
    }

    #[tokio::test]
    async fn ingest_text_persists_memory_with_chunks() {
        let coordinator = coordinator(16);
        let input = IngestInput {
            user_id: Uuid::new_v4(),
            content_type: ContentType::Text,
            content: "the mitochondria is the powerhouse of the cell".to_string(),
            blob_ref: None,
            meta: serde_json::Value::Null,
            memory_type: None,
        };
        let memory = coordinator.ingest(input).await.unwrap();
        assert_eq!(memory.content_type, ContentType::Text);
        let calls = coordinator.backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].1.is_empty());
        assert_eq!(calls[0].1[0].embedding.len(), 16);
    }

    #[tokio::test]
    async fn ingest_rejects_empty_text() {
        let coordinator = coordinator(16);
        let input = IngestInput {
            user_id: Uuid::new_v4(),
            content_type: ContentType::Text,
            content: "   ".to_string(),
            blob_ref: None,
            meta: serde_json::Value::Null,
            memory_type: None,
        };
        let err = coordinator.ingest(input).await.unwrap_err();
        assert!(matches!(err, MemoriaError::Validation(_)));
    }

    #[tokio::test]
    async fn ingest_image_without_collaborator_reports_dependency_unavailable() {
        let coordinator = coordinator(16);
        let input = IngestInput {
            user_id: Uuid::new_v4(),
            content_type: ContentType::Image,
            content: String::new(),
            blob_ref: Some("users/1/images/photo.png".to_string()),
            meta: serde_json::Value::Null,
            memory_type: None,
        };
        let err = coordinator.ingest(input).await.unwrap_err();
        assert!(matches!(err, MemoriaError::DependencyUnavailable(_)));
    }

    #[tokio::test]
    async fn ingest_image_without_blob_ref_is_a_validation_error() {
        let coordinator = coordinator(16);
        let input = IngestInput {
            user_id: Uuid::new_v4(),
            content_type: ContentType::Image,
            content: String::new(),
            blob_ref: None,
            meta: serde_json::Value::Null,
            memory_type: None,
        };
        let err = coordinator.ingest(input).await.unwrap_err();
        assert!(matches!(err, MemoriaError::Validation(_)));
    }
}
