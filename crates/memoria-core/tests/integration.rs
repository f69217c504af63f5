//! Cross-module integration tests: ingestion into storage, retrieval
//! through the Memory Manager, consolidation, and forgetting. Uses a
//! scratch on-disk SQLite file per test via `tempfile`, and the
//! deterministic `HashingEmbeddingBackend` so runs need no network access.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use memoria_core::{
    Config, ContentType, EmbedOpts, EmbeddingService, HashingEmbeddingBackend, IngestInput,
    IngestionCoordinator, MemoryManager, MemoryType, Storage, SummaryGenerator,
};

fn test_storage() -> (Arc<Storage>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("memoria.db");
    let config = Config::default();
    let storage = Arc::new(Storage::new(Some(db_path), config.embedding_dim).expect("open storage"));
    (storage, dir)
}

fn test_embeddings(config: &Config) -> Arc<EmbeddingService> {
    Arc::new(EmbeddingService::new(
        Arc::new(HashingEmbeddingBackend::new(config.embedding_dim)),
        config.embedding_dim,
    ))
}

/// Deterministic stand-in for an LM-backed adapter, built the same way
/// `memoria-cli`'s `ChatClientSummaryGenerator` is: at the call site, never
/// inside `memoria-core` itself.
struct StubSummaryGenerator;

#[async_trait]
impl SummaryGenerator for StubSummaryGenerator {
    async fn summarize(&self, _prompt: &str) -> memoria_core::Result<String> {
        Ok("stub summary".to_string())
    }
}

#[tokio::test]
async fn ingest_then_retrieve_hierarchical_round_trip() {
    let (storage, _dir) = test_storage();
    let config = Config::default();
    let embeddings = test_embeddings(&config);
    let user_id = Uuid::new_v4();

    let coordinator = IngestionCoordinator::new(storage.clone(), embeddings.clone(), config.clone());
    let memory = coordinator
        .ingest(IngestInput {
            user_id,
            content_type: ContentType::Text,
            content: "The mitochondria is the powerhouse of the cell".to_string(),
            blob_ref: None,
            meta: serde_json::Value::Null,
            memory_type: Some(MemoryType::Episodic),
        })
        .await
        .expect("ingest");

    let manager = MemoryManager::new(storage.clone(), config.clone());
    let embedding = embeddings
        .embed("What powers a cell?", EmbedOpts::with_target_dim(config.embedding_dim))
        .expect("embed query");

    let matches = manager
        .retrieve_hierarchical(user_id, &embedding.vector, 5, true, Utc::now())
        .await
        .expect("retrieve");

    assert!(matches.iter().any(|m| m.memory_id == memory.id));
}

#[tokio::test]
async fn ingest_assigns_episodic_by_default_and_respects_explicit_override() {
    let (storage, _dir) = test_storage();
    let config = Config::default();
    let embeddings = test_embeddings(&config);
    let user_id = Uuid::new_v4();
    let coordinator = IngestionCoordinator::new(storage.clone(), embeddings.clone(), config.clone());

    let explicit = coordinator
        .ingest(IngestInput {
            user_id,
            content_type: ContentType::Text,
            content: "Always boil pasta in salted water".to_string(),
            blob_ref: None,
            meta: serde_json::Value::Null,
            memory_type: Some(MemoryType::Procedural),
        })
        .await
        .expect("ingest");

    assert_eq!(explicit.memory_type, MemoryType::Procedural);
}

#[tokio::test]
async fn forgetting_never_increases_memory_count_and_is_idempotent() {
    let (storage, _dir) = test_storage();
    let config = Config::default();
    let embeddings = test_embeddings(&config);
    let user_id = Uuid::new_v4();
    let coordinator = IngestionCoordinator::new(storage.clone(), embeddings.clone(), config.clone());

    for text in ["first note", "second note", "third note"] {
        coordinator
            .ingest(IngestInput {
                user_id,
                content_type: ContentType::Text,
                content: text.to_string(),
                blob_ref: None,
                meta: serde_json::Value::Null,
                memory_type: Some(MemoryType::Episodic),
            })
            .await
            .expect("ingest");
    }

    let (_, before) = storage.get_memories(user_id, 0, 100).expect("get_memories before");

    let manager = MemoryManager::new(storage.clone(), config.clone());
    // All memories are fresh, so nothing is old enough to be forgotten yet.
    let deleted_now = manager.forget_unimportant(user_id, Utc::now()).await.expect("forget now");
    assert_eq!(deleted_now, 0);

    // Run the sweep again as if from far in the future: unimportant memories
    // go, and a second run against the same horizon finds nothing left to do.
    let far_future = Utc::now() + Duration::days(config.memory_consolidation_days + 1);
    let deleted_first = manager.forget_unimportant(user_id, far_future).await.expect("forget future");
    let deleted_second = manager.forget_unimportant(user_id, far_future).await.expect("forget future again");

    let (_, after) = storage.get_memories(user_id, 0, 100).expect("get_memories after");

    assert_eq!(deleted_second, 0, "a second sweep against the same horizon should find nothing left to forget");
    assert!(after <= before, "forgetting must never increase the memory count");
    assert_eq!(before - after, deleted_first);
}

fn backdated_memory(user_id: Uuid, content: &str, age_days: i64) -> memoria_core::Memory {
    let created_at = Utc::now() - Duration::days(age_days);
    memoria_core::Memory {
        id: Uuid::new_v4(),
        user_id,
        content_type: ContentType::Text,
        content: content.to_string(),
        meta: serde_json::Value::Null,
        blob_ref: None,
        created_at,
        last_accessed: created_at,
        memory_type: MemoryType::Episodic,
        importance: 50,
    }
}

fn chunk_for(memory_id: Uuid, text: &str, embedding: Vec<f32>) -> memoria_core::Chunk {
    memoria_core::Chunk { id: Uuid::new_v4(), memory_id, chunk_index: 0, text: text.to_string(), embedding }
}

#[tokio::test]
async fn consolidation_is_idempotent_on_a_second_pass() {
    let (storage, _dir) = test_storage();
    let config = Config::default();
    let embeddings = test_embeddings(&config);
    let user_id = Uuid::new_v4();

    // Two near-duplicate old episodic memories that should cluster together,
    // old enough to clear `memory_consolidation_days`.
    for text in ["Met Alice for coffee downtown", "Had coffee with Alice downtown"] {
        let memory = backdated_memory(user_id, text, config.memory_consolidation_days + 5);
        let embedding = embeddings
            .embed(text, EmbedOpts::with_target_dim(config.embedding_dim))
            .expect("embed");
        let chunk = chunk_for(memory.id, text, embedding.vector);
        storage.create_memory(&memory, std::slice::from_ref(&chunk)).expect("create_memory");
    }

    let manager = MemoryManager::new(storage.clone(), config.clone());
    let generator = StubSummaryGenerator;
    let embeddings_for_closure = embeddings.clone();
    let target_dim = config.embedding_dim;
    let embed = move |text: &str| {
        let embeddings = embeddings_for_closure.clone();
        let text = text.to_string();
        Box::pin(async move {
            let embedding = embeddings.embed(&text, EmbedOpts::with_target_dim(target_dim))?;
            Ok(embedding.vector)
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = memoria_core::Result<Vec<f32>>> + Send>>
    };

    let now = Utc::now();
    let first = manager.consolidate(user_id, &generator, embed.clone(), now).await.expect("consolidate first");
    // Whether the two near-duplicates land in one cluster or two, every
    // candidate gets summarized exactly once on the first pass.
    assert_eq!(first.memories_consolidated, 2);
    assert!(first.summaries_created >= 1);

    // The consolidated memories are now referenced by a summary, so a second
    // pass over the same data must not create another summary from them.
    let second = manager.consolidate(user_id, &generator, embed, now).await.expect("consolidate second");
    assert_eq!(second.summaries_created, 0);
    assert_eq!(second.memories_consolidated, 0);
}
