//! Memory Manager (component E).
//!
//! Classification, importance scoring, consolidation, hierarchical
//! retrieval, forgetting, and access logging. The scoring and clustering
//! math here is pure and storage-agnostic; [`MemoryBackend`] is the thin
//! seam the Memory Store (component D) implements so this module never
//! touches SQL directly.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::embeddings::cosine_similarity;
use crate::error::Result;
use crate::model::{ContentType, Memory, MemorySummary, MemoryType};

/// Everything the Memory Manager needs from the Memory Store. `storage`
/// implements this against its SQLite-backed tables and per-user vector
/// indexes.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn access_stats(&self, memory_id: Uuid) -> Result<(i64, Option<DateTime<Utc>>)>;
    async fn chunk_embeddings(&self, memory_id: Uuid) -> Result<Vec<Vec<f32>>>;
    async fn first_chunk_embedding(&self, memory_id: Uuid) -> Result<Option<Vec<f32>>>;

    /// Episodic memories for `user_id` older than `cutoff`, not already
    /// referenced by an active [`MemorySummary`], oldest-created first.
    async fn consolidation_candidates(
        &self,
        user_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>>;

    async fn insert_summary(&self, summary: &MemorySummary) -> Result<()>;

    /// Memories for `user_id` older than `cutoff`, regardless of summary
    /// membership (the caller filters out summarized ones per Design Note
    /// §9(b)).
    async fn forgetting_candidates(&self, user_id: Uuid, cutoff: DateTime<Utc>) -> Result<Vec<Memory>>;
    async fn is_referenced_by_summary(&self, memory_id: Uuid) -> Result<bool>;
    async fn delete_memory(&self, user_id: Uuid, memory_id: Uuid) -> Result<()>;

    async fn recent_episodic_matches(
        &self,
        user_id: Uuid,
        query_vector: &[f32],
        limit: usize,
        since: DateTime<Utc>,
    ) -> Result<Vec<HierarchicalMatch>>;
    async fn summary_matches(
        &self,
        user_id: Uuid,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<HierarchicalMatch>>;

    async fn log_access(&self, memory_id: Uuid, kind: crate::model::AccessKind) -> Result<()>;
}

#[async_trait]
impl<T: MemoryBackend + ?Sized> MemoryBackend for std::sync::Arc<T> {
    async fn access_stats(&self, memory_id: Uuid) -> Result<(i64, Option<DateTime<Utc>>)> {
        (**self).access_stats(memory_id).await
    }
    async fn chunk_embeddings(&self, memory_id: Uuid) -> Result<Vec<Vec<f32>>> {
        (**self).chunk_embeddings(memory_id).await
    }
    async fn first_chunk_embedding(&self, memory_id: Uuid) -> Result<Option<Vec<f32>>> {
        (**self).first_chunk_embedding(memory_id).await
    }
    async fn consolidation_candidates(
        &self,
        user_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        (**self).consolidation_candidates(user_id, cutoff, limit).await
    }
    async fn insert_summary(&self, summary: &MemorySummary) -> Result<()> {
        (**self).insert_summary(summary).await
    }
    async fn forgetting_candidates(&self, user_id: Uuid, cutoff: DateTime<Utc>) -> Result<Vec<Memory>> {
        (**self).forgetting_candidates(user_id, cutoff).await
    }
    async fn is_referenced_by_summary(&self, memory_id: Uuid) -> Result<bool> {
        (**self).is_referenced_by_summary(memory_id).await
    }
    async fn delete_memory(&self, user_id: Uuid, memory_id: Uuid) -> Result<()> {
        (**self).delete_memory(user_id, memory_id).await
    }
    async fn recent_episodic_matches(
        &self,
        user_id: Uuid,
        query_vector: &[f32],
        limit: usize,
        since: DateTime<Utc>,
    ) -> Result<Vec<HierarchicalMatch>> {
        (**self).recent_episodic_matches(user_id, query_vector, limit, since).await
    }
    async fn summary_matches(&self, user_id: Uuid, query_vector: &[f32], limit: usize) -> Result<Vec<HierarchicalMatch>> {
        (**self).summary_matches(user_id, query_vector, limit).await
    }
    async fn log_access(&self, memory_id: Uuid, kind: crate::model::AccessKind) -> Result<()> {
        (**self).log_access(memory_id, kind).await
    }
}

/// A hierarchical-retrieval hit from either the episodic or summary tier.
#[derive(Debug, Clone)]
pub struct HierarchicalMatch {
    pub memory_id: Uuid,
    pub content_type: ContentType,
    pub chunk_text: String,
    pub similarity: f32,
    pub memory_type: MemoryType,
    pub created_at: DateTime<Utc>,
    pub meta: serde_json::Value,
}

/// Summarizes a cluster of related memories at low temperature. Kept
/// separate from the `llm` module's `ChatClient` so this file has no
/// forward dependency on it; `llm::ChatClient` is adapted into this trait
/// at the call site.
#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    async fn summarize(&self, prompt: &str) -> Result<String>;
}

const CONSOLIDATION_BATCH: usize = 50;
const CLUSTER_SIMILARITY_THRESHOLD: f32 = 0.7;
const SUMMARY_PROMPT_CHAR_BUDGET: usize = 4000;

/// §4.4.1 classification. `explicit` is `meta.memory_type`, honored first.
pub fn classify_memory(
    content: &str,
    content_type: ContentType,
    explicit: Option<MemoryType>,
) -> MemoryType {
    if let Some(explicit) = explicit {
        return explicit;
    }

    let content_lower = content.to_lowercase();
    let year = Utc::now().format("%Y").to_string();
    let temporal_markers = [
        "yesterday",
        "today",
        "last week",
        "on monday",
        "this morning",
        "last night",
        year.as_str(),
    ];
    let has_temporal = temporal_markers.iter().any(|m| content_lower.contains(m));

    let personal_markers = ["i ", "my ", "me ", "we ", "our "];
    let has_personal = personal_markers.iter().any(|m| content_lower.contains(m));

    let word_count = content.split_whitespace().count();
    let is_short = word_count < 100;

    if (has_temporal && has_personal) || (is_short && has_personal) {
        MemoryType::Episodic
    } else if content_type == ContentType::Pdf || word_count > 500 {
        MemoryType::Semantic
    } else {
        MemoryType::Episodic
    }
}

/// §4.4.2 importance scoring, as a float in `[0, ~1]` before persistence.
#[allow(clippy::too_many_arguments)]
pub fn importance_score(
    created_at: DateTime<Utc>,
    last_accessed: Option<DateTime<Utc>>,
    access_count: i64,
    content_type: ContentType,
    embedding_variance: f32,
    now: DateTime<Utc>,
) -> f32 {
    let age_days = (now - created_at).num_days().max(0) as f32;
    let recency = (-age_days / 30.0).exp();

    let frequency = ((1 + access_count.max(0)) as f32).ln() / 10.0;

    let access_recency = match last_accessed {
        Some(t) => {
            let days_since = (now - t).num_days().max(0) as f32;
            (-days_since / 7.0).exp()
        }
        None => 0.0,
    };

    let type_weight = content_type.type_weight();
    let richness = embedding_variance.min(1.0);

    0.35 * recency + 0.25 * frequency + 0.20 * access_recency + 0.15 * type_weight + 0.05 * richness
}

/// Rounds an importance float to the persisted `0..100` integer.
pub fn importance_to_persisted(importance: f32) -> i32 {
    (importance * 100.0).round().clamp(0.0, 100.0) as i32
}

/// Population variance of a set of equal-length embeddings, flattened
/// across all dimensions. Zero for zero or one vectors.
pub fn embedding_variance(embeddings: &[Vec<f32>]) -> f32 {
    if embeddings.len() < 2 {
        return 0.0;
    }
    let all: Vec<f32> = embeddings.iter().flatten().copied().collect();
    if all.is_empty() {
        return 0.0;
    }
    let mean = all.iter().sum::<f32>() / all.len() as f32;
    let variance = all.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / all.len() as f32;
    variance
}

/// §4.4.3 greedy single-pass clustering. `representatives` must be in
/// creation order; each entry is `(memory_id, first_chunk_embedding)`.
pub fn cluster_memories(representatives: &[(Uuid, Vec<f32>)]) -> Vec<Vec<Uuid>> {
    let mut used = vec![false; representatives.len()];
    let mut groups = Vec::new();

    for i in 0..representatives.len() {
        if used[i] {
            continue;
        }
        let (seed_id, seed_emb) = &representatives[i];
        let mut group = vec![*seed_id];
        used[i] = true;

        for j in (i + 1)..representatives.len() {
            if used[j] {
                continue;
            }
            let (other_id, other_emb) = &representatives[j];
            if cosine_similarity(seed_emb, other_emb) >= CLUSTER_SIMILARITY_THRESHOLD {
                group.push(*other_id);
                used[j] = true;
            }
        }
        groups.push(group);
    }
    groups
}

/// Builds the consolidation summary prompt from dated memory contents,
/// concatenated and truncated to roughly 4000 characters.
pub fn build_summary_prompt(entries: &[(DateTime<Utc>, String)]) -> String {
    let combined = entries
        .iter()
        .map(|(created_at, content)| format!("[{}] {}", created_at.format("%Y-%m-%d"), content))
        .collect::<Vec<_>>()
        .join("\n\n");
    if combined.len() <= SUMMARY_PROMPT_CHAR_BUDGET {
        combined
    } else {
        combined.chars().take(SUMMARY_PROMPT_CHAR_BUDGET).collect()
    }
}

/// Orchestrates consolidation, forgetting, and hierarchical retrieval
/// against a [`MemoryBackend`].
pub struct MemoryManager<B: MemoryBackend> {
    backend: B,
    config: Config,
}

/// Outcome of a single consolidation run.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationReport {
    pub memories_consolidated: usize,
    pub summaries_created: usize,
}

impl<B: MemoryBackend> MemoryManager<B> {
    pub fn new(backend: B, config: Config) -> Self {
        Self { backend, config }
    }

    /// Current importance for a memory, combining access stats and
    /// embedding richness fetched from the backend.
    pub async fn current_importance(&self, memory: &Memory, now: DateTime<Utc>) -> Result<f32> {
        let (access_count, last_accessed) = self.backend.access_stats(memory.id).await?;
        let embeddings = self.backend.chunk_embeddings(memory.id).await?;
        let variance = embedding_variance(&embeddings);
        Ok(importance_score(
            memory.created_at,
            last_accessed,
            access_count,
            memory.content_type,
            variance,
            now,
        ))
    }

    /// §4.4.3. One failed group summary does not abort the batch.
    pub async fn consolidate(
        &self,
        user_id: Uuid,
        generator: &dyn SummaryGenerator,
        embed: impl Fn(&str) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<f32>>> + Send + '_>>,
        now: DateTime<Utc>,
    ) -> Result<ConsolidationReport> {
        let cutoff = now - Duration::days(self.config.memory_consolidation_days as i64);
        let candidates = self
            .backend
            .consolidation_candidates(user_id, cutoff, CONSOLIDATION_BATCH)
            .await?;

        if candidates.is_empty() {
            tracing::info!(%user_id, "no memories to consolidate");
            return Ok(ConsolidationReport::default());
        }

        let mut representatives = Vec::with_capacity(candidates.len());
        for memory in &candidates {
            if let Some(emb) = self.backend.first_chunk_embedding(memory.id).await? {
                representatives.push((memory.id, emb));
            }
        }

        let groups = cluster_memories(&representatives);
        let mut report = ConsolidationReport::default();

        for group_ids in groups {
            let group: Vec<&Memory> = candidates.iter().filter(|m| group_ids.contains(&m.id)).collect();
            if group.is_empty() {
                continue;
            }

            match self.summarize_group(user_id, &group, generator, &embed, now).await {
                Ok(summary) => {
                    report.summaries_created += 1;
                    report.memories_consolidated += group.len();
                    tracing::info!(summary_id = %summary.id, count = group.len(), "consolidated memory group");
                }
                Err(err) => {
                    tracing::warn!(%err, "summary generation failed for a consolidation group, skipping");
                }
            }
        }

        Ok(report)
    }

    async fn summarize_group(
        &self,
        user_id: Uuid,
        group: &[&Memory],
        generator: &dyn SummaryGenerator,
        embed: &impl Fn(&str) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<f32>>> + Send + '_>>,
        now: DateTime<Utc>,
    ) -> Result<MemorySummary> {
        let entries: Vec<(DateTime<Utc>, String)> =
            group.iter().map(|m| (m.created_at, m.content.clone())).collect();
        let prompt = build_summary_prompt(&entries);
        let summary_text = generator.summarize(&prompt).await?;
        let embedding = embed(&summary_text).await?;

        let mut importances = Vec::with_capacity(group.len());
        for memory in group {
            importances.push(self.current_importance(memory, now).await?);
        }
        let mean_importance = importances.iter().sum::<f32>() / importances.len() as f32;

        let date_range_start = group.iter().map(|m| m.created_at).min().unwrap();
        let date_range_end = group.iter().map(|m| m.created_at).max().unwrap();

        let summary = MemorySummary {
            id: Uuid::new_v4(),
            user_id,
            text: summary_text,
            embedding,
            source_memory_ids: group.iter().map(|m| m.id).collect(),
            memory_count: group.len() as i64,
            date_range_start,
            date_range_end,
            importance: importance_to_persisted(mean_importance),
            created_at: now,
        };

        self.backend.insert_summary(&summary).await?;
        Ok(summary)
    }

    /// §4.4.5. Memories referenced by an active summary are skipped per
    /// Design Note §9(b), rather than cascading into the summary.
    pub async fn forget_unimportant(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        let threshold = self.config.memory_forget_threshold;
        let cutoff = now - Duration::days(self.config.memory_consolidation_days as i64);
        let candidates = self.backend.forgetting_candidates(user_id, cutoff).await?;

        let mut forgotten = 0;
        for memory in candidates {
            if self.backend.is_referenced_by_summary(memory.id).await? {
                continue;
            }
            let importance = self.current_importance(&memory, now).await?;
            if importance < threshold {
                self.backend.delete_memory(user_id, memory.id).await?;
                forgotten += 1;
                tracing::info!(memory_id = %memory.id, importance, "forgot low-importance memory");
            }
        }
        Ok(forgotten)
    }

    /// §4.4.4 hierarchical retrieval.
    pub async fn retrieve_hierarchical(
        &self,
        user_id: Uuid,
        query_vector: &[f32],
        top_k: usize,
        include_summaries: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<HierarchicalMatch>> {
        let half = top_k / 2;
        let since = now - Duration::days(self.config.memory_episodic_days as i64);

        let mut results = self
            .backend
            .recent_episodic_matches(user_id, query_vector, half, since)
            .await?;

        if include_summaries {
            let summaries = self.backend.summary_matches(user_id, query_vector, half).await?;
            results.extend(summaries);
        }

        results.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    /// §4.4.6. Best-effort: failures are logged, never propagated.
    pub async fn log_access_best_effort(&self, memory_id: Uuid, kind: crate::model::AccessKind) {
        if let Err(err) = self.backend.log_access(memory_id, kind).await {
            tracing::warn!(%memory_id, %err, "access logging failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn days_ago(days: i64) -> DateTime<Utc> {
        Utc::now() - Duration::days(days)
    }

    #[test]
    fn classification_episodic_temporal_personal() {
        let result = classify_memory("Yesterday I met Alice for coffee", ContentType::Text, None);
        assert_eq!(result, MemoryType::Episodic);
    }

    #[test]
    fn classification_semantic_long_essay() {
        let essay = "thermodynamics ".repeat(520);
        let result = classify_memory(&essay, ContentType::Text, None);
        assert_eq!(result, MemoryType::Semantic);
    }

    #[test]
    fn classification_pdf_always_semantic() {
        let result = classify_memory("short note", ContentType::Pdf, None);
        assert_eq!(result, MemoryType::Semantic);
    }

    #[test]
    fn classification_explicit_override_wins() {
        let result = classify_memory("Yesterday I met Alice", ContentType::Text, Some(MemoryType::Procedural));
        assert_eq!(result, MemoryType::Procedural);
    }

    #[test]
    fn importance_decays_with_age() {
        let now = Utc::now();
        let fresh = importance_score(days_ago(1), None, 0, ContentType::Text, 0.0, now);
        let old = importance_score(days_ago(200), None, 0, ContentType::Text, 0.0, now);
        assert!(fresh > old);
    }

    #[test]
    fn importance_increases_with_access() {
        let now = Utc::now();
        let created = days_ago(10);
        let low = importance_score(created, None, 0, ContentType::Text, 0.0, now);
        let high = importance_score(created, Some(now), 20, ContentType::Text, 0.0, now);
        assert!(high > low);
    }

    #[test]
    fn cluster_memories_groups_by_similarity_threshold() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let reps = vec![
            (a, vec![1.0, 0.0]),
            (b, vec![0.99, 0.05]),
            (c, vec![0.0, 1.0]),
        ];
        let groups = cluster_memories(&reps);
        assert_eq!(groups.len(), 2);
        assert!(groups[0].contains(&a) && groups[0].contains(&b));
        assert_eq!(groups[1], vec![c]);
    }

    #[test]
    fn summary_prompt_truncates_to_budget() {
        let entries = vec![(Utc::now(), "x".repeat(10_000))];
        let prompt = build_summary_prompt(&entries);
        assert!(prompt.len() <= SUMMARY_PROMPT_CHAR_BUDGET);
    }

    #[test]
    fn embedding_variance_zero_for_single_vector() {
        assert_eq!(embedding_variance(&[vec![1.0, 2.0]]), 0.0);
    }
}
