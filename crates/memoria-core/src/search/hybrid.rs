//! Hybrid Search (component C).
//!
//! Fuses a dense candidate set (already fetched via Stage 1 kNN, see
//! [`crate::search::vector`]) with a lexical BM25 re-score (Stage 2) over
//! the same candidates, then returns the top_k under the requested fusion
//! method.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::lexical::{Doc, LexicalRanker};
use crate::model::ContentType;

/// A dense-stage candidate, as produced by Stage 1 kNN over Chunks.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: Uuid,
    pub memory_id: Uuid,
    pub chunk_text: String,
    pub content_type: ContentType,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// `1 - cosine_distance`.
    pub similarity: f32,
}

/// Final fused result returned by [`hybrid_search`].
#[derive(Debug, Clone)]
pub struct HybridResult {
    pub chunk_id: Uuid,
    pub memory_id: Uuid,
    pub chunk_text: String,
    pub content_type: ContentType,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub similarity: f32,
    pub fused_score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMethod {
    Weighted,
    Rrf,
}

/// `Σ 1 / (k + rank)` per id across both lists; rank is 0-indexed.
pub fn reciprocal_rank_fusion(
    keyword_results: &[(String, f32)],
    semantic_results: &[(String, f32)],
    k: f32,
) -> Vec<(String, f32)> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    for (rank, (key, _)) in keyword_results.iter().enumerate() {
        *scores.entry(key.clone()).or_default() += 1.0 / (k + rank as f32);
    }
    for (rank, (key, _)) in semantic_results.iter().enumerate() {
        *scores.entry(key.clone()).or_default() += 1.0 / (k + rank as f32);
    }
    let mut results: Vec<(String, f32)> = scores.into_iter().collect();
    results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    results
}

fn min_max_normalize(list: &[(String, f32)]) -> HashMap<String, f32> {
    if list.is_empty() {
        return HashMap::new();
    }
    let min = list.iter().map(|(_, s)| *s).fold(f32::INFINITY, f32::min);
    let max = list.iter().map(|(_, s)| *s).fold(f32::NEG_INFINITY, f32::max);
    let range = (max - min).max(1e-6);
    list.iter().map(|(id, s)| (id.clone(), (s - min) / range)).collect()
}

/// `α·dense + (1-α)·lexical`, each ranking min-max normalized to [0,1]
/// over the union of ids before combining. Ties on the fused score fall
/// back to the normalized lexical score, then the normalized dense score,
/// so the ordering is fully deterministic rather than dependent on
/// `HashMap`/sort stability.
pub fn weighted_fusion(
    dense_results: &[(String, f32)],
    lexical_results: &[(String, f32)],
    alpha: f32,
) -> Vec<(String, f32)> {
    let dense_norm = min_max_normalize(dense_results);
    let lexical_norm = min_max_normalize(lexical_results);

    let mut ids: Vec<String> = dense_norm.keys().chain(lexical_norm.keys()).cloned().collect();
    ids.sort();
    ids.dedup();

    let mut fused: Vec<(String, f32, f32, f32)> = ids
        .into_iter()
        .map(|id| {
            let d = *dense_norm.get(&id).unwrap_or(&0.0);
            let l = *lexical_norm.get(&id).unwrap_or(&0.0);
            (id, alpha * d + (1.0 - alpha) * l, l, d)
        })
        .collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| b.3.partial_cmp(&a.3).unwrap_or(std::cmp::Ordering::Equal))
    });
    fused.into_iter().map(|(id, score, _, _)| (id, score)).collect()
}

/// Run Stage 2 (lexical re-score) over `candidates` and fuse with their
/// existing dense similarities, returning the top_k.
pub fn hybrid_search(
    candidates: Vec<ChunkCandidate>,
    query: &str,
    top_k: usize,
    fusion: FusionMethod,
    alpha: f32,
) -> Vec<HybridResult> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let dense_results: Vec<(String, f32)> = {
        let mut ranked: Vec<&ChunkCandidate> = candidates.iter().collect();
        ranked.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        ranked
            .into_iter()
            .map(|c| (c.chunk_id.to_string(), c.similarity))
            .collect()
    };

    let id_strings: Vec<String> = candidates.iter().map(|c| c.chunk_id.to_string()).collect();
    let mut ranker = LexicalRanker::new();
    let docs: Vec<Doc<'_>> = candidates
        .iter()
        .zip(id_strings.iter())
        .map(|(c, id)| Doc { id, text: &c.chunk_text })
        .collect();
    ranker.fit(&docs);
    let lexical_results = ranker.search(query, candidates.len() * 2);

    let fused = match fusion {
        FusionMethod::Weighted => weighted_fusion(&dense_results, &lexical_results, alpha),
        FusionMethod::Rrf => reciprocal_rank_fusion(&lexical_results, &dense_results, 60.0),
    };

    let by_id: HashMap<String, &ChunkCandidate> =
        candidates.iter().map(|c| (c.chunk_id.to_string(), c)).collect();

    let mut results: Vec<HybridResult> = fused
        .into_iter()
        .filter_map(|(id, fused_score)| {
            by_id.get(&id).map(|c| HybridResult {
                chunk_id: c.chunk_id,
                memory_id: c.memory_id,
                chunk_text: c.chunk_text.clone(),
                content_type: c.content_type,
                meta: c.meta.clone(),
                created_at: c.created_at,
                similarity: c.similarity,
                fused_score,
            })
        })
        .collect();

    // Ties broken by higher dense similarity, then smaller memory_id.
    results.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.memory_id.cmp(&b.memory_id))
    });
    results.truncate(top_k);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_favors_items_in_both_lists() {
        let keyword = vec![("doc-1".to_string(), 0.9), ("doc-2".to_string(), 0.8)];
        let semantic = vec![("doc-2".to_string(), 0.95), ("doc-1".to_string(), 0.85)];
        let results = reciprocal_rank_fusion(&keyword, &semantic, 60.0);
        for i in 1..results.len() {
            assert!(results[i - 1].1 >= results[i].1);
        }
    }

    #[test]
    fn rrf_idempotence_doubles_scores() {
        let list = vec![("a".to_string(), 1.0), ("b".to_string(), 1.0)];
        let single = reciprocal_rank_fusion(&list, &[], 60.0);
        let doubled = reciprocal_rank_fusion(&list, &list, 60.0);
        let single_map: HashMap<_, _> = single.into_iter().collect();
        let doubled_map: HashMap<_, _> = doubled.into_iter().collect();
        for (id, score) in &single_map {
            assert!((doubled_map[id] - score * 2.0).abs() < 1e-5);
        }
    }

    #[test]
    fn weighted_fusion_s3_scenario() {
        let dense = vec![("a".to_string(), 0.9), ("b".to_string(), 0.8)];
        let lexical = vec![("b".to_string(), 10.0), ("a".to_string(), 2.0)];

        let half = weighted_fusion(&dense, &lexical, 0.5);
        assert_eq!(half[0].0, "b");

        let all_dense = weighted_fusion(&dense, &lexical, 1.0);
        assert_eq!(all_dense[0].0, "a");
    }

    #[test]
    fn fusion_monotonicity_weighted() {
        let dense = vec![("a".to_string(), 0.9), ("b".to_string(), 0.5)];
        let lexical = vec![("a".to_string(), 5.0), ("b".to_string(), 1.0)];
        let fused = weighted_fusion(&dense, &lexical, 0.5);
        let a_score = fused.iter().find(|(id, _)| id == "a").unwrap().1;
        let b_score = fused.iter().find(|(id, _)| id == "b").unwrap().1;
        assert!(a_score > b_score);
    }
}
