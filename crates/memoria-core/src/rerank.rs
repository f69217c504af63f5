//! Re-ranker (component I).
//!
//! Boosts or suppresses a result's score based on the user's preferred and
//! suppressed topics. No-op when the user has neither configured.

use crate::context::ContextSource;
use crate::model::UserPreference;

const BOOST_MULTIPLIER: f32 = 1.3;
const SUPPRESS_MULTIPLIER: f32 = 0.7;

/// A scored result going through re-ranking.
#[derive(Debug, Clone)]
pub struct RankedResult {
    pub source: ContextSource,
    pub score: f32,
}

/// Applies boost/suppress (each first-match-only, independently) and
/// re-sorts descending. Returns `results` untouched, in original order,
/// when the user has no preferences configured.
pub fn rerank(results: Vec<RankedResult>, preferences: &UserPreference) -> Vec<RankedResult> {
    if preferences.boost_topics.is_empty() && preferences.suppress_topics.is_empty() {
        return results;
    }

    let boost_topics: Vec<String> = preferences.boost_topics.iter().map(|t| t.to_lowercase()).collect();
    let suppress_topics: Vec<String> = preferences.suppress_topics.iter().map(|t| t.to_lowercase()).collect();

    let mut reranked: Vec<RankedResult> = results
        .into_iter()
        .map(|mut result| {
            let haystack = format!("{} {}", result.source.chunk_text, result.source.meta).to_lowercase();

            if boost_topics.iter().any(|topic| haystack.contains(topic.as_str())) {
                result.score *= BOOST_MULTIPLIER;
            }
            if suppress_topics.iter().any(|topic| haystack.contains(topic.as_str())) {
                result.score *= SUPPRESS_MULTIPLIER;
            }
            result
        })
        .collect();

    reranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    reranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentType;
    use uuid::Uuid;

    fn ranked(text: &str, score: f32) -> RankedResult {
        RankedResult {
            source: ContextSource {
                memory_id: Uuid::new_v4(),
                content_type: ContentType::Text,
                chunk_text: text.to_string(),
                meta: serde_json::Value::Null,
                similarity: score,
            },
            score,
        }
    }

    fn prefs(boost: &[&str], suppress: &[&str]) -> UserPreference {
        UserPreference {
            user_id: Uuid::nil(),
            boost_topics: boost.iter().map(|s| s.to_string()).collect(),
            suppress_topics: suppress.iter().map(|s| s.to_string()).collect(),
            search_opts: serde_json::Value::Null,
        }
    }

    #[test]
    fn no_op_without_preferences() {
        let results = vec![ranked("rust programming", 0.5), ranked("cooking recipes", 0.9)];
        let reranked = rerank(results.clone(), &UserPreference::default());
        assert_eq!(reranked[0].source.chunk_text, results[0].source.chunk_text);
    }

    #[test]
    fn boost_topic_raises_score_above_unboosted() {
        let results = vec![ranked("rust programming tips", 0.5), ranked("cooking recipes", 0.55)];
        let reranked = rerank(results, &prefs(&["rust"], &[]));
        assert_eq!(reranked[0].source.chunk_text, "rust programming tips");
    }

    #[test]
    fn suppress_topic_lowers_score() {
        let results = vec![ranked("spam content here", 0.9)];
        let reranked = rerank(results, &prefs(&[], &["spam"]));
        assert!((reranked[0].score - 0.9 * SUPPRESS_MULTIPLIER).abs() < 1e-5);
    }

    #[test]
    fn boost_and_suppress_compose_independently() {
        let results = vec![ranked("rust spam", 1.0)];
        let reranked = rerank(results, &prefs(&["rust"], &["spam"]));
        let expected = 1.0 * BOOST_MULTIPLIER * SUPPRESS_MULTIPLIER;
        assert!((reranked[0].score - expected).abs() < 1e-5);
    }
}
