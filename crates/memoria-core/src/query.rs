//! Query Analyzer (component F).
//!
//! Pure-functional classification of a query's intent, shape, and
//! temporal/complexity signals. Decomposition for multi-hop queries is the
//! only part that talks to the LM, via [`QueryDecomposer`].

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Factual,
    Search,
    Conversational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionType {
    Factual,
    Entity,
    Location,
    Temporal,
    Causal,
    Procedural,
    Choice,
    Unknown,
}

/// Output of [`analyze`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryAnalysis {
    pub intent: Intent,
    pub has_temporal: bool,
    pub is_comparison: bool,
    pub is_complex: bool,
    pub question_type: QuestionType,
    pub requires_multi_hop: bool,
}

const CONVERSATIONAL_MARKERS: &[&str] =
    &["hi", "hello", "hey", "thanks", "thank you", "how are you", "what can you do", "help", "assist"];
const SEARCH_MARKERS: &[&str] =
    &["find", "search", "look for", "show me", "about", "regarding", "related to", "tell me", "give me information"];
const FACTUAL_MARKERS: &[&str] = &[
    "what", "when", "where", "who", "which", "how many", "how much", "definition", "meaning", "explain",
    "describe", "is", "are", "was", "were", "does", "did", "can", "will",
];

const TEMPORAL_KEYWORDS: &[&str] =
    &["yesterday", "today", "last week", "this morning", "last night", "when", "date", "history of"];
const COMPARISON_KEYWORDS: &[&str] = &["compare", "versus", "vs", "difference between", "better than", "contrast"];
const COMPLEX_KEYWORDS: &[&str] = &["and then", "as well as", "also", "multiple", "several", "both"];
const RECENCY_KEYWORDS: &[&str] =
    &["latest", "recent", "current", "today", "now", "news", "update", "breaking"];

/// Classifies intent by first-match lexicon lookup, conversational first
/// so greetings never get misread as a factual "how are you" question.
pub fn classify_intent(query: &str) -> Intent {
    let lower = query.to_lowercase();
    if CONVERSATIONAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return Intent::Conversational;
    }
    if SEARCH_MARKERS.iter().any(|m| lower.contains(m)) {
        return Intent::Search;
    }
    if FACTUAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return Intent::Factual;
    }
    Intent::Factual
}

/// Classifies by the query's leading word.
pub fn classify_question_type(query: &str) -> QuestionType {
    let lower = query.trim().to_lowercase();
    let first_word = lower.split_whitespace().next().unwrap_or("");
    match first_word {
        "what" => QuestionType::Factual,
        "who" | "whom" | "whose" => QuestionType::Entity,
        "where" => QuestionType::Location,
        "when" => QuestionType::Temporal,
        "why" => QuestionType::Causal,
        "how" => QuestionType::Procedural,
        "which" if lower.contains(" or ") => QuestionType::Choice,
        _ if lower.contains(" or ") && lower.ends_with('?') => QuestionType::Choice,
        _ => QuestionType::Unknown,
    }
}

fn has_temporal(query: &str) -> bool {
    let lower = query.to_lowercase();
    let year = chrono::Utc::now().format("%Y").to_string();
    TEMPORAL_KEYWORDS.iter().any(|k| lower.contains(k)) || lower.contains(&year)
}

fn is_comparison(query: &str) -> bool {
    let lower = query.to_lowercase();
    COMPARISON_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn is_complex(query: &str) -> bool {
    let lower = query.to_lowercase();
    COMPLEX_KEYWORDS.iter().any(|k| lower.contains(k)) || lower.matches('?').count() > 1
}

/// §4.5: runs every classifier over `query`.
pub fn analyze(query: &str) -> QueryAnalysis {
    let comparison = is_comparison(query);
    let complex = is_complex(query);
    QueryAnalysis {
        intent: classify_intent(query),
        has_temporal: has_temporal(query),
        is_comparison: comparison,
        is_complex: complex,
        question_type: classify_question_type(query),
        requires_multi_hop: comparison || complex,
    }
}

/// Web search trigger: non-conversational intent and either thin local
/// results or an explicit recency keyword.
pub fn should_search_web(query: &str, n_local_hits: usize) -> bool {
    if classify_intent(query) == Intent::Conversational {
        return false;
    }
    if n_local_hits < 2 {
        return true;
    }
    let lower = query.to_lowercase();
    let year = chrono::Utc::now().format("%Y").to_string();
    RECENCY_KEYWORDS.iter().any(|k| lower.contains(k)) || lower.contains(&year)
}

static STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does",
    "did", "will", "would", "should", "can", "could", "may", "might", "must", "shall", "to", "of", "in", "for",
    "on", "at", "by", "with", "from", "about", "as", "into", "through", "during", "before", "after", "above",
    "below", "between", "under", "i", "me", "my", "you", "your", "it", "its", "what", "which",
];

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").unwrap());

/// Keyword extraction, stop-word filtered, length > 2.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    WORD_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Expands a query with the prior turn's content (if not already a
/// substring) for lightweight conversational carry-over.
pub fn rewrite_query(query: &str, last_user_message: Option<&str>) -> Vec<String> {
    let mut queries = vec![query.to_string()];
    if let Some(context) = last_user_message {
        if !context.is_empty() && !query.to_lowercase().contains(&context.to_lowercase()) {
            queries.push(format!("{context} {query}"));
        }
    }
    queries.truncate(3);
    queries
}

static NUMBERED_LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(?:\d+[.)]|[-*])\s*(.+)$").unwrap());

/// Parses an LM's numbered/bulleted sub-question response. Keeps lines of
/// at least 10 characters; falls back to `[query]` if nothing parses.
pub fn parse_sub_questions(raw: &str, fallback_query: &str) -> Vec<String> {
    let parsed: Vec<String> = raw
        .lines()
        .filter_map(|line| NUMBERED_LINE_RE.captures(line.trim()))
        .map(|caps| caps[1].trim().to_string())
        .filter(|line| line.len() >= 10)
        .collect();

    if parsed.is_empty() {
        vec![fallback_query.to_string()]
    } else {
        parsed
    }
}

/// Asks the LM to break a multi-hop query into 2-4 sub-questions. Kept
/// separate from the `llm` module's `ChatClient` so this file has no
/// forward dependency on it; `llm::ChatClient` is adapted into this trait
/// at the call site.
#[async_trait]
pub trait QueryDecomposer: Send + Sync {
    async fn decompose(&self, query: &str) -> Result<String>;
}

/// Prompt a [`QueryDecomposer`] adapter should send the LM alongside the
/// raw query, kept here so every adapter uses the identical wording.
pub const DECOMPOSITION_PROMPT: &str = "Break the following question into \
    2-4 standalone sub-questions that together cover everything needed to \
    answer it. Reply with one sub-question per line, numbered.";

/// Runs decomposition only when [`QueryAnalysis::requires_multi_hop`] is
/// set, otherwise returns the query unchanged.
pub async fn decompose_if_needed(
    query: &str,
    analysis: &QueryAnalysis,
    decomposer: &dyn QueryDecomposer,
) -> Result<Vec<String>> {
    if !analysis.requires_multi_hop {
        return Ok(vec![query.to_string()]);
    }
    let raw = decomposer.decompose(query).await?;
    Ok(parse_sub_questions(&raw, query))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_conversational_greeting() {
        assert_eq!(classify_intent("hey, how's it going"), Intent::Conversational);
    }

    #[test]
    fn classifies_factual_wh_question() {
        assert_eq!(classify_intent("What is the capital of France?"), Intent::Factual);
    }

    #[test]
    fn classifies_search_intent() {
        assert_eq!(classify_intent("find me articles about rust"), Intent::Search);
    }

    #[test]
    fn question_type_by_leading_word() {
        assert_eq!(classify_question_type("Where is the Eiffel Tower?"), QuestionType::Location);
        assert_eq!(classify_question_type("Why did it fail?"), QuestionType::Causal);
        assert_eq!(classify_question_type("How do I configure this?"), QuestionType::Procedural);
    }

    #[test]
    fn multi_hop_flagged_for_comparison() {
        let analysis = analyze("Compare Rust versus Go for systems programming");
        assert!(analysis.is_comparison);
        assert!(analysis.requires_multi_hop);
    }

    #[test]
    fn should_search_web_triggers_on_thin_local_results() {
        assert!(should_search_web("what is rust", 0));
    }

    #[test]
    fn should_search_web_skips_conversational() {
        assert!(!should_search_web("hello there", 0));
    }

    #[test]
    fn should_search_web_triggers_on_recency_keyword_with_good_local_hits() {
        assert!(should_search_web("what is the latest rust release", 5));
        assert!(!should_search_web("what is the capital of france", 5));
    }

    #[test]
    fn extract_keywords_drops_stop_words() {
        let keywords = extract_keywords("What is the capital of France?");
        assert_eq!(keywords, vec!["capital", "france"]);
    }

    #[test]
    fn parse_sub_questions_handles_numbered_list() {
        let raw = "1. What is the capital of France?\n2. What is its population?\nNote: ignore me";
        let parsed = parse_sub_questions(raw, "fallback");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn parse_sub_questions_falls_back_when_nothing_parses() {
        let parsed = parse_sub_questions("no structure here", "original query");
        assert_eq!(parsed, vec!["original query".to_string()]);
    }
}
