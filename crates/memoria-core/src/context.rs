//! Context Builder (component G).
//!
//! Turns a result set into a token-budgeted context string, assembles it
//! into the final chat-completion message list, and extracts `[Source N]`
//! citations back out of the LM's answer.

use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::model::{ContentType, Role};

/// Counts tokens for a piece of text consistent with the target LM.
/// Implementations wrap the LM's actual tokenizer; [`CharApproxTokenCounter`]
/// is the `chars / 4` fallback used when no tokenizer is available.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

pub struct CharApproxTokenCounter;

impl TokenCounter for CharApproxTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }
}

/// A single retrieval hit as seen by the context builder — the superset of
/// fields [`crate::search::HybridResult`] and
/// [`crate::memory_manager::HierarchicalMatch`] both carry.
#[derive(Debug, Clone)]
pub struct ContextSource {
    pub memory_id: Uuid,
    pub content_type: ContentType,
    pub chunk_text: String,
    pub meta: serde_json::Value,
    pub similarity: f32,
}

fn format_block(source: &ContextSource, index: usize) -> String {
    let mut lines = vec![format!("[Source {}]", index)];
    lines.push(format!("Type: {}", source.content_type.as_str()));

    match source.content_type {
        ContentType::Image => {
            if source.meta.get("has_text").and_then(|v| v.as_bool()).unwrap_or(false) {
                lines.push("Hint: image with extracted text".to_string());
            }
        }
        ContentType::Pdf => {
            let pages = source.meta.get("page_count").map(|v| v.to_string()).unwrap_or_else(|| "unknown".to_string());
            lines.push(format!("Pages: {pages}"));
        }
        ContentType::Audio => {
            let duration = source.meta.get("duration_seconds").and_then(|v| v.as_f64()).unwrap_or(0.0);
            lines.push(format!("Duration: {duration:.1}s"));
        }
        _ => {}
    }

    lines.push(format!("\nContent:\n{}", source.chunk_text.trim()));
    lines.join("\n")
}

/// Builds the context string, skipping duplicate chunk text and stopping
/// before the next block would exceed `max_context_tokens`.
pub fn build_context(sources: &[ContextSource], max_context_tokens: usize, counter: &dyn TokenCounter) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut blocks = Vec::new();
    let mut total_tokens = 0usize;

    for (i, source) in sources.iter().enumerate() {
        if source.chunk_text.is_empty() || !seen.insert(source.chunk_text.clone()) {
            continue;
        }
        let block = format_block(source, i + 1);
        let block_tokens = counter.count(&block);
        if total_tokens + block_tokens > max_context_tokens {
            break;
        }
        total_tokens += block_tokens;
        blocks.push(block);
    }

    blocks.join("\n\n---\n\n")
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant with access to the user's personal memory. \
Answer questions based on the provided context. If the context doesn't contain relevant information, say so clearly. \
Always cite your sources using [Source N] notation.";

const NO_CONTEXT_MESSAGE: &str =
    "No relevant information found in the user's memory. Provide a helpful response based on general knowledge.";

/// A chat-completion message, as sent to [`crate::llm::ChatClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Assembles the final message list: system prompt, last 6 history turns
/// (user/assistant only), a context message (or the no-context fallback),
/// then the query.
pub fn build_prompt(
    query: &str,
    context: &str,
    history: &[ChatMessage],
    system_prompt: Option<&str>,
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    messages.push(ChatMessage {
        role: Role::System,
        content: system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string(),
    });

    let recent = history.iter().rev().take(6).collect::<Vec<_>>();
    for msg in recent.into_iter().rev() {
        if matches!(msg.role, Role::User | Role::Assistant) && !msg.content.is_empty() {
            messages.push(msg.clone());
        }
    }

    if !context.is_empty() {
        messages.push(ChatMessage {
            role: Role::System,
            content: format!("Here is relevant information from the user's memory:\n\n{context}\n\nPlease answer the following question based on this information."),
        });
    } else {
        messages.push(ChatMessage { role: Role::System, content: NO_CONTEXT_MESSAGE.to_string() });
    }

    messages.push(ChatMessage { role: Role::User, content: query.to_string() });
    messages
}

/// A citation extracted from an answer's `[Source N]` references.
#[derive(Debug, Clone)]
pub struct Citation {
    pub memory_id: Uuid,
    pub content_type: ContentType,
    pub snippet: String,
    pub similarity: f32,
}

static SOURCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[Source (\d+)\]").unwrap());

/// Scans `answer` for `[Source N]` references and maps them back to the
/// result list used to build the prompt. Indices outside the list are
/// ignored — extracted citations never exceed what was actually present.
pub fn extract_citations(answer: &str, sources: &[ContextSource]) -> Vec<Citation> {
    let mut indices: Vec<usize> = SOURCE_RE
        .captures_iter(answer)
        .filter_map(|caps| caps[1].parse::<usize>().ok())
        .filter_map(|n| n.checked_sub(1))
        .collect();
    indices.sort_unstable();
    indices.dedup();

    indices
        .into_iter()
        .filter_map(|idx| sources.get(idx))
        .map(|s| Citation {
            memory_id: s.memory_id,
            content_type: s.content_type,
            snippet: s.chunk_text.chars().take(200).collect(),
            similarity: s.similarity,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(text: &str, content_type: ContentType) -> ContextSource {
        ContextSource {
            memory_id: Uuid::new_v4(),
            content_type,
            chunk_text: text.to_string(),
            meta: serde_json::Value::Null,
            similarity: 0.9,
        }
    }

    #[test]
    fn char_approx_counter_matches_chars_div_4() {
        let counter = CharApproxTokenCounter;
        assert_eq!(counter.count("abcd"), 1);
        assert_eq!(counter.count("abcde"), 2);
    }

    #[test]
    fn build_context_skips_duplicate_chunks() {
        let sources = vec![source("paris is the capital of france", ContentType::Text), source("paris is the capital of france", ContentType::Text)];
        let context = build_context(&sources, 10_000, &CharApproxTokenCounter);
        assert_eq!(context.matches("[Source").count(), 1);
    }

    #[test]
    fn build_context_stops_at_token_budget() {
        let sources = vec![source(&"x".repeat(400), ContentType::Text), source(&"y".repeat(400), ContentType::Text)];
        let context = build_context(&sources, 50, &CharApproxTokenCounter);
        assert_eq!(context.matches("[Source").count(), 1);
    }

    #[test]
    fn build_prompt_falls_back_when_no_context() {
        let messages = build_prompt("what time is it", "", &[], None);
        assert!(messages.iter().any(|m| m.content.contains("No relevant information")));
        assert_eq!(messages.last().unwrap().role, Role::User);
    }

    #[test]
    fn build_prompt_keeps_only_last_six_history_messages() {
        let history: Vec<ChatMessage> =
            (0..10).map(|i| ChatMessage { role: Role::User, content: format!("turn {i}") }).collect();
        let messages = build_prompt("query", "ctx", &history, None);
        let history_in_prompt = messages.iter().filter(|m| m.content.starts_with("turn")).count();
        assert_eq!(history_in_prompt, 6);
    }

    #[test]
    fn extract_citations_maps_source_indices_back_to_results() {
        let sources = vec![source("paris fact", ContentType::Text), source("berlin fact", ContentType::Text)];
        let citations = extract_citations("Paris is the capital [Source 1]. See also [Source 2].", &sources);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].memory_id, sources[0].memory_id);
    }

    #[test]
    fn extract_citations_ignores_out_of_range_indices() {
        let sources = vec![source("paris fact", ContentType::Text)];
        let citations = extract_citations("See [Source 5]", &sources);
        assert!(citations.is_empty());
    }
}
