//! LM adapter (§6 "LM endpoint").
//!
//! `ChatClient` is the seam the RAG Orchestrator calls through.
//! `OllamaChatClient` talks to a real Ollama-compatible `/api/chat` endpoint
//! (line-delimited JSON streaming), grounded on `danielmriley-aigent`'s
//! `OllamaClient`. `FallbackChatClient` never leaves the process — it always
//! answers with the deterministic unavailable notice from §7, useful as a
//! default when no LM is configured.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::context::ChatMessage;
use crate::model::Role;

const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
const NON_STREAMING_TIMEOUT: Duration = Duration::from_secs(120);
const STREAM_CHUNK_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("language model unavailable: {0}")]
    Unavailable(String),
    #[error("language model request timed out: {0}")]
    Timeout(String),
    #[error("malformed language model response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ChatOpts {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatOpts {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            temperature: config.llm_temperature,
            max_tokens: config.llm_max_tokens,
        }
    }
}

/// Chat-completion seam. `count_tokens` defaults to `None`, which tells
/// [`crate::context`] to fall back to its chars/4 approximation.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], opts: ChatOpts) -> Result<String, LlmError>;

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        opts: ChatOpts,
        tx: mpsc::Sender<String>,
    ) -> Result<(), LlmError>;

    fn count_tokens(&self, _text: &str) -> Option<usize> {
        None
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn messages_to_ollama(messages: &[ChatMessage]) -> serde_json::Value {
    serde_json::Value::Array(
        messages
            .iter()
            .map(|m| serde_json::json!({ "role": role_str(m.role), "content": m.content }))
            .collect(),
    )
}

/// Real Ollama `/api/chat` client. Base URL from `OLLAMA_BASE_URL`, default
/// `http://localhost:11434`.
pub struct OllamaChatClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaChatClient {
    pub fn new(model: impl Into<String>) -> Self {
        let base_url = std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_OLLAMA_BASE_URL.to_string());
        Self::with_base_url(model, base_url)
    }

    pub fn with_base_url(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatClient for OllamaChatClient {
    async fn complete(&self, messages: &[ChatMessage], opts: ChatOpts) -> Result<String, LlmError> {
        let payload = serde_json::json!({
            "model": self.model,
            "messages": messages_to_ollama(messages),
            "stream": false,
            "options": { "temperature": opts.temperature, "num_predict": opts.max_tokens },
        });

        let response = tokio::time::timeout(
            NON_STREAMING_TIMEOUT,
            self.client.post(self.endpoint()).json(&payload).send(),
        )
        .await
        .map_err(|_| LlmError::Timeout(format!("no response from {} within {:?}", self.base_url, NON_STREAMING_TIMEOUT)))?
        .map_err(|e| LlmError::Unavailable(format!("{} unreachable: {e}", self.base_url)))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Unavailable(format!("ollama returned {status}: {body}")));
        }

        body.get("message")
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse("response missing message.content".to_string()))
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        opts: ChatOpts,
        tx: mpsc::Sender<String>,
    ) -> Result<(), LlmError> {
        let payload = serde_json::json!({
            "model": self.model,
            "messages": messages_to_ollama(messages),
            "stream": true,
            "options": { "temperature": opts.temperature, "num_predict": opts.max_tokens },
        });

        let mut response = self
            .client
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(format!("{} unreachable: {e}", self.base_url)))?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!("ollama returned {status}: {body}")));
        }

        loop {
            let chunk = tokio::time::timeout(STREAM_CHUNK_IDLE_TIMEOUT, response.chunk())
                .await
                .map_err(|_| LlmError::Timeout("no stream chunk within idle timeout".to_string()))?
                .map_err(|e| LlmError::Unavailable(e.to_string()))?;

            let Some(chunk) = chunk else { break };
            let text = String::from_utf8_lossy(&chunk);
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(json) = serde_json::from_str::<serde_json::Value>(line) else { continue };
                if let Some(content) = json.get("message").and_then(|m| m.get("content")).and_then(|v| v.as_str())
                {
                    if !content.is_empty() && tx.send(content.to_string()).await.is_err() {
                        return Ok(());
                    }
                }
                if json.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

const FALLBACK_GUIDANCE: &str =
    "The assistant's language model backend is temporarily unavailable. Please retry shortly, or contact your administrator if the issue persists.";

/// §7: the deterministic message returned on LM unavailability. Never
/// persisted as an assistant message by the caller.
pub fn fallback_message(question: &str) -> String {
    format!("I can't answer \"{question}\" right now. {FALLBACK_GUIDANCE}")
}

fn last_user_question(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// Always "unavailable". Used when no LM is configured, or in tests.
pub struct FallbackChatClient;

#[async_trait]
impl ChatClient for FallbackChatClient {
    async fn complete(&self, messages: &[ChatMessage], _opts: ChatOpts) -> Result<String, LlmError> {
        Ok(fallback_message(&last_user_question(messages)))
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        _opts: ChatOpts,
        tx: mpsc::Sender<String>,
    ) -> Result<(), LlmError> {
        let _ = tx.send(fallback_message(&last_user_question(messages))).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> ChatMessage {
        ChatMessage { role, content: content.to_string() }
    }

    #[tokio::test]
    async fn fallback_client_answers_with_deterministic_notice() {
        let client = FallbackChatClient;
        let messages = vec![msg(Role::System, "sys"), msg(Role::User, "what time is it")];
        let answer = client.complete(&messages, ChatOpts { temperature: 0.7, max_tokens: 128 }).await.unwrap();
        assert!(answer.contains("what time is it"));
        assert!(answer.contains("unavailable"));
    }

    #[tokio::test]
    async fn fallback_client_streams_single_chunk() {
        let client = FallbackChatClient;
        let messages = vec![msg(Role::User, "hello")];
        let (tx, mut rx) = mpsc::channel(4);
        client.complete_stream(&messages, ChatOpts { temperature: 0.0, max_tokens: 1 }, tx).await.unwrap();
        let chunk = rx.recv().await.unwrap();
        assert!(chunk.contains("hello"));
    }

    #[test]
    fn fallback_message_contains_question_and_guidance() {
        let message = fallback_message("why is the sky blue");
        assert!(message.contains("why is the sky blue"));
        assert!(message.contains("retry"));
    }

    #[tokio::test]
    async fn ollama_client_reports_unavailable_when_unreachable() {
        let client = OllamaChatClient::with_base_url("llama3", "http://127.0.0.1:1");
        let messages = vec![msg(Role::User, "hi")];
        let err = client.complete(&messages, ChatOpts { temperature: 0.7, max_tokens: 64 }).await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
    }
}
