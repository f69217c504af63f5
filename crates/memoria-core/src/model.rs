//! Domain model.
//!
//! Entities and their invariants as laid out in the data model: User,
//! Memory, Chunk, MemoryAccess, MemorySummary, Conversation, Message,
//! UserPreference, WebSource. IDs are opaque UUIDs; timestamps are UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content modality a Memory was ingested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Image,
    Pdf,
    Audio,
    Web,
}

impl ContentType {
    /// `type_weight` used by importance scoring.
    pub fn type_weight(self) -> f32 {
        match self {
            ContentType::Text => 1.0,
            ContentType::Pdf => 1.2,
            ContentType::Image => 0.9,
            ContentType::Audio => 1.1,
            ContentType::Web => 0.7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Pdf => "pdf",
            ContentType::Audio => "audio",
            ContentType::Web => "web",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ContentType::Text),
            "image" => Some(ContentType::Image),
            "pdf" => Some(ContentType::Pdf),
            "audio" => Some(ContentType::Audio),
            "web" => Some(ContentType::Web),
            _ => None,
        }
    }
}

/// Memory tier, mutable via reclassification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Episodic,
    Semantic,
    Procedural,
}

impl MemoryType {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
            MemoryType::Procedural => "procedural",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "episodic" => Some(MemoryType::Episodic),
            "semantic" => Some(MemoryType::Semantic),
            "procedural" => Some(MemoryType::Procedural),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub credential_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A stored unit of personal memory. One-to-many with Chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content_type: ContentType,
    pub content: String,
    pub meta: serde_json::Value,
    pub blob_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub memory_type: MemoryType,
    /// Integer 0..100 (round(importance*100)).
    pub importance: i32,
}

/// A bounded-token slice of a Memory with its own embedding. Immutable
/// after creation; `chunk_index` is monotonic and contiguous within its
/// parent Memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: Uuid,
    pub memory_id: Uuid,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Retrieval,
    Edit,
    View,
}

impl AccessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessKind::Retrieval => "retrieval",
            AccessKind::Edit => "edit",
            AccessKind::View => "view",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "retrieval" => Some(AccessKind::Retrieval),
            "edit" => Some(AccessKind::Edit),
            "view" => Some(AccessKind::View),
            _ => None,
        }
    }
}

/// Append-only event log used by importance scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAccess {
    pub id: Uuid,
    pub memory_id: Uuid,
    pub kind: AccessKind,
    pub accessed_at: DateTime<Utc>,
}

/// Derived, consolidated compression of a group of related episodic
/// Memories. May be regenerated; each source Memory appears in at most one
/// active summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySummary {
    pub id: Uuid,
    pub user_id: Uuid,
    pub text: String,
    pub embedding: Vec<f32>,
    pub source_memory_ids: Vec<Uuid>,
    pub memory_count: i64,
    pub date_range_start: DateTime<Utc>,
    pub date_range_end: DateTime<Utc>,
    pub importance: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Per-user preferences, unique on `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreference {
    pub user_id: Uuid,
    pub boost_topics: Vec<String>,
    pub suppress_topics: Vec<String>,
    pub search_opts: serde_json::Value,
}

impl Default for UserPreference {
    fn default() -> Self {
        Self {
            user_id: Uuid::nil(),
            boost_topics: Vec::new(),
            suppress_topics: Vec::new(),
            search_opts: serde_json::Value::Object(Default::default()),
        }
    }
}

/// Cached scrape of an external URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSource {
    pub id: Uuid,
    pub url: String,
    pub title: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub scraped_at: DateTime<Utc>,
}

/// DTO for the Ingestion Coordinator entry point. `deny_unknown_fields`
/// keeps the boundary strict even though `meta` itself is schema-less.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngestInput {
    pub user_id: Uuid,
    pub content_type: ContentType,
    /// Raw content for text; for image/pdf/audio this may be empty and the
    /// caller instead supplies `blob_ref` for an external collaborator to
    /// resolve.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub blob_ref: Option<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
    /// Explicit override for classification (`meta.memory_type` per spec).
    #[serde(default)]
    pub memory_type: Option<MemoryType>,
}

/// DTO for a retrieval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecallInput {
    pub user_id: Uuid,
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub content_type: Option<ContentType>,
    #[serde(default)]
    pub include_summaries: bool,
}

fn default_top_k() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_weight_matches_spec() {
        assert_eq!(ContentType::Text.type_weight(), 1.0);
        assert_eq!(ContentType::Pdf.type_weight(), 1.2);
        assert_eq!(ContentType::Image.type_weight(), 0.9);
        assert_eq!(ContentType::Audio.type_weight(), 1.1);
        assert_eq!(ContentType::Web.type_weight(), 0.7);
    }

    #[test]
    fn ingest_input_deny_unknown_fields() {
        let raw = serde_json::json!({
            "userId": Uuid::nil(),
            "contentType": "text",
            "content": "hello",
            "bogusField": true,
        });
        let err = serde_json::from_value::<IngestInput>(raw).unwrap_err();
        assert!(err.to_string().contains("bogusField") || err.to_string().contains("unknown field"));
    }

    #[test]
    fn recall_input_defaults_top_k() {
        let raw = serde_json::json!({"userId": Uuid::nil(), "query": "hi"});
        let parsed: RecallInput = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.top_k, 5);
        assert!(!parsed.include_summaries);
    }
}
