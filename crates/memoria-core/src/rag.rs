//! RAG Orchestrator (component H).
//!
//! Ties the Query Analyzer (F), Memory Manager (E)'s hierarchical retrieval,
//! the web adapters (§6), the Context Builder (G), the Re-ranker (I), and
//! the LM adapter into the single request pipeline from §4.7.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::context::{
    build_context, build_prompt, extract_citations, ChatMessage, Citation, ContextSource,
    DEFAULT_SYSTEM_PROMPT,
};
use crate::embeddings::{cosine_similarity, EmbedOpts, EmbeddingService};
use crate::config::Config;
use crate::error::{MemoriaError, Result};
use crate::llm::{fallback_message, ChatClient, ChatOpts};
use crate::memory_manager::{HierarchicalMatch, MemoryBackend, MemoryManager};
use crate::model::{AccessKind, Conversation, ContentType, Message, Role, UserPreference, WebSource};
use crate::query::{self, QueryAnalysis, QueryDecomposer};
use crate::rerank::{rerank, RankedResult};
use crate::web::{ScrapedPage, WebScraper, WebSearchProvider};

const MAX_SUBQUERY_CONCURRENCY: usize = 4;
const TOP_N_CANDIDATES: usize = 10;
const TEMPORAL_WEIGHT: f32 = 0.4;
const RECENT_AGE_DAYS: i64 = 7;
const RECENT_AGE_BOOST: f32 = 1.5;
const ACCESS_LOG_TOP_N: usize = 5;

/// Conversation/preference/web-cache persistence the orchestrator needs
/// beyond [`MemoryBackend`].
#[async_trait]
pub trait RagBackend: Send + Sync {
    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Vec<Message>>;
    async fn create_conversation(&self, user_id: Uuid) -> Result<Conversation>;
    async fn append_message_pair(&self, user_message: &Message, assistant_message: &Message) -> Result<()>;
    async fn get_preferences(&self, user_id: Uuid) -> Result<UserPreference>;
    async fn upsert_web_source(&self, source: &WebSource) -> Result<()>;
}

#[async_trait]
impl<T: RagBackend + ?Sized> RagBackend for Arc<T> {
    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        (**self).get_conversation(conversation_id).await
    }
    async fn create_conversation(&self, user_id: Uuid) -> Result<Conversation> {
        (**self).create_conversation(user_id).await
    }
    async fn append_message_pair(&self, user_message: &Message, assistant_message: &Message) -> Result<()> {
        (**self).append_message_pair(user_message, assistant_message).await
    }
    async fn get_preferences(&self, user_id: Uuid) -> Result<UserPreference> {
        (**self).get_preferences(user_id).await
    }
    async fn upsert_web_source(&self, source: &WebSource) -> Result<()> {
        (**self).upsert_web_source(source).await
    }
}

#[derive(Debug, Clone)]
pub struct RagRequest {
    pub user_id: Uuid,
    pub query: String,
    pub conversation_id: Option<Uuid>,
    pub enable_web: bool,
    pub top_k: usize,
}

#[derive(Debug, Clone)]
pub struct RagAnswer {
    pub conversation_id: Uuid,
    pub answer: String,
    pub sources: Vec<Citation>,
    pub analysis: QueryAnalysis,
    pub sub_queries: Vec<String>,
    /// True when the LM was unreachable and `answer` is the §7 fallback
    /// notice. The pair was not persisted in this case.
    pub degraded: bool,
}

fn hierarchical_to_context(m: HierarchicalMatch) -> ContextSource {
    ContextSource { memory_id: m.memory_id, content_type: m.content_type, chunk_text: m.chunk_text, meta: m.meta, similarity: m.similarity }
}

fn recency_factor(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let age_days = (now - created_at).num_days().max(0);
    let recency = (-(age_days as f32) / 30.0).exp();
    if age_days < RECENT_AGE_DAYS {
        recency * RECENT_AGE_BOOST
    } else {
        recency
    }
}

/// §4.7's temporal boost, applied when the query analysis flags
/// `has_temporal`.
fn apply_temporal_boost(results: &mut [RankedResult], created_at: &std::collections::HashMap<Uuid, DateTime<Utc>>, now: DateTime<Utc>) {
    for result in results.iter_mut() {
        let Some(&created_at) = created_at.get(&result.source.memory_id) else { continue };
        let recency = recency_factor(created_at, now);
        result.score = (1.0 - TEMPORAL_WEIGHT) * result.source.similarity + TEMPORAL_WEIGHT * recency;
    }
}

fn dedup_by_memory_sorted(mut results: Vec<RankedResult>) -> Vec<RankedResult> {
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut seen = std::collections::HashSet::new();
    results.retain(|r| seen.insert(r.source.memory_id));
    results.truncate(TOP_N_CANDIDATES);
    results
}

fn system_prompt_for(analysis: &QueryAnalysis) -> String {
    let mut prompt = DEFAULT_SYSTEM_PROMPT.to_string();
    if analysis.requires_multi_hop {
        prompt.push_str(" Break down your reasoning into clear steps before answering.");
    }
    if analysis.is_comparison {
        prompt.push_str(" Contrast the items being compared clearly and explicitly.");
    }
    if analysis.has_temporal {
        prompt.push_str(" Weight recent information more heavily than older information.");
    }
    prompt
}

pub struct RagOrchestrator<B: MemoryBackend + RagBackend + Clone + 'static> {
    memory_manager: Arc<MemoryManager<B>>,
    backend: B,
    embeddings: Arc<EmbeddingService>,
    chat_client: Arc<dyn ChatClient>,
    web_search_chain: Vec<Arc<dyn WebSearchProvider>>,
    scraper: Arc<dyn WebScraper>,
    decomposer: Arc<dyn QueryDecomposer>,
    config: Config,
}

impl<B: MemoryBackend + RagBackend + Clone + 'static> RagOrchestrator<B> {
    pub fn new(
        backend: B,
        embeddings: Arc<EmbeddingService>,
        chat_client: Arc<dyn ChatClient>,
        web_search_chain: Vec<Arc<dyn WebSearchProvider>>,
        scraper: Arc<dyn WebScraper>,
        decomposer: Arc<dyn QueryDecomposer>,
        config: Config,
    ) -> Self {
        let memory_manager = Arc::new(MemoryManager::new(backend.clone(), config.clone()));
        Self { memory_manager, backend, embeddings, chat_client, web_search_chain, scraper, decomposer, config }
    }

    async fn history_for(&self, user_id: Uuid, conversation_id: Option<Uuid>) -> Result<(Uuid, Vec<Message>)> {
        match conversation_id {
            Some(id) => {
                let history = self.backend.get_conversation(id).await?;
                Ok((id, history))
            }
            None => {
                let conversation = self.backend.create_conversation(user_id).await?;
                Ok((conversation.id, Vec::new()))
            }
        }
    }

    async fn retrieve_subquery(
        memory_manager: Arc<MemoryManager<B>>,
        user_id: Uuid,
        vector: Vec<f32>,
        top_k: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<HierarchicalMatch>> {
        memory_manager.retrieve_hierarchical(user_id, &vector, top_k, true, now).await
    }

    async fn retrieve_all(&self, user_id: Uuid, sub_queries: &[String], top_k: usize, now: DateTime<Utc>) -> Result<(Vec<HierarchicalMatch>, Vec<f32>)> {
        let refs: Vec<&str> = sub_queries.iter().map(String::as_str).collect();
        let vectors: Vec<Vec<f32>> = self
            .embeddings
            .embed_batch(&refs, EmbedOpts::with_target_dim(self.config.embedding_dim))?
            .into_iter()
            .map(|e| e.vector)
            .collect();

        let mut all_matches = Vec::new();
        for chunk in vectors.chunks(MAX_SUBQUERY_CONCURRENCY) {
            let mut joins = JoinSet::new();
            for vector in chunk {
                let memory_manager = self.memory_manager.clone();
                let vector = vector.clone();
                joins.spawn(Self::retrieve_subquery(memory_manager, user_id, vector, top_k, now));
            }
            while let Some(result) = joins.join_next().await {
                let matches = result.map_err(MemoriaError::internal)??;
                all_matches.extend(matches);
            }
        }

        let primary_vector = vectors.into_iter().next().unwrap_or_default();
        Ok((all_matches, primary_vector))
    }

    async fn search_web(&self, query: &str, n: usize) -> Vec<crate::web::SearchHit> {
        for provider in &self.web_search_chain {
            match provider.search(query, n).await {
                Ok(hits) if !hits.is_empty() => return hits,
                _ => continue,
            }
        }
        Vec::new()
    }

    async fn web_candidates(&self, query: &str, primary_vector: &[f32]) -> Vec<ContextSource> {
        if primary_vector.is_empty() {
            return Vec::new();
        }
        let hits = self.search_web(query, self.config.web_search_results).await;
        let mut sources = Vec::new();
        for hit in hits {
            let Ok(page): std::result::Result<ScrapedPage, _> = self.scraper.scrape(&hit.url).await else { continue };
            let Ok(embedded) = self.embeddings.embed_batch(&[page.text.as_str()], EmbedOpts::with_target_dim(self.config.embedding_dim)) else { continue };
            let Some(embedding) = embedded.into_iter().next() else { continue };
            let similarity = cosine_similarity(primary_vector, &embedding.vector);

            let web_source = WebSource {
                id: Uuid::new_v4(),
                url: page.url.clone(),
                title: page.title.clone().unwrap_or_default(),
                text: page.text.clone(),
                embedding: embedding.vector,
                scraped_at: Utc::now(),
            };
            if self.backend.upsert_web_source(&web_source).await.is_err() {
                continue;
            }

            sources.push(ContextSource {
                memory_id: web_source.id,
                content_type: ContentType::Web,
                chunk_text: page.text,
                meta: serde_json::json!({ "url": page.url, "title": web_source.title }),
                similarity,
            });
        }
        sources
    }

    /// §4.7 steps 1-7: everything up to (not including) the LM call.
    async fn prepare(
        &self,
        request: &RagRequest,
        now: DateTime<Utc>,
    ) -> Result<(Uuid, Vec<Message>, QueryAnalysis, Vec<String>, Vec<ContextSource>)> {
        let (conversation_id, history) = self.history_for(request.user_id, request.conversation_id).await?;

        let analysis = query::analyze(&request.query);
        let sub_queries = query::decompose_if_needed(&request.query, &analysis, &*self.decomposer).await?;

        let (matches, primary_vector) = self.retrieve_all(request.user_id, &sub_queries, request.top_k.max(1), now).await?;
        let local_hit_count = matches.len();

        let created_at: std::collections::HashMap<Uuid, DateTime<Utc>> =
            matches.iter().map(|m| (m.memory_id, m.created_at)).collect();

        let mut sources: Vec<ContextSource> = matches.into_iter().map(hierarchical_to_context).collect();
        if local_hit_count < 2 && request.enable_web {
            sources.extend(self.web_candidates(&request.query, &primary_vector).await);
        }

        let mut ranked: Vec<RankedResult> = sources.into_iter().map(|source| RankedResult { score: source.similarity, source }).collect();
        if analysis.has_temporal {
            apply_temporal_boost(&mut ranked, &created_at, now);
        }
        let ranked = dedup_by_memory_sorted(ranked);

        let preferences = self.backend.get_preferences(request.user_id).await.unwrap_or_default();
        let reranked = rerank(ranked, &preferences);
        let final_sources: Vec<ContextSource> = reranked.into_iter().map(|r| r.source).collect();

        Ok((conversation_id, history, analysis, sub_queries, final_sources))
    }

    fn build_chat_messages(&self, request: &RagRequest, history: &[Message], analysis: &QueryAnalysis, sources: &[ContextSource]) -> (Vec<ChatMessage>, String) {
        let history_messages: Vec<ChatMessage> =
            history.iter().map(|m| ChatMessage { role: m.role, content: m.content.clone() }).collect();
        let counter = crate::context::CharApproxTokenCounter;
        let max_context_tokens = (self.config.llm_context_window as usize) / 2;
        let context = build_context(sources, max_context_tokens, &counter);
        let system_prompt = system_prompt_for(analysis);
        let messages = build_prompt(&request.query, &context, &history_messages, Some(&system_prompt));
        (messages, context)
    }

    async fn persist_and_log(&self, conversation_id: Uuid, answer: &str, sources: &[ContextSource], web_used: bool) {
        let now = Utc::now();
        let user_message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            role: Role::User,
            content: String::new(),
            meta: serde_json::Value::Null,
            created_at: now,
        };
        let assistant_message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            role: Role::Assistant,
            content: answer.to_string(),
            meta: serde_json::json!({ "sourcesCount": sources.len(), "webUsed": web_used }),
            created_at: now,
        };
        if let Err(err) = self.backend.append_message_pair(&user_message, &assistant_message).await {
            tracing::warn!(%conversation_id, %err, "failed to persist conversation turn");
        }

        for source in sources.iter().filter(|s| s.content_type != ContentType::Web).take(ACCESS_LOG_TOP_N) {
            self.memory_manager.log_access_best_effort(source.memory_id, AccessKind::Retrieval).await;
        }
    }

    /// Non-streaming §4.7 pipeline.
    pub async fn ask(&self, request: RagRequest, now: DateTime<Utc>) -> Result<RagAnswer> {
        let (conversation_id, history, analysis, sub_queries, sources) = self.prepare(&request, now).await?;
        let (messages, _context) = self.build_chat_messages(&request, &history, &analysis, &sources);
        let opts = ChatOpts::from_config(&self.config);

        match self.chat_client.complete(&messages, opts).await {
            Ok(answer) => {
                let web_used = sources.iter().any(|s| s.content_type == ContentType::Web);
                self.persist_and_log(conversation_id, &answer, &sources, web_used).await;
                let citations = extract_citations(&answer, &sources);
                Ok(RagAnswer { conversation_id, answer, sources: citations, analysis, sub_queries, degraded: false })
            }
            Err(_) => Ok(RagAnswer {
                conversation_id,
                answer: fallback_message(&request.query),
                sources: Vec::new(),
                analysis,
                sub_queries,
                degraded: true,
            }),
        }
    }

    /// Streaming variant. `tx` receives answer chunks in generation order;
    /// the terminal `{done, sources}` summary is the returned [`RagAnswer`].
    /// `cancel` fires if the client disconnects; no partial answer is
    /// persisted when it does.
    pub async fn ask_stream(
        &self,
        request: RagRequest,
        now: DateTime<Utc>,
        tx: mpsc::Sender<String>,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<RagAnswer> {
        let prepared = tokio::select! {
            biased;
            _ = &mut cancel => return Err(MemoriaError::Transient("request cancelled".to_string())),
            result = self.prepare(&request, now) => result?,
        };
        let (conversation_id, history, analysis, sub_queries, sources) = prepared;
        let (messages, _context) = self.build_chat_messages(&request, &history, &analysis, &sources);
        let opts = ChatOpts::from_config(&self.config);

        // The producer must run concurrently with the drain loop below: it
        // sends every fragment over a bounded channel and only returns at
        // stream end, so awaiting it first would deadlock once the channel
        // fills.
        let (chunk_tx, mut chunk_rx) = mpsc::channel(32);
        let chat_client = self.chat_client.clone();
        let producer = tokio::spawn(async move { chat_client.complete_stream(&messages, opts, chunk_tx).await });

        let mut answer = String::new();
        loop {
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    producer.abort();
                    return Err(MemoriaError::Transient("request cancelled".to_string()));
                }
                chunk = chunk_rx.recv() => match chunk {
                    Some(chunk) => {
                        answer.push_str(&chunk);
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        let stream_result = match producer.await {
            Ok(result) => result,
            Err(err) => return Err(MemoriaError::internal(err)),
        };

        if stream_result.is_err() {
            return Ok(RagAnswer {
                conversation_id,
                answer: fallback_message(&request.query),
                sources: Vec::new(),
                analysis,
                sub_queries,
                degraded: true,
            });
        }

        let web_used = sources.iter().any(|s| s.content_type == ContentType::Web);
        self.persist_and_log(conversation_id, &answer, &sources, web_used).await;
        let citations = extract_citations(&answer, &sources);
        Ok(RagAnswer { conversation_id, answer, sources: citations, analysis, sub_queries, degraded: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::backend::HashingEmbeddingBackend;
    use crate::llm::{FallbackChatClient, LlmError};
    use crate::model::MemoryType;
    use crate::web::{NullWebScraper, NullWebSearchProvider};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct FakeBackend {
        episodic: Arc<Vec<HierarchicalMatch>>,
        conversations: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait]
    impl MemoryBackend for FakeBackend {
        async fn access_stats(&self, _memory_id: Uuid) -> Result<(i64, Option<DateTime<Utc>>)> {
            Ok((0, None))
        }
        async fn chunk_embeddings(&self, _memory_id: Uuid) -> Result<Vec<Vec<f32>>> {
            Ok(Vec::new())
        }
        async fn first_chunk_embedding(&self, _memory_id: Uuid) -> Result<Option<Vec<f32>>> {
            Ok(None)
        }
        async fn consolidation_candidates(&self, _user_id: Uuid, _cutoff: DateTime<Utc>, _limit: usize) -> Result<Vec<crate::model::Memory>> {
            Ok(Vec::new())
        }
        async fn insert_summary(&self, _summary: &crate::model::MemorySummary) -> Result<()> {
            Ok(())
        }
        async fn forgetting_candidates(&self, _user_id: Uuid, _cutoff: DateTime<Utc>) -> Result<Vec<crate::model::Memory>> {
            Ok(Vec::new())
        }
        async fn is_referenced_by_summary(&self, _memory_id: Uuid) -> Result<bool> {
            Ok(false)
        }
        async fn delete_memory(&self, _user_id: Uuid, _memory_id: Uuid) -> Result<()> {
            Ok(())
        }
        async fn recent_episodic_matches(&self, _user_id: Uuid, _query_vector: &[f32], limit: usize, _since: DateTime<Utc>) -> Result<Vec<HierarchicalMatch>> {
            Ok(self.episodic.iter().take(limit).cloned().collect())
        }
        async fn summary_matches(&self, _user_id: Uuid, _query_vector: &[f32], _limit: usize) -> Result<Vec<HierarchicalMatch>> {
            Ok(Vec::new())
        }
        async fn log_access(&self, _memory_id: Uuid, _kind: AccessKind) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl RagBackend for FakeBackend {
        async fn get_conversation(&self, _conversation_id: Uuid) -> Result<Vec<Message>> {
            Ok(self.conversations.lock().unwrap().clone())
        }
        async fn create_conversation(&self, user_id: Uuid) -> Result<Conversation> {
            Ok(Conversation { id: Uuid::new_v4(), user_id, created_at: Utc::now() })
        }
        async fn append_message_pair(&self, user_message: &Message, assistant_message: &Message) -> Result<()> {
            let mut conversations = self.conversations.lock().unwrap();
            conversations.push(user_message.clone());
            conversations.push(assistant_message.clone());
            Ok(())
        }
        async fn get_preferences(&self, user_id: Uuid) -> Result<UserPreference> {
            Ok(UserPreference { user_id, ..UserPreference::default() })
        }
        async fn upsert_web_source(&self, _source: &WebSource) -> Result<()> {
            Ok(())
        }
    }

    struct EchoDecomposer;
    #[async_trait]
    impl QueryDecomposer for EchoDecomposer {
        async fn decompose(&self, query: &str) -> Result<String> {
            Ok(format!("1. {query}\n2. extra angle on {query}"))
        }
    }

    fn orchestrator(episodic: Vec<HierarchicalMatch>, chat_client: Arc<dyn ChatClient>) -> RagOrchestrator<FakeBackend> {
        let backend = FakeBackend { episodic: Arc::new(episodic), conversations: Arc::new(Mutex::new(Vec::new())) };
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(HashingEmbeddingBackend::new(16)), 16));
        RagOrchestrator::new(
            backend,
            embeddings,
            chat_client,
            vec![Arc::new(NullWebSearchProvider)],
            Arc::new(NullWebScraper),
            Arc::new(EchoDecomposer),
            Config { embedding_dim: 16, ..Config::default() },
        )
    }

    fn sample_match(text: &str) -> HierarchicalMatch {
        HierarchicalMatch {
            memory_id: Uuid::new_v4(),
            content_type: ContentType::Text,
            chunk_text: text.to_string(),
            similarity: 0.8,
            memory_type: MemoryType::Semantic,
            created_at: Utc::now(),
            meta: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn ask_persists_turn_and_returns_answer() {
        let orchestrator = orchestrator(vec![sample_match("paris is the capital of france")], Arc::new(FallbackChatClient));
        let request = RagRequest { user_id: Uuid::new_v4(), query: "what is the capital of france".to_string(), conversation_id: None, enable_web: false, top_k: 5 };
        let answer = orchestrator.ask(request, Utc::now()).await.unwrap();
        assert!(answer.answer.contains("capital of france"));
    }

    struct AlwaysFailsChatClient;
    #[async_trait]
    impl ChatClient for AlwaysFailsChatClient {
        async fn complete(&self, _messages: &[ChatMessage], _opts: ChatOpts) -> std::result::Result<String, LlmError> {
            Err(LlmError::Unavailable("offline".to_string()))
        }
        async fn complete_stream(&self, _messages: &[ChatMessage], _opts: ChatOpts, _tx: mpsc::Sender<String>) -> std::result::Result<(), LlmError> {
            Err(LlmError::Unavailable("offline".to_string()))
        }
    }

    #[tokio::test]
    async fn ask_degrades_without_persisting_on_lm_failure() {
        let orchestrator = orchestrator(vec![sample_match("some fact")], Arc::new(AlwaysFailsChatClient));
        let request = RagRequest { user_id: Uuid::new_v4(), query: "tell me something".to_string(), conversation_id: None, enable_web: false, top_k: 5 };
        let answer = orchestrator.ask(request, Utc::now()).await.unwrap();
        assert!(answer.degraded);
        assert!(answer.answer.contains("tell me something"));
        assert!(orchestrator.backend.conversations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ask_decomposes_multi_hop_queries() {
        let orchestrator = orchestrator(vec![sample_match("rust info"), sample_match("go info")], Arc::new(FallbackChatClient));
        let request = RagRequest { user_id: Uuid::new_v4(), query: "compare rust versus go".to_string(), conversation_id: None, enable_web: false, top_k: 5 };
        let answer = orchestrator.ask(request, Utc::now()).await.unwrap();
        assert_eq!(answer.sub_queries.len(), 2);
    }
}
