//! Memoria CLI
//!
//! Operator shell for the memoria-core engine: ingest content, ask
//! questions through the RAG pipeline, and run maintenance (consolidation,
//! forgetting) against a local SQLite store.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use directories::ProjectDirs;
use uuid::Uuid;

use memoria_core::{
    ChatClient, ChatOpts, Config, ContentType, EmbedOpts, EmbeddingService, FallbackChatClient,
    FallbackSearchProvider, HashingEmbeddingBackend, HttpWebScraper, IngestInput,
    IngestionCoordinator, MemoryManager, MemoryType, NullWebScraper, NullWebSearchProvider,
    OllamaChatClient, QueryDecomposer, RagOrchestrator, RagRequest, Storage, SummaryGenerator,
    WebScraper, WebSearchProvider, DECOMPOSITION_PROMPT,
};

/// Memoria - personal memory and RAG CLI
#[derive(Parser)]
#[command(name = "memoria")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the memoria personal memory and RAG engine")]
struct Cli {
    /// Path to the SQLite database (defaults to the platform data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// User ID to operate as (defaults to a fixed nil UUID for single-user use)
    #[arg(long, global = true)]
    user_id: Option<Uuid>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a piece of text content
    Ingest {
        /// Content to remember
        content: String,
        /// Explicit memory type override (episodic, semantic, procedural)
        #[arg(long)]
        memory_type: Option<String>,
    },

    /// Ask a question through the RAG pipeline
    Ask {
        /// Question to ask
        query: String,
        /// Continue an existing conversation
        #[arg(long)]
        conversation_id: Option<Uuid>,
        /// Allow falling back to web search when local memory is thin
        #[arg(long)]
        web: bool,
        /// Number of memories to retrieve
        #[arg(long, default_value = "5")]
        top_k: usize,
    },

    /// Show memory counts for the active user
    Stats,

    /// Run a consolidation cycle (episodic -> semantic summaries)
    Consolidate,

    /// Run a forgetting cycle (delete unimportant, unsummarized memories)
    Forget,
}

/// Wraps a [`ChatClient`] as a [`QueryDecomposer`], per the design note in
/// `query.rs`: the trait stays LM-agnostic, the adapter lives at the call
/// site.
struct ChatClientDecomposer {
    chat_client: Arc<dyn ChatClient>,
}

#[async_trait::async_trait]
impl QueryDecomposer for ChatClientDecomposer {
    async fn decompose(&self, query: &str) -> memoria_core::Result<String> {
        let messages = vec![
            memoria_core::ChatMessage { role: memoria_core::Role::System, content: DECOMPOSITION_PROMPT.to_string() },
            memoria_core::ChatMessage { role: memoria_core::Role::User, content: query.to_string() },
        ];
        let opts = ChatOpts { temperature: 0.3, max_tokens: 256 };
        Ok(self.chat_client.complete(&messages, opts).await?)
    }
}

/// Wraps a [`ChatClient`] as a [`SummaryGenerator`], per the same design
/// note in `memory_manager.rs`.
struct ChatClientSummaryGenerator {
    chat_client: Arc<dyn ChatClient>,
}

#[async_trait::async_trait]
impl SummaryGenerator for ChatClientSummaryGenerator {
    async fn summarize(&self, prompt: &str) -> memoria_core::Result<String> {
        let messages = vec![memoria_core::ChatMessage { role: memoria_core::Role::User, content: prompt.to_string() }];
        let opts = ChatOpts { temperature: 0.3, max_tokens: 512 };
        Ok(self.chat_client.complete(&messages, opts).await?)
    }
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("dev", "memoria", "memoria")
        .ok_or_else(|| anyhow::anyhow!("could not determine project directories"))?;
    Ok(proj_dirs.data_dir().join("memoria.db"))
}

fn build_chat_client() -> Arc<dyn ChatClient> {
    match std::env::var("OLLAMA_MODEL") {
        Ok(model) => Arc::new(OllamaChatClient::new(model)),
        Err(_) => Arc::new(FallbackChatClient),
    }
}

fn build_web_search_chain() -> Vec<Arc<dyn WebSearchProvider>> {
    let mut chain: Vec<Arc<dyn WebSearchProvider>> = Vec::new();
    if let Ok(key) = std::env::var("BRAVE_API_KEY") {
        chain.push(Arc::new(memoria_core::BraveSearchProvider::new(key)));
    }
    if let Ok(key) = std::env::var("SERP_API_KEY") {
        chain.push(Arc::new(memoria_core::SerpApiSearchProvider::new(key)));
    }
    chain.push(Arc::new(FallbackSearchProvider::new()));
    chain
}

fn build_scraper(config: &Config) -> Arc<dyn WebScraper> {
    if std::env::var("MEMORIA_DISABLE_WEB").is_ok() {
        Arc::new(NullWebScraper)
    } else {
        Arc::new(HttpWebScraper::new(config.web_scrape_timeout))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };
    let user_id = cli.user_id.unwrap_or(Uuid::nil());
    let config = Config::from_env();

    let storage = Arc::new(Storage::new(Some(db_path), config.embedding_dim)?);
    let embeddings = Arc::new(EmbeddingService::new(
        Arc::new(HashingEmbeddingBackend::new(config.embedding_dim)),
        config.embedding_dim,
    ));

    match cli.command {
        Commands::Ingest { content, memory_type } => run_ingest(storage, embeddings, config, user_id, content, memory_type).await,
        Commands::Ask { query, conversation_id, web, top_k } => {
            run_ask(storage, embeddings, config, user_id, query, conversation_id, web, top_k).await
        }
        Commands::Stats => run_stats(storage, user_id),
        Commands::Consolidate => run_consolidate(storage, embeddings, config, user_id).await,
        Commands::Forget => run_forget(storage, config, user_id).await,
    }
}

async fn run_ingest(
    storage: Arc<Storage>,
    embeddings: Arc<EmbeddingService>,
    config: Config,
    user_id: Uuid,
    content: String,
    memory_type: Option<String>,
) -> anyhow::Result<()> {
    let memory_type = memory_type
        .map(|raw| MemoryType::parse_name(&raw).ok_or_else(|| anyhow::anyhow!("unknown memory type '{raw}'")))
        .transpose()?;

    let coordinator = IngestionCoordinator::new(storage, embeddings, config);
    let memory = coordinator
        .ingest(IngestInput {
            user_id,
            content_type: ContentType::Text,
            content,
            blob_ref: None,
            meta: serde_json::Value::Null,
            memory_type,
        })
        .await?;

    println!("{}", "=== Memory Ingested ===".cyan().bold());
    println!("{}: {}", "ID".white().bold(), memory.id);
    println!("{}: {}", "Type".white().bold(), memory.memory_type.as_str());
    println!("{}: {}", "Importance".white().bold(), memory.importance);
    Ok(())
}

async fn run_ask(
    storage: Arc<Storage>,
    embeddings: Arc<EmbeddingService>,
    config: Config,
    user_id: Uuid,
    query: String,
    conversation_id: Option<Uuid>,
    web: bool,
    top_k: usize,
) -> anyhow::Result<()> {
    let chat_client = build_chat_client();
    let web_chain: Vec<Arc<dyn WebSearchProvider>> = if web { build_web_search_chain() } else { vec![Arc::new(NullWebSearchProvider)] };
    let scraper = build_scraper(&config);
    let decomposer: Arc<dyn QueryDecomposer> = Arc::new(ChatClientDecomposer { chat_client: chat_client.clone() });

    let orchestrator = RagOrchestrator::new(storage, embeddings, chat_client, web_chain, scraper, decomposer, config);

    let request = RagRequest { user_id, query, conversation_id, enable_web: web, top_k };
    let answer = orchestrator.ask(request, chrono::Utc::now()).await?;

    println!("{}", "=== Answer ===".cyan().bold());
    if answer.degraded {
        println!("{}", answer.answer.yellow());
    } else {
        println!("{}", answer.answer);
    }
    if !answer.sources.is_empty() {
        println!();
        println!("{}", "Sources:".white().bold());
        for (index, citation) in answer.sources.iter().enumerate() {
            println!("  [{}] {} ({:.3}) {}", index + 1, citation.memory_id, citation.similarity, citation.snippet);
        }
    }
    println!();
    println!("{}: {}", "Conversation".dimmed(), answer.conversation_id);
    Ok(())
}

fn run_stats(storage: Arc<Storage>, user_id: Uuid) -> anyhow::Result<()> {
    let (memories, total) = storage.get_memories(user_id, 0, 500)?;

    println!("{}", "=== Memoria Statistics ===".cyan().bold());
    println!("{}: {}", "Total Memories".white().bold(), total);

    let episodic = memories.iter().filter(|m| m.memory_type == MemoryType::Episodic).count();
    let semantic = memories.iter().filter(|m| m.memory_type == MemoryType::Semantic).count();
    let procedural = memories.iter().filter(|m| m.memory_type == MemoryType::Procedural).count();
    println!("{}: {}", "Episodic".white(), episodic);
    println!("{}: {}", "Semantic".white(), semantic);
    println!("{}: {}", "Procedural".white(), procedural);

    if let Some(newest) = memories.iter().map(|m| m.created_at).max() {
        println!("{}: {}", "Newest".white(), newest.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

async fn run_consolidate(storage: Arc<Storage>, embeddings: Arc<EmbeddingService>, config: Config, user_id: Uuid) -> anyhow::Result<()> {
    println!("{}", "=== Memoria Consolidation ===".cyan().bold());

    let chat_client = build_chat_client();
    let generator = ChatClientSummaryGenerator { chat_client };
    let manager = MemoryManager::new(storage, config);

    let embed = move |text: &str| {
        let embeddings = embeddings.clone();
        let text = text.to_string();
        let target_dim = embeddings.dimensions();
        Box::pin(async move {
            let embedding = embeddings.embed(&text, EmbedOpts::with_target_dim(target_dim))?;
            Ok(embedding.vector)
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = memoria_core::Result<Vec<f32>>> + Send>>
    };

    let report = manager.consolidate(user_id, &generator, embed, chrono::Utc::now()).await?;

    println!("{}: {}", "Memories Consolidated".white().bold(), report.memories_consolidated);
    println!("{}: {}", "Summaries Created".white().bold(), report.summaries_created);
    Ok(())
}

async fn run_forget(storage: Arc<Storage>, config: Config, user_id: Uuid) -> anyhow::Result<()> {
    println!("{}", "=== Memoria Forgetting ===".cyan().bold());

    let manager = MemoryManager::new(storage, config);
    let deleted = manager.forget_unimportant(user_id, chrono::Utc::now()).await?;

    println!("{}: {}", "Memories Deleted".white().bold(), deleted);
    Ok(())
}
