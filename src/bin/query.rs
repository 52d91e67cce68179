use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use noteseek::vector_store::PineconeIndex;
use noteseek::{
    render_context, GeminiRewriter, OpenAiEmbedder, PassthroughRewriter, Retriever,
    RetrieverConfig, Rewriter, TokenCounter, DENSE_DIMENSION,
};

#[derive(Parser, Debug)]
#[command(
    name = "noteseek-query",
    about = "Search the indexed reading archive and print cited context"
)]
struct QueryCli {
    /// Query text
    #[arg(long)]
    query: String,

    /// Final passage count
    #[arg(long, default_value_t = 12)]
    top_k: usize,

    /// Minimum chunk score kept (dot product over hybrid records)
    #[arg(long, default_value_t = 0.7)]
    min_score: f32,

    /// Minimum header score kept in the candidate pass
    #[arg(long, default_value_t = 0.75)]
    header_min_score: f32,

    /// Pinecone API key
    #[arg(long, env = "PINECONE_API_KEY")]
    pinecone_api_key: String,

    /// Pinecone index host URL
    #[arg(long, env = "PINECONE_INDEX")]
    pinecone_index: String,

    /// OpenAI API key used for query embeddings
    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: String,

    /// Embedding model identifier
    #[arg(
        long,
        env = "NOTESEEK_EMBED_MODEL",
        default_value = "text-embedding-3-small"
    )]
    embed_model: String,

    /// Base URL for OpenAI-compatible endpoints
    #[arg(
        long,
        env = "NOTESEEK_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    openai_base_url: String,

    /// Gemini API key for query rewriting (required unless --no-rewrite)
    #[arg(long, env = "GEMINI_API_KEY")]
    gemini_api_key: Option<String>,

    /// Gemini model identifier
    #[arg(long, env = "NOTESEEK_REWRITE_MODEL", default_value = "gemini-2.0-flash")]
    rewrite_model: String,

    /// Search with the raw query, skipping the LLM rewriter
    #[arg(long, default_value_t = false)]
    no_rewrite: bool,

    /// Seconds before outbound requests time out
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Retry attempts for transient upstream errors
    #[arg(long, default_value_t = 5)]
    max_retries: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = QueryCli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs.max(1));
    let tokens = Arc::new(TokenCounter::new());

    let index = PineconeIndex::new(
        cli.pinecone_api_key,
        cli.pinecone_index,
        timeout,
        cli.max_retries,
    )?;
    let embedder = OpenAiEmbedder::new(
        cli.openai_api_key,
        cli.openai_base_url,
        cli.embed_model,
        DENSE_DIMENSION,
        timeout,
        cli.max_retries,
        tokens,
    )?;
    let rewriter: Arc<dyn Rewriter> = if cli.no_rewrite {
        Arc::new(PassthroughRewriter)
    } else {
        let api_key = cli
            .gemini_api_key
            .ok_or_else(|| anyhow!("GEMINI_API_KEY must be set unless --no-rewrite is given"))?;
        Arc::new(GeminiRewriter::new(api_key, cli.rewrite_model, timeout)?)
    };

    let retriever = Retriever::new(
        Arc::new(index),
        Arc::new(embedder),
        rewriter,
        RetrieverConfig {
            top_k: cli.top_k.max(1),
            min_score: cli.min_score,
            header_min_score: cli.header_min_score,
            ..RetrieverConfig::default()
        },
    );

    let passages = retriever.search(&cli.query).await?;
    let rendered = render_context(&passages);
    if !rendered.has_sources {
        println!("No matching notes.");
        return Ok(());
    }
    println!("{}", rendered.text);
    Ok(())
}
