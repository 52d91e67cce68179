use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use noteseek::reader::DEFAULT_READER_BASE_URL;
use noteseek::vector_store::PineconeIndex;
use noteseek::{
    ChunkerConfig, OpenAiEmbedder, ReaderClient, SyncOptions, SyncPipeline, TokenCounter,
    DENSE_DIMENSION,
};

#[derive(Parser, Debug)]
#[command(
    name = "noteseek-sync",
    about = "Ingest the reading archive into the hybrid vector index"
)]
struct SyncCli {
    /// Reader API token
    #[arg(long, env = "READWISE_TOKEN")]
    readwise_token: String,

    /// Reader API base URL
    #[arg(long, env = "NOTESEEK_READER_BASE", default_value = DEFAULT_READER_BASE_URL)]
    reader_base_url: String,

    /// Pinecone API key
    #[arg(long, env = "PINECONE_API_KEY")]
    pinecone_api_key: String,

    /// Pinecone index host URL (dot-product metric, hybrid-capable)
    #[arg(long, env = "PINECONE_INDEX")]
    pinecone_index: String,

    /// OpenAI API key used for embeddings
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

    /// Only ingest documents updated after this ISO-8601 instant
    #[arg(long, env = "LAST_SYNC_TIME")]
    updated_after: Option<String>,

    /// Reprocess documents even when the index already holds them
    #[arg(long, default_value_t = false)]
    force_update: bool,

    /// Seconds before outbound requests time out
    #[arg(long, default_value_t = 60)]
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
    let cli = SyncCli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs.max(1));
    let tokens = Arc::new(TokenCounter::new());

    let reader = ReaderClient::new(
        cli.readwise_token,
        cli.reader_base_url,
        timeout,
        cli.max_retries,
    )?;
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
        Arc::clone(&tokens),
    )?;

    let pipeline = SyncPipeline::new(
        reader,
        Arc::new(index),
        Arc::new(embedder),
        tokens,
        ChunkerConfig::default(),
    );
    let options = SyncOptions {
        updated_after: cli.updated_after,
        force_update: cli.force_update,
    };
    let report = pipeline.sync(&options).await?;
    report.report();
    Ok(())
}
