//! Command-line front end for the ingestion pipeline.
//!
//! ```text
//! lexgraph --document-id LAW-2041 --document-id LAW-2042
//! lexgraph --batch ids.txt --output-json report.json
//! lexgraph --batch ids.txt --simulate --enrich-workers 32
//! lexgraph --rollback LAW-2041
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lexgraph_ingest::config::IngestionConfig;
use lexgraph_ingest::error::IngestError;
use lexgraph_ingest::orchestrator::Orchestrator;
use lexgraph_ingest::persist::{GraphStore, SqliteGraphStore};
use lexgraph_ingest::resources::ResourceManager;

#[derive(Parser, Debug)]
#[command(name = "lexgraph", about = "Ingest structured legal documents into the graph store")]
struct Cli {
    /// Document id to ingest; repeatable.
    #[arg(long = "document-id", value_name = "ID")]
    document_ids: Vec<String>,

    /// File with one document id per line ('#' starts a comment).
    #[arg(long, value_name = "FILE")]
    batch: Option<PathBuf>,

    /// Delete every persisted unit of this document, then exit.
    #[arg(long, value_name = "ID", conflicts_with_all = ["document_ids", "batch"])]
    rollback: Option<String>,

    /// Parse documents without computing embedding vectors.
    #[arg(long)]
    skip_embeddings: bool,

    /// Deterministic fake embeddings, no cache, no network (stress mode).
    #[arg(long)]
    simulate: bool,

    #[arg(long, value_name = "N")]
    parse_workers: Option<usize>,

    #[arg(long, value_name = "N")]
    enrich_workers: Option<usize>,

    #[arg(long, value_name = "N")]
    persist_workers: Option<usize>,

    #[arg(long, value_name = "N")]
    channel_capacity: Option<usize>,

    /// Leaf count above which a document is enriched in parallel chunks.
    #[arg(long, value_name = "N")]
    scatter_chunk_size: Option<usize>,

    /// Write the batch report as JSON to this path ('-' for stdout).
    #[arg(long, value_name = "PATH")]
    output_json: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(all_succeeded) => {
            if all_succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            error!(error = %err, "run aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool, IngestError> {
    let mut config = IngestionConfig::from_env();
    let parse_workers = cli.parse_workers.unwrap_or(config.parse_workers);
    let enrich_workers = cli.enrich_workers.unwrap_or(config.enrich_workers);
    let persist_workers = cli.persist_workers.unwrap_or(config.persist_workers);
    config = config.with_pool_sizes(parse_workers, enrich_workers, persist_workers);
    if let Some(capacity) = cli.channel_capacity {
        config = config.with_channel_capacity(capacity);
    }
    if let Some(size) = cli.scatter_chunk_size {
        config = config.with_scatter_chunk_size(size);
    }
    config = config
        .with_skip_embeddings(cli.skip_embeddings)
        .with_simulated_embeddings(cli.simulate);

    if let Some(document_id) = &cli.rollback {
        let store = SqliteGraphStore::open(&config.store_path).await?;
        let deleted = store.delete_document(document_id).await?;
        let reindexed = store.rebuild_vector_index().await?;
        info!(document_id = %document_id, deleted, reindexed, "manual rollback complete");
        return Ok(true);
    }

    let mut document_ids = cli.document_ids.clone();
    if let Some(path) = &cli.batch {
        let contents = tokio::fs::read_to_string(path).await?;
        document_ids.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    if document_ids.is_empty() {
        return Err(IngestError::ResourceInit(
            "no document ids given; use --document-id or --batch".into(),
        ));
    }

    let resources = Arc::new(ResourceManager::initialize(&config).await?);
    let orchestrator = Orchestrator::new(config, resources);
    let report = orchestrator.run(document_ids).await?;

    for result in &report.results {
        if !result.success {
            error!(
                document_id = %result.document_id,
                stage = result.failed_stage.as_deref().unwrap_or("unknown"),
                error = result.error_message.as_deref().unwrap_or(""),
                "document failed"
            );
        }
    }
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        nodes = report.nodes_created,
        edges = report.edges_created,
        cache_hits = report.cache_hits,
        computed = report.embeddings_computed,
        links = report.reference_links,
        "batch finished"
    );

    if let Some(path) = &cli.output_json {
        let json = serde_json::to_string_pretty(&report)?;
        if path.as_os_str() == "-" {
            println!("{json}");
        } else {
            tokio::fs::write(path, json).await?;
            info!(path = %path.display(), "report written");
        }
    }

    Ok(report.all_succeeded())
}
