//! Docent CLI
//!
//! Command-line interface for ingesting documents, searching them and asking
//! questions grounded in their content. Results are printed as JSON on
//! stdout; logs and progress go to stderr.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use docent_lib::documents::Embedder;
use docent_lib::{
    config_path, init_logging, Config, Conversation, IngestProgress, RetrievalPipeline, SearchResult,
};

#[derive(Parser)]
#[command(name = "docent")]
#[command(about = "Docent - local document retrieval and question answering", long_about = None)]
struct Cli {
    /// Database file (overrides config and DOCENT_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Debug-level logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, chunk, embed and store a document
    Ingest {
        path: PathBuf,
        /// Display name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// List stored documents
    List,
    /// Show one document and its chunks
    Show { id: String },
    /// Delete a document and its chunks
    Delete { id: String },
    /// Remove every document
    Clear,
    /// Document, chunk and dimension counts
    Stats,
    /// Rank stored chunks against a query
    Search {
        query: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        #[arg(long, allow_negative_numbers = true)]
        threshold: Option<f32>,
    },
    /// Answer a question from retrieved context
    Ask {
        query: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Recompute all embeddings with the current provider
    Reembed,
    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (API key redacted)
    Show,
    /// Print the preferences file location
    Path,
    /// Write a default preferences file
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Send one embedding request to the configured provider, without fallback
    Check,
}

// ============ OUTPUT TYPES ============

#[derive(Serialize)]
struct ErrorOutput {
    error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchHit {
    document_id: String,
    document: String,
    chunk_index: u32,
    score: f32,
    relevance: i32,
    content: String,
}

impl From<&SearchResult> for SearchHit {
    fn from(r: &SearchResult) -> Self {
        Self {
            document_id: r.document.id.clone(),
            document: r.document.name.clone(),
            chunk_index: r.chunk.index,
            score: r.score,
            relevance: r.relevance_percent(),
            content: r.chunk.content.clone(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkOutput {
    index: u32,
    start_index: usize,
    end_index: usize,
    dimensions: usize,
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ShowOutput {
    id: String,
    name: String,
    path: String,
    created_at: String,
    content_length: usize,
    chunks: Vec<ChunkOutput>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnswerOutput {
    answer: String,
    sources: Vec<SearchHit>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusOutput {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckOutput {
    ok: bool,
    provider: String,
    model: String,
    dimensions: usize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match run(cli, &cancel).await {
        Ok(json) => println!("{}", json),
        Err(e) => {
            let error = ErrorOutput { error: format!("{:#}", e) };
            println!("{}", serde_json::to_string(&error).unwrap_or_else(|_| "{}".to_string()));
            std::process::exit(1);
        }
    }
}

fn load_config(db: Option<PathBuf>) -> anyhow::Result<Config> {
    let mut config = Config::load().context("loading configuration")?;
    if let Some(db) = db {
        config.database_path = Some(db);
    }
    Ok(config)
}

async fn run(cli: Cli, cancel: &CancellationToken) -> anyhow::Result<String> {
    match cli.command {
        Commands::Config { action } => handle_config(action, cli.db).await,
        command => {
            let config = load_config(cli.db)?;
            let pipeline = RetrievalPipeline::open(&config)?;
            handle_documents(command, &config, &pipeline, cancel).await
        }
    }
}

async fn handle_documents(
    command: Commands,
    config: &Config,
    pipeline: &RetrievalPipeline,
    cancel: &CancellationToken,
) -> anyhow::Result<String> {
    match command {
        Commands::Ingest { path, name } => {
            let report = pipeline
                .ingest_file(&path, name.as_deref(), cancel, log_progress)
                .await?;
            if report.local_embeddings > 0 && config.provider.is_configured() {
                warn!(
                    chunks = report.local_embeddings,
                    "Some chunks used local fallback embeddings"
                );
            }
            Ok(serde_json::to_string(&report)?)
        }

        Commands::List => Ok(serde_json::to_string(&pipeline.list().await?)?),

        Commands::Show { id } => {
            let document = pipeline.get(&id).await?;
            let output = ShowOutput {
                id: document.id,
                name: document.name,
                path: document.path,
                created_at: document.created_at.to_rfc3339(),
                content_length: document.content.chars().count(),
                chunks: document
                    .chunks
                    .into_iter()
                    .map(|c| ChunkOutput {
                        index: c.index,
                        start_index: c.start_index,
                        end_index: c.end_index,
                        dimensions: c.embedding.len(),
                        content: c.content,
                    })
                    .collect(),
            };
            Ok(serde_json::to_string(&output)?)
        }

        Commands::Delete { id } => {
            pipeline.delete(&id).await?;
            Ok(serde_json::to_string(&StatusOutput { ok: true, id: Some(id), path: None })?)
        }

        Commands::Clear => {
            pipeline.clear().await?;
            Ok(serde_json::to_string(&StatusOutput { ok: true, id: None, path: None })?)
        }

        Commands::Stats => Ok(serde_json::to_string(&pipeline.stats().await?)?),

        Commands::Search { query, top_k, threshold } => {
            let results = match (top_k, threshold) {
                (None, None) => pipeline.retrieve(&query, cancel).await?,
                (top_k, threshold) => {
                    let settings = pipeline.retrieval_settings();
                    pipeline
                        .search(
                            &query,
                            top_k.unwrap_or(settings.top_k),
                            threshold.unwrap_or(settings.threshold),
                            cancel,
                        )
                        .await?
                }
            };
            let hits: Vec<SearchHit> = results.iter().map(SearchHit::from).collect();
            Ok(serde_json::to_string(&hits)?)
        }

        Commands::Ask { query, top_k } => {
            if let Some(k) = top_k {
                let mut adjusted = config.clone();
                adjusted.retrieval.top_k = k;
                pipeline.reload(&adjusted)?;
            }
            let mut conversation = Conversation::new();
            let answer = pipeline.ask(&mut conversation, &query, cancel).await?;
            let output = AnswerOutput {
                answer: answer.text,
                sources: answer.sources.iter().map(SearchHit::from).collect(),
            };
            Ok(serde_json::to_string(&output)?)
        }

        Commands::Reembed => {
            let report = pipeline
                .reembed_all(cancel, |current, total| {
                    info!(current, total, "Re-embedding");
                })
                .await?;
            Ok(serde_json::to_string(&report)?)
        }

        Commands::Config { .. } => bail!("configuration commands do not use the document store"),
    }
}

async fn handle_config(action: ConfigAction, db: Option<PathBuf>) -> anyhow::Result<String> {
    match action {
        ConfigAction::Show => {
            let mut config = load_config(db)?;
            if config.provider.api_key.is_some() {
                config.provider.api_key = Some("********".to_string());
            }
            let mut value = serde_json::to_value(&config)?;
            value["databasePath"] = serde_json::json!(config.database_path()?);
            Ok(serde_json::to_string_pretty(&value)?)
        }

        ConfigAction::Path => {
            let path = config_path()?;
            Ok(serde_json::to_string(&StatusOutput {
                ok: path.exists(),
                id: None,
                path: Some(path.display().to_string()),
            })?)
        }

        ConfigAction::Init { force } => {
            let path = config_path()?;
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            let written = Config::default().save()?;
            info!(path = %written.display(), "Wrote default configuration");
            Ok(serde_json::to_string(&StatusOutput {
                ok: true,
                id: None,
                path: Some(written.display().to_string()),
            })?)
        }

        ConfigAction::Check => {
            let config = load_config(db)?;
            if !config.provider.is_configured() {
                bail!("no API key configured for {}", config.provider.kind.as_str());
            }
            let embedder = Embedder::new(config.provider.clone(), config.embedding.clone());
            let vector = embedder
                .embed_remote("docent connectivity check")
                .await
                .context("embedding provider check failed")?;
            Ok(serde_json::to_string(&CheckOutput {
                ok: true,
                provider: config.provider.kind.as_str().to_string(),
                model: config.provider.embedding_model().to_string(),
                dimensions: vector.len(),
            })?)
        }
    }
}

fn log_progress(progress: IngestProgress) {
    match progress.fraction {
        Some(fraction) => info!(
            stage = ?progress.stage,
            progress = %format!("{:.0}%", fraction * 100.0),
            "{}",
            progress.message
        ),
        None => info!(stage = ?progress.stage, "{}", progress.message),
    }
}
