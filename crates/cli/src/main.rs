use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cli::output;
use semantic_core::config::{self, AppConfig};
use semantic_core::knowledge::MetadataFilter;
use semantic_core::models::FileKind;
use semantic_core::pipeline;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Index {
            provider,
            roots,
            json,
        } => run_index(cfg, provider, roots, json).await,
        Commands::Search {
            query,
            topk,
            provider,
            kind,
            project,
            context,
            json,
        } => run_search(cfg, query, topk, provider, kind, project, context, json).await,
        Commands::Stats { json } => run_stats(cfg, json).await,
        Commands::Export {
            provider,
            kind,
            project,
            output,
        } => run_export(cfg, provider, kind, project, output).await,
    }
}

#[derive(Parser)]
#[command(name = "semantic-index", version, about = "Business-semantic code indexing")]
struct Cli {
    /// Path to config TOML
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest, classify and index the configured roots
    Index {
        /// Provider name; defaults to `default_provider`
        #[arg(short, long)]
        provider: Option<String>,
        /// Index only these roots; records elsewhere are kept
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        roots: Vec<String>,
        /// Output JSON summary
        #[arg(long)]
        json: bool,
    },
    /// Retrieve business knowledge for a natural-language request
    Search {
        query: String,
        /// Number of results (defaults to retrieval.top_k)
        #[arg(long)]
        topk: Option<usize>,
        /// Only records produced by this provider
        #[arg(long)]
        provider: Option<String>,
        /// Only `code` or `configuration` records
        #[arg(long)]
        kind: Option<String>,
        /// Only records of this project
        #[arg(long)]
        project: Option<String>,
        /// Print the grouped context summary instead of the hit list
        #[arg(long)]
        context: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show what the knowledge store holds
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Dump stored records as JSON Lines
    Export {
        #[arg(long)]
        provider: Option<String>,
        /// Only `code` or `configuration` records
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        project: Option<String>,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

async fn run_index(
    cfg: AppConfig,
    provider: Option<String>,
    roots: Vec<String>,
    json: bool,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight files");
            on_signal.cancel();
        }
    });

    let report = pipeline::run_index(&cfg, provider.as_deref(), &roots, cancel).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&output::report_json(&report))?);
    } else {
        print!("{}", output::render_report(&report));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_search(
    cfg: AppConfig,
    query: String,
    topk: Option<usize>,
    provider: Option<String>,
    kind: Option<String>,
    project: Option<String>,
    context: bool,
    json: bool,
) -> Result<()> {
    let filter = metadata_filter(provider, kind, project)?;
    let retriever = pipeline::open_retriever(&cfg).await?;
    let k = topk.unwrap_or(cfg.retrieval.top_k);
    let hits = retriever.retrieve_top(&query, k, &filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&output::hits_json(&query, &hits))?);
    } else if context {
        let summary =
            semantic_core::retrieval::context_summary(&hits, cfg.retrieval.context_max_chars);
        println!("{summary}");
    } else {
        print!("{}", output::render_hits(&hits));
    }
    Ok(())
}

fn metadata_filter(
    provider: Option<String>,
    kind: Option<String>,
    project: Option<String>,
) -> Result<MetadataFilter> {
    let mut filter = MetadataFilter::all();
    if let Some(p) = provider.as_deref() {
        filter = filter.provider(p);
    }
    if let Some(k) = kind.as_deref() {
        let kind = FileKind::parse(k).with_context(|| format!("unknown file kind `{k}`"))?;
        filter = filter.file_kind(kind);
    }
    if let Some(p) = project.as_deref() {
        filter = filter.project(p);
    }
    Ok(filter)
}

async fn run_export(
    cfg: AppConfig,
    provider: Option<String>,
    kind: Option<String>,
    project: Option<String>,
    destination: Option<PathBuf>,
) -> Result<()> {
    let filter = metadata_filter(provider, kind, project)?;
    let records = pipeline::export(&cfg, &filter).await?;
    match destination {
        Some(path) => {
            let file = File::create(&path)
                .with_context(|| format!("create export file {}", path.display()))?;
            output::write_records(&records, BufWriter::new(file))?;
            info!(records = records.len(), path = %path.display(), "export written");
        }
        None => output::write_records(&records, std::io::stdout().lock())?,
    }
    Ok(())
}

async fn run_stats(cfg: AppConfig, json: bool) -> Result<()> {
    let stats = pipeline::stats(&cfg).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", output::render_stats(&stats));
    }
    Ok(())
}
