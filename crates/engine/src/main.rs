//! # medparse CLI
//!
//! Runs one pipeline operation per invocation and prints its result as JSON
//! on stdout. Logs go to stderr.
//!
//! ```bash
//! medparse index note-1 note-2
//! medparse ask "What was prescribed for the knee pain?" --top-k 3
//! medparse extract note-1
//! medparse bundle note-1
//! medparse note note-1 simplify
//! ```
//!
//! When `persistence.state_dir` is configured, the index and caches are
//! loaded at startup and saved before exit.

use anyhow::Context;
use clap::{Parser, Subcommand};
use medparse_common::config::AppConfig;
use medparse_common::metrics::{register_metrics, BACKEND_BUCKETS};
use medparse_common::VERSION;
use medparse_engine::{AskRequest, ClinicalPipeline};
use medparse_extraction::NoteOperation;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Clinical narrative retrieval and structured extraction
#[derive(Parser)]
#[command(name = "medparse", version, about)]
struct Cli {
    /// Configuration file; layered under APP__ environment variables
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index documents into the default corpus
    Index {
        #[arg(required = true)]
        ids: Vec<String>,

        /// Rebuild even when the content is already indexed
        #[arg(long)]
        force: bool,
    },

    /// Answer a question from indexed documents
    Ask {
        query: String,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        corpus: Option<String>,

        /// Restrict retrieval to a document; repeatable
        #[arg(long = "document")]
        documents: Vec<String>,
    },

    /// Extract a structured record from a document
    Extract {
        id: String,

        /// Bypass the result cache
        #[arg(long)]
        fresh: bool,
    },

    /// Build an interchange bundle for a document
    Bundle { id: String },

    /// Run a note operation: summarize, patient-info or simplify
    Note {
        id: String,

        operation: NoteOperation,

        #[arg(long)]
        fresh: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(&path.to_string_lossy()),
        None => AppConfig::load(),
    }
    .context("failed to load configuration")?;

    init_tracing(&config);
    init_metrics(&config)?;

    info!(version = VERSION, service = %config.observability.service_name, "Starting medparse");

    let pipeline = ClinicalPipeline::from_config(config)?;
    if let Some(dir) = pipeline.config().persistence.state_dir.clone() {
        pipeline.load_state(&dir).await?;
    }

    let outcome = run(&pipeline, cli.command).await;
    if let Err(e) = pipeline.shutdown().await {
        warn!(error = %e, "Failed to persist state");
    }
    outcome
}

async fn run(pipeline: &ClinicalPipeline, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Index { ids, force } => {
            let mut handles = Vec::with_capacity(ids.len());
            for id in &ids {
                let handle = if force {
                    pipeline.rebuild_index(id).await?
                } else {
                    pipeline.build_index(id).await?
                };
                handles.push(handle);
            }
            print_json(&handles)
        }
        Commands::Ask {
            query,
            top_k,
            corpus,
            documents,
        } => {
            let mut request = AskRequest::new(query);
            if let Some(k) = top_k {
                request = request.with_top_k(k);
            }
            if let Some(corpus) = corpus {
                request = request.with_corpus(corpus);
            }
            if !documents.is_empty() {
                request = request.with_documents(documents);
            }
            print_json(&pipeline.retrieve_and_answer(request).await?)
        }
        Commands::Extract { id, fresh } => print_json(&pipeline.extract_structured(&id, !fresh).await?),
        Commands::Bundle { id } => print_json(&pipeline.to_interchange_bundle(&id).await?),
        Commands::Note { id, operation, fresh } => print_json(&pipeline.run_note(&id, operation, !fresh).await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn init_metrics(config: &AppConfig) -> anyhow::Result<()> {
    let port = config.observability.metrics_port;
    if port > 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), BACKEND_BUCKETS)?
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "Metrics exporter listening");
    }
    register_metrics();
    Ok(())
}
