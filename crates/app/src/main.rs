use chrono::Utc;
use clap::{Parser, Subcommand};
use protocol_index_core::{
    build_context, document_catalog, page_content, Citation, FolderSource, FsChunkStore, FsLedger,
    IndexNotifier, Ledger, LedgerPolicy, LopdfLayoutAdapter, NoopNotifier, Pipeline,
    PipelineConfig, WebhookNotifier,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "protocol-index", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Folder that holds the source PDFs (searched recursively).
    #[arg(long, env = "PROTOCOL_INDEX_SOURCE_DIR", default_value = "./protocols")]
    source_dir: PathBuf,

    /// Folder for the ledger and the chunk store.
    #[arg(long, env = "PROTOCOL_INDEX_STATE_DIR", default_value = "./.protocol-index")]
    state_dir: PathBuf,

    /// Endpoint that receives the "refresh index" signal after a productive pass.
    #[arg(long, env = "PROTOCOL_INDEX_REFRESH_WEBHOOK")]
    refresh_webhook: Option<String>,

    /// Seconds a single document may spend in extraction.
    #[arg(long, env = "PROTOCOL_INDEX_EXTRACTION_TIMEOUT_SECS", default_value = "120")]
    extraction_timeout_secs: u64,

    /// Seconds after which an unfinished claim is considered abandoned.
    #[arg(long, env = "PROTOCOL_INDEX_STALE_AFTER_SECS", default_value = "1800")]
    stale_after_secs: u64,

    /// Extraction attempts before a failing document is given up on.
    #[arg(long, env = "PROTOCOL_INDEX_MAX_ATTEMPTS", default_value = "3")]
    max_attempts: u32,

    /// Seconds to wait before retrying a failed document.
    #[arg(long, env = "PROTOCOL_INDEX_RETRY_BACKOFF_SECS", default_value = "300")]
    retry_backoff_secs: u64,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            extraction_timeout: Duration::from_secs(self.extraction_timeout_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Extract every new or retry-eligible document once, then exit.
    Run,
    /// Print the ingestion ledger.
    Status,
    /// List indexed documents with page and chunk counts.
    Documents,
    /// Print the chunks of one page with their positions.
    Page {
        /// Document name as listed by `documents`.
        #[arg(long)]
        doc: String,
        /// 1-based page number.
        #[arg(long)]
        page: u32,
    },
    /// Print the numbered source blocks handed to answer synthesis for one page.
    Context {
        #[arg(long)]
        doc: String,
        #[arg(long)]
        page: u32,
    },
}

/// Grace period for in-flight work when the process exits. Extraction workers
/// that already timed out are not waited on past this.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(execute(cli));
    // Dropping the runtime would block on timed-out extraction workers.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");
    let config = cli.pipeline_config();
    config.validate()?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        source_dir = %cli.source_dir.display(),
        state_dir = %cli.state_dir.display(),
        "protocol-index boot"
    );

    let store = Arc::new(FsChunkStore::open(cli.state_dir.join("chunks")).await?);
    let ledger = Arc::new(
        FsLedger::open(cli.state_dir.join("ledger.json"), LedgerPolicy::from(&config)).await?,
    );

    match cli.command {
        Command::Run => {
            let source = FolderSource::new(&cli.source_dir);
            let layout = Arc::new(LopdfLayoutAdapter::new(&cli.source_dir));

            match cli.refresh_webhook.as_deref() {
                Some(endpoint) => {
                    let notifier = WebhookNotifier::new(endpoint)?;
                    let pipeline = Pipeline::new(source, layout, store, ledger, notifier, config)?;
                    run_pass(&pipeline).await?;
                    pipeline.notifier().flush().await;
                }
                None => {
                    warn!("no refresh webhook configured, downstream index will not be notified");
                    let pipeline =
                        Pipeline::new(source, layout, store, ledger, NoopNotifier, config)?;
                    run_pass(&pipeline).await?;
                }
            }
        }
        Command::Status => {
            for record in ledger.records().await? {
                let attempted = record
                    .last_attempt_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{} status={} chunks={} attempts={} last_attempt={}",
                    record.doc_name, record.status, record.chunk_count, record.attempts, attempted
                );
                if record.is_permanently_failed(config.max_attempts) {
                    println!("  permanently failed, no further retries");
                }
                if let Some(detail) = record.error_detail {
                    println!("  error: {detail}");
                }
            }
        }
        Command::Documents => {
            for summary in document_catalog(store.as_ref()).await? {
                let span = match (summary.first_extracted, summary.last_extracted) {
                    (Some(first), Some(last)) => {
                        format!("{} .. {}", first.to_rfc3339(), last.to_rfc3339())
                    }
                    _ => "-".to_string(),
                };
                println!(
                    "{} pages={} chunks={} extracted={}",
                    summary.doc_name, summary.total_pages, summary.total_chunks, span
                );
            }
        }
        Command::Page { doc, page } => {
            let entries = page_content(store.as_ref(), &doc, page).await?;
            if entries.is_empty() {
                println!("no chunks for {doc} page {page}");
            }
            for (index, entry) in entries.iter().enumerate() {
                let citation = Citation::from_chunk(index + 1, &entry.chunk);
                let bbox = entry.chunk.bbox;
                println!(
                    "[{}] {} bbox=[{:.1}, {:.1}, {:.1}, {:.1}]",
                    citation.chunk_id, citation.locator(), bbox.x0, bbox.y0, bbox.x1, bbox.y1
                );
                if let Some(position) = entry.position {
                    println!(
                        "  center=({:.1}%, {:.1}%)",
                        position.relative_x, position.relative_y
                    );
                }
                println!("  {}", citation.excerpt);
            }
        }
        Command::Context { doc, page } => {
            let chunks = page_content(store.as_ref(), &doc, page)
                .await?
                .into_iter()
                .map(|entry| entry.chunk)
                .collect::<Vec<_>>();
            let (context, citations) = build_context(&chunks);
            println!("{context}");
            println!();
            for citation in citations {
                println!("[{}] {}", citation.source_num, citation.locator());
            }
        }
    }

    Ok(())
}

async fn run_pass<N>(
    pipeline: &Pipeline<FolderSource, LopdfLayoutAdapter, FsChunkStore, FsLedger, N>,
) -> anyhow::Result<()>
where
    N: IndexNotifier + Send + Sync,
{
    let summary = pipeline.run_once().await?;
    if summary.abandoned_workers > 0 {
        warn!(
            abandoned_workers = summary.abandoned_workers,
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "leaving timed-out extraction workers behind at exit"
        );
    }
    println!(
        "run {}: processed={} failed={} skipped={} chunks={} refresh_requested={}",
        summary.run_id,
        summary.processed,
        summary.failed,
        summary.skipped,
        summary.chunks_written,
        summary.refresh_requested
    );
    Ok(())
}
