use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;
use warcannon::config::{NodeConfig, PlannerConfig};
use warcannon::planner::{decode_listing, plan_chunks, run_planner};
use warcannon::queue::WorkQueue;
use warcannon::s3_state::{S3State, S3StateConfig};
use warcannon::sqs_queue::SqsQueue;
use warcannon::store::{BlobStore, LocalStore};
use warcannon::WarcannonError;

#[derive(Parser)]
#[command(name = "planner")]
#[command(about = "Split a crawl's archive listing into queue batches", long_about = None)]
struct Cli {
    /// Crawl id, e.g. CC-MAIN-2020-34
    crawl: String,
    /// Units per queue message
    #[arg(long, default_value_t = 10)]
    chunk_size: usize,
    /// Stop after this many messages (0 for no limit)
    #[arg(long, default_value_t = 300_000)]
    max_chunks: usize,
    /// Concurrent send calls
    #[arg(long, default_value_t = 16)]
    concurrency: usize,
    /// Read the listing from a local file (plain or gzip) instead of the source bucket
    #[arg(long)]
    listing: Option<PathBuf>,
    /// Plan and report without sending anything
    #[arg(long)]
    dry_run: bool,
}

async fn run(cli: Cli) -> Result<(), WarcannonError> {
    let node = NodeConfig::from_env()?;
    let mut config = PlannerConfig::new(&cli.crawl);
    config.chunk_size = cli.chunk_size;
    config.max_chunks = (cli.max_chunks > 0).then_some(cli.max_chunks);
    config.send_concurrency = cli.concurrency;
    config.validate()?;

    if cli.dry_run {
        let bytes = match &cli.listing {
            Some(path) => std::fs::read(path)?,
            None => {
                let source = S3State::connect(S3StateConfig::new(&node.source_bucket, &node.region)).await?;
                source.get(&warcannon::planner::listing_key(&cli.crawl)).await?
            }
        };
        let paths = decode_listing(&bytes)?;
        let batches = plan_chunks(&paths, config.chunk_size);
        println!(
            "{}",
            serde_json::json!({ "total_units": paths.len(), "batches_created": batches.len() })
        );
        return Ok(());
    }

    if node.queue_url.is_empty() {
        return Err(WarcannonError::Config("WARCANNON_QUEUE_URL is not set".to_string()));
    }
    let queue: Arc<dyn WorkQueue> = Arc::new(SqsQueue::connect(&node.queue_url, &node.region).await?);

    let source: Box<dyn BlobStore> = match &cli.listing {
        Some(path) => {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| WarcannonError::Config(format!("bad listing path {}", path.display())))?;
            config.listing_key = Some(name.to_string());
            let dir = path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
            Box::new(LocalStore::new(dir, &node.status_prefix))
        }
        None => Box::new(S3State::connect(S3StateConfig::new(&node.source_bucket, &node.region)).await?),
    };

    let report = run_planner(source.as_ref(), queue, &config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    if let Err(e) = warcannon::telemetry::init_tracing("warcannon-planner") {
        eprintln!("{}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("tokio runtime error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "planning failed");
            ExitCode::FAILURE
        }
    }
}
