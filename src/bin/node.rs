use clap::Parser;
use dotenv::dotenv;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use warcannon::aggregator::ResultAggregator;
use warcannon::config::{NodeConfig, ScanConfig};
use warcannon::engine::MatchEngine;
use warcannon::fetch::CliFetcher;
use warcannon::instance::resolve_instance_id;
use warcannon::memory_config::{HostSnapshot, SlotBudget};
use warcannon::node::{Node, NodeSettings};
use warcannon::patterns::PatternSet;
use warcannon::runner::{sibling_program, InProcessRunner, ProcessRunner, UnitRunner};
use warcannon::s3_state::{S3State, S3StateConfig};
use warcannon::sqs_queue::SqsQueue;
use warcannon::WarcannonError;

#[derive(Parser)]
#[command(name = "node")]
#[command(about = "Pull batches from the work queue and scan them until the queue is drained", long_about = None)]
struct Cli {
    /// Override the derived worker slot count
    #[arg(long)]
    parallelism: Option<usize>,
    /// Run units on the blocking pool instead of separate worker processes
    #[arg(long)]
    in_process: bool,
}

async fn run(cli: Cli) -> Result<(), WarcannonError> {
    let config = NodeConfig::from_env()?;
    config.require_remote()?;

    let instance_id = resolve_instance_id(config.instance_id.as_deref()).await;
    let host = HostSnapshot::sample();
    let parallelism = match cli.parallelism {
        Some(p) => p.max(1),
        None => SlotBudget::for_host(&host, config.parallelism_factor, config.slot_memory_bytes).parallelism,
    };

    let queue = Arc::new(SqsQueue::connect(&config.queue_url, &config.region).await?);
    let store = Arc::new(
        S3State::connect(S3StateConfig {
            bucket: config.results_bucket.clone(),
            region: config.region.clone(),
            prefix: String::new(),
            status_prefix: config.status_prefix.clone(),
            endpoint: config.endpoint.clone(),
        })
        .await?,
    );

    let runner: Arc<dyn UnitRunner> = if cli.in_process {
        let scan = ScanConfig::from_env()?;
        let patterns = PatternSet::load(scan.patterns_file.as_deref())?;
        Arc::new(InProcessRunner::new(
            Arc::new(CliFetcher::new(&config.source_bucket, &config.scratch_dir)),
            Arc::new(MatchEngine::new(Arc::new(patterns), &scan)),
        ))
    } else {
        let program = match &config.worker_bin {
            Some(path) => path.clone(),
            None => sibling_program("scan_unit")?,
        };
        info!(program = %program.display(), "using worker process");
        Arc::new(ProcessRunner::new(program, Vec::new()))
    };

    let results = ResultAggregator::new(
        store.clone(),
        &config.results_prefix,
        &instance_id,
        config.snapshot_interval,
        config.rotate_bytes,
    );
    let node = Node::new(
        &instance_id,
        NodeSettings::from_config(&config, parallelism),
        queue,
        runner,
        store,
        results,
    );

    tokio::select! {
        report = node.run() => {
            let report = report?;
            info!(completed = report.completed_units, hits = report.total_hits, "done");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; unfinished batches will be redelivered");
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    if let Err(e) = warcannon::telemetry::init_tracing("warcannon-node") {
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
            error!(error = %e, "node stopped");
            ExitCode::FAILURE
        }
    }
}
