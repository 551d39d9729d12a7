use clap::Parser;
use dotenv::dotenv;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use warcannon::config::NodeConfig;
use warcannon::fleet::{evaluate, FleetAssessment, ProgressSummary};
use warcannon::s3_state::{S3State, S3StateConfig};
use warcannon::sqs_queue::SqsQueue;
use warcannon::store::BlobStore;
use warcannon::WarcannonError;

const NOT_TERMINABLE: u8 = 3;

#[derive(Parser)]
#[command(name = "fleet_watch")]
#[command(about = "Watch node heartbeats and queue depth; tear the fleet down when work is exhausted", long_about = None)]
struct Cli {
    /// Seconds between assessments
    #[arg(long, default_value_t = 30)]
    interval: u64,
    /// Assess once; exit 0 if terminable, 3 otherwise
    #[arg(long)]
    once: bool,
    /// Shell command run once the fleet is terminable
    #[arg(long)]
    teardown_cmd: Option<String>,
    /// Key for the published progress summary
    #[arg(long, default_value = "progress.json")]
    progress_key: String,
}

async fn teardown(cmd: &str) -> Result<(), WarcannonError> {
    info!(%cmd, "running teardown");
    let status = tokio::process::Command::new("sh").arg("-c").arg(cmd).status().await?;
    if !status.success() {
        return Err(WarcannonError::Other(format!("teardown command exited with {}", status)));
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<bool, WarcannonError> {
    let config = NodeConfig::from_env()?;
    config.require_remote()?;
    let queue = SqsQueue::connect(&config.queue_url, &config.region).await?;
    let store = S3State::connect(S3StateConfig {
        bucket: config.results_bucket.clone(),
        region: config.region.clone(),
        prefix: String::new(),
        status_prefix: config.status_prefix.clone(),
        endpoint: config.endpoint.clone(),
    })
    .await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.interval.max(1)));
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now().timestamp();
        let (statuses, assessment): (_, FleetAssessment) = match evaluate(&store, &queue, now).await {
            Ok(result) => result,
            Err(e) if !cli.once => {
                warn!(error = %e, "assessment failed");
                continue;
            }
            Err(e) => return Err(e),
        };
        info!(
            nodes = assessment.nodes,
            working = assessment.working,
            stale = assessment.stale,
            visible = assessment.visible,
            in_flight = assessment.in_flight,
            hits = assessment.total_hits,
            terminable = assessment.terminable,
            "fleet assessed"
        );

        let summary = serde_json::to_vec(&ProgressSummary::new(&statuses, now))?;
        if let Err(e) = store.put(&cli.progress_key, summary, "application/json").await {
            warn!(error = %e, "progress summary upload failed");
        }

        if assessment.terminable {
            if let Some(cmd) = &cli.teardown_cmd {
                teardown(cmd).await?;
            }
            return Ok(true);
        }
        if cli.once {
            return Ok(false);
        }
    }
}

fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    if let Err(e) = warcannon::telemetry::init_tracing("warcannon-fleet-watch") {
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
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(NOT_TERMINABLE),
        Err(e) => {
            error!(error = %e, "fleet watch stopped");
            ExitCode::FAILURE
        }
    }
}
