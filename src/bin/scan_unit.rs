use clap::Parser;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use warcannon::batch::WorkUnit;
use warcannon::config::{NodeConfig, ScanConfig};
use warcannon::engine::MatchEngine;
use warcannon::fetch::{CliFetcher, LocalFetcher, ObjectFetcher};
use warcannon::patterns::PatternSet;
use warcannon::warc::open_archive;
use warcannon::worker::run_unit;
use warcannon::WarcannonError;

#[derive(Parser)]
#[command(name = "scan_unit")]
#[command(about = "Scan one archive unit and report findings as JSON lines", long_about = None)]
struct Cli {
    /// Archive key to fetch, or a local file path with --local
    unit: String,
    /// Scan a local WARC file and print the result object
    #[arg(long)]
    local: bool,
    /// Write the local result object here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
    /// Read keys from this directory instead of copying from the source bucket
    #[arg(long)]
    source_dir: Option<PathBuf>,
}

fn build_engine() -> Result<MatchEngine, WarcannonError> {
    let scan = ScanConfig::from_env()?;
    let patterns = PatternSet::load(scan.patterns_file.as_deref())?;
    Ok(MatchEngine::new(Arc::new(patterns), &scan))
}

fn scan_remote(cli: &Cli) -> Result<(), WarcannonError> {
    let engine = build_engine()?;
    let fetcher: Box<dyn ObjectFetcher> = match &cli.source_dir {
        Some(dir) => Box::new(LocalFetcher::new(dir)),
        None => {
            let node = NodeConfig::from_env()?;
            Box::new(CliFetcher::new(&node.source_bucket, &node.scratch_dir))
        }
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut write_error: Option<WarcannonError> = None;
    run_unit(&WorkUnit::new(cli.unit.as_str()), fetcher.as_ref(), &engine, |message| {
        if write_error.is_none() {
            if let Err(e) = message.write_line(&mut out) {
                write_error = Some(e);
            }
        }
    })?;
    match write_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn scan_local(cli: &Cli) -> Result<(), WarcannonError> {
    let engine = build_engine()?;
    let started = Instant::now();
    let records = open_archive(File::open(&cli.unit)?)?;
    let report = engine.scan(records, |p| {
        info!(seen = p.records_seen, processed = p.records_processed, "progress");
    })?;

    let json = serde_json::to_vec_pretty(&report.metrics)?;
    match &cli.output {
        Some(path) => std::fs::write(path, &json)?,
        None => {
            let mut out = std::io::stdout().lock();
            out.write_all(&json)?;
            out.write_all(b"\n")?;
        }
    }

    eprintln!("--- Performance statistics ---");
    eprintln!("Records seen: {}", report.progress.records_seen);
    eprintln!("Records processed: {}", report.progress.records_processed);
    eprintln!("Average per-record processing time: {}ns", report.average_record_time().as_nanos());
    eprintln!("Total hits: {}", report.metrics.total_hits);
    eprintln!("Elapsed: {:.2}s", started.elapsed().as_secs_f64());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = warcannon::telemetry::init_tracing("warcannon-scan-unit") {
        eprintln!("{}", e);
    }

    let result = if cli.local { scan_local(&cli) } else { scan_remote(&cli) };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(unit = %cli.unit, error = %e, "scan failed");
            ExitCode::FAILURE
        }
    }
}
