//! Execution of one work unit in an isolated context.
//!
//! `ProcessRunner` launches a worker executable per unit and reads its JSON
//! line protocol. `InProcessRunner` runs the same code on the blocking pool,
//! which isolates panics but not memory exhaustion.

use crate::batch::WorkUnit;
use crate::engine::{MatchEngine, ScanProgress};
use crate::fetch::ObjectFetcher;
use crate::metrics::ResultMetrics;
use crate::worker::{run_unit, WorkerMessage};
use crate::WarcannonError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

pub type ProgressFn = Box<dyn FnMut(ScanProgress) + Send + 'static>;

#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Completed { metrics: ResultMetrics },
    Failed { reason: String },
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Completed { .. })
    }
}

#[async_trait]
pub trait UnitRunner: Send + Sync {
    /// Run one unit to completion. Never returns an error: every failure is an outcome.
    async fn run(&self, unit: WorkUnit, on_progress: ProgressFn) -> UnitOutcome;
}

/// An executable installed next to the current one.
pub fn sibling_program(name: &str) -> Result<PathBuf, WarcannonError> {
    Ok(std::env::current_exe()?.with_file_name(name))
}

pub struct ProcessRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessRunner {
    /// `program [args...] <unit>` is executed for each unit.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl UnitRunner for ProcessRunner {
    async fn run(&self, unit: WorkUnit, mut on_progress: ProgressFn) -> UnitOutcome {
        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .arg(unit.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return UnitOutcome::Failed {
                    reason: format!("spawn {}: {}", self.program.display(), e),
                };
            }
        };

        let mut done: Option<ResultMetrics> = None;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match WorkerMessage::parse_line(&line) {
                        Ok(WorkerMessage::Progress {
                            records_seen,
                            records_processed,
                        }) => on_progress(ScanProgress {
                            records_seen,
                            records_processed,
                        }),
                        Ok(WorkerMessage::Done { metrics }) => done = Some(metrics),
                        Err(e) => debug!(unit = %unit.tail(40), error = %e, "ignoring worker output"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(unit = %unit.tail(40), error = %e, "worker stdout read failed");
                        break;
                    }
                }
            }
        }

        let status = child.wait().await;
        match (done, status) {
            (Some(metrics), Ok(status)) => {
                if !status.success() {
                    warn!(unit = %unit.tail(40), %status, "worker reported done but exited abnormally");
                }
                UnitOutcome::Completed { metrics }
            }
            (Some(metrics), Err(e)) => {
                warn!(unit = %unit.tail(40), error = %e, "worker reported done but wait failed");
                UnitOutcome::Completed { metrics }
            }
            (None, Ok(status)) => UnitOutcome::Failed {
                reason: format!("worker exited without result ({})", status),
            },
            (None, Err(e)) => UnitOutcome::Failed {
                reason: format!("worker wait failed: {}", e),
            },
        }
    }
}

pub struct InProcessRunner {
    fetcher: Arc<dyn ObjectFetcher>,
    engine: Arc<MatchEngine>,
}

impl InProcessRunner {
    pub fn new(fetcher: Arc<dyn ObjectFetcher>, engine: Arc<MatchEngine>) -> Self {
        Self { fetcher, engine }
    }
}

#[async_trait]
impl UnitRunner for InProcessRunner {
    async fn run(&self, unit: WorkUnit, mut on_progress: ProgressFn) -> UnitOutcome {
        let fetcher = self.fetcher.clone();
        let engine = self.engine.clone();
        let task = tokio::task::spawn_blocking(move || {
            run_unit(&unit, fetcher.as_ref(), &engine, |message| {
                if let WorkerMessage::Progress {
                    records_seen,
                    records_processed,
                } = message
                {
                    on_progress(ScanProgress {
                        records_seen,
                        records_processed,
                    });
                }
            })
        });
        match task.await {
            Ok(Ok(report)) => UnitOutcome::Completed {
                metrics: report.metrics,
            },
            Ok(Err(e)) => UnitOutcome::Failed { reason: e.to_string() },
            Err(e) => UnitOutcome::Failed {
                reason: format!("worker task aborted: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::fetch::LocalFetcher;
    use crate::patterns::PatternSet;

    #[tokio::test]
    async fn test_in_process_failure_is_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let runner = InProcessRunner::new(
            Arc::new(LocalFetcher::new(dir.path())),
            Arc::new(MatchEngine::new(Arc::new(PatternSet::defaults().unwrap()), &ScanConfig::default())),
        );
        let outcome = runner.run(WorkUnit::new("missing.warc.gz"), Box::new(|_| {})).await;
        assert!(!outcome.is_success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_without_done_is_failure() {
        let runner = ProcessRunner::new("true", Vec::new());
        let outcome = runner.run(WorkUnit::new("a.warc.gz"), Box::new(|_| {})).await;
        assert!(matches!(outcome, UnitOutcome::Failed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_done_line_is_credited_despite_exit_code() {
        let script = r#"echo '{"type":"progress","records_seen":5,"records_processed":2}'; echo '{"type":"done","metrics":{"total_hits":3,"regex_hits":{}}}'; exit 1"#;
        let runner = ProcessRunner::new("sh", vec!["-c".to_string(), script.to_string(), "worker".to_string()]);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let outcome = runner
            .run(WorkUnit::new("a.warc.gz"), Box::new(move |p| sink.lock().unwrap().push(p)))
            .await;
        match outcome {
            UnitOutcome::Completed { metrics } => assert_eq!(metrics.total_hits, 3),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(seen.lock().unwrap()[0].records_seen, 5);
    }
}
