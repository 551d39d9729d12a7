//! The per-node control loop.
//!
//! All node state (leases, metrics, progress) is owned by one task and only
//! mutated while handling one event at a time. Queue receives and unit runs
//! happen on spawned tasks that report back over a channel.

use crate::aggregator::{ResultAggregator, SnapshotOutcome};
use crate::batch::WorkUnit;
use crate::config::NodeConfig;
use crate::engine::ScanProgress;
use crate::lease::{LeaseId, LeaseManager, PullOutcome};
use crate::liveness::{LivenessController, NodeState, NodeStatus};
use crate::memory_config::HostSampler;
use crate::queue::{ReceivedMessage, WorkQueue};
use crate::runner::{UnitOutcome, UnitRunner};
use crate::store::StatusStore;
use crate::WarcannonError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const FINAL_SNAPSHOT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub parallelism: usize,
    pub queue_factor: f64,
    pub heartbeat_interval: Duration,
    pub lease_ttl: Duration,
    pub max_records: u64,
    pub max_pull_failures: u32,
}

impl NodeSettings {
    pub fn from_config(config: &NodeConfig, parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            queue_factor: config.queue_factor,
            heartbeat_interval: config.heartbeat_interval,
            lease_ttl: config.lease_ttl,
            max_records: config.max_records,
            max_pull_failures: config.max_pull_failures.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub completed_units: u64,
    pub total_hits: u64,
    pub forfeited_batches: usize,
}

enum NodeEvent {
    Pulled(Result<Option<ReceivedMessage>, WarcannonError>),
    Progress {
        lease: LeaseId,
        unit: WorkUnit,
        progress: ScanProgress,
    },
    Finished {
        lease: LeaseId,
        unit: WorkUnit,
        outcome: UnitOutcome,
    },
}

pub struct Node {
    settings: NodeSettings,
    queue: Arc<dyn WorkQueue>,
    runner: Arc<dyn UnitRunner>,
    statuses: Arc<dyn StatusStore>,
    results: ResultAggregator,
    leases: LeaseManager,
    liveness: LivenessController,
    host: HostSampler,
    busy: usize,
    pull_failures: u32,
}

impl Node {
    pub fn new(
        instance_id: &str,
        settings: NodeSettings,
        queue: Arc<dyn WorkQueue>,
        runner: Arc<dyn UnitRunner>,
        statuses: Arc<dyn StatusStore>,
        results: ResultAggregator,
    ) -> Self {
        let liveness = LivenessController::new(
            instance_id,
            settings.parallelism,
            settings.lease_ttl,
            settings.max_records,
        );
        Self {
            settings,
            queue,
            runner,
            statuses,
            results,
            leases: LeaseManager::new(),
            liveness,
            host: HostSampler::new(),
            busy: 0,
            pull_failures: 0,
        }
    }

    pub fn state(&self) -> NodeState {
        self.liveness.state()
    }

    /// Run until the queue is drained and every unit has settled.
    pub async fn run(mut self) -> Result<NodeReport, WarcannonError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            instance_id = %self.liveness.instance_id(),
            parallelism = self.settings.parallelism,
            queue_factor = self.settings.queue_factor,
            "node starting"
        );
        self.maybe_pull(&tx, Duration::ZERO);

        let mut fatal = None;
        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    if let Err(e) = self.handle(event, &tx).await {
                        if self.liveness.state() == NodeState::Starting {
                            return Err(e);
                        }
                        fatal = Some(e);
                    }
                }
                _ = heartbeat.tick() => self.heartbeat().await,
            }

            if fatal.is_some() {
                break;
            }
            self.fill_slots(&tx);
            self.maybe_pull(&tx, Duration::ZERO);
            self.flush_acks().await;

            if let Some(state) = self.liveness.update(self.leases.is_draining(), self.leases.counts()) {
                info!(%state, "node state changed");
                if state == NodeState::Exhausted {
                    break;
                }
            }
        }

        // Acknowledged batches are only safe once their findings are stored.
        let persisted = self.persist_final().await;
        if let Some(e) = fatal {
            return Err(e);
        }
        persisted?;
        Ok(self.report())
    }

    async fn handle(&mut self, event: NodeEvent, tx: &UnboundedSender<NodeEvent>) -> Result<(), WarcannonError> {
        match event {
            NodeEvent::Pulled(Ok(received)) => {
                self.pull_failures = 0;
                self.liveness.pull_resolved();
                match self.leases.finish_pull(received) {
                    PullOutcome::Leased { lease, units } => {
                        debug!(lease = lease.value(), units, "leased batch");
                    }
                    PullOutcome::Empty => debug!("queue empty"),
                    PullOutcome::Malformed { receipt_handle, reason } => {
                        warn!(receipt = %receipt_handle, %reason, "malformed batch");
                    }
                }
            }
            NodeEvent::Pulled(Err(e)) => {
                self.leases.pull_failed();
                self.pull_failures += 1;
                if self.liveness.state() == NodeState::Starting {
                    error!(error = %e, "cannot reach work queue");
                    return Err(e);
                }
                if self.pull_failures >= self.settings.max_pull_failures {
                    error!(error = %e, failures = self.pull_failures, "giving up on work queue");
                    return Err(e);
                }
                let delay = Duration::from_millis(250 << self.pull_failures.min(5));
                warn!(error = %e, failures = self.pull_failures, ?delay, "pull failed, retrying");
                self.maybe_pull(tx, delay);
            }
            NodeEvent::Progress { lease, unit, progress } => {
                self.liveness.unit_progress(lease, unit.as_str(), progress);
            }
            NodeEvent::Finished { lease, unit, outcome } => {
                self.busy = self.busy.saturating_sub(1);
                let success = outcome.is_success();
                match outcome {
                    UnitOutcome::Completed { metrics } => {
                        debug!(unit = %unit.tail(40), hits = metrics.total_hits, "unit completed");
                        self.results.merge(metrics);
                    }
                    UnitOutcome::Failed { reason } => {
                        warn!(unit = %unit.tail(40), %reason, "unit failed");
                    }
                }
                self.liveness.unit_finished(lease, unit.as_str(), success);
                self.leases.complete(lease, success);
                self.snapshot(false).await;
            }
        }
        Ok(())
    }

    fn maybe_pull(&mut self, tx: &UnboundedSender<NodeEvent>, delay: Duration) {
        if !self.leases.should_pull(self.settings.parallelism, self.settings.queue_factor) {
            return;
        }
        if !self.leases.begin_pull() {
            return;
        }
        let queue = self.queue.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send(NodeEvent::Pulled(queue.receive().await));
        });
    }

    fn fill_slots(&mut self, tx: &UnboundedSender<NodeEvent>) {
        while self.busy < self.settings.parallelism {
            let Some((lease, unit)) = self.leases.take() else {
                break;
            };
            self.busy += 1;
            self.liveness.unit_started(lease, unit.as_str());
            debug!(unit = %unit.tail(40), lease = lease.value(), "dispatching unit");

            let runner = self.runner.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let progress_tx = tx.clone();
                let progress_unit = unit.clone();
                let on_progress = Box::new(move |progress: ScanProgress| {
                    let _ = progress_tx.send(NodeEvent::Progress {
                        lease,
                        unit: progress_unit.clone(),
                        progress,
                    });
                });
                let outcome = runner.run(unit.clone(), on_progress).await;
                let _ = tx.send(NodeEvent::Finished { lease, unit, outcome });
            });
        }
    }

    /// Delete every settled batch. Failed deletes stay queued for the next flush.
    async fn flush_acks(&mut self) {
        for handle in self.leases.drain_acks() {
            match self.queue.delete(&handle).await {
                Ok(()) => debug!(receipt = %handle, "acknowledged batch"),
                Err(e) => {
                    warn!(receipt = %handle, error = %e, "delete failed, will retry");
                    self.leases.retry_ack(handle);
                }
            }
        }
    }

    async fn snapshot(&mut self, force: bool) -> bool {
        match self.results.snapshot(force).await {
            Ok(SnapshotOutcome::Skipped) => true,
            Ok(SnapshotOutcome::Saved { key, bytes }) => {
                debug!(%key, bytes, "results saved");
                true
            }
            Ok(SnapshotOutcome::Rotated { key, next_key, .. }) => {
                info!(%key, %next_key, "results rotated");
                true
            }
            Err(e) => {
                warn!(error = %e, "results snapshot failed");
                false
            }
        }
    }

    fn status(&mut self) -> NodeStatus {
        let host = self.host.sample();
        self.liveness.status(
            chrono::Utc::now().timestamp(),
            &host,
            self.leases.counts(),
            self.results.lifetime_hits(),
        )
    }

    async fn heartbeat(&mut self) {
        let status = self.status();
        debug!(
            state = %status.state,
            pending = status.pending_units,
            completed = status.completed_units,
            hits = status.total_hits,
            "heartbeat"
        );
        if let Err(e) = self.statuses.put_status(&status).await {
            warn!(error = %e, "heartbeat write failed");
        }
        self.snapshot(false).await;
    }

    /// Flush acknowledgements, force a results snapshot, and write the terminal heartbeat.
    async fn persist_final(&mut self) -> Result<(), WarcannonError> {
        self.flush_acks().await;
        if self.leases.has_pending_acks() {
            warn!("exiting with unacknowledged batches; they will be redelivered");
        }

        let mut saved = false;
        for attempt in 1..=FINAL_SNAPSHOT_ATTEMPTS {
            if self.snapshot(true).await {
                saved = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
        }

        let status = self.status();
        if let Err(e) = self.statuses.put_status(&status).await {
            warn!(error = %e, "terminal heartbeat write failed");
        }
        if !saved {
            return Err(WarcannonError::Storage("final results snapshot failed".to_string()));
        }
        Ok(())
    }

    fn report(&self) -> NodeReport {
        let report = NodeReport {
            completed_units: self.liveness.completed_units(),
            total_hits: self.results.lifetime_hits(),
            forfeited_batches: self.leases.forfeited(),
        };
        info!(
            completed = report.completed_units,
            hits = report.total_hits,
            forfeited = report.forfeited_batches,
            "node exhausted"
        );
        report
    }
}
