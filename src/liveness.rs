//! Per-node lifecycle state and heartbeat records.

use crate::engine::ScanProgress;
use crate::lease::{LeaseCounts, LeaseId};
use crate::memory_config::HostSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Starting,
    Running,
    Draining,
    Exhausted,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Starting => "Starting",
            NodeState::Running => "Running",
            NodeState::Draining => "Draining",
            NodeState::Exhausted => "Exhausted",
        };
        f.write_str(name)
    }
}

impl NodeState {
    /// Exhausted is terminal; otherwise the state follows the queue and the pending count.
    pub fn next(self, first_pull_resolved: bool, draining: bool, pending: usize) -> NodeState {
        match self {
            NodeState::Exhausted => NodeState::Exhausted,
            _ if !first_pull_resolved => NodeState::Starting,
            _ if draining && pending == 0 => NodeState::Exhausted,
            _ if draining => NodeState::Draining,
            _ => NodeState::Running,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitProgress {
    pub records_seen: u64,
    pub records_processed: u64,
    /// Share of the display cap reached, 0 to 100.
    pub percent: f64,
}

/// One heartbeat. Overwritten per instance in the status store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub instance_id: String,
    pub timestamp: i64,
    pub state: NodeState,
    pub load: f64,
    pub memory: f64,
    pub progress: BTreeMap<String, UnitProgress>,
    pub completed_units: u64,
    pub failed_units: u64,
    pub partial_units: u64,
    pub pending_units: u64,
    pub queued_units: u64,
    pub total_hits: u64,
    pub lease_expiry: i64,
    #[serde(default)]
    pub parallelism: usize,
    #[serde(default)]
    pub runtime_secs: u64,
}

impl NodeStatus {
    pub fn new(instance_id: &str, now: i64) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            timestamp: now,
            state: NodeState::Starting,
            load: 0.0,
            memory: 0.0,
            progress: BTreeMap::new(),
            completed_units: 0,
            failed_units: 0,
            partial_units: 0,
            pending_units: 0,
            queued_units: 0,
            total_hits: 0,
            lease_expiry: now + 300,
            parallelism: 0,
            runtime_secs: 0,
        }
    }
}

pub struct LivenessController {
    instance_id: String,
    started: Instant,
    state: NodeState,
    first_pull_resolved: bool,
    lease_ttl: Duration,
    max_records: u64,
    parallelism: usize,
    /// Keyed by lease as well as unit; a redelivered unit may run twice at once.
    progress: BTreeMap<(LeaseId, String), UnitProgress>,
    completed_units: u64,
    failed_units: u64,
}

impl LivenessController {
    pub fn new(instance_id: &str, parallelism: usize, lease_ttl: Duration, max_records: u64) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            started: Instant::now(),
            state: NodeState::Starting,
            first_pull_resolved: false,
            lease_ttl,
            max_records: max_records.max(1),
            parallelism,
            progress: BTreeMap::new(),
            completed_units: 0,
            failed_units: 0,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn pull_resolved(&mut self) {
        self.first_pull_resolved = true;
    }

    /// Recompute the state. Returns the new state if it changed.
    pub fn update(&mut self, draining: bool, counts: LeaseCounts) -> Option<NodeState> {
        let next = self
            .state
            .next(self.first_pull_resolved, draining, counts.queued + counts.in_flight);
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }

    pub fn unit_started(&mut self, lease: LeaseId, unit: &str) {
        self.progress.insert((lease, unit.to_string()), UnitProgress::default());
    }

    /// Ignored for units that are not running.
    pub fn unit_progress(&mut self, lease: LeaseId, unit: &str, progress: ScanProgress) {
        let capped = progress.records_seen.min(self.max_records);
        if let Some(entry) = self.progress.get_mut(&(lease, unit.to_string())) {
            *entry = UnitProgress {
                records_seen: progress.records_seen,
                records_processed: progress.records_processed,
                percent: capped as f64 * 100.0 / self.max_records as f64,
            };
        }
    }

    /// Clear the unit's progress entry and credit it only on success.
    pub fn unit_finished(&mut self, lease: LeaseId, unit: &str, success: bool) {
        self.progress.remove(&(lease, unit.to_string()));
        if success {
            self.completed_units += 1;
        } else {
            self.failed_units += 1;
        }
    }

    /// Progress by unit. Concurrent copies of one unit report the furthest along.
    fn progress_by_unit(&self) -> BTreeMap<String, UnitProgress> {
        let mut by_unit: BTreeMap<String, UnitProgress> = BTreeMap::new();
        for ((_, unit), progress) in &self.progress {
            let entry = by_unit.entry(unit.clone()).or_default();
            if progress.records_seen >= entry.records_seen {
                *entry = *progress;
            }
        }
        by_unit
    }

    pub fn completed_units(&self) -> u64 {
        self.completed_units
    }

    pub fn status(&self, now: i64, host: &HostSnapshot, counts: LeaseCounts, total_hits: u64) -> NodeStatus {
        NodeStatus {
            instance_id: self.instance_id.clone(),
            timestamp: now,
            state: self.state,
            load: host.load_one,
            memory: host.memory_fraction(),
            progress: self.progress_by_unit(),
            completed_units: self.completed_units,
            failed_units: self.failed_units,
            partial_units: self.progress.len() as u64,
            pending_units: (counts.queued + counts.in_flight) as u64,
            queued_units: counts.queued as u64,
            total_hits,
            lease_expiry: now + self.lease_ttl.as_secs() as i64,
            parallelism: self.parallelism,
            runtime_secs: self.started.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostSnapshot {
        HostSnapshot {
            cpus: 4,
            total_memory: 100,
            used_memory: 25,
            load_one: 1.5,
        }
    }

    #[test]
    fn test_state_machine() {
        assert_eq!(NodeState::Starting.next(false, false, 0), NodeState::Starting);
        assert_eq!(NodeState::Starting.next(true, false, 3), NodeState::Running);
        assert_eq!(NodeState::Running.next(true, true, 3), NodeState::Draining);
        assert_eq!(NodeState::Draining.next(true, true, 0), NodeState::Exhausted);
        assert_eq!(NodeState::Exhausted.next(true, false, 5), NodeState::Exhausted);
        // Idle but more may arrive.
        assert_eq!(NodeState::Running.next(true, false, 0), NodeState::Running);
    }

    #[test]
    fn test_status_fields() {
        let mut controller = LivenessController::new("i-1", 4, Duration::from_secs(300), 100);
        controller.pull_resolved();
        controller.update(false, LeaseCounts { leases: 1, queued: 2, in_flight: 1 });
        controller.unit_started(LeaseId::new(1), "u1");
        controller.unit_progress(LeaseId::new(1), "u1", ScanProgress { records_seen: 250, records_processed: 10 });

        let status = controller.status(1_000, &host(), LeaseCounts { leases: 1, queued: 2, in_flight: 1 }, 7);
        assert_eq!(status.state, NodeState::Running);
        assert_eq!(status.lease_expiry, 1_300);
        assert_eq!(status.pending_units, 3);
        assert_eq!(status.partial_units, 1);
        assert_eq!(status.progress["u1"].percent, 100.0);
        assert_eq!(status.memory, 0.25);
        assert_eq!(status.total_hits, 7);
    }

    #[test]
    fn test_failed_unit_is_not_credited() {
        let mut controller = LivenessController::new("i-1", 1, Duration::from_secs(300), 100);
        controller.unit_started(LeaseId::new(1), "u1");
        controller.unit_finished(LeaseId::new(1), "u1", false);
        assert_eq!(controller.completed_units(), 0);
        let status = controller.status(0, &host(), LeaseCounts::default(), 0);
        assert!(status.progress.is_empty());
        assert_eq!(status.failed_units, 1);
    }

    #[test]
    fn test_duplicate_delivery_keeps_both_progress_entries() {
        let mut controller = LivenessController::new("i-1", 2, Duration::from_secs(300), 100);
        controller.unit_started(LeaseId::new(1), "u1");
        controller.unit_started(LeaseId::new(2), "u1");
        controller.unit_progress(LeaseId::new(2), "u1", ScanProgress { records_seen: 40, records_processed: 5 });

        let status = controller.status(0, &host(), LeaseCounts::default(), 0);
        assert_eq!(status.partial_units, 2);
        assert_eq!(status.progress["u1"].records_seen, 40);

        controller.unit_finished(LeaseId::new(1), "u1", true);
        let status = controller.status(0, &host(), LeaseCounts::default(), 0);
        assert_eq!(status.partial_units, 1);
        assert_eq!(status.progress["u1"].records_seen, 40);

        controller.unit_finished(LeaseId::new(2), "u1", true);
        assert!(controller.status(0, &host(), LeaseCounts::default(), 0).progress.is_empty());
    }
}
