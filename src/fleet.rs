//! Fleet-wide termination decision.
//!
//! The fleet may be torn down only when no node is still working and the
//! queue reports nothing visible and nothing in flight.

use crate::liveness::{NodeState, NodeStatus};
use crate::queue::{QueueDepth, WorkQueue};
use crate::store::StatusStore;
use crate::WarcannonError;
use chrono::{SecondsFormat, TimeZone, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;

/// Fresh heartbeat, and either still starting or holding pending units.
pub fn node_still_working(status: &NodeStatus, now: i64) -> bool {
    now <= status.lease_expiry && (status.state == NodeState::Starting || status.pending_units > 0)
}

pub fn fleet_terminable(statuses: &[NodeStatus], depth: QueueDepth, now: i64) -> bool {
    depth.is_empty() && !statuses.iter().any(|s| node_still_working(s, now))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetAssessment {
    pub nodes: usize,
    pub working: usize,
    pub stale: usize,
    pub visible: u64,
    pub in_flight: u64,
    pub total_hits: u64,
    pub completed_units: u64,
    pub terminable: bool,
}

/// Keep only the newest record per instance.
pub fn latest_per_instance(statuses: Vec<NodeStatus>) -> Vec<NodeStatus> {
    let mut newest: FxHashMap<String, NodeStatus> = FxHashMap::default();
    for status in statuses {
        match newest.get(&status.instance_id) {
            Some(existing) if existing.timestamp >= status.timestamp => {}
            _ => {
                newest.insert(status.instance_id.clone(), status);
            }
        }
    }
    let mut out: Vec<NodeStatus> = newest.into_values().collect();
    out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    out
}

pub fn assess(statuses: &[NodeStatus], depth: QueueDepth, now: i64) -> FleetAssessment {
    FleetAssessment {
        nodes: statuses.len(),
        working: statuses.iter().filter(|s| node_still_working(s, now)).count(),
        stale: statuses.iter().filter(|s| now > s.lease_expiry).count(),
        visible: depth.visible,
        in_flight: depth.in_flight,
        total_hits: statuses.iter().map(|s| s.total_hits).sum(),
        completed_units: statuses.iter().map(|s| s.completed_units).sum(),
        terminable: fleet_terminable(statuses, depth, now),
    }
}

/// Body of the published `progress.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSummary<'a> {
    pub generated: String,
    pub metrics: &'a [NodeStatus],
}

impl<'a> ProgressSummary<'a> {
    pub fn new(statuses: &'a [NodeStatus], now: i64) -> Self {
        let generated = Utc
            .timestamp_opt(now, 0)
            .single()
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        Self {
            generated,
            metrics: statuses,
        }
    }
}

/// Scan the status store and queue depth once.
pub async fn evaluate(
    statuses: &dyn StatusStore,
    queue: &dyn WorkQueue,
    now: i64,
) -> Result<(Vec<NodeStatus>, FleetAssessment), WarcannonError> {
    let records = latest_per_instance(statuses.scan().await?);
    let depth = queue.depth().await?;
    let assessment = assess(&records, depth, now);
    Ok((records, assessment))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: &str, state: NodeState, pending: u64, now: i64) -> NodeStatus {
        let mut s = NodeStatus::new(id, now);
        s.state = state;
        s.pending_units = pending;
        s
    }

    #[test]
    fn test_stale_heartbeat_stops_counting() {
        let s = status("i-1", NodeState::Running, 4, 0);
        assert!(node_still_working(&s, 300));
        assert!(!node_still_working(&s, 301));
    }

    #[test]
    fn test_starting_node_counts_even_without_pending() {
        let s = status("i-1", NodeState::Starting, 0, 0);
        assert!(node_still_working(&s, 10));
    }

    #[test]
    fn test_latest_per_instance() {
        let old = status("i-1", NodeState::Running, 3, 10);
        let new = status("i-1", NodeState::Exhausted, 0, 20);
        let latest = latest_per_instance(vec![new.clone(), old]);
        assert_eq!(latest, vec![new]);
    }

    #[test]
    fn test_progress_summary_shape() {
        let statuses = vec![status("i-1", NodeState::Running, 1, 0)];
        let json = serde_json::to_value(ProgressSummary::new(&statuses, 0)).unwrap();
        assert_eq!(json["generated"], "1970-01-01T00:00:00Z");
        assert_eq!(json["metrics"][0]["instance_id"], "i-1");
    }
}
