//! Node-local bookkeeping for delivered batches.
//!
//! A lease leaves the dispatch front when its last unit is taken, but its
//! message is only acknowledged once every taken unit has settled. Any failed
//! unit forfeits the acknowledgment so the provider redelivers the batch.

use crate::batch::{WorkBatch, WorkUnit};
use crate::queue::ReceivedMessage;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseId(u64);

impl LeaseId {
    pub(crate) fn new(raw: u64) -> Self {
        LeaseId(raw)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct Lease {
    receipt_handle: String,
    remaining: VecDeque<WorkUnit>,
    in_flight: usize,
    failed: usize,
    total: usize,
}

impl Lease {
    fn settled(&self) -> bool {
        self.remaining.is_empty() && self.in_flight == 0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PullOutcome {
    Leased { lease: LeaseId, units: usize },
    /// The queue had nothing visible; the manager is now draining.
    Empty,
    /// The body did not decode. The message stays unacknowledged.
    Malformed { receipt_handle: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseCounts {
    pub leases: usize,
    pub queued: usize,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
pub struct LeaseManager {
    leases: BTreeMap<LeaseId, Lease>,
    next_id: u64,
    pulling: bool,
    draining: bool,
    pending_acks: Vec<String>,
    forfeited: usize,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no pull is outstanding, the queue has not run dry, and the
    /// buffered units are below `parallelism * queue_factor`.
    pub fn should_pull(&self, parallelism: usize, queue_factor: f64) -> bool {
        !self.pulling && !self.draining && (self.queued_units() as f64) < parallelism as f64 * queue_factor
    }

    /// Claim the pull guard. Returns false if a pull is already in flight.
    pub fn begin_pull(&mut self) -> bool {
        if self.pulling {
            return false;
        }
        self.pulling = true;
        true
    }

    /// Release the guard after a receive error.
    pub fn pull_failed(&mut self) {
        self.pulling = false;
    }

    pub fn finish_pull(&mut self, received: Option<ReceivedMessage>) -> PullOutcome {
        self.pulling = false;
        let Some(message) = received else {
            if !self.draining {
                debug!("queue returned no message, draining");
            }
            self.draining = true;
            return PullOutcome::Empty;
        };

        let batch = match WorkBatch::from_message_body(&message.body) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(receipt = %message.receipt_handle, error = %e, "leaving malformed message unacknowledged");
                return PullOutcome::Malformed {
                    receipt_handle: message.receipt_handle,
                    reason: e.to_string(),
                };
            }
        };

        self.next_id += 1;
        let id = LeaseId::new(self.next_id);
        let remaining: VecDeque<WorkUnit> = batch.units().into();
        let units = remaining.len();
        let lease = Lease {
            receipt_handle: message.receipt_handle,
            remaining,
            in_flight: 0,
            failed: 0,
            total: units,
        };
        if lease.settled() {
            // Nothing to do for an empty batch.
            self.pending_acks.push(lease.receipt_handle);
        } else {
            self.leases.insert(id, lease);
        }
        PullOutcome::Leased { lease: id, units }
    }

    /// Next unit from the oldest lease that still has undispatched units.
    pub fn take(&mut self) -> Option<(LeaseId, WorkUnit)> {
        for (id, lease) in self.leases.iter_mut() {
            if let Some(unit) = lease.remaining.pop_front() {
                lease.in_flight += 1;
                return Some((*id, unit));
            }
        }
        None
    }

    /// Record that a dispatched unit finished. Returns true if this settled the lease.
    pub fn complete(&mut self, id: LeaseId, success: bool) -> bool {
        let Some(lease) = self.leases.get_mut(&id) else {
            warn!(lease = id.0, "completion for unknown lease");
            return false;
        };
        lease.in_flight = lease.in_flight.saturating_sub(1);
        if !success {
            lease.failed += 1;
        }
        if !lease.settled() {
            return false;
        }

        if let Some(lease) = self.leases.remove(&id) {
            if lease.failed == 0 {
                self.pending_acks.push(lease.receipt_handle);
            } else {
                self.forfeited += 1;
                warn!(
                    lease = id.0,
                    failed = lease.failed,
                    total = lease.total,
                    "batch had failed units, leaving it for redelivery"
                );
            }
        }
        true
    }

    /// Receipt handles ready to delete, including earlier failed deletes.
    pub fn drain_acks(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_acks)
    }

    /// Put back a handle whose delete failed so the next flush retries it.
    pub fn retry_ack(&mut self, receipt_handle: String) {
        self.pending_acks.push(receipt_handle);
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    pub fn is_pulling(&self) -> bool {
        self.pulling
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Draining with nothing queued or in flight.
    pub fn is_exhausted(&self) -> bool {
        self.draining && !self.pulling && self.leases.is_empty()
    }

    pub fn queued_units(&self) -> usize {
        self.leases.values().map(|l| l.remaining.len()).sum()
    }

    pub fn in_flight_units(&self) -> usize {
        self.leases.values().map(|l| l.in_flight).sum()
    }

    /// Units of a lease not yet settled, or `None` once it is gone.
    pub fn outstanding(&self, id: LeaseId) -> Option<usize> {
        self.leases.get(&id).map(|l| l.remaining.len() + l.in_flight)
    }

    pub fn counts(&self) -> LeaseCounts {
        LeaseCounts {
            leases: self.leases.len(),
            queued: self.queued_units(),
            in_flight: self.in_flight_units(),
        }
    }

    /// Leases dropped without acknowledgment.
    pub fn forfeited(&self) -> usize {
        self.forfeited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(handle: &str, body: &str) -> Option<ReceivedMessage> {
        Some(ReceivedMessage {
            receipt_handle: handle.to_string(),
            body: body.to_string(),
        })
    }

    #[test]
    fn test_take_walks_oldest_lease_first() {
        let mut manager = LeaseManager::new();
        manager.finish_pull(message("h1", r#"{"a/":["1","2"]}"#));
        manager.finish_pull(message("h2", r#"{"b/":["1"]}"#));
        let order: Vec<String> = std::iter::from_fn(|| manager.take())
            .map(|(_, u)| u.to_string())
            .collect();
        assert_eq!(order, vec!["a/1.warc.gz", "a/2.warc.gz", "b/1.warc.gz"]);
    }

    #[test]
    fn test_ack_waits_for_in_flight_units() {
        let mut manager = LeaseManager::new();
        manager.finish_pull(message("h1", r#"{"a/":["1","2"]}"#));
        let (l1, _) = manager.take().unwrap();
        let (l2, _) = manager.take().unwrap();
        assert_eq!(l1, l2);
        assert!(manager.drain_acks().is_empty());

        assert!(!manager.complete(l1, true));
        assert!(manager.drain_acks().is_empty());
        assert!(manager.complete(l2, true));
        assert_eq!(manager.drain_acks(), vec!["h1".to_string()]);
    }

    #[test]
    fn test_failed_unit_forfeits_ack() {
        let mut manager = LeaseManager::new();
        manager.finish_pull(message("h1", r#"{"a/":["1","2"]}"#));
        let (id, _) = manager.take().unwrap();
        manager.take().unwrap();
        manager.complete(id, false);
        manager.complete(id, true);
        assert!(manager.drain_acks().is_empty());
        assert_eq!(manager.forfeited(), 1);
        assert_eq!(manager.outstanding(id), None);
    }

    #[test]
    fn test_empty_pull_is_sticky_drain() {
        let mut manager = LeaseManager::new();
        assert!(manager.should_pull(4, 0.5));
        assert!(manager.begin_pull());
        assert!(!manager.begin_pull());
        assert_eq!(manager.finish_pull(None), PullOutcome::Empty);
        assert!(manager.is_draining());
        assert!(manager.is_exhausted());
        assert!(!manager.should_pull(4, 0.5));
    }

    #[test]
    fn test_backpressure_threshold() {
        let mut manager = LeaseManager::new();
        manager.finish_pull(message("h1", r#"{"a/":["1","2"]}"#));
        assert!(!manager.should_pull(4, 0.5));
        assert!(manager.should_pull(6, 0.5));
    }

    #[test]
    fn test_malformed_body_is_not_leased() {
        let mut manager = LeaseManager::new();
        let outcome = manager.finish_pull(message("bad", "not json"));
        assert!(matches!(outcome, PullOutcome::Malformed { .. }));
        assert_eq!(manager.counts(), LeaseCounts::default());
        assert!(manager.drain_acks().is_empty());
    }

    #[test]
    fn test_retry_ack_requeues_handle() {
        let mut manager = LeaseManager::new();
        manager.finish_pull(message("h1", "{}"));
        let acks = manager.drain_acks();
        assert_eq!(acks, vec!["h1".to_string()]);
        manager.retry_ack(acks[0].clone());
        assert!(manager.has_pending_acks());
    }
}
