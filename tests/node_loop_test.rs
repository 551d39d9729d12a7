use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warcannon::aggregator::ResultAggregator;
use warcannon::batch::{WorkBatch, WorkUnit};
use warcannon::engine::ScanProgress;
use warcannon::liveness::NodeState;
use warcannon::metrics::ResultMetrics;
use warcannon::node::{Node, NodeSettings};
use warcannon::queue::{MemoryQueue, QueueDepth, ReceivedMessage, SendBatchResult, SendEntry, WorkQueue};
use warcannon::runner::{ProgressFn, UnitOutcome, UnitRunner};
use warcannon::store::{MemoryStore, StatusStore};
use warcannon::WarcannonError;

/// Reports one hit per unit, except for units listed in `failing`.
#[derive(Default)]
struct ScriptedRunner {
    failing: HashSet<String>,
    ran: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn failing(units: &[&str]) -> Self {
        Self {
            failing: units.iter().map(|u| u.to_string()).collect(),
            ..Self::default()
        }
    }

    fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }
}

#[async_trait]
impl UnitRunner for ScriptedRunner {
    async fn run(&self, unit: WorkUnit, mut on_progress: ProgressFn) -> UnitOutcome {
        self.ran.lock().unwrap().push(unit.to_string());
        on_progress(ScanProgress {
            records_seen: 10,
            records_processed: 4,
        });
        tokio::task::yield_now().await;
        if self.failing.contains(unit.as_str()) {
            return UnitOutcome::Failed {
                reason: "scripted failure".to_string(),
            };
        }
        let mut metrics = ResultMetrics::with_patterns(["access_key_id"]);
        metrics.record("access_key_id", unit.as_str(), unit.as_str(), "a.example", "https://a.example/");
        UnitOutcome::Completed { metrics }
    }
}

/// Serves a fixed number of receives, then fails every one after.
struct FailingAfter {
    inner: MemoryQueue,
    receives_left: AtomicUsize,
}

impl FailingAfter {
    fn new(inner: MemoryQueue, receives: usize) -> Self {
        Self {
            inner,
            receives_left: AtomicUsize::new(receives),
        }
    }
}

#[async_trait]
impl WorkQueue for FailingAfter {
    async fn receive(&self) -> Result<Option<ReceivedMessage>, WarcannonError> {
        let left = self.receives_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(WarcannonError::Queue("connection reset".to_string()));
        }
        self.receives_left.store(left - 1, Ordering::SeqCst);
        self.inner.receive().await
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), WarcannonError> {
        self.inner.delete(receipt_handle).await
    }

    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<SendBatchResult, WarcannonError> {
        self.inner.send_batch(entries).await
    }

    async fn depth(&self) -> Result<QueueDepth, WarcannonError> {
        self.inner.depth().await
    }
}

fn settings() -> NodeSettings {
    NodeSettings {
        parallelism: 2,
        queue_factor: 1.5,
        heartbeat_interval: Duration::from_millis(50),
        lease_ttl: Duration::from_secs(300),
        max_records: 1000,
        max_pull_failures: 3,
    }
}

fn enqueue(queue: &MemoryQueue, batches: usize, units: usize) {
    for b in 0..batches {
        let mut batch = WorkBatch::new();
        batch.open_group(&format!("seg-{}/", b));
        for u in 0..units {
            batch.push_suffix(&u.to_string());
        }
        queue.push_body(batch.to_message_body().unwrap()).unwrap();
    }
}

fn node(queue: &Arc<MemoryQueue>, runner: &Arc<ScriptedRunner>, store: &Arc<MemoryStore>) -> Node {
    let results = ResultAggregator::new(store.clone(), "results", "node-a", Duration::ZERO, 1 << 20);
    Node::new("node-a", settings(), queue.clone(), runner.clone(), store.clone(), results)
}

fn results_key(store: &MemoryStore) -> String {
    let keys: Vec<String> = store
        .keys()
        .unwrap()
        .into_iter()
        .filter(|k| k.starts_with("results/node-a_"))
        .collect();
    assert_eq!(keys.len(), 1, "keys: {:?}", keys);
    keys[0].clone()
}

#[tokio::test]
async fn test_node_drains_queue_and_acks_every_batch() {
    let queue = Arc::new(MemoryQueue::new());
    enqueue(&queue, 3, 2);
    let runner = Arc::new(ScriptedRunner::default());
    let store = Arc::new(MemoryStore::new());

    let report = node(&queue, &runner, &store).run().await.unwrap();

    assert_eq!(report.completed_units, 6);
    assert_eq!(report.total_hits, 6);
    assert_eq!(report.forfeited_batches, 0);
    assert_eq!(runner.ran().len(), 6);
    assert_eq!(queue.deleted().unwrap().len(), 3);
    assert!(queue.depth().await.unwrap().is_empty());

    let saved: ResultMetrics = serde_json::from_slice(&store.object(&results_key(&store)).unwrap().unwrap()).unwrap();
    assert_eq!(saved.total_hits, 6);
    assert_eq!(saved.finding_count(), 6);

    let statuses = store.scan().await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].state, NodeState::Exhausted);
    assert_eq!(statuses[0].pending_units, 0);
    assert_eq!(statuses[0].completed_units, 6);
    assert!(statuses[0].progress.is_empty());
}

#[tokio::test]
async fn test_failed_unit_leaves_its_batch_for_redelivery() {
    let queue = Arc::new(MemoryQueue::new());
    enqueue(&queue, 2, 2);
    let runner = Arc::new(ScriptedRunner::failing(&["seg-1/0.warc.gz"]));
    let store = Arc::new(MemoryStore::new());

    let report = node(&queue, &runner, &store).run().await.unwrap();

    assert_eq!(report.completed_units, 3);
    assert_eq!(report.forfeited_batches, 1);
    assert_eq!(queue.deleted().unwrap().len(), 1);
    let depth = queue.depth().await.unwrap();
    assert_eq!(depth.visible, 0);
    assert_eq!(depth.in_flight, 1);

    let statuses = store.scan().await.unwrap();
    assert_eq!(statuses[0].failed_units, 1);
}

#[tokio::test]
async fn test_empty_queue_exhausts_immediately() {
    let queue = Arc::new(MemoryQueue::new());
    let runner = Arc::new(ScriptedRunner::default());
    let store = Arc::new(MemoryStore::new());

    let report = node(&queue, &runner, &store).run().await.unwrap();

    assert_eq!(report.completed_units, 0);
    assert!(runner.ran().is_empty());
    let saved: ResultMetrics = serde_json::from_slice(&store.object(&results_key(&store)).unwrap().unwrap()).unwrap();
    assert!(saved.is_empty());
}

#[tokio::test]
async fn test_receive_failure_at_startup_is_fatal() {
    let queue = Arc::new(MemoryQueue::new());
    enqueue(&queue, 1, 1);
    queue.fail_next_receives(1).unwrap();
    let runner = Arc::new(ScriptedRunner::default());
    let store = Arc::new(MemoryStore::new());

    let err = node(&queue, &runner, &store).run().await.unwrap_err();

    assert!(matches!(err, WarcannonError::Queue(_)));
    assert!(runner.ran().is_empty());
    assert_eq!(queue.visible_bodies().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_delete_is_retried() {
    let queue = Arc::new(MemoryQueue::new());
    enqueue(&queue, 2, 1);
    queue.fail_next_deletes(1).unwrap();
    let runner = Arc::new(ScriptedRunner::default());
    let store = Arc::new(MemoryStore::new());

    let report = node(&queue, &runner, &store).run().await.unwrap();

    assert_eq!(report.completed_units, 2);
    let mut deleted = queue.deleted().unwrap();
    deleted.sort();
    deleted.dedup();
    assert_eq!(deleted.len(), 2);
    assert!(queue.depth().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unsaved_results_fail_the_node() {
    let queue = Arc::new(MemoryQueue::new());
    enqueue(&queue, 1, 1);
    let runner = Arc::new(ScriptedRunner::default());
    let store = Arc::new(MemoryStore::new());
    store.fail_next_puts(100).unwrap();

    let err = node(&queue, &runner, &store).run().await.unwrap_err();

    assert!(matches!(err, WarcannonError::Storage(_)));
    // The batch was still acknowledged; only the snapshot is missing.
    assert_eq!(queue.deleted().unwrap().len(), 1);
    assert_eq!(store.scan().await.unwrap()[0].state, NodeState::Exhausted);
}

#[tokio::test(start_paused = true)]
async fn test_queue_loss_still_persists_acknowledged_findings() {
    let memory = MemoryQueue::new();
    enqueue(&memory, 2, 1);
    let queue = Arc::new(FailingAfter::new(memory, 2));
    let runner = Arc::new(ScriptedRunner::default());
    let store = Arc::new(MemoryStore::new());
    let results = ResultAggregator::new(store.clone(), "results", "node-a", Duration::from_secs(60), 1 << 20);
    let node = Node::new("node-a", settings(), queue.clone(), runner.clone(), store.clone(), results);

    let err = node.run().await.unwrap_err();

    assert!(matches!(err, WarcannonError::Queue(_)));
    assert_eq!(runner.ran().len(), 2);
    assert_eq!(queue.inner.deleted().unwrap().len(), 2);
    let saved: ResultMetrics = serde_json::from_slice(&store.object(&results_key(&store)).unwrap().unwrap()).unwrap();
    assert_eq!(saved.total_hits, 2);
    assert_eq!(store.scan().await.unwrap()[0].completed_units, 2);
}
