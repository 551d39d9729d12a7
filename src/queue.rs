use crate::WarcannonError;
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Provider batching limit for send operations.
pub const SEND_BATCH_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub receipt_handle: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEntry {
    pub id: String,
    pub body: String,
}

/// Outcome of one send-batch call. Providers may accept part of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendBatchResult {
    pub accepted: usize,
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub visible: u64,
    pub in_flight: u64,
}

impl QueueDepth {
    pub fn is_empty(&self) -> bool {
        self.visible == 0 && self.in_flight == 0
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Receive at most one message. `None` means the queue had nothing visible.
    async fn receive(&self) -> Result<Option<ReceivedMessage>, WarcannonError>;

    /// Acknowledge (delete) a received message.
    async fn delete(&self, receipt_handle: &str) -> Result<(), WarcannonError>;

    /// Send up to [`SEND_BATCH_LIMIT`] messages.
    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<SendBatchResult, WarcannonError>;

    /// Approximate visible and in-flight message counts.
    async fn depth(&self) -> Result<QueueDepth, WarcannonError>;
}

struct InFlight {
    body: String,
    visible_at: Instant,
}

#[derive(Default)]
struct MemoryQueueState {
    visible: VecDeque<String>,
    in_flight: FxHashMap<String, InFlight>,
    next_handle: u64,
    failing_deletes: usize,
    failing_receives: usize,
    reject_ids: FxHashSet<String>,
    deleted: Vec<String>,
    send_calls: usize,
}

/// In-process queue with visibility-timeout redelivery.
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(Duration::from_secs(30))
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            visibility_timeout,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryQueueState>, WarcannonError> {
        self.state
            .lock()
            .map_err(|_| WarcannonError::Queue("memory queue lock poisoned".to_string()))
    }

    /// Enqueue a raw body directly.
    pub fn push_body(&self, body: impl Into<String>) -> Result<(), WarcannonError> {
        self.lock()?.visible.push_back(body.into());
        Ok(())
    }

    /// The next `count` delete calls fail.
    pub fn fail_next_deletes(&self, count: usize) -> Result<(), WarcannonError> {
        self.lock()?.failing_deletes = count;
        Ok(())
    }

    /// The next `count` receive calls fail.
    pub fn fail_next_receives(&self, count: usize) -> Result<(), WarcannonError> {
        self.lock()?.failing_receives = count;
        Ok(())
    }

    /// Entries with this id are rejected by `send_batch`.
    pub fn reject_entry(&self, id: &str) -> Result<(), WarcannonError> {
        self.lock()?.reject_ids.insert(id.to_string());
        Ok(())
    }

    /// Receipt handles deleted so far, in order.
    pub fn deleted(&self) -> Result<Vec<String>, WarcannonError> {
        Ok(self.lock()?.deleted.clone())
    }

    pub fn send_calls(&self) -> Result<usize, WarcannonError> {
        Ok(self.lock()?.send_calls)
    }

    /// Bodies currently visible, in queue order.
    pub fn visible_bodies(&self) -> Result<Vec<String>, WarcannonError> {
        Ok(self.lock()?.visible.iter().cloned().collect())
    }

    fn requeue_expired(state: &mut MemoryQueueState, now: Instant) {
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(h, _)| h.clone())
            .collect();
        for handle in expired {
            if let Some(msg) = state.in_flight.remove(&handle) {
                state.visible.push_back(msg.body);
            }
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn receive(&self) -> Result<Option<ReceivedMessage>, WarcannonError> {
        let mut state = self.lock()?;
        if state.failing_receives > 0 {
            state.failing_receives -= 1;
            return Err(WarcannonError::Queue("injected receive failure".to_string()));
        }
        Self::requeue_expired(&mut state, Instant::now());
        let Some(body) = state.visible.pop_front() else {
            return Ok(None);
        };
        state.next_handle += 1;
        let receipt_handle = format!("rh-{:08}", state.next_handle);
        state.in_flight.insert(
            receipt_handle.clone(),
            InFlight {
                body: body.clone(),
                visible_at: Instant::now() + self.visibility_timeout,
            },
        );
        Ok(Some(ReceivedMessage { receipt_handle, body }))
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), WarcannonError> {
        let mut state = self.lock()?;
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(WarcannonError::Queue(format!("injected delete failure for {}", receipt_handle)));
        }
        if state.in_flight.remove(receipt_handle).is_none() {
            return Err(WarcannonError::Queue(format!("unknown receipt handle {}", receipt_handle)));
        }
        state.deleted.push(receipt_handle.to_string());
        Ok(())
    }

    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<SendBatchResult, WarcannonError> {
        if entries.len() > SEND_BATCH_LIMIT {
            return Err(WarcannonError::Queue(format!(
                "batch of {} exceeds limit {}",
                entries.len(),
                SEND_BATCH_LIMIT
            )));
        }
        let mut state = self.lock()?;
        state.send_calls += 1;
        let mut result = SendBatchResult::default();
        for entry in entries {
            if state.reject_ids.contains(&entry.id) {
                result.rejected.push(entry.id);
            } else {
                state.visible.push_back(entry.body);
                result.accepted += 1;
            }
        }
        Ok(result)
    }

    async fn depth(&self) -> Result<QueueDepth, WarcannonError> {
        let mut state = self.lock()?;
        Self::requeue_expired(&mut state, Instant::now());
        Ok(QueueDepth {
            visible: state.visible.len() as u64,
            in_flight: state.in_flight.len() as u64,
        })
    }
}
