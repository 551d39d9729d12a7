//! Node-level result accumulation with throttled snapshots and key rotation.

use crate::metrics::ResultMetrics;
use crate::store::BlobStore;
use crate::WarcannonError;
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Throttled, or nothing changed since the last save.
    Skipped,
    Saved { key: String, bytes: usize },
    /// Saved under `key`, then reset; accumulation continues under `next_key`.
    Rotated { key: String, bytes: usize, next_key: String },
}

pub struct ResultAggregator {
    store: Arc<dyn BlobStore>,
    prefix: String,
    instance_id: String,
    metrics: ResultMetrics,
    key: String,
    seq: u64,
    last_snapshot: Option<Instant>,
    throttle: Duration,
    rotate_bytes: usize,
    dirty: bool,
    lifetime_hits: u64,
}

impl ResultAggregator {
    pub fn new(
        store: Arc<dyn BlobStore>,
        prefix: &str,
        instance_id: &str,
        throttle: Duration,
        rotate_bytes: usize,
    ) -> Self {
        let prefix = prefix.trim_end_matches('/').to_string();
        let key = snapshot_key(&prefix, instance_id, 0);
        Self {
            store,
            prefix,
            instance_id: instance_id.to_string(),
            metrics: ResultMetrics::new(),
            key,
            seq: 0,
            last_snapshot: None,
            throttle,
            rotate_bytes: rotate_bytes.max(1),
            dirty: false,
            lifetime_hits: 0,
        }
    }

    pub fn merge(&mut self, unit: ResultMetrics) {
        self.lifetime_hits += unit.total_hits;
        self.metrics.merge(unit);
        self.dirty = true;
    }

    pub fn metrics(&self) -> &ResultMetrics {
        &self.metrics
    }

    pub fn current_key(&self) -> &str {
        &self.key
    }

    /// Hits merged since start, across rotations.
    pub fn lifetime_hits(&self) -> u64 {
        self.lifetime_hits
    }

    /// Write the accumulated metrics. A failed write leaves the in-memory state intact.
    pub async fn snapshot(&mut self, force: bool) -> Result<SnapshotOutcome, WarcannonError> {
        if !force {
            let throttled = self.last_snapshot.is_some_and(|t| t.elapsed() < self.throttle);
            if throttled || !self.dirty {
                return Ok(SnapshotOutcome::Skipped);
            }
        }

        let bytes = serde_json::to_vec(&self.metrics)?;
        let size = bytes.len();
        self.store.put(&self.key, bytes, "application/json").await?;
        self.last_snapshot = Some(Instant::now());
        self.dirty = false;

        if size <= self.rotate_bytes {
            debug!(key = %self.key, bytes = size, "snapshot saved");
            return Ok(SnapshotOutcome::Saved {
                key: self.key.clone(),
                bytes: size,
            });
        }

        self.seq += 1;
        let next_key = snapshot_key(&self.prefix, &self.instance_id, self.seq);
        let key = std::mem::replace(&mut self.key, next_key.clone());
        self.metrics = ResultMetrics::new();
        info!(%key, %next_key, bytes = size, "rotated results");
        Ok(SnapshotOutcome::Rotated {
            key,
            bytes: size,
            next_key,
        })
    }
}

pub fn snapshot_key(prefix: &str, instance_id: &str, seq: u64) -> String {
    format!(
        "{}/{}_{}_{}.json",
        prefix,
        instance_id,
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        seq
    )
}
