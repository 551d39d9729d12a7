//! Turns a flat archive listing into mask-compressed batches and publishes them.
//!
//! Walking the listing, the planner keeps a current mask: the longest prefix the
//! current element shares with the element `LOOKAHEAD` positions ahead. Elements
//! that still start with the mask join its group; the first one that does not
//! opens a new group. A batch closes every `chunk_size` units and at the end of
//! the listing.

use crate::batch::{strip_extension, WorkBatch};
use crate::config::PlannerConfig;
use crate::queue::{SendEntry, WorkQueue, SEND_BATCH_LIMIT};
use crate::store::BlobStore;
use crate::WarcannonError;
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Distance to the element used to compute a new mask.
pub const LOOKAHEAD: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanReport {
    pub total_units: usize,
    pub batches_created: usize,
    pub messages_attempted: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub failed_calls: usize,
}

/// Longest common prefix of `left` and `right`, never covering all of `left`.
pub fn common_mask<'a>(left: &'a str, right: &str) -> &'a str {
    let limit = left.char_indices().last().map(|(i, _)| i).unwrap_or(0);
    let mut end = 0;
    for ((i, l), r) in left.char_indices().zip(right.chars()) {
        if i >= limit || l != r {
            break;
        }
        end = i + l.len_utf8();
    }
    &left[..end]
}

pub fn plan_chunks<S: AsRef<str>>(paths: &[S], chunk_size: usize) -> Vec<WorkBatch> {
    let chunk_size = chunk_size.max(1);
    let stems: Vec<&str> = paths.iter().map(|p| strip_extension(p.as_ref())).collect();

    let mut batches = Vec::new();
    let mut current = WorkBatch::new();
    let mut mask: Option<&str> = None;

    for (a, stem) in stems.iter().enumerate() {
        let shares = mask.is_some_and(|m| stem.starts_with(m));
        if !shares {
            let next = (a + LOOKAHEAD).min(stems.len() - 1);
            let new_mask = common_mask(stem, stems[next]);
            // A repeated key would reorder units on decode, so close early instead.
            if current.has_mask(new_mask) {
                batches.push(std::mem::take(&mut current));
            }
            current.open_group(new_mask);
            mask = Some(new_mask);
        }

        let prefix_len = mask.map(str::len).unwrap_or(0);
        current.push_suffix(&stem[prefix_len..]);

        if current.len() == chunk_size {
            batches.push(std::mem::take(&mut current));
            mask = None;
        }
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

/// Decompress (if gzip) and split a listing into non-empty lines.
pub fn decode_listing(bytes: &[u8]) -> Result<Vec<String>, WarcannonError> {
    let text = if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut out = String::new();
        MultiGzDecoder::new(bytes)
            .read_to_string(&mut out)
            .map_err(|e| WarcannonError::Planning(format!("listing decompress failed: {}", e)))?;
        out
    } else {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| WarcannonError::Planning(format!("listing is not UTF-8: {}", e)))?
    };

    Ok(text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn listing_key(crawl: &str) -> String {
    format!("crawl-data/{}/warc.paths.gz", crawl)
}

pub async fn fetch_listing(source: &dyn BlobStore, key: &str) -> Result<Vec<String>, WarcannonError> {
    let bytes = source
        .get(key)
        .await
        .map_err(|e| WarcannonError::Planning(format!("listing {} unavailable: {}", key, e)))?;
    decode_listing(&bytes)
}

/// Publish batches in groups of [`SEND_BATCH_LIMIT`], stopping after `max_chunks` messages.
pub async fn publish_batches(
    queue: Arc<dyn WorkQueue>,
    batches: &[WorkBatch],
    config: &PlannerConfig,
) -> Result<PlanReport, WarcannonError> {
    let limit = config.max_chunks.map_or(batches.len(), |m| m.min(batches.len()));
    let mut report = PlanReport {
        total_units: batches.iter().map(WorkBatch::len).sum(),
        batches_created: batches.len(),
        ..PlanReport::default()
    };

    let permits = Arc::new(Semaphore::new(config.send_concurrency.max(1)));
    let mut sends = JoinSet::new();

    for (group_idx, group) in batches[..limit].chunks(SEND_BATCH_LIMIT).enumerate() {
        let mut entries = Vec::with_capacity(group.len());
        for (offset, batch) in group.iter().enumerate() {
            entries.push(SendEntry {
                id: format!("{}-{}", config.crawl, group_idx * SEND_BATCH_LIMIT + offset),
                body: batch.to_message_body()?,
            });
        }
        report.messages_attempted += entries.len();

        let queue = queue.clone();
        let permits = permits.clone();
        let retries = config.send_retries;
        sends.spawn(async move {
            let _permit = permits.acquire_owned().await;
            send_with_retry(queue.as_ref(), entries, retries).await
        });
    }

    while let Some(joined) = sends.join_next().await {
        match joined {
            Ok(SendOutcome::Sent { accepted, rejected }) => {
                report.accepted += accepted;
                report.rejected += rejected.len();
                if !rejected.is_empty() {
                    warn!(count = rejected.len(), first = %rejected[0], "queue rejected entries");
                }
            }
            Ok(SendOutcome::Failed { entries, error }) => {
                warn!(entries, %error, "send batch failed after retries");
                report.failed_calls += 1;
                report.rejected += entries;
            }
            Err(e) => {
                return Err(WarcannonError::Planning(format!("send task aborted: {}", e)));
            }
        }
    }

    Ok(report)
}

enum SendOutcome {
    Sent { accepted: usize, rejected: Vec<String> },
    Failed { entries: usize, error: WarcannonError },
}

async fn send_with_retry(queue: &dyn WorkQueue, entries: Vec<SendEntry>, retries: usize) -> SendOutcome {
    let count = entries.len();
    let mut attempt = 0;
    loop {
        match queue.send_batch(entries.clone()).await {
            Ok(result) => {
                return SendOutcome::Sent {
                    accepted: result.accepted,
                    rejected: result.rejected,
                };
            }
            Err(error) if attempt >= retries => return SendOutcome::Failed { entries: count, error },
            Err(error) => {
                attempt += 1;
                warn!(attempt, %error, "send batch failed, retrying");
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
        }
    }
}

/// Fetch the listing, plan it, and publish the result.
pub async fn run_planner(
    source: &dyn BlobStore,
    queue: Arc<dyn WorkQueue>,
    config: &PlannerConfig,
) -> Result<PlanReport, WarcannonError> {
    let key = config.listing_key.clone().unwrap_or_else(|| listing_key(&config.crawl));
    info!(%key, "fetching listing");
    let paths = fetch_listing(source, &key).await?;
    info!(units = paths.len(), chunk_size = config.chunk_size, "planning batches");

    let batches = plan_chunks(&paths, config.chunk_size);
    let report = publish_batches(queue, &batches, config).await?;

    info!(
        total_units = report.total_units,
        batches = report.batches_created,
        accepted = report.accepted,
        rejected = report.rejected,
        "planning complete"
    );
    Ok(report)
}
