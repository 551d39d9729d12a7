use crate::WarcannonError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_SOURCE_BUCKET: &str = "commoncrawl";
pub const DEFAULT_MIME_TYPES: &[&str] = &[
    "text/html",
    "text/javascript",
    "text/ecmascript",
    "application/javascript",
    "application/ecmascript",
];

const MIB: u64 = 1024 * 1024;

fn parse_var<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, WarcannonError> {
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| WarcannonError::Config(format!("{} has invalid value '{}'", name, raw))),
        _ => Ok(default),
    }
}

fn string_var(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.trim().is_empty())
}

fn list_var(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: &[&str]) -> Vec<String> {
    match lookup(name) {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Record filters and pattern source for the match engine.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub mime_types: Vec<String>,
    pub domains: Vec<String>,
    pub patterns_file: Option<PathBuf>,
    pub progress_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mime_types: DEFAULT_MIME_TYPES.iter().map(|s| s.to_string()).collect(),
            domains: Vec::new(),
            patterns_file: None,
            progress_interval: Duration::from_secs(1),
        }
    }
}

impl ScanConfig {
    pub fn from_env() -> Result<Self, WarcannonError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, WarcannonError> {
        Ok(Self {
            mime_types: list_var(lookup, "WARCANNON_MIME_TYPES", DEFAULT_MIME_TYPES),
            domains: list_var(lookup, "WARCANNON_DOMAINS", &[]),
            patterns_file: string_var(lookup, "WARCANNON_PATTERNS_FILE").map(PathBuf::from),
            progress_interval: Duration::from_millis(parse_var(lookup, "WARCANNON_PROGRESS_MS", 1000u64)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub crawl: String,
    pub chunk_size: usize,
    pub max_chunks: Option<usize>,
    pub listing_key: Option<String>,
    pub send_concurrency: usize,
    pub send_retries: usize,
}

impl PlannerConfig {
    pub fn new(crawl: &str) -> Self {
        Self {
            crawl: crawl.to_string(),
            chunk_size: 10,
            max_chunks: Some(300_000),
            listing_key: None,
            send_concurrency: 16,
            send_retries: 2,
        }
    }

    pub fn validate(&self) -> Result<(), WarcannonError> {
        if self.crawl.is_empty() {
            return Err(WarcannonError::Config("crawl must be specified, e.g. CC-MAIN-2020-34".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(WarcannonError::Config("chunk_size must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Everything a node control process needs.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub queue_url: String,
    pub region: String,
    pub results_bucket: String,
    pub results_prefix: String,
    pub status_prefix: String,
    pub source_bucket: String,
    pub endpoint: Option<String>,
    pub instance_id: Option<String>,
    pub parallelism_factor: f64,
    pub slot_memory_bytes: u64,
    pub queue_factor: f64,
    pub heartbeat_interval: Duration,
    pub lease_ttl: Duration,
    pub snapshot_interval: Duration,
    pub rotate_bytes: usize,
    pub max_records: u64,
    pub worker_bin: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub max_pull_failures: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            region: DEFAULT_REGION.to_string(),
            results_bucket: String::new(),
            results_prefix: "results".to_string(),
            status_prefix: "status".to_string(),
            source_bucket: DEFAULT_SOURCE_BUCKET.to_string(),
            endpoint: None,
            instance_id: None,
            parallelism_factor: 1.0,
            slot_memory_bytes: 614 * MIB,
            queue_factor: 0.5,
            heartbeat_interval: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(300),
            snapshot_interval: Duration::from_secs(10),
            rotate_bytes: 250 * MIB as usize,
            max_records: 130_000,
            worker_bin: None,
            scratch_dir: PathBuf::from("/tmp/warcannon"),
            max_pull_failures: 5,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, WarcannonError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, WarcannonError> {
        let d = Self::default();
        let config = Self {
            queue_url: string_var(lookup, "WARCANNON_QUEUE_URL").unwrap_or(d.queue_url),
            region: string_var(lookup, "WARCANNON_REGION").unwrap_or(d.region),
            results_bucket: string_var(lookup, "WARCANNON_RESULTS_BUCKET").unwrap_or(d.results_bucket),
            results_prefix: string_var(lookup, "WARCANNON_RESULTS_PREFIX").unwrap_or(d.results_prefix),
            status_prefix: string_var(lookup, "WARCANNON_STATUS_PREFIX").unwrap_or(d.status_prefix),
            source_bucket: string_var(lookup, "WARCANNON_SOURCE_BUCKET").unwrap_or(d.source_bucket),
            endpoint: string_var(lookup, "WARCANNON_S3_ENDPOINT"),
            instance_id: string_var(lookup, "WARCANNON_INSTANCE_ID"),
            parallelism_factor: parse_var(lookup, "WARCANNON_PARALLELISM_FACTOR", d.parallelism_factor)?,
            slot_memory_bytes: parse_var(lookup, "WARCANNON_SLOT_MEMORY_MIB", d.slot_memory_bytes / MIB)? * MIB,
            queue_factor: parse_var(lookup, "WARCANNON_QUEUE_FACTOR", d.queue_factor)?,
            heartbeat_interval: Duration::from_secs(parse_var(lookup, "WARCANNON_HEARTBEAT_SECS", 10u64)?),
            lease_ttl: Duration::from_secs(parse_var(lookup, "WARCANNON_LEASE_TTL_SECS", 300u64)?),
            snapshot_interval: Duration::from_secs(parse_var(lookup, "WARCANNON_SNAPSHOT_SECS", 10u64)?),
            rotate_bytes: parse_var(lookup, "WARCANNON_ROTATE_MIB", 250usize)? * MIB as usize,
            max_records: parse_var(lookup, "WARCANNON_MAX_RECORDS", d.max_records)?,
            worker_bin: string_var(lookup, "WARCANNON_WORKER_BIN").map(PathBuf::from),
            scratch_dir: string_var(lookup, "WARCANNON_SCRATCH_DIR").map(PathBuf::from).unwrap_or(d.scratch_dir),
            max_pull_failures: parse_var(lookup, "WARCANNON_MAX_PULL_FAILURES", d.max_pull_failures)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WarcannonError> {
        if !(self.queue_factor > 0.0) {
            return Err(WarcannonError::Config("queue_factor must be > 0".to_string()));
        }
        if !(self.parallelism_factor > 0.0) {
            return Err(WarcannonError::Config("parallelism_factor must be > 0".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(WarcannonError::Config("heartbeat interval must be > 0".to_string()));
        }
        if self.rotate_bytes == 0 {
            return Err(WarcannonError::Config("rotation threshold must be > 0".to_string()));
        }
        if self.slot_memory_bytes == 0 {
            return Err(WarcannonError::Config("slot memory must be > 0".to_string()));
        }
        Ok(())
    }

    /// Fail unless the remote endpoints a distributed node needs are set.
    pub fn require_remote(&self) -> Result<(), WarcannonError> {
        if self.queue_url.is_empty() {
            return Err(WarcannonError::Config("WARCANNON_QUEUE_URL is not set".to_string()));
        }
        if self.results_bucket.is_empty() {
            return Err(WarcannonError::Config("WARCANNON_RESULTS_BUCKET is not set".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_node_defaults() {
        let config = NodeConfig::from_lookup(&lookup_from(&[])).unwrap();
        assert_eq!(config.queue_factor, 0.5);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.lease_ttl, Duration::from_secs(300));
        assert_eq!(config.rotate_bytes, 250 * 1024 * 1024);
        assert!(config.require_remote().is_err());
    }

    #[test]
    fn test_node_overrides() {
        let config = NodeConfig::from_lookup(&lookup_from(&[
            ("WARCANNON_QUEUE_URL", "https://queue"),
            ("WARCANNON_RESULTS_BUCKET", "results-1"),
            ("WARCANNON_QUEUE_FACTOR", "1.5"),
            ("WARCANNON_ROTATE_MIB", "1"),
        ]))
        .unwrap();
        assert_eq!(config.queue_factor, 1.5);
        assert_eq!(config.rotate_bytes, 1024 * 1024);
        assert!(config.require_remote().is_ok());
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = NodeConfig::from_lookup(&lookup_from(&[("WARCANNON_HEARTBEAT_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, WarcannonError::Config(_)));
    }

    #[test]
    fn test_zero_queue_factor_rejected() {
        assert!(NodeConfig::from_lookup(&lookup_from(&[("WARCANNON_QUEUE_FACTOR", "0")])).is_err());
    }

    #[test]
    fn test_scan_lists() {
        let config = ScanConfig::from_lookup(&lookup_from(&[
            ("WARCANNON_MIME_TYPES", ""),
            ("WARCANNON_DOMAINS", "example.com, test.org"),
        ]))
        .unwrap();
        assert!(config.mime_types.is_empty());
        assert_eq!(config.domains, vec!["example.com", "test.org"]);
        assert_eq!(ScanConfig::default().mime_types.len(), 5);
    }

    #[test]
    fn test_planner_validation() {
        assert!(PlannerConfig::new("").validate().is_err());
        assert!(PlannerConfig::new("CC-MAIN-2020-34").validate().is_ok());
    }
}
