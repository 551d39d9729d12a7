//! Streaming match engine: filters archive records, runs the combined pattern
//! set once per record, and accumulates findings for one work unit.

use crate::config::ScanConfig;
use crate::metrics::ResultMetrics;
use crate::patterns::PatternSet;
use crate::warc::ArchiveRecord;
use crate::WarcannonError;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub records_seen: u64,
    pub records_processed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub metrics: ResultMetrics,
    pub progress: ScanProgress,
    /// Time spent matching processed records.
    pub match_time: Duration,
}

impl ScanReport {
    pub fn average_record_time(&self) -> Duration {
        if self.progress.records_processed == 0 {
            return Duration::ZERO;
        }
        self.match_time / self.progress.records_processed.min(u32::MAX as u64) as u32
    }
}

/// Host part of a URI, or `""` when there is none.
pub fn domain_of(uri: &str) -> &str {
    uri.split('/').nth(2).unwrap_or("")
}

/// Trimmed value with every quote character removed.
pub fn canonicalize(value: &str) -> String {
    value.trim().chars().filter(|c| *c != '\'' && *c != '"').collect()
}

pub fn value_hash(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

pub struct MatchEngine {
    patterns: Arc<PatternSet>,
    mime_types: FxHashSet<String>,
    domains: FxHashSet<String>,
    progress_interval: Duration,
}

impl MatchEngine {
    pub fn new(patterns: Arc<PatternSet>, config: &ScanConfig) -> Self {
        Self {
            patterns,
            mime_types: config.mime_types.iter().cloned().collect(),
            domains: config.domains.iter().cloned().collect(),
            progress_interval: config.progress_interval,
        }
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    /// Response records whose payload type and host pass the allow-lists.
    pub fn accepts(&self, record: &ArchiveRecord) -> bool {
        if !record.is_response() {
            return false;
        }
        if !self.mime_types.is_empty() {
            match record.payload_type.as_deref() {
                Some(mime) if self.mime_types.contains(mime) => {}
                _ => return false,
            }
        }
        if !self.domains.is_empty() {
            let domain = record.target_uri.as_deref().map(domain_of).unwrap_or("");
            if !self.domains.contains(domain) {
                return false;
            }
        }
        true
    }

    /// Match one accepted record into `metrics`.
    pub fn scan_record(&self, record: &ArchiveRecord, metrics: &mut ResultMetrics) {
        let uri = record.target_uri.as_deref().unwrap_or("");
        let domain = domain_of(uri);

        for (pattern, matched) in self.patterns.find_all(&record.content) {
            let raw = String::from_utf8_lossy(matched);
            let Some(value) = self.patterns.validator(pattern).apply(&raw) else {
                continue;
            };
            let canonical = canonicalize(&value);
            let hash = value_hash(&canonical);
            metrics.record(self.patterns.name(pattern), &hash, &canonical, domain, uri);
        }
    }

    /// Consume a record stream. `on_progress` fires at most once per progress interval.
    pub fn scan<I, F>(&self, records: I, mut on_progress: F) -> Result<ScanReport, WarcannonError>
    where
        I: IntoIterator<Item = Result<ArchiveRecord, WarcannonError>>,
        F: FnMut(ScanProgress),
    {
        let mut report = ScanReport {
            metrics: ResultMetrics::with_patterns(self.patterns.names()),
            ..ScanReport::default()
        };
        let mut last_report = Instant::now();

        for record in records {
            let record = record?;
            if last_report.elapsed() >= self.progress_interval {
                last_report = Instant::now();
                on_progress(report.progress);
            }
            report.progress.records_seen += 1;

            if !self.accepts(&record) {
                continue;
            }
            report.progress.records_processed += 1;
            let started = Instant::now();
            self.scan_record(&record, &mut report.metrics);
            report.match_time += started.elapsed();
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::PatternSpec;

    fn engine(config: &ScanConfig) -> MatchEngine {
        MatchEngine::new(Arc::new(PatternSet::defaults().unwrap()), config)
    }

    fn response(uri: &str, mime: &str, body: &str) -> ArchiveRecord {
        ArchiveRecord {
            record_type: "response".to_string(),
            payload_type: Some(mime.to_string()),
            target_uri: Some(uri.to_string()),
            content: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_domain_of_handles_missing_host() {
        assert_eq!(domain_of("https://a.example/x/y"), "a.example");
        assert_eq!(domain_of("mailto:someone"), "");
        assert_eq!(domain_of(""), "");
    }

    #[test]
    fn test_canonicalize_strips_all_quotes() {
        assert_eq!(canonicalize("  'ab\"c'  "), "abc");
    }

    #[test]
    fn test_filters() {
        let config = ScanConfig {
            domains: vec!["keep.example".to_string()],
            ..ScanConfig::default()
        };
        let engine = engine(&config);
        assert!(engine.accepts(&response("https://keep.example/", "text/html", "")));
        assert!(!engine.accepts(&response("https://other.example/", "text/html", "")));
        assert!(!engine.accepts(&response("https://keep.example/", "image/png", "")));
        let mut request = response("https://keep.example/", "text/html", "");
        request.record_type = "request".to_string();
        assert!(!engine.accepts(&request));
    }

    #[test]
    fn test_empty_mime_list_allows_everything() {
        let config = ScanConfig {
            mime_types: Vec::new(),
            ..ScanConfig::default()
        };
        let mut record = response("https://a/", "image/png", "");
        record.payload_type = None;
        assert!(engine(&config).accepts(&record));
    }

    #[test]
    fn test_validator_rejection_drops_hit() {
        let set = PatternSet::compile(&[PatternSpec::new("tok", "tok_[a-z]+").with_validator(
            crate::validators::ValidatorKind::DenySubstrings {
                needles: vec!["captcha".to_string()],
            },
        )])
        .unwrap();
        let engine = MatchEngine::new(Arc::new(set), &ScanConfig::default());
        let mut metrics = ResultMetrics::new();
        engine.scan_record(&response("https://a/", "text/html", "tok_captcha tok_real"), &mut metrics);
        assert_eq!(metrics.total_hits, 1);
        let finding = metrics.regex_hits["tok"].values().next().unwrap();
        assert_eq!(finding.value, "tok_real");
    }

    #[test]
    fn test_progress_is_throttled() {
        let config = ScanConfig {
            progress_interval: Duration::ZERO,
            ..ScanConfig::default()
        };
        let records = (0..3).map(|_| Ok(response("https://a/", "text/html", "nothing")));
        let mut reports = Vec::new();
        let report = engine(&config).scan(records, |p| reports.push(p)).unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[2].records_seen, 2);
        assert_eq!(report.progress.records_processed, 3);

        let slow = ScanConfig::default();
        let records = (0..3).map(|_| Ok(response("https://a/", "text/html", "nothing")));
        let mut count = 0;
        engine(&slow).scan(records, |_| count += 1).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_decode_error_fails_scan() {
        let records = vec![
            Ok(response("https://a/", "text/html", "")),
            Err(WarcannonError::Decode("bad".to_string())),
        ];
        assert!(engine(&ScanConfig::default()).scan(records, |_| {}).is_err());
    }
}
