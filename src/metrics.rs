use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;

/// Source URIs retained per domain per finding. The first ones seen are kept.
pub const MAX_URIS_PER_DOMAIN: usize = 3;

const VALUE_KEY: &str = "value";
/// Prefixed onto domain keys that would collide with `value` or with an escaped key.
const DOMAIN_ESCAPE: char = '~';

pub type UriList = SmallVec<[String; MAX_URIS_PER_DOMAIN]>;

/// One deduplicated value with its per-domain evidence.
///
/// Serialized flat: `{"value": "...", "<domain>": ["<uri>", ...]}`. A domain
/// named `value`, or one starting with `~`, is written with one extra `~`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Finding {
    pub value: String,
    pub domains: BTreeMap<String, UriList>,
}

fn escape_domain(domain: &str) -> String {
    if domain == VALUE_KEY || domain.starts_with(DOMAIN_ESCAPE) {
        format!("{}{}", DOMAIN_ESCAPE, domain)
    } else {
        domain.to_string()
    }
}

fn unescape_domain(key: String) -> String {
    match key.strip_prefix(DOMAIN_ESCAPE) {
        Some(rest) => rest.to_string(),
        None => key,
    }
}

impl Serialize for Finding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.domains.len() + 1))?;
        map.serialize_entry(VALUE_KEY, &self.value)?;
        for (domain, uris) in &self.domains {
            map.serialize_entry(&escape_domain(domain), uris)?;
        }
        map.end()
    }
}

struct FindingVisitor;

impl<'de> Visitor<'de> for FindingVisitor {
    type Value = Finding;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a finding with a value and per-domain uri lists")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Finding, A::Error> {
        let mut value = None;
        let mut domains = BTreeMap::new();
        while let Some(key) = access.next_key::<String>()? {
            if key == VALUE_KEY {
                if value.is_some() {
                    return Err(de::Error::duplicate_field(VALUE_KEY));
                }
                value = Some(access.next_value::<String>()?);
            } else {
                let uris = access.next_value::<UriList>()?;
                domains.insert(unescape_domain(key), uris);
            }
        }
        Ok(Finding {
            value: value.ok_or_else(|| de::Error::missing_field(VALUE_KEY))?,
            domains,
        })
    }
}

impl<'de> Deserialize<'de> for Finding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(FindingVisitor)
    }
}

impl Finding {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            domains: BTreeMap::new(),
        }
    }

    /// Append `uri` under `domain` unless it is already there or the domain is full.
    pub fn add_uri(&mut self, domain: &str, uri: &str) -> bool {
        let uris = self.domains.entry(domain.to_string()).or_default();
        if uris.len() >= MAX_URIS_PER_DOMAIN || uris.iter().any(|u| u == uri) {
            return false;
        }
        uris.push(uri.to_string());
        true
    }

    fn absorb(&mut self, other: Finding) {
        for (domain, uris) in other.domains {
            for uri in uris {
                self.add_uri(&domain, &uri);
            }
        }
    }
}

/// Findings keyed by pattern name, then by value hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub total_hits: u64,
    pub regex_hits: BTreeMap<String, BTreeMap<String, Finding>>,
}

impl ResultMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an empty finding map for every pattern so consumers see all keys.
    pub fn with_patterns<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            total_hits: 0,
            regex_hits: names.into_iter().map(|n| (n.to_string(), BTreeMap::new())).collect(),
        }
    }

    /// Count one hit and attach its evidence.
    pub fn record(&mut self, pattern: &str, hash: &str, value: &str, domain: &str, uri: &str) {
        self.total_hits += 1;
        self.regex_hits
            .entry(pattern.to_string())
            .or_default()
            .entry(hash.to_string())
            .or_insert_with(|| Finding::new(value))
            .add_uri(domain, uri);
    }

    /// Fold another metrics object into this one.
    pub fn merge(&mut self, other: ResultMetrics) {
        self.total_hits += other.total_hits;
        for (pattern, incoming) in other.regex_hits {
            let findings = self.regex_hits.entry(pattern).or_default();
            for (hash, finding) in incoming {
                match findings.get_mut(&hash) {
                    Some(existing) => existing.absorb(finding),
                    None => {
                        let mut fresh = Finding::new(finding.value.clone());
                        fresh.absorb(finding);
                        findings.insert(hash, fresh);
                    }
                }
            }
        }
    }

    pub fn finding_count(&self) -> usize {
        self.regex_hits.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_hits == 0 && self.finding_count() == 0
    }
}
