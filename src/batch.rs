//! Work units and the compact mask+suffix batch encoding used on the queue.
//!
//! A message body is a JSON object `{mask: [suffix, ...], ...}`. Each unit is
//! reconstructed as `mask + suffix + ".warc.gz"`. Group order is preserved in
//! both directions so a batch expands back into the exact planned sequence.

use crate::WarcannonError;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Extension re-appended to every reconstructed unit.
pub const ARCHIVE_EXTENSION: &str = ".warc.gz";

/// One archive object to fetch and scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkUnit(String);

impl WorkUnit {
    pub fn new(key: impl Into<String>) -> Self {
        WorkUnit(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last `len` characters, used to keep log lines short.
    pub fn tail(&self, len: usize) -> &str {
        let start = self.0.len().saturating_sub(len);
        let mut idx = start;
        while !self.0.is_char_boundary(idx) {
            idx += 1;
        }
        &self.0[idx..]
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip the archive extension if present. Identifiers without it are kept as-is.
pub fn strip_extension(path: &str) -> &str {
    path.strip_suffix(ARCHIVE_EXTENSION).unwrap_or(path)
}

/// A group of units sharing a path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskGroup {
    pub mask: String,
    pub suffixes: Vec<String>,
}

/// A set of units sharing common path-prefix masks, as carried by one queue message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkBatch {
    groups: Vec<MaskGroup>,
}

impl WorkBatch {
    pub fn new() -> Self {
        Self { groups: Vec::new() }
    }

    pub fn groups(&self) -> &[MaskGroup] {
        &self.groups
    }

    pub fn has_mask(&self, mask: &str) -> bool {
        self.groups.iter().any(|g| g.mask == mask)
    }

    /// Start a new group. The caller guarantees the mask is not already present.
    pub fn open_group(&mut self, mask: &str) {
        self.groups.push(MaskGroup {
            mask: mask.to_string(),
            suffixes: Vec::new(),
        });
    }

    /// Append a suffix to the most recently opened group.
    pub fn push_suffix(&mut self, suffix: &str) {
        if self.groups.is_empty() {
            self.open_group("");
        }
        if let Some(group) = self.groups.last_mut() {
            group.suffixes.push(suffix.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.suffixes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expand into full unit identifiers, in planned order.
    pub fn units(&self) -> Vec<WorkUnit> {
        self.groups
            .iter()
            .flat_map(|g| {
                g.suffixes
                    .iter()
                    .map(move |s| WorkUnit(format!("{}{}{}", g.mask, s, ARCHIVE_EXTENSION)))
            })
            .collect()
    }

    pub fn to_message_body(&self) -> Result<String, WarcannonError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_message_body(body: &str) -> Result<Self, WarcannonError> {
        serde_json::from_str(body)
            .map_err(|e| WarcannonError::Decode(format!("invalid batch body: {}", e)))
    }
}

impl Serialize for WorkBatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.groups.len()))?;
        for group in &self.groups {
            map.serialize_entry(&group.mask, &group.suffixes)?;
        }
        map.end()
    }
}

struct WorkBatchVisitor;

impl<'de> Visitor<'de> for WorkBatchVisitor {
    type Value = WorkBatch;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of mask to suffix list")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<WorkBatch, A::Error> {
        let mut groups = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((mask, suffixes)) = access.next_entry::<String, Vec<String>>()? {
            groups.push(MaskGroup { mask, suffixes });
        }
        Ok(WorkBatch { groups })
    }
}

impl<'de> Deserialize<'de> for WorkBatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(WorkBatchVisitor)
    }
}
