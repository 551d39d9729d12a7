//! Per-pattern post-match validation.
//!
//! A validator sees the raw matched text and either returns the value to keep
//! or `None` to drop the candidate.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidatorKind {
    #[default]
    None,
    /// Drop values containing any needle, compared case-insensitively.
    DenySubstrings { needles: Vec<String> },
    /// Decode a base64 `user:password` token and keep the decoded form.
    Base64Credentials,
}

impl ValidatorKind {
    pub fn is_none(&self) -> bool {
        matches!(self, ValidatorKind::None)
    }

    /// Lowercase needles once so the per-match path only lowercases the value.
    pub fn prepared(self) -> Self {
        match self {
            ValidatorKind::DenySubstrings { needles } => ValidatorKind::DenySubstrings {
                needles: needles.into_iter().map(|n| n.to_ascii_lowercase()).collect(),
            },
            other => other,
        }
    }

    pub fn apply(&self, raw: &str) -> Option<String> {
        match self {
            ValidatorKind::None => Some(raw.to_string()),
            ValidatorKind::DenySubstrings { needles } => {
                let lowered = raw.to_ascii_lowercase();
                if needles.iter().any(|n| lowered.contains(n.as_str())) {
                    None
                } else {
                    Some(raw.to_string())
                }
            }
            ValidatorKind::Base64Credentials => decode_credentials(raw),
        }
    }
}

fn decode_credentials(raw: &str) -> Option<String> {
    let token = raw
        .trim()
        .trim_matches(|c| c == '\'' || c == '"')
        .split_whitespace()
        .last()?;
    let decoded = STANDARD.decode(token).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, password) = text.split_once(':')?;
    if user.is_empty() || password.is_empty() || text.chars().any(char::is_control) {
        return None;
    }
    Some(text)
}
