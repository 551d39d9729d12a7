use std::fmt;

#[derive(Debug)]
pub enum WarcannonError {
    Planning(String),
    Queue(String),
    Storage(String),
    Decode(String),
    Pattern(String),
    Config(String),
    Worker(String),
    Io(std::io::Error),
    Json(serde_json::Error),
    Other(String),
}

impl fmt::Display for WarcannonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarcannonError::Planning(e) => write!(f, "Planning error: {}", e),
            WarcannonError::Queue(e) => write!(f, "Queue error: {}", e),
            WarcannonError::Storage(e) => write!(f, "Storage error: {}", e),
            WarcannonError::Decode(e) => write!(f, "Decode error: {}", e),
            WarcannonError::Pattern(e) => write!(f, "Pattern error: {}", e),
            WarcannonError::Config(e) => write!(f, "Config error: {}", e),
            WarcannonError::Worker(e) => write!(f, "Worker error: {}", e),
            WarcannonError::Io(e) => write!(f, "IO error: {}", e),
            WarcannonError::Json(e) => write!(f, "JSON error: {}", e),
            WarcannonError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for WarcannonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WarcannonError::Io(e) => Some(e),
            WarcannonError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WarcannonError {
    fn from(err: std::io::Error) -> Self {
        WarcannonError::Io(err)
    }
}

impl From<serde_json::Error> for WarcannonError {
    fn from(err: serde_json::Error) -> Self {
        WarcannonError::Json(err)
    }
}

impl From<regex::Error> for WarcannonError {
    fn from(err: regex::Error) -> Self {
        WarcannonError::Pattern(err.to_string())
    }
}

impl From<String> for WarcannonError {
    fn from(err: String) -> Self {
        WarcannonError::Other(err)
    }
}

impl From<&str> for WarcannonError {
    fn from(err: &str) -> Self {
        WarcannonError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes_variant() {
        let err = WarcannonError::Queue("receive timed out".to_string());
        assert_eq!(err.to_string(), "Queue error: receive timed out");
    }

    #[test]
    fn test_regex_error_maps_to_pattern() {
        let err: WarcannonError = regex::Regex::new("(").unwrap_err().into();
        assert!(matches!(err, WarcannonError::Pattern(_)));
    }
}
