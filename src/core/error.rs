//! Error types for figview

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Main error type for configuration, I/O and server plumbing
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),
}

/// Classified kind of a load failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum LoadErrorKind {
    Network,
    Decode,
    ContextExhausted,
    ContextLost,
    Aborted,
    CircuitOpen,
    DuplicateInFlight,
    Timeout,
}

impl fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadErrorKind::Network => "NetworkError",
            LoadErrorKind::Decode => "DecodeError",
            LoadErrorKind::ContextExhausted => "ContextExhausted",
            LoadErrorKind::ContextLost => "ContextLost",
            LoadErrorKind::Aborted => "Aborted",
            LoadErrorKind::CircuitOpen => "CircuitOpen",
            LoadErrorKind::DuplicateInFlight => "DuplicateInFlight",
            LoadErrorKind::Timeout => "Timeout",
        };
        f.write_str(name)
    }
}

/// Failure of a single asset load, tagged where it happened
#[derive(Clone, Debug, Error, PartialEq)]
pub enum LoadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("rendering context limit reached for '{0}'")]
    ContextExhausted(String),

    #[error("rendering context lost for '{0}'")]
    ContextLost(String),

    #[error("load of '{0}' aborted")]
    Aborted(String),

    #[error("circuit open for '{id}', retry in {retry_after:?}")]
    CircuitOpen { id: String, retry_after: Duration },

    #[error("load of '{0}' already in flight")]
    DuplicateInFlight(String),

    #[error("load timed out after {0:?}")]
    Timeout(Duration),
}

impl LoadError {
    pub fn kind(&self) -> LoadErrorKind {
        match self {
            LoadError::Network(_) => LoadErrorKind::Network,
            LoadError::Decode(_) => LoadErrorKind::Decode,
            LoadError::ContextExhausted(_) => LoadErrorKind::ContextExhausted,
            LoadError::ContextLost(_) => LoadErrorKind::ContextLost,
            LoadError::Aborted(_) => LoadErrorKind::Aborted,
            LoadError::CircuitOpen { .. } => LoadErrorKind::CircuitOpen,
            LoadError::DuplicateInFlight(_) => LoadErrorKind::DuplicateInFlight,
            LoadError::Timeout(_) => LoadErrorKind::Timeout,
        }
    }

    /// Expected control states that callers treat as "try later"
    pub fn is_control_state(&self) -> bool {
        matches!(self, LoadError::Aborted(_) | LoadError::CircuitOpen { .. })
    }

    /// Whether the batch loader retries this failure automatically
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoadError::Network(_) | LoadError::Decode(_) | LoadError::ContextLost(_)
        )
    }
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        LoadError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(LoadError::Network("x".into()).kind(), LoadErrorKind::Network);
        assert_eq!(LoadError::Decode("x".into()).kind(), LoadErrorKind::Decode);
        assert_eq!(
            LoadError::CircuitOpen { id: "a".into(), retry_after: Duration::from_secs(1) }.kind(),
            LoadErrorKind::CircuitOpen
        );
        assert_eq!(LoadError::Timeout(Duration::from_secs(10)).kind(), LoadErrorKind::Timeout);
    }

    #[test]
    fn test_control_states() {
        assert!(LoadError::Aborted("a".into()).is_control_state());
        assert!(LoadError::CircuitOpen { id: "a".into(), retry_after: Duration::ZERO }.is_control_state());
        assert!(!LoadError::Decode("bad".into()).is_control_state());
        assert!(!LoadError::ContextExhausted("a".into()).is_control_state());
    }

    #[test]
    fn test_retryable() {
        assert!(LoadError::Network("x".into()).is_retryable());
        assert!(LoadError::Decode("x".into()).is_retryable());
        assert!(LoadError::ContextLost("a".into()).is_retryable());
        assert!(!LoadError::Aborted("a".into()).is_retryable());
        assert!(!LoadError::DuplicateInFlight("a".into()).is_retryable());
        assert!(!LoadError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_io_error_is_network() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(LoadError::from(io).kind(), LoadErrorKind::Network);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(LoadErrorKind::Decode.to_string(), "DecodeError");
        assert_eq!(LoadErrorKind::ContextExhausted.to_string(), "ContextExhausted");
    }
}
