//! Error type shared across the workspace.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowkeeperError>;

#[derive(Debug, Error)]
pub enum FlowkeeperError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Store-level failure that is not a plain SQL error (poisoned connection, bad row data).
    #[error("Store error: {0}")]
    Store(String),

    /// The external flow/broadcast engine failed or was unreachable.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),
}

impl FlowkeeperError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FlowkeeperError::upstream("engine unreachable");
        assert_eq!(err.to_string(), "Upstream error: engine unreachable");
    }

    #[test]
    fn test_from_serde() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: FlowkeeperError = parse.unwrap_err().into();
        assert!(matches!(err, FlowkeeperError::Serialization(_)));
    }
}
