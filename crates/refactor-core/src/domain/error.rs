//! Domain-level error taxonomy for refactor-bot.

use refactor_state::StorageError;

/// refactor-bot domain errors.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// Network failure, timeout, 5xx or 429 from a collaborator. Retried
    /// with bounded backoff before it surfaces.
    #[error("transient failure calling {service}: {message}")]
    TransientExternal { service: String, message: String },

    /// Non-retryable rejection from a collaborator (4xx other than 408/429).
    #[error("{service} rejected request with status {status}: {message}")]
    External {
        service: String,
        status: u16,
        message: String,
    },

    /// Compare-and-set lost twice in a row, or the fresh state no longer
    /// supports the decision that was about to be committed.
    #[error("persistence conflict on {repo_id}: {detail}")]
    PersistenceConflict { repo_id: String, detail: String },

    /// Malformed repository configuration or broken operator setup.
    /// The cycle is aborted before any PR is attempted.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BotError {
    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        BotError::TransientExternal {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Whether the failed call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, BotError::TransientExternal { .. })
    }

    /// Whether operators must act before the bot can make progress.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::FatalConfig(_))
    }
}

/// Result type for refactor-bot domain operations.
pub type Result<T> = std::result::Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = BotError::transient("github", "connection reset");
        assert!(err.is_transient());
        assert!(err.to_string().contains("github"));

        let err = BotError::External {
            service: "github".to_string(),
            status: 422,
            message: "Reference already exists".to_string(),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("422"));
    }

    #[test]
    fn test_fatal_config_display() {
        let err = BotError::FatalConfig("flake8 not found on PATH".to_string());
        assert!(err.is_fatal());
        assert!(err.to_string().contains("fatal configuration error"));
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: BotError = StorageError::Backend("db down".to_string()).into();
        assert!(matches!(err, BotError::Storage(_)));
        assert!(err.to_string().contains("db down"));
    }
}
