use bridge_traits::BridgeError;
use thiserror::Error;

use crate::models::{QueueStatus, ResourceId};

#[derive(Error, Debug)]
pub enum OfflineError {
    /// The remote fetch failed; retried automatically by the queue.
    #[error("Transfer failed for {resource_id}: {message}")]
    Transfer {
        resource_id: ResourceId,
        message: String,
        /// HTTP status when the server answered
        status: Option<u16>,
    },

    /// Writing or deleting local media failed; never retried automatically.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Metadata and disk disagree. Handled inside recovery.
    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Resource {0} is already queued")]
    DuplicateRequest(ResourceId),

    #[error("Queue item {0} not found")]
    ItemNotFound(String),

    #[error("Cannot {action} an item that is {status}")]
    InvalidTransition {
        status: QueueStatus,
        action: &'static str,
    },

    #[error("Offline storage is not initialized")]
    NotInitialized,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),
}

impl OfflineError {
    pub fn transfer(resource_id: &ResourceId, message: impl Into<String>) -> Self {
        Self::Transfer {
            resource_id: resource_id.clone(),
            message: message.into(),
            status: None,
        }
    }

    /// Whether the queue may schedule another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transfer { .. })
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, OfflineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transfer_errors_retry() {
        let id = ResourceId::new("track-1");
        assert!(OfflineError::transfer(&id, "connection reset").is_retryable());
        assert!(!OfflineError::Storage("disk full".to_string()).is_retryable());
        assert!(OfflineError::Storage("disk full".to_string()).is_storage());
        assert!(!OfflineError::NotInitialized.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = OfflineError::InvalidTransition {
            status: QueueStatus::Completed,
            action: "pause",
        };
        assert_eq!(err.to_string(), "Cannot pause an item that is completed");

        let err = OfflineError::Transfer {
            resource_id: ResourceId::new("track-9"),
            message: "HTTP 503".to_string(),
            status: Some(503),
        };
        assert_eq!(err.to_string(), "Transfer failed for track-9: HTTP 503");
    }
}
