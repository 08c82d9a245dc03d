use perch_core::{EventBusError, PerchError};
use perch_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("{entity} is missing {field}")]
    MissingField {
        entity: &'static str,
        field: &'static str,
    },

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<IngestError> for PerchError {
    fn from(error: IngestError) -> Self {
        match error {
            IngestError::EventBus(error) => PerchError::EventBus(error),
            other => PerchError::Store(other.to_string()),
        }
    }
}

/// Failure of a single group metadata fetch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("group {0} not found")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected")]
    NotConnected,
}

impl From<FetchError> for PerchError {
    fn from(error: FetchError) -> Self {
        PerchError::Transport(error.to_string())
    }
}
