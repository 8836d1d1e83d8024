//! Storage error types.

use arbor_core::CoreError;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("slot not found: {0}")]
    SlotNotFound(String),

    #[error("invalid slot name: {0:?}")]
    InvalidSlotName(String),

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl StorageError {
    pub fn is_corruption(&self) -> bool {
        match self {
            StorageError::Corruption(_) | StorageError::RecordTooLarge { .. } | StorageError::Json(_) => true,
            StorageError::Core(e) => e.is_corruption(),
            _ => false,
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Core(e) => e,
            StorageError::Json(e) => CoreError::Json(e),
            e @ (StorageError::Corruption(_) | StorageError::RecordTooLarge { .. }) => CoreError::CorruptData {
                reason: e.to_string(),
            },
            other => CoreError::Backend(other.to_string()),
        }
    }
}
