//! Core error types.

use thiserror::Error;

/// Errors from the automaton engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("instance not found: {instance}")]
    InstanceNotFound { instance: String },

    #[error("instance already exists: {instance}")]
    InstanceExists { instance: String },

    #[error("system not found: {system}")]
    SystemNotFound { system: String },

    #[error("node not found: {node}")]
    NodeNotFound { node: String },

    #[error("instance '{instance}' has no current node")]
    NotInitialized { instance: String },

    #[error("invalid content: {reason}")]
    InvalidContent { reason: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },

    #[error("invalid parameters for variant '{tag}': {reason}")]
    InvalidVariant { tag: String, reason: String },

    #[error("corrupt save data: {reason}")]
    CorruptData { reason: String },

    #[error("no save backend configured")]
    NoBackend,

    #[error("save backend error: {0}")]
    Backend(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns whether this error aborts only the current load.
    pub fn is_corruption(&self) -> bool {
        matches!(self, CoreError::CorruptData { .. } | CoreError::Json(_))
    }

    /// Returns a stable code for host-side reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            CoreError::InstanceExists { .. } => "INSTANCE_EXISTS",
            CoreError::SystemNotFound { .. } => "SYSTEM_NOT_FOUND",
            CoreError::NodeNotFound { .. } => "NODE_NOT_FOUND",
            CoreError::NotInitialized { .. } => "NOT_INITIALIZED",
            CoreError::InvalidContent { .. } => "INVALID_CONTENT",
            CoreError::InvalidGuard { .. } => "INVALID_CONTENT",
            CoreError::InvalidVariant { .. } => "INVALID_CONTENT",
            CoreError::CorruptData { .. } => "CORRUPT_DATA",
            CoreError::NoBackend => "NO_BACKEND",
            CoreError::Backend(_) => "IO_ERROR",
            CoreError::Json(_) => "CORRUPT_DATA",
        }
    }
}
