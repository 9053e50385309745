//! Engine-level error types.

use thiserror::Error;

use crate::container::ContainerError;
use crate::resource::ResourceStatus;

/// Result type for lifecycle operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the lifecycle controller and readiness monitor.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("resource {0} is already running")]
    AlreadyRunning(String),

    #[error("resource {0} is already stopped")]
    AlreadyStopped(String),

    #[error("cannot {operation} resource {id} while it is {status}")]
    InvalidState {
        id: String,
        operation: &'static str,
        status: ResourceStatus,
    },

    #[error("{operation} already in progress for resource {id}")]
    OperationInProgress { id: String, operation: &'static str },

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("container for resource {0} disappeared")]
    ContainerMissing(String),

    #[error("no free ports left in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("invalid proxy configuration: {0}")]
    ProxyConfigInvalid(String),

    #[error("resource {id} did not become ready after {checks} checks")]
    ReadinessTimeout { id: String, checks: u32 },

    #[error(transparent)]
    Runtime(ContainerError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ContainerError> for EngineError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::NoRuntimeAvailable => EngineError::RuntimeUnavailable(err.to_string()),
            ContainerError::RuntimeUnreachable(message) => EngineError::RuntimeUnavailable(message),
            ContainerError::ImageNotFound(image) => EngineError::ImageNotFound(image),
            ContainerError::InvalidInput(message) => EngineError::InvalidRequest(message),
            other => EngineError::Runtime(other),
        }
    }
}
