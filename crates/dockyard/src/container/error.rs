//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// No container runtime binary available.
    #[error("no container runtime available (docker or podman)")]
    NoRuntimeAvailable,

    /// The runtime binary exists but its daemon/socket cannot be reached.
    #[error("container runtime unreachable: {0}")]
    RuntimeUnreachable(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Classify the stderr of a failed runtime command.
    ///
    /// Docker and Podman word these differently, so matching is loose and
    /// case-insensitive.
    pub fn from_stderr(command: &str, target: &str, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if is_unreachable_message(&lower) {
            ContainerError::RuntimeUnreachable(stderr.trim().to_string())
        } else if command != "run" && is_missing_message(&lower) {
            if command.starts_with("image") || command == "pull" {
                ContainerError::ImageNotFound(target.to_string())
            } else {
                ContainerError::ContainerNotFound(target.to_string())
            }
        } else {
            ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            }
        }
    }

    /// Whether the error means the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ContainerError::ContainerNotFound(_) | ContainerError::ImageNotFound(_)
        )
    }
}

pub(crate) fn is_missing_message(lower: &str) -> bool {
    lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("no such volume")
        || lower.contains("no such network")
        || lower.contains("no such image")
        || lower.contains("not found")
        || lower.contains("does not exist")
}

pub(crate) fn is_unreachable_message(lower: &str) -> bool {
    lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("unable to connect to podman")
        || lower.contains("connection refused")
}
