//! Container runtime error types.

use shellroom_core::RoomError;
use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur while driving the container runtime.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime command ran but reported failure.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Failed to parse runtime output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// The runtime binary could not be executed at all.
    #[error("no container runtime available: {0}")]
    NoRuntimeAvailable(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether the error means the engine itself is unreachable, as opposed
    /// to a single operation failing.
    pub fn is_unavailable(&self) -> bool {
        match self {
            ContainerError::NoRuntimeAvailable(_) => true,
            ContainerError::CommandFailed { message, .. } => {
                message.contains("Cannot connect to the Docker daemon")
                    || message.contains("Is the docker daemon running")
            }
            _ => false,
        }
    }
}

impl From<ContainerError> for RoomError {
    fn from(e: ContainerError) -> Self {
        if e.is_unavailable() {
            RoomError::RuntimeUnavailable(e.to_string())
        } else {
            RoomError::ProvisioningFailed(e.to_string())
        }
    }
}
