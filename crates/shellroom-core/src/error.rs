use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the study room core and surfaced at the client boundary.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("invalid username: {0}")]
    InvalidUsernameFormat(String),

    #[error("weak password: {0}")]
    WeakPassword(String),

    #[error("username already taken: {0}")]
    UsernameTaken(String),

    #[error("bad credential")]
    BadCredential,

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("session creation failed: {0}")]
    SessionCreationFailed(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("no active container for {0}")]
    NoActiveContainer(String),

    #[error("session not found: {0}")]
    SessionNotFound(u64),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Stable error categories shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidUsername,
    WeakPassword,
    UsernameTaken,
    BadCredential,
    ProvisioningFailed,
    SessionCreationFailed,
    RuntimeUnavailable,
    NoActiveContainer,
    NotJoined,
    RateLimited,
    InvalidMessage,
    Internal,
}

impl RoomError {
    /// The client-visible category of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RoomError::InvalidUsernameFormat(_) => ErrorCode::InvalidUsername,
            RoomError::WeakPassword(_) => ErrorCode::WeakPassword,
            RoomError::UsernameTaken(_) => ErrorCode::UsernameTaken,
            RoomError::BadCredential => ErrorCode::BadCredential,
            RoomError::ProvisioningFailed(_) => ErrorCode::ProvisioningFailed,
            RoomError::SessionCreationFailed(_) => ErrorCode::SessionCreationFailed,
            RoomError::RuntimeUnavailable(_) => ErrorCode::RuntimeUnavailable,
            RoomError::NoActiveContainer(_) => ErrorCode::NoActiveContainer,
            RoomError::SessionNotFound(_) => ErrorCode::NotJoined,
            RoomError::RateLimited(_) => ErrorCode::RateLimited,
            RoomError::InvalidMessage(_) | RoomError::Codec(_) => ErrorCode::InvalidMessage,
            RoomError::Transport(_)
            | RoomError::Storage(_)
            | RoomError::Io(_)
            | RoomError::Other(_) => ErrorCode::Internal,
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for RoomError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        RoomError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for RoomError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        RoomError::Codec(e.to_string())
    }
}

pub type RoomResult<T> = Result<T, RoomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_and_credential_errors_are_distinguishable() {
        assert_ne!(
            RoomError::ProvisioningFailed("boom".into()).code(),
            RoomError::BadCredential.code()
        );
        assert_eq!(
            RoomError::RuntimeUnavailable("docker".into()).code(),
            ErrorCode::RuntimeUnavailable
        );
    }

    #[test]
    fn internal_errors_collapse_to_one_code() {
        assert_eq!(RoomError::Storage("db".into()).code(), ErrorCode::Internal);
        assert_eq!(RoomError::Other("x".into()).code(), ErrorCode::Internal);
    }
}
