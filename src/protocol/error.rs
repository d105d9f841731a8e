//! Session-level errors and their AMQP 0-10 error codes.

use thiserror::Error;

/// Errors surfaced by session command handling.
///
/// Channel exceptions (`Unauthorized` through `InvalidArgument`) close the
/// session but keep the connection; `Framing` and `Internal` are fatal to
/// the attachment and surfaced to the transport collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("unauthorized-access: {0}")]
    Unauthorized(String),
    #[error("not-found: {0}")]
    NotFound(String),
    #[error("resource-locked: {0}")]
    ResourceLocked(String),
    #[error("precondition-failed: {0}")]
    PreconditionFailed(String),
    #[error("illegal-state: {0}")]
    IllegalState(String),
    #[error("not-allowed: {0}")]
    NotAllowed(String),
    #[error("not-implemented: {0}")]
    NotImplemented(String),
    #[error("internal-error: {0}")]
    Internal(String),
    #[error("invalid-argument: {0}")]
    InvalidArgument(String),
    #[error("framing-error: {0}")]
    Framing(String),
}

impl SessionError {
    /// AMQP 0-10 execution exception error code.
    pub fn code(&self) -> u16 {
        match self {
            SessionError::Unauthorized(_) => 403,
            SessionError::NotFound(_) => 404,
            SessionError::ResourceLocked(_) => 405,
            SessionError::PreconditionFailed(_) => 406,
            SessionError::IllegalState(_) => 409,
            SessionError::NotAllowed(_) => 530,
            SessionError::NotImplemented(_) => 540,
            SessionError::Internal(_) => 541,
            SessionError::InvalidArgument(_) => 542,
            SessionError::Framing(_) => 501,
        }
    }

    /// True for errors that abort the session rather than close it cleanly.
    pub fn aborts_session(&self) -> bool {
        matches!(self, SessionError::Internal(_) | SessionError::Framing(_))
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
