use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::StatusCode;

/// A central error enum for session and transfer errors.
///
/// The enum is `Clone` so that a single session failure can be delivered to
/// every request still waiting on that session.
#[derive(Debug, Clone, Error)]
pub enum SftpError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected for {username}@{host}: {reason}")]
    AuthRejected {
        username: String,
        host: String,
        reason: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request {request_id} timed out after {after:?}")]
    RequestTimeout { request_id: u32, after: Duration },

    #[error("integrity check failed for transfer {transfer_id}: local {local}, remote {remote}")]
    Integrity {
        transfer_id: String,
        local: String,
        remote: String,
    },

    #[error("transfer {transfer_id} on profile {profile_id} failed at offset {offset}: {reason}")]
    TransferFailed {
        profile_id: String,
        transfer_id: String,
        offset: u64,
        reason: Box<SftpError>,
    },

    #[error("remote status {code:?}: {message}")]
    Status { code: StatusCode, message: String },

    #[error("session closed")]
    SessionClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("no credential available for profile {0}")]
    MissingCredential(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

/// Convert from std::io::Error.
impl From<std::io::Error> for SftpError {
    fn from(err: std::io::Error) -> SftpError {
        SftpError::Io(Arc::new(err))
    }
}

impl SftpError {
    /// Errors after which the owning session cannot carry further requests.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SftpError::Unreachable(_)
                | SftpError::AuthRejected { .. }
                | SftpError::Protocol(_)
                | SftpError::SessionClosed
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SftpError::RequestTimeout { .. })
    }

    /// Status code of a remote error reply, if this is one.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            SftpError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Strip transfer context and return the underlying cause.
    pub fn root_cause(&self) -> &SftpError {
        match self {
            SftpError::TransferFailed { reason, .. } => reason.root_cause(),
            other => other,
        }
    }
}
