//! Error types for remote execution

use std::time::Duration;
use thiserror::Error;

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Host does not accept connections yet; worth retrying
    #[error("Host {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    /// Host answered but refused the credentials; retrying cannot help
    #[error("Authentication rejected for {username}@{address}")]
    AuthRejected { address: String, username: String },

    #[error("SSH connection refused after {attempts} retries")]
    RetriesExhausted { address: String, attempts: u32 },

    #[error("Command did not complete within {timeout:?}: {command}")]
    CommandIncomplete { command: String, timeout: Duration },

    #[error("Remote process finished without an exit status: {command}")]
    StatusUnavailable { command: String },

    #[error("Session to {host} is closed")]
    SessionClosed { host: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Unreachable { .. })
    }
}

impl From<ssh2::Error> for RemoteError {
    fn from(e: ssh2::Error) -> Self {
        RemoteError::Transport(e.to_string())
    }
}
