//! SSH error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during SSH operations
#[derive(Debug, Error)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("No SSH keys found in {0}")]
    NoKeysFound(PathBuf),

    #[error("Failed to load SSH key {path}: {reason}")]
    KeyLoad { path: PathBuf, reason: String },

    #[error("Host key verification failed for {host}: {reason}")]
    HostKeyVerification { host: String, reason: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Command could not be started: {0}")]
    CommandFailed(String),

    #[error("{}", describe_missing_exit(.signal))]
    NoExitStatus { signal: Option<String> },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Not connected")]
    NotConnected,

    #[error("SSH protocol error: {0}")]
    Protocol(String),
}

/// Broad failure categories callers can match on without caring about the
/// exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network setup, authentication or host key rejection.
    Connection,
    /// The remote side refused to start the command.
    CommandExecution,
    /// Reading or writing a process stream failed, or the channel went away.
    StreamIo,
    /// A put/get or other SFTP operation failed.
    Transfer,
}

impl SshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SshError::Connection(_)
            | SshError::Authentication(_)
            | SshError::NoKeysFound(_)
            | SshError::KeyLoad { .. }
            | SshError::HostKeyVerification { .. }
            | SshError::Timeout(_)
            | SshError::NotConnected
            | SshError::Protocol(_) => ErrorKind::Connection,
            SshError::CommandFailed(_) => ErrorKind::CommandExecution,
            SshError::NoExitStatus { .. } | SshError::Channel(_) | SshError::Io(_) => {
                ErrorKind::StreamIo
            }
            SshError::Transfer(_) | SshError::FileNotFound(_) => ErrorKind::Transfer,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        SshError::Protocol(e.to_string())
    }
}

fn describe_missing_exit(signal: &Option<String>) -> String {
    match signal {
        Some(signal) => format!("Remote command terminated by signal {signal}"),
        None => "Channel closed without an exit status".to_string(),
    }
}

/// Result type for SSH operations
pub type SshResult<T> = std::result::Result<T, SshError>;
