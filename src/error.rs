use std::io;

use thiserror::Error;

/// Central error type for the server core.
///
/// Only startup and lifecycle failures surface through this type; a
/// failing connection is always resolved locally (an HTTP error reply
/// or a close) and never propagates past the connection boundary.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid bind configuration: {0}")]
    Bind(String),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("privilege drop failed: {0}")]
    Privilege(#[source] io::Error),

    #[error("signal handler installation failed: {0}")]
    Signal(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
