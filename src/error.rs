use std::io;

use thiserror::Error;

/// Central error type for the server.
///
/// Fatal variants (`Listen`, `Epoll`, `Db` at startup) terminate the process
/// with exit code 1; everything per-connection is recovered locally by
/// closing that one connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("listen socket setup failed: {0}")]
    Listen(io::Error),

    #[error("epoll setup failed: {0}")]
    Epoll(io::Error),

    #[error("signal bridge setup failed: {0}")]
    Signals(io::Error),

    #[error("database error: {0}")]
    Db(String),

    #[error("log sink setup failed: {0}")]
    LogInit(String),
}

impl From<postgres::Error> for ServerError {
    fn from(e: postgres::Error) -> Self {
        ServerError::Db(e.to_string())
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
