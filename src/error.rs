use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaneError {
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    /// The facade, view, or queue was used after it was disposed.
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    /// A stream subscriber left this many rows unread and the stream was cut off.
    #[error("stream subscriber fell {0} rows behind")]
    StreamBacklog(usize),

    #[error("invalid argument: {0}")]
    ArgumentError(String),

    #[error("blob stream was opened read-only")]
    ReadOnly,

    /// Raised only by `close()`; never attached to an ordinary operation.
    #[error("failed to close SQLite connection: {0}")]
    CloseError(#[source] rusqlite::Error),

    #[error("scoped view is already in use by this operation")]
    Reentrant,

    #[error("queued operation panicked: {0}")]
    OperationPanicked(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl LaneError {
    /// Primary and extended SQLite result codes, when the error came from the engine.
    #[must_use]
    pub fn sqlite_code(&self) -> Option<(rusqlite::ErrorCode, i32)> {
        match self {
            LaneError::SqliteError(rusqlite::Error::SqliteFailure(err, _))
            | LaneError::CloseError(rusqlite::Error::SqliteFailure(err, _)) => {
                Some((err.code, err.extended_code))
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        matches!(self, LaneError::Disposed(_))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LaneError::Cancelled)
    }

    /// Map `SQLITE_INTERRUPT` raised by the progress handler back to a cancellation.
    pub(crate) fn from_interruptible(err: rusqlite::Error, interrupted: bool) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(ffi, _)
                if interrupted && ffi.code == rusqlite::ErrorCode::OperationInterrupted =>
            {
                LaneError::Cancelled
            }
            _ => LaneError::SqliteError(err),
        }
    }
}

impl From<LaneError> for io::Error {
    fn from(err: LaneError) -> Self {
        let kind = match &err {
            LaneError::Disposed(_) => io::ErrorKind::NotConnected,
            LaneError::ArgumentError(_) => io::ErrorKind::InvalidInput,
            LaneError::ReadOnly => io::ErrorKind::PermissionDenied,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
