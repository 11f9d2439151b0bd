use snafu::Snafu;

/// SQLite primary result codes that indicate lock contention rather than a failure.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Queue {queue} does not exist"))]
    QueueNotFound { queue: String },

    #[snafu(display("Failed to send message to {queue}"))]
    SendFailed {
        queue: String,
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Operation cancelled"))]
    Cancelled,

    #[snafu(display("Invalid queue address: {message}"))]
    InvalidAddress { message: String },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Invalid state: {message}"))]
    InvalidState { message: String },

    #[snafu(display("Transaction scope timed out"))]
    ScopeTimedOut,

    #[snafu(display("Enlisted resource failed to prepare"))]
    EnlistmentFailed {
        #[snafu(source(false))]
        source: eyre::Report,
    },

    #[snafu(display("Failed to serialize message headers"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Internal error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Internal { source: Some(e) }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }

    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }

    pub fn invalid_address(message: impl Into<String>) -> Self {
        Self::InvalidAddress {
            message: message.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Maps a storage error raised while writing to `queue`.
    pub(crate) fn from_send(queue: impl Into<String>, source: sqlx::Error) -> Self {
        let queue = queue.into();
        if is_missing_table(&source) {
            Self::QueueNotFound { queue }
        } else {
            Self::SendFailed { queue, source }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the error is the engine refusing a lock, the expected outcome of contention
    /// between concurrent receive transactions.
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Self::Sqlx { source } | Self::SendFailed { source, .. } => is_lock_contention(source),
            _ => false,
        }
    }
}

pub(crate) fn is_missing_table(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.message().starts_with("no such table"),
        _ => false,
    }
}

pub(crate) fn is_lock_contention(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false),
        _ => false,
    }
}
