use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Queue name is empty"))]
    EmptyName,

    #[snafu(display("Queue {queue} already exists"))]
    QueueAlreadyExists { queue: String },

    #[snafu(display("Queue {queue} not found"))]
    QueueNotFound { queue: String },

    #[snafu(display("Consumer name is not provided"))]
    ConsumerNameNotProvided,

    #[snafu(display("Consumer name is not a string"))]
    ConsumerNameNotString,

    #[snafu(display("No message to dequeue from {queue}"))]
    NoMessageToDequeue { queue: String },

    #[snafu(display("Message {message_id} is not pending in {queue}"))]
    NotPending { queue: String, message_id: i64 },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Submission rejected: {reason}"))]
    AccessDenied { reason: String },

    #[snafu(display("Invalid node number {node}: must be between 0 and {max}"))]
    InvalidNodeNumber { node: i64, max: i64 },

    #[snafu(display("{operation} on {resource} timed out after {millis}ms"))]
    Timeout {
        operation: &'static str,
        resource: String,
        millis: u128,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Malformed payload"))]
    Serde {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Internal error"))]
    InternalError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serde { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalError { source: Some(e) }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalError {
            source: Some(e.into()),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn access_denied(reason: impl Into<String>) -> Self {
        Self::AccessDenied {
            reason: reason.into(),
        }
    }

    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }

    /// Caller mistakes. These are returned as-is and never retried.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::EmptyName
                | Self::QueueAlreadyExists { .. }
                | Self::QueueNotFound { .. }
                | Self::ConsumerNameNotProvided
                | Self::ConsumerNameNotString
                | Self::NotPending { .. }
                | Self::NotFound { .. }
                | Self::InvalidParameter { .. }
                | Self::AccessDenied { .. }
        )
    }

    /// The queue had nothing to hand out. Pollers should treat this as a
    /// normal outcome.
    pub fn is_empty_queue(&self) -> bool {
        matches!(self, Self::NoMessageToDequeue { .. })
    }

    /// Backend failures that may succeed when attempted again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Sqlx { source } => match source {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(e) => e.code().is_some_and(|code| is_busy_code(&code)),
                _ => false,
            },
            _ => false,
        }
    }

    pub(crate) fn is_unique_violation(&self) -> bool {
        match self {
            Self::Sqlx {
                source: sqlx::Error::Database(e),
            } => e.is_unique_violation(),
            _ => false,
        }
    }
}

/// SQLITE_BUSY and SQLITE_LOCKED, including their extended codes.
fn is_busy_code(code: &str) -> bool {
    code.parse::<i32>()
        .is_ok_and(|code| matches!(code & 0xff, 5 | 6))
}
