//! Error types for the data-access layer
//!
//! One crate-wide taxonomy shared by every backend. Each variant is a stable
//! error kind; backend-native errors are preserved as an attached cause and
//! never swallowed.

use thiserror::Error;

/// Result type alias for all ORM operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Error taxonomy for ORM operations
#[derive(Debug, Error)]
pub enum OrmError {
    /// Condition or select referenced a column the schema does not declare
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    /// Condition tree used an operator key no compiler understands
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    /// Group specification used an aggregate key no compiler understands
    #[error("unknown aggregate '{0}'")]
    UnknownAggregate(String),

    /// Manipulate batch contained an unrecognized directive
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Zero rows where exactly one was required
    #[error("record not found in '{0}'")]
    NotFound(String),

    /// Unique constraint violation, normalized across backends
    #[error("duplicate key in '{0}'")]
    DuplicateKey(String),

    /// A required column was missing or null on create
    #[error("required field '{0}' is missing")]
    RequiredFieldMissing(String),

    /// Restrict integrity policy tripped: dependent rows exist
    #[error("integrity violation on '{0}': dependent records exist")]
    IntegrityViolation(String),

    /// Operation issued against a committed or rolled-back transaction
    #[error("transaction already finished")]
    TransactionFinished,

    /// Connection establishment or pool failure
    #[error("connection error: {message}")]
    Connection {
        message: String,
        /// Transient failures are retried with backoff; auth failures are not
        retryable: bool,
    },

    /// Opaque backend error passthrough with the native cause attached
    #[error("backend error: {message}")]
    UnknownBackend {
        message: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl OrmError {
    /// Retryable connection failure with a transient cause
    pub fn retryable_connection(message: impl Into<String>) -> Self {
        OrmError::Connection {
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent connection failure (bad credentials, bad database name)
    pub fn permanent_connection(message: impl Into<String>) -> Self {
        OrmError::Connection {
            message: message.into(),
            retryable: false,
        }
    }

    /// Opaque passthrough keeping the native error for diagnostics
    pub fn backend(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        OrmError::UnknownBackend {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Opaque passthrough from a bare message
    pub fn backend_message(message: impl Into<String>) -> Self {
        OrmError::UnknownBackend {
            message: message.into(),
            cause: None,
        }
    }

    /// True for connection errors worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrmError::Connection { retryable: true, .. })
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::UnknownBackend {
            message: format!("serialization failed: {}", err),
            cause: Some(Box::new(err)),
        }
    }
}
