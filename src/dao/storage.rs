use std::{error::Error, io};
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by storage backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transport or session failure; callers decide whether to reconnect.
    #[error("storage connection failed: {message}")]
    Connection {
        message: String,
        /// Whether the peer closed the stream (end-of-stream rather than refusal/timeout).
        eof: bool,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// No session has been established, or it was already closed.
    #[error("storage is not connected")]
    NotConnected,
    /// The requested entity does not exist in its type namespace.
    #[error("entity `{id}` of type `{type_name}` not found")]
    NotFound { type_name: String, id: String },
    /// A stored document does not have the expected shape.
    #[error("failed to decode stored document: {message}")]
    Decode { message: String },
    /// Any other upstream failure (index conflicts, rejected commands...).
    #[error("storage operation failed: {message}")]
    Operation {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A range iterator ran past its last item.
    #[error("iterator exhausted")]
    Exhausted,
    /// A range iterator was polled again after reporting exhaustion.
    #[error("iterator used after exhaustion")]
    IteratorClosed,
}

impl StorageError {
    /// Construct a connection error from any backend failure.
    pub fn connection(
        message: String,
        eof: bool,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        StorageError::Connection {
            message,
            eof,
            source: Box::new(source),
        }
    }

    /// Construct a generic operation error from any backend failure.
    pub fn operation(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Operation {
            message,
            source: Box::new(source),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        StorageError::Decode {
            message: message.into(),
        }
    }

    pub fn not_found(type_name: &str, id: &str) -> Self {
        StorageError::NotFound {
            type_name: type_name.to_owned(),
            id: id.to_owned(),
        }
    }

    /// Error returned by a store whose connection was released with `close`.
    pub fn closed() -> Self {
        StorageError::connection(
            "store has been closed".into(),
            true,
            io::Error::new(io::ErrorKind::NotConnected, "store closed"),
        )
    }

    /// Whether the failure happened at the transport/session level.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            StorageError::Connection { .. } | StorageError::NotConnected
        )
    }

    /// Whether the connection was closed underneath the operation.
    pub fn is_eof(&self) -> bool {
        matches!(self, StorageError::Connection { eof: true, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    /// Whether this is the end-of-sequence marker of a range iterator.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, StorageError::Exhausted)
    }
}
