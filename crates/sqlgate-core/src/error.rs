//! Error types for sqlgate operations.
//!
//! The taxonomy follows the coordination layer's failure surface:
//!
//! - [`ConnectionError`] - the gate/dispatcher/connection was torn down
//! - [`QueryError`] - the embedded engine rejected a statement; carries the
//!   engine-specific status code verbatim
//! - [`TransactionError`] - operating on a closed transaction or savepoint
//! - [`PreparedError`] - operating on a closed or unknown prepared handle
//! - [`ProtocolError`] - a reply did not have the shape the request implies
//!
//! Cancellation is *not* an error variant: it travels as
//! `Outcome::Cancelled` on every async operation. Invariant violations
//! (double unlock, releasing an unheld gate) are programmer errors and
//! panic rather than surfacing here.

use std::fmt;

/// Result alias over [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The primary error type for all sqlgate operations.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Error {
    /// Gate/dispatcher/connection teardown errors
    Connection(ConnectionError),
    /// Statement errors reported by the embedded engine
    Query(QueryError),
    /// Transaction and savepoint lifecycle errors
    Transaction(TransactionError),
    /// Prepared-handle lifecycle errors
    Prepared(PreparedError),
    /// Reply-shape errors at the cross-thread boundary
    Protocol(ProtocolError),
}

/// Teardown-related errors.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConnectionErrorKind {
    /// Operation attempted after the connection was closed
    Closed,
    /// The worker thread is gone without a close handshake
    WorkerGone,
}

/// A statement the engine rejected.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueryError {
    pub message: String,
    /// Engine-specific status code, surfaced verbatim.
    pub status: Option<i32>,
    /// The statement that failed, when known.
    pub sql: Option<String>,
}

/// Transaction/savepoint lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransactionErrorKind {
    /// Commit or rollback already issued; the handle is terminal
    AlreadyClosed,
    /// Downgrade requested without a downgrade hook
    DowngradeUnsupported,
}

/// Prepared-handle lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PreparedError {
    pub kind: PreparedErrorKind,
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PreparedErrorKind {
    /// The handle was closed by the caller
    Closed,
    /// The worker has no statement registered under this id
    NotFound,
}

/// A reply whose shape does not match the request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProtocolError {
    pub message: String,
}

impl Error {
    /// Teardown error for a closed connection.
    pub fn closed(path: &str) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Closed,
            message: format!("db already closed: {path}"),
        })
    }

    /// Teardown error for a worker that vanished mid-operation.
    pub fn worker_gone() -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::WorkerGone,
            message: "connection worker terminated unexpectedly".to_string(),
        })
    }

    /// Engine statement error with an engine status code.
    pub fn query(message: impl Into<String>, status: Option<i32>) -> Self {
        Error::Query(QueryError {
            message: message.into(),
            status,
            sql: None,
        })
    }

    /// Already-closed transaction error.
    pub fn transaction_closed() -> Self {
        Error::Transaction(TransactionError {
            kind: TransactionErrorKind::AlreadyClosed,
            message: "transaction already closed".to_string(),
        })
    }

    /// Already-closed savepoint error.
    pub fn savepoint_closed(name: &str) -> Self {
        Error::Transaction(TransactionError {
            kind: TransactionErrorKind::AlreadyClosed,
            message: format!("savepoint already closed: {name}"),
        })
    }

    /// Closed prepared-handle error.
    pub fn prepared_closed(id: u64) -> Self {
        Error::Prepared(PreparedError {
            kind: PreparedErrorKind::Closed,
            id,
        })
    }

    /// Unknown prepared-handle error.
    pub fn prepared_not_found(id: u64) -> Self {
        Error::Prepared(PreparedError {
            kind: PreparedErrorKind::NotFound,
            id,
        })
    }

    /// Reply-shape error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
        })
    }

    /// True when this error reports teardown of the connection.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Closed,
                ..
            })
        )
    }

    /// The engine status code, when this is an engine error that carries one.
    pub fn status(&self) -> Option<i32> {
        match self {
            Error::Query(e) => e.status,
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "connection error: {}", e.message),
            Error::Query(e) => match e.status {
                Some(code) => write!(f, "query error (status {code}): {}", e.message),
                None => write!(f, "query error: {}", e.message),
            },
            Error::Transaction(e) => write!(f, "transaction error: {}", e.message),
            Error::Prepared(e) => match e.kind {
                PreparedErrorKind::Closed => write!(f, "prepared({}) already closed", e.id),
                PreparedErrorKind::NotFound => write!(f, "not found prepared({})", e.id),
            },
            Error::Protocol(e) => write!(f, "protocol error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {}
