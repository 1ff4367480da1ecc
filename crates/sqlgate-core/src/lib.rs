//! Core types for sqlgate.
//!
//! `sqlgate-core` holds the leaf types shared by the concurrency layer and
//! by engine implementations:
//!
//! - [`Value`] - dynamically-typed SQL values for parameter binding and rows
//! - [`Row`] - a query result row with index- and name-based access
//! - [`Error`] - the error taxonomy for every sqlgate operation
//!
//! All async operations in the sqlgate crates integrate with asupersync's
//! structured concurrency: they take a `Cx` context and return an
//! `Outcome`, so cancellation is an explicit third channel next to success
//! and failure rather than an error variant.

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConnectionError, ConnectionErrorKind, Error, PreparedError, PreparedErrorKind, ProtocolError,
    QueryError, Result, TransactionError, TransactionErrorKind,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;

// Re-export asupersync primitives used across the API surface.
pub use asupersync::{Cx, Outcome};
