//! Cross-thread request/reply envelope.
//!
//! Callers never talk to the engine directly: every operation is encoded as
//! a [`Request`], carried over the connection worker's queue, and answered
//! with a [`Payload`]. When the dispatcher coalesces several concurrently
//! submitted calls it wraps them into [`Request::Task`] and the service
//! answers with [`Payload::Task`], an ordered array of per-call outcomes.
//!
//! All types here are serde-serializable: they are the wire shape of the
//! thread boundary.

use serde::{Deserialize, Serialize};
use sqlgate_core::row::Entries;
use sqlgate_core::{Error, Row, Value};

/// A method invoked on a previously prepared statement handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// Finalize the handle and release engine resources
    Close,
    /// Column names of the compiled query
    Columns,
    /// First resulting row, if any
    First,
    /// First resulting row as key-value entries
    FirstEntry,
    /// All resulting rows
    All,
    /// All resulting rows as key-value entries
    AllEntries,
    /// Run ignoring any resulting rows
    Execute,
    /// The SQL text with placeholders expanded
    ExpandSql,
}

impl Method {
    /// Human-readable name, used in trace output.
    pub const fn name(&self) -> &'static str {
        match self {
            Method::Close => "close",
            Method::Columns => "columns",
            Method::First => "first",
            Method::FirstEntry => "firstEntry",
            Method::All => "all",
            Method::AllEntries => "allEntries",
            Method::Execute => "execute",
            Method::ExpandSql => "expandSql",
        }
    }

    /// Whether this method produces a value the caller will read.
    pub const fn returns_value(&self) -> bool {
        !matches!(self, Method::Close | Method::Execute)
    }
}

/// Target of a batch item: raw SQL text or a prepared handle id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// SQL text
    Sql(String),
    /// Prepared handle id
    Handle(u64),
}

/// One operation inside a batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub statement: Statement,
    pub args: Vec<Value>,
    /// Whether this item contributes a slot to the reply
    pub result: bool,
    /// Return query rows as key-value entries
    pub entries: bool,
    /// Compile `statement` into a new prepared handle
    pub prepare: bool,
    /// Invoke a method on the handle named by `statement`
    pub method: Option<Method>,
}

impl BatchItem {
    /// A plain SQL item with no reply slot.
    pub fn sql(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            statement: Statement::Sql(sql.into()),
            args,
            result: false,
            entries: false,
            prepare: false,
            method: None,
        }
    }

    /// A SQL item that returns rows.
    pub fn query(sql: impl Into<String>, args: Vec<Value>, entries: bool) -> Self {
        Self {
            statement: Statement::Sql(sql.into()),
            args,
            result: true,
            entries,
            prepare: false,
            method: None,
        }
    }

    /// An item that compiles a new prepared handle.
    pub fn prepare(sql: impl Into<String>) -> Self {
        Self {
            statement: Statement::Sql(sql.into()),
            args: Vec::new(),
            result: true,
            entries: false,
            prepare: true,
            method: None,
        }
    }

    /// A method call on an existing prepared handle.
    pub fn method(handle: u64, method: Method, args: Vec<Value>, result: bool) -> Self {
        Self {
            statement: Statement::Handle(handle),
            args,
            result,
            entries: false,
            prepare: false,
            method: Some(method),
        }
    }
}

/// A unit of work submitted to the connection worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Execute a statement, discarding rows
    Execute { sql: String, args: Vec<Value> },
    /// Execute a statement and return its rows
    Query {
        sql: String,
        args: Vec<Value>,
        entries: bool,
    },
    /// Compile a statement into a prepared handle
    Prepare { sql: String },
    /// Invoke a method on a prepared handle
    Method {
        handle: u64,
        method: Method,
        args: Vec<Value>,
        /// Whether the caller wants the method's value back
        want: bool,
    },
    /// Execute an ordered list of heterogeneous operations
    Batch {
        /// Wrap the whole list in an auto-named savepoint
        savepoint: bool,
        items: Vec<BatchItem>,
    },
    /// Terminate the engine connection
    Close { force: bool },
    /// Coalesced envelope: several calls, one round trip.
    ///
    /// Built only by the dispatcher; callers never construct this.
    Task(Vec<Request>),
}

/// Reply slot for one result-bearing batch item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemReply {
    /// Rows from a query item
    Rows(Vec<Row>),
    /// Entries from a query item with `entries: true`
    Entries(Vec<Entries>),
    /// Handle id from a prepare item
    Prepared(u64),
    /// Value from a method item
    Method(Payload),
}

/// The data half of a successful reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// No value (execute-shaped requests)
    None,
    /// Query rows
    Rows(Vec<Row>),
    /// Query rows as key-value entries
    Entries(Vec<Entries>),
    /// A single optional row (`Method::First`)
    Row(Option<Row>),
    /// A single optional row as entries (`Method::FirstEntry`)
    EntriesRow(Option<Entries>),
    /// Prepared handle id
    Handle(u64),
    /// Column names (`Method::Columns`)
    Columns(Vec<String>),
    /// Expanded SQL text (`Method::ExpandSql`)
    Sql(String),
    /// Ordered reply slots of a batch request
    Items(Vec<ItemReply>),
    /// Ordered per-call outcomes of a coalesced task envelope
    Task(Vec<Result<Payload, Error>>),
}
