//! Concurrency control and request coordination for embedded SQL engines.
//!
//! `sqlgate` sits in front of an embedded SQL engine that runs off the
//! caller's thread of control, and lets many logical callers issue reads,
//! writes, transactions, and prepared-statement operations concurrently
//! against that single serialized connection while minimizing cross-thread
//! round trips.
//!
//! # Architecture
//!
//! - [`Gate`] - an async reader/writer lock built from message passing: a
//!   dedicated arbiter consumes typed intents and is the only code that
//!   mutates the lock state, so no native lock guards it.
//! - [`Dispatcher`] - a single-consumer loop that owns the engine. Calls
//!   submitted while it is busy are opportunistically merged into one task
//!   envelope, so N contended callers cost one round trip instead of N.
//! - `Session` - pairs the gate with the dispatcher to give every operation
//!   lock-then-call semantics with release on all exit paths.
//! - [`Transaction`] / [`Savepoint`] - stateful wrappers that own the
//!   locking decisions for their lifetime, lazily send `BEGIN`/`SAVEPOINT`
//!   on the first write, upgrade shared holds to exclusive, and resolve by
//!   commit or rollback exactly once. Nested savepoints delegate locking to
//!   their parent and never touch the gate.
//! - [`Batch`] - an ordered list of heterogeneous operations submitted as
//!   one engine batch, with derived-value splicing and handle wrapping over
//!   the raw reply.
//!
//! The engine itself is a collaborator behind the [`Engine`] trait; sqlgate
//! never parses or stores anything.
//!
//! All async operations take an `asupersync` [`Cx`] and return an
//! [`Outcome`], so every suspension point - gate acquisition, dispatcher
//! submission, transaction operations - is cancellable, with no side effect
//! when cancellation wins before admission.
//!
//! # Example
//!
//! ```ignore
//! let db = Db::open(&cx, engine, OpenOptions::new().path("app.db")).await?;
//! let id = db
//!     .insert(&cx, None, "people", &[("name", "A".into())], None)
//!     .await?;
//! db.transaction(&cx, TransactionKind::Deferred, async |txn| {
//!     txn.execute(&cx, None, "UPDATE people SET name = ?", &[Value::Text("B".into())])
//!         .await
//! })
//! .await?;
//! db.close();
//! ```

pub mod batch;
pub mod builder;
pub mod dispatcher;
pub mod engine;
pub mod envelope;
pub mod gate;
pub mod prepared;

mod db;
mod service;
mod session;
mod transaction;

pub use batch::{Batch, BatchCommit, BatchValue};
pub use builder::{
    Builder, ColumnVar, Conflict, PrepareBuilder, PrepareColumns, SelectOptions, WhereOptions,
};
pub use db::{Db, MigrationHooks, OpenOptions};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use engine::{Engine, EngineStatement};
pub use envelope::{BatchItem, ItemReply, Method, Payload, Request, Statement};
pub use gate::{Gate, LockMode, Locked};
pub use prepared::Prepared;
pub use transaction::{BoxedOutcome, Savepoint, Transaction, TransactionKind};

// Re-export the core types alongside the coordination layer.
pub use sqlgate_core::{Cx, Error, Outcome, Result, Row, Value};
pub use sqlgate_core::row::{ColumnInfo, Entries};
