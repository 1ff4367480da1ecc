//! Engine boundary traits.
//!
//! The embedded SQL engine is an external collaborator: sqlgate coordinates
//! access to it but never implements parsing, planning, or storage. An
//! [`Engine`] lives on the connection worker thread and is only ever touched
//! by that thread, so the trait is synchronous and takes `&mut self` - the
//! serialization the whole crate is built around.
//!
//! Engine errors must be reported as [`Error::Query`] carrying the
//! engine-specific status code verbatim; the coordination layer surfaces
//! them unchanged.

use sqlgate_core::{Error, Result, Row, Value};

/// An embedded SQL engine connection.
pub trait Engine: Send + 'static {
    /// Execute a statement, ignoring any resulting rows.
    fn execute(&mut self, sql: &str, args: &[Value]) -> Result<(), Error>;

    /// Execute a statement and return all resulting rows.
    fn query(&mut self, sql: &str, args: &[Value]) -> Result<Vec<Row>, Error>;

    /// Compile a statement for repeated execution.
    ///
    /// The returned statement owns engine-side resources; dropping it
    /// releases them.
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn EngineStatement>, Error>;

    /// Close the connection. With `force`, abandon in-progress state.
    fn close(&mut self, force: bool) -> Result<(), Error>;
}

/// A compiled statement held by the engine.
///
/// Dropping a statement finalizes it engine-side.
pub trait EngineStatement: Send {
    /// Column names of the compiled query.
    fn columns(&mut self) -> Result<Vec<String>, Error>;

    /// Bind `args` and return the first resulting row, if any.
    fn first(&mut self, args: &[Value]) -> Result<Option<Row>, Error>;

    /// Bind `args` and return all resulting rows.
    fn all(&mut self, args: &[Value]) -> Result<Vec<Row>, Error>;

    /// Bind `args` and run, ignoring any resulting rows.
    fn execute(&mut self, args: &[Value]) -> Result<(), Error>;

    /// The SQL text with placeholders substituted by the bound `args`.
    fn expand_sql(&mut self, args: &[Value]) -> Result<String, Error>;
}
