//! Caller-side prepared statement handles.

use crate::envelope::{Method, Payload};
use crate::gate::LockMode;
use crate::session::Session;
use sqlgate_core::row::Entries;
use sqlgate_core::{Cx, Error, Outcome, Row, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A compiled statement owned by this connection.
///
/// The handle pairs the engine-side resource id with the original SQL text.
/// It must be closed when no longer needed or the engine resource leaks;
/// the two per-connection singleton handles (`last_insert_rowid()`,
/// `changes()`) are exempt and their `close` is a guarded no-op. Clones
/// share the closed flag: closing any clone closes them all.
#[derive(Clone)]
pub struct Prepared<'s> {
    session: &'s Session,
    id: u64,
    sql: String,
    closed: Arc<AtomicBool>,
}

impl<'s> Prepared<'s> {
    pub(crate) fn new(session: &'s Session, id: u64, sql: String) -> Self {
        Self {
            session,
            id,
            sql,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The engine-side resource id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The SQL this handle was compiled from.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the engine-side resource.
    ///
    /// Returns `false` when already closed. Finalization is fire-and-forget
    /// best-effort, like every cleanup on this surface. Closing a singleton
    /// handle only marks the wrapper closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if !self.session.is_singleton_handle(self.id) {
            self.session.post_close(self.id);
        }
        true
    }

    fn guard(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::prepared_closed(self.id));
        }
        Ok(())
    }

    async fn method(
        &self,
        cx: &Cx,
        lock: LockMode,
        method: Method,
        args: &[Value],
        traced: bool,
    ) -> Outcome<Payload, Error> {
        if let Err(err) = self.guard() {
            return Outcome::Err(err);
        }
        let sql = traced.then_some(self.sql.as_str());
        self.session
            .method(cx, lock, self.id, method, args, sql)
            .await
    }

    /// Column names of the compiled query.
    pub async fn columns(&self, cx: &Cx) -> Outcome<Vec<String>, Error> {
        match self
            .method(cx, LockMode::None, Method::Columns, &[], false)
            .await
        {
            Outcome::Ok(Payload::Columns(columns)) => Outcome::Ok(columns),
            Outcome::Ok(_) => Outcome::Err(Error::protocol("columns reply shape")),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Bind `args` and return the first resulting row, if any.
    pub async fn first(&self, cx: &Cx, args: &[Value]) -> Outcome<Option<Row>, Error> {
        match self
            .method(cx, LockMode::Shared, Method::First, args, true)
            .await
        {
            Outcome::Ok(Payload::Row(row)) => Outcome::Ok(row),
            Outcome::Ok(_) => Outcome::Err(Error::protocol("first reply shape")),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Like `first`, returned as key-value entries.
    pub async fn first_entry(&self, cx: &Cx, args: &[Value]) -> Outcome<Option<Entries>, Error> {
        match self
            .method(cx, LockMode::Shared, Method::FirstEntry, args, true)
            .await
        {
            Outcome::Ok(Payload::EntriesRow(row)) => Outcome::Ok(row),
            Outcome::Ok(_) => Outcome::Err(Error::protocol("firstEntry reply shape")),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Bind `args` and return all resulting rows.
    pub async fn all(&self, cx: &Cx, args: &[Value]) -> Outcome<Vec<Row>, Error> {
        match self
            .method(cx, LockMode::Shared, Method::All, args, true)
            .await
        {
            Outcome::Ok(Payload::Rows(rows)) => Outcome::Ok(rows),
            Outcome::Ok(_) => Outcome::Err(Error::protocol("all reply shape")),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Like `all`, returned as key-value entries.
    pub async fn all_entries(&self, cx: &Cx, args: &[Value]) -> Outcome<Vec<Entries>, Error> {
        match self
            .method(cx, LockMode::Shared, Method::AllEntries, args, true)
            .await
        {
            Outcome::Ok(Payload::Entries(entries)) => Outcome::Ok(entries),
            Outcome::Ok(_) => Outcome::Err(Error::protocol("allEntries reply shape")),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Bind `args` and run, ignoring any resulting rows.
    ///
    /// Defaults to the exclusive lock: execution may write through the
    /// compiled statement.
    pub async fn execute(&self, cx: &Cx, args: &[Value]) -> Outcome<(), Error> {
        self.execute_locked(cx, LockMode::Exclusive, args).await
    }

    /// `execute` with an explicit lock mode.
    pub async fn execute_locked(
        &self,
        cx: &Cx,
        lock: LockMode,
        args: &[Value],
    ) -> Outcome<(), Error> {
        match self.method(cx, lock, Method::Execute, args, true).await {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// The SQL text with placeholders substituted by `args`.
    pub async fn expand_sql(&self, cx: &Cx, args: &[Value]) -> Outcome<String, Error> {
        match self
            .method(cx, LockMode::None, Method::ExpandSql, args, false)
            .await
        {
            Outcome::Ok(Payload::Sql(sql)) => Outcome::Ok(sql),
            Outcome::Ok(_) => Outcome::Err(Error::protocol("expandSql reply shape")),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}

impl std::fmt::Debug for Prepared<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prepared")
            .field("id", &self.id)
            .field("sql", &self.sql)
            .field("closed", &self.is_closed())
            .finish()
    }
}
