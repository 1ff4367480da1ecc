//! Session: the lock-then-call façade over one connection.
//!
//! A session pairs the connection's [`Gate`] with its [`Dispatcher`]. Every
//! operation acquires the requested lock mode, performs the dispatcher call,
//! and releases the gate on each exit path - success, engine error, or
//! cancellation - before returning. The compound `insert`/`changes`
//! operations submit the caller's statement together with a follow-up read
//! of a process-lifetime prepared handle as one savepoint-wrapped engine
//! batch, so the derived value cannot be perturbed by interleaved writers.

use crate::dispatcher::Dispatcher;
use crate::envelope::{BatchItem, ItemReply, Method, Payload, Request};
use crate::gate::{Gate, LockMode, Locked};
use sqlgate_core::row::Entries;
use asupersync::{Cx, Outcome};
use sqlgate_core::{Error, Row, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Statement metadata echoed with a traced batch commit.
#[derive(Debug, Clone)]
pub(crate) struct TracedStatement {
    pub sql: String,
    pub args: Vec<Value>,
    pub method: Option<Method>,
}

pub(crate) struct Session {
    gate: Gate,
    dispatcher: Dispatcher,
    trace_sql: AtomicBool,
    rowid_handle: u64,
    changes_handle: u64,
}

impl Session {
    /// Build the session: install the two singleton prepared handles
    /// (`last_insert_rowid()` / `changes()`) with one savepoint-wrapped
    /// batch, then open the gate.
    pub(crate) async fn init(
        cx: &Cx,
        dispatcher: Dispatcher,
        trace_sql: bool,
    ) -> Outcome<Session, Error> {
        let request = Request::Batch {
            savepoint: true,
            items: vec![
                BatchItem::prepare("SELECT last_insert_rowid()"),
                BatchItem::prepare("SELECT changes()"),
            ],
        };
        let payload = match dispatcher.submit(cx, request).await {
            Outcome::Ok(payload) => payload,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let Payload::Items(items) = payload else {
            return Outcome::Err(Error::protocol("session init reply shape"));
        };
        let handles: Vec<u64> = items
            .iter()
            .filter_map(|item| match item {
                ItemReply::Prepared(id) => Some(*id),
                _ => None,
            })
            .collect();
        let [rowid_handle, changes_handle] = handles[..] else {
            return Outcome::Err(Error::protocol("session init reply shape"));
        };
        Outcome::Ok(Session {
            gate: Gate::new(),
            dispatcher,
            trace_sql: AtomicBool::new(trace_sql),
            rowid_handle,
            changes_handle,
        })
    }

    pub(crate) fn gate(&self) -> &Gate {
        &self.gate
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn rowid_handle(&self) -> u64 {
        self.rowid_handle
    }

    pub(crate) fn changes_handle(&self) -> u64 {
        self.changes_handle
    }

    /// Whether `id` is one of the process-lifetime singleton handles that
    /// callers must never close.
    pub(crate) fn is_singleton_handle(&self, id: u64) -> bool {
        id == self.rowid_handle || id == self.changes_handle
    }

    pub(crate) fn trace_sql(&self) -> bool {
        self.trace_sql.load(Ordering::Relaxed)
    }

    pub(crate) fn set_trace_sql(&self, on: bool) {
        self.trace_sql.store(on, Ordering::Relaxed);
    }

    fn trace_start(&self) -> Option<Instant> {
        self.trace_sql().then(Instant::now)
    }

    fn trace(&self, started: Option<Instant>, sql: &str, args: &[Value], method: Option<Method>) {
        let Some(started) = started else { return };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match method {
            Some(method) => tracing::debug!(
                target: "sqlgate::session",
                method = method.name(),
                sql,
                ?args,
                elapsed_ms,
                "statement"
            ),
            None => tracing::debug!(
                target: "sqlgate::session",
                sql,
                ?args,
                elapsed_ms,
                "statement"
            ),
        }
    }

    /// Echo a statement that never reached the engine (fast paths).
    pub(crate) fn trace_zero(&self, sql: &str) {
        if self.trace_sql() {
            tracing::debug!(target: "sqlgate::session", sql, elapsed_ms = 0_u64, "statement");
        }
    }

    async fn acquire(&self, cx: &Cx, lock: LockMode) -> Outcome<Option<Locked>, Error> {
        match lock {
            LockMode::None => Outcome::Ok(None),
            LockMode::Shared => match self.gate.read_lock(cx).await {
                Outcome::Ok(token) => Outcome::Ok(Some(token)),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            LockMode::Exclusive => match self.gate.lock(cx).await {
                Outcome::Ok(token) => Outcome::Ok(Some(token)),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
        }
    }

    /// The lock-then-call funnel every operation goes through.
    pub(crate) async fn call(
        &self,
        cx: &Cx,
        lock: LockMode,
        request: Request,
    ) -> Outcome<Payload, Error> {
        let guard = match self.acquire(cx, lock).await {
            Outcome::Ok(guard) => guard,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let outcome = self.dispatcher.submit(cx, request).await;
        drop(guard);
        outcome
    }

    pub(crate) async fn execute(
        &self,
        cx: &Cx,
        lock: LockMode,
        sql: &str,
        args: &[Value],
    ) -> Outcome<(), Error> {
        let started = self.trace_start();
        let outcome = self
            .call(
                cx,
                lock,
                Request::Execute {
                    sql: sql.to_string(),
                    args: args.to_vec(),
                },
            )
            .await;
        self.trace(started, sql, args, None);
        match outcome {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub(crate) async fn query(
        &self,
        cx: &Cx,
        lock: LockMode,
        sql: &str,
        args: &[Value],
    ) -> Outcome<Vec<Row>, Error> {
        let started = self.trace_start();
        let outcome = self
            .call(
                cx,
                lock,
                Request::Query {
                    sql: sql.to_string(),
                    args: args.to_vec(),
                    entries: false,
                },
            )
            .await;
        self.trace(started, sql, args, None);
        match outcome {
            Outcome::Ok(Payload::Rows(rows)) => Outcome::Ok(rows),
            Outcome::Ok(_) => Outcome::Err(Error::protocol("query reply shape")),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub(crate) async fn query_entries(
        &self,
        cx: &Cx,
        lock: LockMode,
        sql: &str,
        args: &[Value],
    ) -> Outcome<Vec<Entries>, Error> {
        let started = self.trace_start();
        let outcome = self
            .call(
                cx,
                lock,
                Request::Query {
                    sql: sql.to_string(),
                    args: args.to_vec(),
                    entries: true,
                },
            )
            .await;
        self.trace(started, sql, args, None);
        match outcome {
            Outcome::Ok(Payload::Entries(entries)) => Outcome::Ok(entries),
            Outcome::Ok(_) => Outcome::Err(Error::protocol("query reply shape")),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run `sql`, then read `last_insert_rowid()` in the same engine batch.
    pub(crate) async fn insert(
        &self,
        cx: &Cx,
        lock: LockMode,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        self.derived(cx, lock, sql, args, self.rowid_handle).await
    }

    /// Run `sql`, then read `changes()` in the same engine batch.
    pub(crate) async fn changes(
        &self,
        cx: &Cx,
        lock: LockMode,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        self.derived(cx, lock, sql, args, self.changes_handle).await
    }

    async fn derived(
        &self,
        cx: &Cx,
        lock: LockMode,
        sql: &str,
        args: &[Value],
        handle: u64,
    ) -> Outcome<i64, Error> {
        let started = self.trace_start();
        let request = Request::Batch {
            savepoint: true,
            items: vec![
                BatchItem::sql(sql, args.to_vec()),
                BatchItem::method(handle, Method::First, Vec::new(), true),
            ],
        };
        let outcome = self.call(cx, lock, request).await;
        self.trace(started, sql, args, None);
        match outcome {
            Outcome::Ok(Payload::Items(items)) => Outcome::Ok(match derived_value(&items) {
                Some(value) => value,
                None => return Outcome::Err(Error::protocol("derived scalar reply shape")),
            }),
            Outcome::Ok(_) => Outcome::Err(Error::protocol("derived scalar reply shape")),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Compile a statement; the caller wraps the returned handle id.
    pub(crate) async fn prepare(&self, cx: &Cx, sql: &str) -> Outcome<u64, Error> {
        let outcome = self
            .call(
                cx,
                LockMode::None,
                Request::Prepare {
                    sql: sql.to_string(),
                },
            )
            .await;
        match outcome {
            Outcome::Ok(Payload::Handle(id)) => Outcome::Ok(id),
            Outcome::Ok(_) => Outcome::Err(Error::protocol("prepare reply shape")),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Invoke a method on a prepared handle. `sql` is only for tracing.
    pub(crate) async fn method(
        &self,
        cx: &Cx,
        lock: LockMode,
        handle: u64,
        method: Method,
        args: &[Value],
        sql: Option<&str>,
    ) -> Outcome<Payload, Error> {
        let started = sql.and_then(|_| self.trace_start());
        let outcome = self
            .call(
                cx,
                lock,
                Request::Method {
                    handle,
                    method,
                    args: args.to_vec(),
                    want: method.returns_value(),
                },
            )
            .await;
        if let Some(sql) = sql {
            self.trace(started, sql, args, Some(method));
        }
        outcome
    }

    /// Submit a caller-assembled batch.
    pub(crate) async fn batch(
        &self,
        cx: &Cx,
        lock: LockMode,
        savepoint: bool,
        items: Vec<BatchItem>,
        traced: &[TracedStatement],
    ) -> Outcome<Vec<ItemReply>, Error> {
        let started = self.trace_start();
        let outcome = self
            .call(cx, lock, Request::Batch { savepoint, items })
            .await;
        if let Some(started) = started {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            for stmt in traced {
                match stmt.method {
                    Some(method) => tracing::debug!(
                        target: "sqlgate::session",
                        method = method.name(),
                        sql = %stmt.sql,
                        args = ?stmt.args,
                        "batch statement"
                    ),
                    None => tracing::debug!(
                        target: "sqlgate::session",
                        sql = %stmt.sql,
                        args = ?stmt.args,
                        "batch statement"
                    ),
                }
            }
            tracing::debug!(target: "sqlgate::session", elapsed_ms, "batch");
        }
        match outcome {
            Outcome::Ok(Payload::Items(items)) => Outcome::Ok(items),
            Outcome::Ok(_) => Outcome::Err(Error::protocol("batch reply shape")),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Fire-and-forget finalize of a prepared handle.
    pub(crate) fn post_close(&self, id: u64) {
        self.dispatcher.post(Request::Method {
            handle: id,
            method: Method::Close,
            args: Vec::new(),
            want: false,
        });
    }

    /// Fire-and-forget execution of a statement on the rollback path.
    pub(crate) fn post_execute(&self, sql: &str) {
        self.dispatcher.post(Request::Execute {
            sql: sql.to_string(),
            args: Vec::new(),
        });
    }

    /// Close the gate and the connection. Returns whether this call was the
    /// one that initiated teardown.
    pub(crate) fn close(&self) -> bool {
        self.gate.close();
        self.dispatcher.close()
    }
}

/// Unwrap the follow-up scalar of a derived insert/changes batch.
fn derived_value(items: &[ItemReply]) -> Option<i64> {
    match items {
        [ItemReply::Method(Payload::Row(Some(row)))] => row.get(0).and_then(Value::as_i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_value_unwraps_first_column() {
        let items = vec![ItemReply::Method(Payload::Row(Some(Row::new(
            vec!["last_insert_rowid()".to_string()],
            vec![Value::Integer(42)],
        ))))];
        assert_eq!(derived_value(&items), Some(42));
    }

    #[test]
    fn test_derived_value_rejects_odd_shapes() {
        assert_eq!(derived_value(&[]), None);
        assert_eq!(derived_value(&[ItemReply::Method(Payload::Row(None))]), None);
        assert_eq!(derived_value(&[ItemReply::Prepared(3)]), None);
    }
}
