//! The connection façade.
//!
//! [`Db::open`] spawns the connection worker around a caller-supplied
//! engine, installs the session singletons, and optionally runs the
//! schema-version ritual: a `sqlgate_system(id, version)` table records the
//! last opened version, and [`MigrationHooks`] callbacks fire inside one
//! transaction when the database is created, upgraded, or downgraded.

use crate::batch::Batch;
use crate::builder::{Conflict, PrepareColumns, SelectOptions, WhereOptions};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::engine::Engine;
use crate::envelope::{Method, Payload};
use crate::gate::LockMode;
use crate::prepared::Prepared;
use crate::session::Session;
use crate::transaction::{
    BoxedOutcome, Savepoint, Transaction, TransactionKind, drive_savepoint, ops,
};
use sqlgate_core::row::Entries;
use sqlgate_core::{Cx, Error, Outcome, Row, TransactionError, TransactionErrorKind, Value};

/// System table recording the schema version.
const SYSTEM_TABLE: &str = "sqlgate_system";

/// Options for [`Db::open`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Label used in closed-connection errors, usually the database path.
    pub path: String,
    /// Schema version to reconcile against the `sqlgate_system` table.
    pub version: Option<u32>,
    /// Echo executed statements with their elapsed time via `tracing`.
    pub trace_sql: bool,
    /// Maximum number of concurrent calls merged into one round trip.
    pub max_coalesce: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            version: None,
            trace_sql: false,
            max_coalesce: 1000,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn trace_sql(mut self, on: bool) -> Self {
        self.trace_sql = on;
        self
    }

    pub fn max_coalesce(mut self, max: usize) -> Self {
        self.max_coalesce = max;
        self
    }
}

/// Schema lifecycle callbacks, fired inside the version transaction.
///
/// Every hook defaults to a no-op except `on_downgrade`, which rejects:
/// opening a database recorded at a newer version requires an explicit
/// downgrade strategy.
pub trait MigrationHooks: Send {
    /// Before any version comparison.
    fn on_open<'a, 'b>(
        &'a mut self,
        cx: &'a Cx,
        txn: &'a mut Transaction<'b>,
    ) -> BoxedOutcome<'a, ()>
    where
        'b: 'a,
    {
        let _ = (cx, txn);
        Box::pin(async { Outcome::Ok(()) })
    }

    /// The version table was empty: a fresh database.
    fn on_create<'a, 'b>(
        &'a mut self,
        cx: &'a Cx,
        txn: &'a mut Transaction<'b>,
        version: u32,
    ) -> BoxedOutcome<'a, ()>
    where
        'b: 'a,
    {
        let _ = (cx, txn, version);
        Box::pin(async { Outcome::Ok(()) })
    }

    /// The requested version is newer than the recorded one.
    fn on_upgrade<'a, 'b>(
        &'a mut self,
        cx: &'a Cx,
        txn: &'a mut Transaction<'b>,
        from: u32,
        to: u32,
    ) -> BoxedOutcome<'a, ()>
    where
        'b: 'a,
    {
        let _ = (cx, txn, from, to);
        Box::pin(async { Outcome::Ok(()) })
    }

    /// The requested version is older than the recorded one.
    fn on_downgrade<'a, 'b>(
        &'a mut self,
        cx: &'a Cx,
        txn: &'a mut Transaction<'b>,
        from: u32,
        to: u32,
    ) -> BoxedOutcome<'a, ()>
    where
        'b: 'a,
    {
        let _ = (cx, txn);
        let err = Error::Transaction(TransactionError {
            kind: TransactionErrorKind::DowngradeUnsupported,
            message: format!(
                "version({from}) is higher than the requested version({to}); \
                 provide an on_downgrade hook"
            ),
        });
        Box::pin(async move { Outcome::Err(err) })
    }

    /// After create/upgrade/downgrade resolved, still inside the
    /// transaction.
    fn on_ready<'a, 'b>(
        &'a mut self,
        cx: &'a Cx,
        txn: &'a mut Transaction<'b>,
        version: u32,
    ) -> BoxedOutcome<'a, ()>
    where
        'b: 'a,
    {
        let _ = (cx, txn, version);
        Box::pin(async { Outcome::Ok(()) })
    }
}

/// Hooks that accept every transition silently except downgrades.
struct DefaultHooks;

impl MigrationHooks for DefaultHooks {}

/// One coordinated connection to an embedded SQL engine.
pub struct Db {
    session: Session,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Open a connection over `engine` with default hooks.
    pub async fn open<E: Engine>(cx: &Cx, engine: E, options: OpenOptions) -> Outcome<Db, Error> {
        Db::open_with_hooks(cx, engine, options, &mut DefaultHooks).await
    }

    /// Open a connection, dispatching schema transitions to `hooks`.
    pub async fn open_with_hooks<E: Engine>(
        cx: &Cx,
        engine: E,
        options: OpenOptions,
        hooks: &mut dyn MigrationHooks,
    ) -> Outcome<Db, Error> {
        let dispatcher = Dispatcher::spawn(
            Box::new(engine),
            DispatcherConfig {
                path: options.path.clone(),
                max_coalesce: options.max_coalesce,
            },
        );
        let session = match Session::init(cx, dispatcher.clone(), options.trace_sql).await {
            Outcome::Ok(session) => session,
            Outcome::Err(e) => {
                dispatcher.close();
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                dispatcher.close();
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                dispatcher.close();
                return Outcome::Panicked(p);
            }
        };
        let db = Db { session };
        if let Some(version) = options.version {
            match db.reconcile_version(cx, version, hooks).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    db.close();
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    db.close();
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    db.close();
                    return Outcome::Panicked(p);
                }
            }
        }
        Outcome::Ok(db)
    }

    async fn reconcile_version(
        &self,
        cx: &Cx,
        version: u32,
        hooks: &mut dyn MigrationHooks,
    ) -> Outcome<(), Error> {
        let mut txn = match Transaction::init(&self.session, cx, TransactionKind::Deferred).await {
            Outcome::Ok(txn) => txn,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match version_ritual(&mut txn, cx, version, hooks).await {
            Outcome::Ok(()) => txn.commit(cx).await,
            Outcome::Err(err) => {
                let _ = txn.rollback(cx).await;
                Outcome::Err(err)
            }
            Outcome::Cancelled(r) => {
                let _ = txn.rollback(cx).await;
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                let _ = txn.rollback(cx).await;
                Outcome::Panicked(p)
            }
        }
    }

    /// The configured connection label.
    pub fn path(&self) -> &str {
        self.session.dispatcher().path()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.session.dispatcher().is_closed()
    }

    /// Whether the connection is still accepting work.
    pub fn is_open(&self) -> bool {
        !self.is_closed()
    }

    /// Whether executed statements are echoed via `tracing`.
    pub fn trace_sql(&self) -> bool {
        self.session.trace_sql()
    }

    /// Toggle statement echoing.
    pub fn set_trace_sql(&self, on: bool) {
        self.session.set_trace_sql(on);
    }

    /// Service round trips performed so far; coalescing keeps this below
    /// the number of submitted calls under contention.
    pub fn round_trips(&self) -> u64 {
        self.session.dispatcher().round_trips()
    }

    /// Tear the connection down. Pending gate waiters and queued calls fail
    /// with the closed error; the engine is closed once in-flight work
    /// drains. Idempotent.
    pub fn close(&self) -> bool {
        self.session.close()
    }

    /// Suspend until the worker has fully drained and the engine connection
    /// is terminated.
    pub async fn wait(&self, cx: &Cx) -> Outcome<(), Error> {
        self.session.dispatcher().wait(cx).await
    }

    fn mode(over: Option<LockMode>, write: bool) -> LockMode {
        over.unwrap_or(if write {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        })
    }

    /// Execute a statement with no result.
    pub async fn execute(
        &self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<(), Error> {
        self.session
            .execute(cx, Db::mode(lock, true), sql, args)
            .await
    }

    /// Execute a raw SELECT and return its rows.
    pub async fn raw_query(
        &self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<Vec<Row>, Error> {
        self.session
            .query(cx, Db::mode(lock, false), sql, args)
            .await
    }

    /// Execute a raw SELECT and return its rows as key-value entries.
    pub async fn raw_query_entries(
        &self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<Vec<Entries>, Error> {
        self.session
            .query_entries(cx, Db::mode(lock, false), sql, args)
            .await
    }

    /// SELECT over `table` with builder clauses.
    pub async fn query(
        &self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        opts: &SelectOptions,
    ) -> Outcome<Vec<Row>, Error> {
        let mut builder = crate::builder::Builder::new();
        if let Err(err) = builder.query(table, opts) {
            return Outcome::Err(err);
        }
        self.raw_query(cx, lock, builder.sql(), builder.args())
            .await
    }

    /// SELECT over `table`, rows as key-value entries.
    pub async fn query_entries(
        &self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        opts: &SelectOptions,
    ) -> Outcome<Vec<Entries>, Error> {
        let mut builder = crate::builder::Builder::new();
        if let Err(err) = builder.query(table, opts) {
            return Outcome::Err(err);
        }
        self.raw_query_entries(cx, lock, builder.sql(), builder.args())
            .await
    }

    /// Execute a raw INSERT and return the inserted row id.
    pub async fn raw_insert(
        &self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        self.session
            .insert(cx, Db::mode(lock, true), sql, args)
            .await
    }

    /// INSERT `values` into `table` and return the inserted row id.
    pub async fn insert(
        &self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        values: &[(&str, Value)],
        conflict: Option<Conflict>,
    ) -> Outcome<i64, Error> {
        let mut builder = crate::builder::Builder::new();
        builder.insert(table, values, conflict);
        self.raw_insert(cx, lock, builder.sql(), builder.args())
            .await
    }

    /// Execute a raw UPDATE and return the number of changed rows.
    pub async fn raw_update(
        &self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        self.session
            .changes(cx, Db::mode(lock, true), sql, args)
            .await
    }

    /// UPDATE `values` in `table` and return the number of changed rows.
    pub async fn update(
        &self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        values: &[(&str, Value)],
        opts: &WhereOptions,
        conflict: Option<Conflict>,
    ) -> Outcome<i64, Error> {
        let mut builder = crate::builder::Builder::new();
        builder.update(table, values, opts, conflict);
        self.raw_update(cx, lock, builder.sql(), builder.args())
            .await
    }

    /// Execute a raw DELETE and return the number of changed rows.
    pub async fn raw_delete(
        &self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        self.session
            .changes(cx, Db::mode(lock, true), sql, args)
            .await
    }

    /// DELETE from `table` and return the number of changed rows.
    pub async fn delete(
        &self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        opts: &WhereOptions,
    ) -> Outcome<i64, Error> {
        let mut builder = crate::builder::Builder::new();
        builder.delete(table, opts);
        self.raw_delete(cx, lock, builder.sql(), builder.args())
            .await
    }

    /// Compile a statement for repeated execution.
    pub async fn prepare(&self, cx: &Cx, sql: &str) -> Outcome<Prepared<'_>, Error> {
        ops::prepare(&self.session, cx, sql).await
    }

    /// Compile an INSERT into `table`.
    pub async fn prepare_insert(
        &self,
        cx: &Cx,
        table: &str,
        columns: &PrepareColumns,
        conflict: Option<Conflict>,
    ) -> Outcome<Prepared<'_>, Error> {
        ops::prepare_insert(&self.session, cx, table, columns, conflict).await
    }

    /// Compile an UPDATE of `columns` in `table`.
    pub async fn prepare_update(
        &self,
        cx: &Cx,
        table: &str,
        columns: &PrepareColumns,
        opts: &WhereOptions,
        conflict: Option<Conflict>,
    ) -> Outcome<Prepared<'_>, Error> {
        ops::prepare_update(&self.session, cx, table, columns, opts, conflict).await
    }

    /// Compile a DELETE from `table`.
    pub async fn prepare_delete(
        &self,
        cx: &Cx,
        table: &str,
        opts: &WhereOptions,
    ) -> Outcome<Prepared<'_>, Error> {
        ops::prepare_delete(&self.session, cx, table, opts).await
    }

    /// Compile a SELECT over `table`.
    pub async fn prepare_query(
        &self,
        cx: &Cx,
        table: &str,
        opts: &SelectOptions,
    ) -> Outcome<Prepared<'_>, Error> {
        ops::prepare_query(&self.session, cx, table, opts).await
    }

    /// The process-lifetime `SELECT changes()` handle. Never closed by
    /// callers; `close` on it is a guarded no-op.
    pub fn prepare_changes(&self) -> Prepared<'_> {
        Prepared::new(
            &self.session,
            self.session.changes_handle(),
            "SELECT changes()".to_string(),
        )
    }

    /// The process-lifetime `SELECT last_insert_rowid()` handle.
    pub fn prepare_last_insert_rowid(&self) -> Prepared<'_> {
        Prepared::new(
            &self.session,
            self.session.rowid_handle(),
            "SELECT last_insert_rowid()".to_string(),
        )
    }

    /// Invoke a method on a prepared handle.
    pub async fn method(
        &self,
        cx: &Cx,
        lock: Option<LockMode>,
        prepared: &Prepared<'_>,
        method: Method,
        args: &[Value],
    ) -> Outcome<Payload, Error> {
        if prepared.is_closed() {
            return Outcome::Err(Error::prepared_closed(prepared.id()));
        }
        let mode = match lock {
            Some(mode) => mode,
            None => match method {
                Method::First | Method::FirstEntry | Method::All | Method::AllEntries => {
                    LockMode::Shared
                }
                Method::Execute => LockMode::Exclusive,
                Method::Close | Method::Columns | Method::ExpandSql => LockMode::None,
            },
        };
        let traced = matches!(
            method,
            Method::First
                | Method::FirstEntry
                | Method::All
                | Method::AllEntries
                | Method::Execute
        );
        self.session
            .method(
                cx,
                mode,
                prepared.id(),
                method,
                args,
                traced.then_some(prepared.sql()),
            )
            .await
    }

    /// Start a batch over this connection.
    pub fn batch(&self) -> Batch<'_> {
        Batch::new(&self.session)
    }

    /// Start a transaction.
    pub async fn begin(&self, cx: &Cx, kind: TransactionKind) -> Outcome<Transaction<'_>, Error> {
        Transaction::init(&self.session, cx, kind).await
    }

    /// Run `f` inside a transaction: committed when `f` returns `Ok`,
    /// rolled back (and the failure re-raised) otherwise. Exactly one of
    /// commit/rollback fires.
    pub async fn transaction<T, F>(&self, cx: &Cx, kind: TransactionKind, f: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Transaction<'_>) -> Outcome<T, Error>,
    {
        let mut txn = match self.begin(cx, kind).await {
            Outcome::Ok(txn) => txn,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match f(&mut txn).await {
            Outcome::Ok(value) => match txn.commit(cx).await {
                Outcome::Ok(()) => Outcome::Ok(value),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            Outcome::Err(err) => {
                let _ = txn.rollback(cx).await;
                Outcome::Err(err)
            }
            Outcome::Cancelled(r) => {
                let _ = txn.rollback(cx).await;
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                let _ = txn.rollback(cx).await;
                Outcome::Panicked(p)
            }
        }
    }

    /// Create a root savepoint owning its own gate decisions.
    pub fn create_savepoint(&self, name: &str) -> Savepoint<'_> {
        Savepoint::init_root(&self.session, name)
    }

    /// Run `f` inside a root savepoint: released on success, rolled back
    /// (and the failure re-raised) otherwise.
    pub async fn with_savepoint<T, F>(&self, cx: &Cx, name: &str, f: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Savepoint<'_>) -> Outcome<T, Error>,
    {
        let mut sp = self.create_savepoint(name);
        drive_savepoint(&mut sp, cx, f).await
    }
}

/// The version-reconciliation body, mirrored from the original open flow.
async fn version_ritual(
    txn: &mut Transaction<'_>,
    cx: &Cx,
    version: u32,
    hooks: &mut dyn MigrationHooks,
) -> Outcome<(), Error> {
    match hooks.on_open(cx, txn).await {
        Outcome::Ok(()) => {}
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    }

    let stored = {
        let mut batch = txn.batch();
        batch.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {SYSTEM_TABLE} \
                 (id INTEGER PRIMARY KEY, version INTEGER)"
            ),
            Vec::new(),
            false,
            None,
        );
        batch.query_entries(
            SYSTEM_TABLE,
            &SelectOptions::new()
                .columns(["version"])
                .where_clause("id = 1"),
            None,
        );
        let values = match batch.commit(cx, crate::batch::BatchCommit::new()).await {
            Outcome::Ok(values) => values,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match values.first() {
            Some(crate::batch::BatchValue::Entries(rows)) => {
                rows.first().map(|row| row.get("version").cloned())
            }
            _ => return Outcome::Err(Error::protocol("version probe reply shape")),
        }
    };

    match stored {
        None => {
            // Fresh database.
            match txn
                .insert(
                    cx,
                    None,
                    SYSTEM_TABLE,
                    &[
                        ("id", Value::Integer(1)),
                        ("version", Value::Integer(i64::from(version))),
                    ],
                    None,
                )
                .await
            {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            match hooks.on_create(cx, txn, version).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Some(Some(Value::Integer(recorded))) if recorded >= 0 && recorded <= i64::from(u32::MAX) =>
        {
            let recorded = recorded as u32;
            if version != recorded {
                match store_version(txn, cx, version).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                let hook = if version > recorded {
                    hooks.on_upgrade(cx, txn, recorded, version)
                } else {
                    hooks.on_downgrade(cx, txn, recorded, version)
                };
                match hook.await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }
        Some(_) => {
            // The recorded value is missing or not an integer: treat the
            // schema as unversioned and re-create.
            match store_version(txn, cx, version).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            match hooks.on_create(cx, txn, version).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
    }

    hooks.on_ready(cx, txn, version).await
}

async fn store_version(txn: &mut Transaction<'_>, cx: &Cx, version: u32) -> Outcome<(), Error> {
    match txn
        .update(
            cx,
            None,
            SYSTEM_TABLE,
            &[("version", Value::Integer(i64::from(version)))],
            &WhereOptions::new().where_clause("id = 1"),
            None,
        )
        .await
    {
        Outcome::Ok(_) => Outcome::Ok(()),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}
