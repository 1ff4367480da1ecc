//! Transaction and savepoint state machines.
//!
//! Both types own the locking decisions for every operation performed
//! through them, for their whole lifetime: `idle -> active (lock held) ->
//! begun (BEGIN/SAVEPOINT sent) -> closed (committed or rolled back)`.
//! BEGIN is lazy - a transaction that only reads never sends
//! BEGIN/COMMIT to the engine. The first write upgrades a shared hold to
//! exclusive by releasing and reacquiring; the upgrade is not atomic and a
//! writer may interleave between the two steps, which is the documented
//! policy.
//!
//! Savepoints are named and either root (own their gate decisions) or
//! nested. A nested savepoint forwards every lock intent to its parent's
//! lock host, so no matter how deep the nesting only the outermost owner
//! ever touches the gate.

use crate::batch::Batch;
use crate::builder::{Builder, Conflict, PrepareBuilder, PrepareColumns, SelectOptions, WhereOptions};
use crate::envelope::{Method, Payload};
use crate::gate::{Gate, LockMode, Locked};
use crate::prepared::Prepared;
use crate::session::Session;
use sqlgate_core::row::Entries;
use sqlgate_core::{Cx, Error, Outcome, Row, Value};
use std::future::Future;
use std::pin::Pin;

/// Boxed future alias used by the object-safe callback seams.
pub type BoxedOutcome<'a, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + Send + 'a>>;

/// How a transaction announces itself to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionKind {
    /// Lazy: no lock and no statement until the first operation
    #[default]
    Deferred,
    /// Take the exclusive gate and send `BEGIN IMMEDIATE` up front
    Immediate,
    /// Take the exclusive gate and send `BEGIN EXCLUSIVE` up front
    Exclusive,
}

impl TransactionKind {
    const fn begin_sql(self) -> &'static str {
        match self {
            TransactionKind::Deferred => "BEGIN DEFERRED",
            TransactionKind::Immediate => "BEGIN IMMEDIATE",
            TransactionKind::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// A lock request routed through a transaction or savepoint.
///
/// `explicit` records whether the caller named the mode or the operation's
/// default chose it; root savepoints treat default reads as writes, so the
/// distinction must survive forwarding through nested savepoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LockIntent {
    pub write: bool,
    pub explicit: bool,
}

fn resolve_intent(over: Option<LockMode>, default_write: bool) -> Option<LockIntent> {
    match over {
        Some(LockMode::None) => None,
        Some(LockMode::Shared) => Some(LockIntent {
            write: false,
            explicit: true,
        }),
        Some(LockMode::Exclusive) => Some(LockIntent {
            write: true,
            explicit: true,
        }),
        None => Some(LockIntent {
            write: default_write,
            explicit: false,
        }),
    }
}

/// The object-safe seam nested savepoints delegate their locking through.
pub(crate) trait LockHost: Send {
    fn acquire<'a>(&'a mut self, cx: &'a Cx, intent: LockIntent) -> BoxedOutcome<'a, ()>;

    /// Reject when this host, or any host above it, is already closed.
    fn ensure_open(&self) -> Result<(), Error>;
}

/// What a transaction or root savepoint currently holds on the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Held {
    #[default]
    None,
    Shared,
    Exclusive,
}

/// One owner's slice of the gate: at most one token at a time.
#[derive(Default)]
struct GateSlot {
    held: Held,
    token: Option<Locked>,
}

impl GateSlot {
    /// Ensure the exclusive gate is held, upgrading a shared hold by
    /// release-then-reacquire.
    async fn exclusive(&mut self, cx: &Cx, gate: &Gate) -> Outcome<(), Error> {
        match self.held {
            Held::Exclusive => return Outcome::Ok(()),
            Held::Shared => {
                // Not atomic: a writer may slip in between these two steps.
                if let Some(token) = self.token.take() {
                    token.unlock();
                }
                self.held = Held::None;
            }
            Held::None => {}
        }
        match gate.lock(cx).await {
            Outcome::Ok(token) => {
                self.token = Some(token);
                self.held = Held::Exclusive;
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Ensure at least a shared hold.
    async fn shared(&mut self, cx: &Cx, gate: &Gate) -> Outcome<(), Error> {
        if self.held != Held::None {
            return Outcome::Ok(());
        }
        match gate.read_lock(cx).await {
            Outcome::Ok(token) => {
                self.token = Some(token);
                self.held = Held::Shared;
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    fn release(&mut self) {
        self.held = Held::None;
        if let Some(token) = self.token.take() {
            token.unlock();
        }
    }
}

/// Send a rollback-path statement, swallowing its failure so the primary
/// error is never masked. A cancelled context still unwinds the engine via
/// the fire-and-forget queue.
async fn best_effort(session: &Session, cx: &Cx, sql: &str) {
    match session.execute(cx, LockMode::None, sql, &[]).await {
        Outcome::Ok(()) => {}
        Outcome::Err(err) => {
            tracing::debug!(target: "sqlgate::transaction", %err, sql, "rollback statement swallowed");
        }
        Outcome::Cancelled(_) => session.post_execute(sql),
        Outcome::Panicked(_) => {}
    }
}

/// A transaction over one connection.
///
/// Must be resolved with [`commit`](Transaction::commit) or
/// [`rollback`](Transaction::rollback); dropping an unresolved transaction
/// releases the gate but leaves an already-begun engine transaction open.
/// Prefer the [`Db::transaction`](crate::Db::transaction) driver, which
/// guarantees exactly one of the two fires.
pub struct Transaction<'s> {
    session: &'s Session,
    slot: GateSlot,
    begun: bool,
    closed: bool,
}

impl<'s> Transaction<'s> {
    pub(crate) async fn init(
        session: &'s Session,
        cx: &Cx,
        kind: TransactionKind,
    ) -> Outcome<Transaction<'s>, Error> {
        let mut txn = Transaction {
            session,
            slot: GateSlot::default(),
            begun: false,
            closed: false,
        };
        if kind == TransactionKind::Deferred {
            session.trace_zero(kind.begin_sql());
            return Outcome::Ok(txn);
        }
        match txn.slot.exclusive(cx, session.gate()).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match session
            .execute(cx, LockMode::None, kind.begin_sql(), &[])
            .await
        {
            Outcome::Ok(()) => {
                txn.begun = true;
                Outcome::Ok(txn)
            }
            Outcome::Err(e) => {
                txn.slot.release();
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                txn.slot.release();
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                txn.slot.release();
                Outcome::Panicked(p)
            }
        }
    }

    /// Whether commit or rollback has already been issued.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn write(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Err(Error::transaction_closed());
        }
        match self.slot.exclusive(cx, self.session.gate()).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if !self.begun {
            match self
                .session
                .execute(cx, LockMode::None, "BEGIN DEFERRED", &[])
                .await
            {
                Outcome::Ok(()) => self.begun = true,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    async fn read(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Err(Error::transaction_closed());
        }
        self.slot.shared(cx, self.session.gate()).await
    }

    /// Commit. If no write ever happened, no statement is sent; the held
    /// lock is released on every path.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Err(Error::transaction_closed());
        }
        self.closed = true;
        if self.begun {
            let outcome = self.session.execute(cx, LockMode::None, "COMMIT", &[]).await;
            self.slot.release();
            return outcome;
        }
        self.session.trace_zero("COMMIT");
        self.slot.release();
        Outcome::Ok(())
    }

    /// Roll back. Statement failures are swallowed; the lock is released.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Err(Error::transaction_closed());
        }
        self.closed = true;
        if self.begun {
            best_effort(self.session, cx, "ROLLBACK").await;
        } else {
            self.session.trace_zero("ROLLBACK");
        }
        self.slot.release();
        Outcome::Ok(())
    }

    /// Create a nested savepoint delegating all locking to this transaction.
    pub async fn savepoint<'t>(
        &'t mut self,
        cx: &Cx,
        name: &str,
    ) -> Outcome<Savepoint<'t>, Error> {
        let session = self.session;
        Savepoint::init_nested(session, self, cx, name).await
    }

    /// Run `f` inside a nested savepoint: released on success, rolled back
    /// (and the error re-raised) on failure.
    pub async fn with_savepoint<T, F>(&mut self, cx: &Cx, name: &str, f: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Savepoint<'_>) -> Outcome<T, Error>,
    {
        let mut sp = match self.savepoint(cx, name).await {
            Outcome::Ok(sp) => sp,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        drive_savepoint(&mut sp, cx, f).await
    }

    /// Start a batch whose commit locks through this transaction.
    pub fn batch<'t>(&'t mut self) -> Batch<'t> {
        let session = self.session;
        Batch::with_host(session, self)
    }

    pub async fn execute(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<(), Error> {
        let session = self.session;
        ops::execute(session, self, cx, lock, sql, args).await
    }

    pub async fn raw_query(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<Vec<Row>, Error> {
        let session = self.session;
        ops::raw_query(session, self, cx, lock, sql, args).await
    }

    pub async fn raw_query_entries(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<Vec<Entries>, Error> {
        let session = self.session;
        ops::raw_query_entries(session, self, cx, lock, sql, args).await
    }

    pub async fn query(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        opts: &SelectOptions,
    ) -> Outcome<Vec<Row>, Error> {
        let session = self.session;
        ops::query(session, self, cx, lock, table, opts).await
    }

    pub async fn query_entries(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        opts: &SelectOptions,
    ) -> Outcome<Vec<Entries>, Error> {
        let session = self.session;
        ops::query_entries(session, self, cx, lock, table, opts).await
    }

    pub async fn raw_insert(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        let session = self.session;
        ops::raw_insert(session, self, cx, lock, sql, args).await
    }

    pub async fn insert(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        values: &[(&str, Value)],
        conflict: Option<Conflict>,
    ) -> Outcome<i64, Error> {
        let session = self.session;
        ops::insert(session, self, cx, lock, table, values, conflict).await
    }

    pub async fn raw_update(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        let session = self.session;
        ops::raw_change(session, self, cx, lock, sql, args).await
    }

    pub async fn update(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        values: &[(&str, Value)],
        opts: &WhereOptions,
        conflict: Option<Conflict>,
    ) -> Outcome<i64, Error> {
        let session = self.session;
        ops::update(session, self, cx, lock, table, values, opts, conflict).await
    }

    pub async fn raw_delete(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        let session = self.session;
        ops::raw_change(session, self, cx, lock, sql, args).await
    }

    pub async fn delete(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        opts: &WhereOptions,
    ) -> Outcome<i64, Error> {
        let session = self.session;
        ops::delete(session, self, cx, lock, table, opts).await
    }

    /// Compile a statement. Prepared handles are connection-wide; no
    /// transaction lock is involved.
    pub async fn prepare(&self, cx: &Cx, sql: &str) -> Outcome<Prepared<'s>, Error> {
        ops::prepare(self.session, cx, sql).await
    }

    /// Compile an INSERT into `table`.
    pub async fn prepare_insert(
        &self,
        cx: &Cx,
        table: &str,
        columns: &PrepareColumns,
        conflict: Option<Conflict>,
    ) -> Outcome<Prepared<'s>, Error> {
        ops::prepare_insert(self.session, cx, table, columns, conflict).await
    }

    /// Compile an UPDATE of `columns` in `table`.
    pub async fn prepare_update(
        &self,
        cx: &Cx,
        table: &str,
        columns: &PrepareColumns,
        opts: &WhereOptions,
        conflict: Option<Conflict>,
    ) -> Outcome<Prepared<'s>, Error> {
        ops::prepare_update(self.session, cx, table, columns, opts, conflict).await
    }

    /// Compile a DELETE from `table`.
    pub async fn prepare_delete(
        &self,
        cx: &Cx,
        table: &str,
        opts: &WhereOptions,
    ) -> Outcome<Prepared<'s>, Error> {
        ops::prepare_delete(self.session, cx, table, opts).await
    }

    /// Compile a SELECT over `table`.
    pub async fn prepare_query(
        &self,
        cx: &Cx,
        table: &str,
        opts: &SelectOptions,
    ) -> Outcome<Prepared<'s>, Error> {
        ops::prepare_query(self.session, cx, table, opts).await
    }

    /// Invoke a method on a prepared handle under this transaction's locks.
    pub async fn method(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        prepared: &Prepared<'_>,
        method: Method,
        args: &[Value],
    ) -> Outcome<Payload, Error> {
        let session = self.session;
        ops::method(session, self, cx, lock, prepared, method, args).await
    }
}

impl LockHost for Transaction<'_> {
    fn acquire<'a>(&'a mut self, cx: &'a Cx, intent: LockIntent) -> BoxedOutcome<'a, ()> {
        Box::pin(async move {
            if intent.write {
                self.write(cx).await
            } else {
                self.read(cx).await
            }
        })
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::transaction_closed());
        }
        Ok(())
    }
}

enum SpInner<'h> {
    Root(GateSlot),
    Nested(&'h mut dyn LockHost),
}

/// A named savepoint.
///
/// Root savepoints own their gate decisions; nested ones forward every
/// intent to the parent host and never touch the gate directly.
pub struct Savepoint<'h> {
    session: &'h Session,
    name: String,
    begun: bool,
    closed: bool,
    inner: SpInner<'h>,
}

impl<'h> Savepoint<'h> {
    pub(crate) fn init_root(session: &'h Session, name: &str) -> Savepoint<'h> {
        Savepoint {
            session,
            name: name.to_string(),
            begun: false,
            closed: false,
            inner: SpInner::Root(GateSlot::default()),
        }
    }

    pub(crate) async fn init_nested(
        session: &'h Session,
        parent: &'h mut dyn LockHost,
        cx: &Cx,
        name: &str,
    ) -> Outcome<Savepoint<'h>, Error> {
        // Nested creation is eager: take a write intent on the parent chain
        // and announce the savepoint immediately.
        match parent
            .acquire(
                cx,
                LockIntent {
                    write: true,
                    explicit: false,
                },
            )
            .await
        {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match session
            .execute(cx, LockMode::None, &format!("SAVEPOINT {name}"), &[])
            .await
        {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        Outcome::Ok(Savepoint {
            session,
            name: name.to_string(),
            begun: true,
            closed: false,
            inner: SpInner::Nested(parent),
        })
    }

    /// The savepoint's name as announced to the engine.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether release or rollback has already been issued.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True when this savepoint delegates locking to a parent.
    pub fn is_nested(&self) -> bool {
        matches!(self.inner, SpInner::Nested(_))
    }

    async fn root_write(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let session = self.session;
        {
            let SpInner::Root(slot) = &mut self.inner else {
                unreachable!("root_write on a nested savepoint")
            };
            match slot.exclusive(cx, session.gate()).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        if !self.begun {
            let sql = format!("SAVEPOINT {}", self.name);
            match session.execute(cx, LockMode::None, &sql, &[]).await {
                Outcome::Ok(()) => self.begun = true,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    async fn root_read(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let session = self.session;
        let SpInner::Root(slot) = &mut self.inner else {
            unreachable!("root_read on a nested savepoint")
        };
        slot.shared(cx, session.gate()).await
    }

    fn release_root(&mut self) {
        if let SpInner::Root(slot) = &mut self.inner {
            slot.release();
        }
    }

    /// Release the savepoint, keeping its changes.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Err(Error::savepoint_closed(&self.name));
        }
        self.closed = true;
        if self.begun {
            if let SpInner::Nested(parent) = &self.inner {
                if let Err(err) = parent.ensure_open() {
                    self.release_root();
                    return Outcome::Err(err);
                }
            }
            let sql = format!("RELEASE {}", self.name);
            let outcome = self.session.execute(cx, LockMode::None, &sql, &[]).await;
            self.release_root();
            return outcome;
        }
        self.session.trace_zero(&format!("RELEASE {}", self.name));
        self.release_root();
        Outcome::Ok(())
    }

    /// Roll back to the savepoint. Statement failures are swallowed.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Err(Error::savepoint_closed(&self.name));
        }
        self.closed = true;
        if self.begun {
            if let SpInner::Nested(parent) = &self.inner {
                if let Err(err) = parent.ensure_open() {
                    self.release_root();
                    return Outcome::Err(err);
                }
            }
            best_effort(self.session, cx, &format!("ROLLBACK TO {}", self.name)).await;
        } else {
            self.session
                .trace_zero(&format!("ROLLBACK TO {}", self.name));
        }
        self.release_root();
        Outcome::Ok(())
    }

    /// Create a deeper savepoint delegating through this one.
    pub async fn savepoint<'t>(
        &'t mut self,
        cx: &Cx,
        name: &str,
    ) -> Outcome<Savepoint<'t>, Error> {
        let session = self.session;
        Savepoint::init_nested(session, self, cx, name).await
    }

    /// Run `f` inside a deeper savepoint, mirroring
    /// [`Transaction::with_savepoint`].
    pub async fn with_savepoint<T, F>(&mut self, cx: &Cx, name: &str, f: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Savepoint<'_>) -> Outcome<T, Error>,
    {
        let mut sp = match self.savepoint(cx, name).await {
            Outcome::Ok(sp) => sp,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        drive_savepoint(&mut sp, cx, f).await
    }

    /// Start a batch whose commit locks through this savepoint.
    pub fn batch<'t>(&'t mut self) -> Batch<'t> {
        let session = self.session;
        Batch::with_host(session, self)
    }

    pub async fn execute(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<(), Error> {
        let session = self.session;
        ops::execute(session, self, cx, lock, sql, args).await
    }

    pub async fn raw_query(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<Vec<Row>, Error> {
        let session = self.session;
        ops::raw_query(session, self, cx, lock, sql, args).await
    }

    pub async fn raw_query_entries(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<Vec<Entries>, Error> {
        let session = self.session;
        ops::raw_query_entries(session, self, cx, lock, sql, args).await
    }

    pub async fn query(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        opts: &SelectOptions,
    ) -> Outcome<Vec<Row>, Error> {
        let session = self.session;
        ops::query(session, self, cx, lock, table, opts).await
    }

    pub async fn query_entries(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        opts: &SelectOptions,
    ) -> Outcome<Vec<Entries>, Error> {
        let session = self.session;
        ops::query_entries(session, self, cx, lock, table, opts).await
    }

    pub async fn raw_insert(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        let session = self.session;
        ops::raw_insert(session, self, cx, lock, sql, args).await
    }

    pub async fn insert(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        values: &[(&str, Value)],
        conflict: Option<Conflict>,
    ) -> Outcome<i64, Error> {
        let session = self.session;
        ops::insert(session, self, cx, lock, table, values, conflict).await
    }

    pub async fn raw_update(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        let session = self.session;
        ops::raw_change(session, self, cx, lock, sql, args).await
    }

    pub async fn update(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        values: &[(&str, Value)],
        opts: &WhereOptions,
        conflict: Option<Conflict>,
    ) -> Outcome<i64, Error> {
        let session = self.session;
        ops::update(session, self, cx, lock, table, values, opts, conflict).await
    }

    pub async fn raw_delete(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        let session = self.session;
        ops::raw_change(session, self, cx, lock, sql, args).await
    }

    pub async fn delete(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        opts: &WhereOptions,
    ) -> Outcome<i64, Error> {
        let session = self.session;
        ops::delete(session, self, cx, lock, table, opts).await
    }

    /// Compile a statement. Prepared handles are connection-wide.
    pub async fn prepare(&self, cx: &Cx, sql: &str) -> Outcome<Prepared<'h>, Error> {
        ops::prepare(self.session, cx, sql).await
    }

    /// Compile an INSERT into `table`.
    pub async fn prepare_insert(
        &self,
        cx: &Cx,
        table: &str,
        columns: &PrepareColumns,
        conflict: Option<Conflict>,
    ) -> Outcome<Prepared<'h>, Error> {
        ops::prepare_insert(self.session, cx, table, columns, conflict).await
    }

    /// Compile an UPDATE of `columns` in `table`.
    pub async fn prepare_update(
        &self,
        cx: &Cx,
        table: &str,
        columns: &PrepareColumns,
        opts: &WhereOptions,
        conflict: Option<Conflict>,
    ) -> Outcome<Prepared<'h>, Error> {
        ops::prepare_update(self.session, cx, table, columns, opts, conflict).await
    }

    /// Compile a DELETE from `table`.
    pub async fn prepare_delete(
        &self,
        cx: &Cx,
        table: &str,
        opts: &WhereOptions,
    ) -> Outcome<Prepared<'h>, Error> {
        ops::prepare_delete(self.session, cx, table, opts).await
    }

    /// Compile a SELECT over `table`.
    pub async fn prepare_query(
        &self,
        cx: &Cx,
        table: &str,
        opts: &SelectOptions,
    ) -> Outcome<Prepared<'h>, Error> {
        ops::prepare_query(self.session, cx, table, opts).await
    }

    /// Invoke a method on a prepared handle under this savepoint's locks.
    pub async fn method(
        &mut self,
        cx: &Cx,
        lock: Option<LockMode>,
        prepared: &Prepared<'_>,
        method: Method,
        args: &[Value],
    ) -> Outcome<Payload, Error> {
        let session = self.session;
        ops::method(session, self, cx, lock, prepared, method, args).await
    }
}

impl LockHost for Savepoint<'_> {
    fn acquire<'a>(&'a mut self, cx: &'a Cx, intent: LockIntent) -> BoxedOutcome<'a, ()> {
        Box::pin(async move {
            if self.closed {
                return Outcome::Err(Error::savepoint_closed(&self.name));
            }
            match &mut self.inner {
                SpInner::Nested(parent) => parent.acquire(cx, intent).await,
                SpInner::Root(_) => {
                    // Root savepoints treat a default read as a write so
                    // the savepoint boundary is announced before any
                    // operation; only an explicit shared request stays
                    // shared.
                    if !intent.write && intent.explicit {
                        self.root_read(cx).await
                    } else {
                        self.root_write(cx).await
                    }
                }
            }
        })
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::savepoint_closed(&self.name));
        }
        match &self.inner {
            SpInner::Nested(parent) => parent.ensure_open(),
            SpInner::Root(_) => Ok(()),
        }
    }
}

/// Commit-on-success / rollback-on-failure driver shared by the savepoint
/// helpers.
pub(crate) async fn drive_savepoint<T, F>(
    sp: &mut Savepoint<'_>,
    cx: &Cx,
    f: F,
) -> Outcome<T, Error>
where
    F: AsyncFnOnce(&mut Savepoint<'_>) -> Outcome<T, Error>,
{
    match f(sp).await {
        Outcome::Ok(value) => match sp.commit(cx).await {
            Outcome::Ok(()) => Outcome::Ok(value),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        },
        Outcome::Err(err) => {
            let _ = sp.rollback(cx).await;
            Outcome::Err(err)
        }
        Outcome::Cancelled(r) => {
            let _ = sp.rollback(cx).await;
            Outcome::Cancelled(r)
        }
        Outcome::Panicked(p) => {
            let _ = sp.rollback(cx).await;
            Outcome::Panicked(p)
        }
    }
}

/// The operation bodies shared by [`Transaction`] and [`Savepoint`]: route
/// the lock decision through the host, then run the session call unlocked.
pub(crate) mod ops {
    use super::{Builder, LockHost, LockIntent, PrepareBuilder, resolve_intent};
    use crate::builder::{Conflict, PrepareColumns, SelectOptions, WhereOptions};
    use crate::envelope::{Method, Payload};
    use crate::gate::LockMode;
    use crate::prepared::Prepared;
    use crate::session::Session;
    use sqlgate_core::row::Entries;
    use sqlgate_core::{Cx, Error, Outcome, Row, Value};

    pub(crate) async fn with_lock(
        host: &mut dyn LockHost,
        cx: &Cx,
        over: Option<LockMode>,
        default_write: bool,
    ) -> Outcome<(), Error> {
        match resolve_intent(over, default_write) {
            None => match host.ensure_open() {
                Ok(()) => Outcome::Ok(()),
                Err(err) => Outcome::Err(err),
            },
            Some(intent) => host.acquire(cx, intent).await,
        }
    }

    pub(crate) async fn execute(
        session: &Session,
        host: &mut dyn LockHost,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<(), Error> {
        match with_lock(host, cx, lock, true).await {
            Outcome::Ok(()) => session.execute(cx, LockMode::None, sql, args).await,
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub(crate) async fn raw_query(
        session: &Session,
        host: &mut dyn LockHost,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<Vec<Row>, Error> {
        match with_lock(host, cx, lock, false).await {
            Outcome::Ok(()) => session.query(cx, LockMode::None, sql, args).await,
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub(crate) async fn raw_query_entries(
        session: &Session,
        host: &mut dyn LockHost,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<Vec<Entries>, Error> {
        match with_lock(host, cx, lock, false).await {
            Outcome::Ok(()) => session.query_entries(cx, LockMode::None, sql, args).await,
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub(crate) async fn query(
        session: &Session,
        host: &mut dyn LockHost,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        opts: &SelectOptions,
    ) -> Outcome<Vec<Row>, Error> {
        let mut builder = Builder::new();
        if let Err(err) = builder.query(table, opts) {
            return Outcome::Err(err);
        }
        raw_query(session, host, cx, lock, builder.sql(), builder.args()).await
    }

    pub(crate) async fn query_entries(
        session: &Session,
        host: &mut dyn LockHost,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        opts: &SelectOptions,
    ) -> Outcome<Vec<Entries>, Error> {
        let mut builder = Builder::new();
        if let Err(err) = builder.query(table, opts) {
            return Outcome::Err(err);
        }
        raw_query_entries(session, host, cx, lock, builder.sql(), builder.args()).await
    }

    pub(crate) async fn raw_insert(
        session: &Session,
        host: &mut dyn LockHost,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        match with_lock(host, cx, lock, true).await {
            Outcome::Ok(()) => session.insert(cx, LockMode::None, sql, args).await,
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub(crate) async fn insert(
        session: &Session,
        host: &mut dyn LockHost,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        values: &[(&str, Value)],
        conflict: Option<Conflict>,
    ) -> Outcome<i64, Error> {
        let mut builder = Builder::new();
        builder.insert(table, values, conflict);
        raw_insert(session, host, cx, lock, builder.sql(), builder.args()).await
    }

    pub(crate) async fn raw_change(
        session: &Session,
        host: &mut dyn LockHost,
        cx: &Cx,
        lock: Option<LockMode>,
        sql: &str,
        args: &[Value],
    ) -> Outcome<i64, Error> {
        match with_lock(host, cx, lock, true).await {
            Outcome::Ok(()) => session.changes(cx, LockMode::None, sql, args).await,
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn update(
        session: &Session,
        host: &mut dyn LockHost,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        values: &[(&str, Value)],
        opts: &WhereOptions,
        conflict: Option<Conflict>,
    ) -> Outcome<i64, Error> {
        let mut builder = Builder::new();
        builder.update(table, values, opts, conflict);
        raw_change(session, host, cx, lock, builder.sql(), builder.args()).await
    }

    pub(crate) async fn delete(
        session: &Session,
        host: &mut dyn LockHost,
        cx: &Cx,
        lock: Option<LockMode>,
        table: &str,
        opts: &WhereOptions,
    ) -> Outcome<i64, Error> {
        let mut builder = Builder::new();
        builder.delete(table, opts);
        raw_change(session, host, cx, lock, builder.sql(), builder.args()).await
    }

    pub(crate) async fn prepare<'s>(
        session: &'s Session,
        cx: &Cx,
        sql: &str,
    ) -> Outcome<Prepared<'s>, Error> {
        match session.prepare(cx, sql).await {
            Outcome::Ok(id) => Outcome::Ok(Prepared::new(session, id, sql.to_string())),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub(crate) async fn prepare_insert<'s>(
        session: &'s Session,
        cx: &Cx,
        table: &str,
        columns: &PrepareColumns,
        conflict: Option<Conflict>,
    ) -> Outcome<Prepared<'s>, Error> {
        let mut builder = PrepareBuilder::new();
        if let Err(err) = builder.insert(table, columns, conflict) {
            return Outcome::Err(err);
        }
        prepare(session, cx, builder.sql()).await
    }

    pub(crate) async fn prepare_update<'s>(
        session: &'s Session,
        cx: &Cx,
        table: &str,
        columns: &PrepareColumns,
        opts: &WhereOptions,
        conflict: Option<Conflict>,
    ) -> Outcome<Prepared<'s>, Error> {
        let mut builder = PrepareBuilder::new();
        if let Err(err) = builder.update(table, columns, opts, conflict) {
            return Outcome::Err(err);
        }
        prepare(session, cx, builder.sql()).await
    }

    pub(crate) async fn prepare_delete<'s>(
        session: &'s Session,
        cx: &Cx,
        table: &str,
        opts: &WhereOptions,
    ) -> Outcome<Prepared<'s>, Error> {
        let mut builder = PrepareBuilder::new();
        builder.delete(table, opts);
        prepare(session, cx, builder.sql()).await
    }

    pub(crate) async fn prepare_query<'s>(
        session: &'s Session,
        cx: &Cx,
        table: &str,
        opts: &SelectOptions,
    ) -> Outcome<Prepared<'s>, Error> {
        let mut builder = PrepareBuilder::new();
        if let Err(err) = builder.query(table, opts) {
            return Outcome::Err(err);
        }
        prepare(session, cx, builder.sql()).await
    }

    /// Lock default per method kind: queries read, execute writes, metadata
    /// methods take no lock.
    fn method_default(method: Method) -> Option<bool> {
        match method {
            Method::First | Method::FirstEntry | Method::All | Method::AllEntries => Some(false),
            Method::Execute => Some(true),
            Method::Close | Method::Columns | Method::ExpandSql => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn method(
        session: &Session,
        host: &mut dyn LockHost,
        cx: &Cx,
        lock: Option<LockMode>,
        prepared: &Prepared<'_>,
        method: Method,
        args: &[Value],
    ) -> Outcome<Payload, Error> {
        if prepared.is_closed() {
            return Outcome::Err(Error::prepared_closed(prepared.id()));
        }
        let locked = match resolve_intent(lock, false) {
            Some(LockIntent {
                explicit: false, ..
            }) => match method_default(method) {
                Some(write) => {
                    host.acquire(
                        cx,
                        LockIntent {
                            write,
                            explicit: false,
                        },
                    )
                    .await
                }
                None => match host.ensure_open() {
                    Ok(()) => Outcome::Ok(()),
                    Err(err) => Outcome::Err(err),
                },
            },
            Some(intent) => host.acquire(cx, intent).await,
            None => match host.ensure_open() {
                Ok(()) => Outcome::Ok(()),
                Err(err) => Outcome::Err(err),
            },
        };
        match locked {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        // The handle may have been closed while waiting on the lock.
        if prepared.is_closed() {
            return Outcome::Err(Error::prepared_closed(prepared.id()));
        }
        let traced = matches!(
            method,
            Method::First
                | Method::FirstEntry
                | Method::All
                | Method::AllEntries
                | Method::Execute
        );
        session
            .method(
                cx,
                LockMode::None,
                prepared.id(),
                method,
                args,
                traced.then_some(prepared.sql()),
            )
            .await
    }
}
