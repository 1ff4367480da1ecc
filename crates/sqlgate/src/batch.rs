//! Batch executor: many heterogeneous operations, one round trip.
//!
//! A [`Batch`] accumulates an ordered list of operations, each optionally
//! named, and submits the whole list as one session-level batch call -
//! optionally wrapped in a savepoint for atomicity. After the engine
//! replies, three post-processing passes run over the raw slots: derived
//! insert/update/delete counts are spliced over the raw statement slot,
//! fresh prepared handle ids are wrapped into [`Prepared`] values bound to
//! this session, and named slots populate a lookup table readable after
//! commit.
//!
//! Build-time defects (duplicate names, a closed prepared handle) are
//! deferred and reported by `commit`, keeping the builder chainable.

use crate::builder::{Builder, Conflict, PrepareBuilder, PrepareColumns, SelectOptions, WhereOptions};
use crate::envelope::{BatchItem, ItemReply, Method, Payload};
use crate::gate::LockMode;
use crate::prepared::Prepared;
use crate::session::{Session, TracedStatement};
use crate::transaction::{LockHost, LockIntent};
use sqlgate_core::row::Entries;
use sqlgate_core::{Cx, Error, Outcome, Row, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Options for [`Batch::commit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchCommit {
    /// Explicit lock mode; defaults from the accumulated operations
    pub lock: Option<LockMode>,
    /// Wrap the whole batch in a savepoint so a mid-batch failure rolls
    /// everything back
    pub savepoint: bool,
}

impl BatchCommit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(mut self, lock: LockMode) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn savepoint(mut self, savepoint: bool) -> Self {
        self.savepoint = savepoint;
        self
    }
}

/// One post-commit result slot, matched by exhaustive case analysis.
#[derive(Debug, Clone)]
pub enum BatchValue<'s> {
    /// Rows from a query item
    Rows(Vec<Row>),
    /// Entries from an entries-query item
    Entries(Vec<Entries>),
    /// Derived scalar spliced over an insert/update/delete item
    Scalar(Value),
    /// A prepared handle created by this batch
    Prepared(Prepared<'s>),
    /// Value of a method call on an existing handle
    Method(Payload),
}

/// Accumulates operations for one atomic submission.
pub struct Batch<'s> {
    session: &'s Session,
    host: Option<&'s mut dyn LockHost>,
    items: Vec<BatchItem>,
    traced: Vec<TracedStatement>,
    /// Reply-slot indices whose derived scalar replaces the raw statement
    hooks: HashSet<usize>,
    /// Reply-slot index -> SQL of the prepare item occupying it
    prepares: HashMap<usize, String>,
    /// Reply-slot index -> caller-assigned name
    keys: HashMap<usize, String>,
    names: HashSet<String>,
    /// Number of reply slots accumulated so far
    slots: usize,
    read: bool,
    write: bool,
    defect: Option<Error>,
    values: Option<BTreeMap<String, BatchValue<'s>>>,
}

impl<'s> Batch<'s> {
    pub(crate) fn new(session: &'s Session) -> Self {
        Self {
            session,
            host: None,
            items: Vec::new(),
            traced: Vec::new(),
            hooks: HashSet::new(),
            prepares: HashMap::new(),
            keys: HashMap::new(),
            names: HashSet::new(),
            slots: 0,
            read: false,
            write: false,
            defect: None,
            values: None,
        }
    }

    pub(crate) fn with_host(session: &'s Session, host: &'s mut dyn LockHost) -> Self {
        let mut batch = Self::new(session);
        batch.host = Some(host);
        batch
    }

    /// Name -> value table of named items, populated by a successful commit.
    pub fn values(&self) -> Option<&BTreeMap<String, BatchValue<'s>>> {
        self.values.as_ref()
    }

    /// Look up one named item's value after commit.
    pub fn get(&self, name: &str) -> Option<&BatchValue<'s>> {
        self.values.as_ref()?.get(name)
    }

    fn name_slot(&mut self, name: Option<&str>) {
        if let Some(name) = name {
            if self.names.contains(name) {
                if self.defect.is_none() {
                    self.defect = Some(Error::protocol(format!("name already exists: {name}")));
                }
                return;
            }
            self.names.insert(name.to_string());
            self.keys.insert(self.slots, name.to_string());
        }
    }

    fn trace_sql(&mut self, sql: &str, args: &[Value], method: Option<Method>) {
        self.traced.push(TracedStatement {
            sql: sql.to_string(),
            args: args.to_vec(),
            method,
        });
    }

    /// Add a raw statement. With `result`, its rows occupy a reply slot.
    pub fn execute(
        &mut self,
        sql: &str,
        args: Vec<Value>,
        result: bool,
        name: Option<&str>,
    ) -> &mut Self {
        if result {
            self.name_slot(name);
            self.slots += 1;
        }
        self.trace_sql(sql, &args, None);
        let mut item = BatchItem::sql(sql, args);
        item.result = result;
        self.items.push(item);
        self.write = true;
        self
    }

    /// Add an INSERT whose reply slot is the inserted row id.
    pub fn raw_insert(&mut self, sql: &str, args: Vec<Value>, name: Option<&str>) -> &mut Self {
        self.name_slot(name);
        self.hooks.insert(self.slots);
        self.slots += 1;
        self.trace_sql(sql, &args, None);
        self.items.push(BatchItem::sql(sql, args));
        self.items.push(BatchItem::method(
            self.session.rowid_handle(),
            Method::First,
            Vec::new(),
            true,
        ));
        self.write = true;
        self
    }

    /// Add an INSERT built from `values`.
    pub fn insert(
        &mut self,
        table: &str,
        values: &[(&str, Value)],
        conflict: Option<Conflict>,
        name: Option<&str>,
    ) -> &mut Self {
        let mut builder = Builder::new();
        builder.insert(table, values, conflict);
        let (sql, args) = builder.into_parts();
        self.raw_insert(&sql, args, name)
    }

    fn change(&mut self, sql: &str, args: Vec<Value>, name: Option<&str>) {
        self.name_slot(name);
        self.hooks.insert(self.slots);
        self.slots += 1;
        self.trace_sql(sql, &args, None);
        self.items.push(BatchItem::sql(sql, args));
        self.items.push(BatchItem::method(
            self.session.changes_handle(),
            Method::First,
            Vec::new(),
            true,
        ));
        self.write = true;
    }

    /// Add a DELETE whose reply slot is the number of changes.
    pub fn raw_delete(&mut self, sql: &str, args: Vec<Value>, name: Option<&str>) -> &mut Self {
        self.change(sql, args, name);
        self
    }

    /// Add a DELETE built from `opts`.
    pub fn delete(&mut self, table: &str, opts: &WhereOptions, name: Option<&str>) -> &mut Self {
        let mut builder = Builder::new();
        builder.delete(table, opts);
        let (sql, args) = builder.into_parts();
        self.change(&sql, args, name);
        self
    }

    /// Add an UPDATE whose reply slot is the number of changes.
    pub fn raw_update(&mut self, sql: &str, args: Vec<Value>, name: Option<&str>) -> &mut Self {
        self.change(sql, args, name);
        self
    }

    /// Add an UPDATE built from `values`.
    pub fn update(
        &mut self,
        table: &str,
        values: &[(&str, Value)],
        opts: &WhereOptions,
        conflict: Option<Conflict>,
        name: Option<&str>,
    ) -> &mut Self {
        let mut builder = Builder::new();
        builder.update(table, values, opts, conflict);
        let (sql, args) = builder.into_parts();
        self.change(&sql, args, name);
        self
    }

    fn push_query(&mut self, sql: String, args: Vec<Value>, entries: bool, name: Option<&str>) {
        self.name_slot(name);
        self.slots += 1;
        self.trace_sql(&sql, &args, None);
        self.items.push(BatchItem::query(sql, args, entries));
        self.read = true;
    }

    /// Add a SELECT returning rows.
    pub fn raw_query(&mut self, sql: &str, args: Vec<Value>, name: Option<&str>) -> &mut Self {
        self.push_query(sql.to_string(), args, false, name);
        self
    }

    /// Add a SELECT returning key-value entries.
    pub fn raw_query_entries(
        &mut self,
        sql: &str,
        args: Vec<Value>,
        name: Option<&str>,
    ) -> &mut Self {
        self.push_query(sql.to_string(), args, true, name);
        self
    }

    /// Add a SELECT over `table` returning rows.
    pub fn query(&mut self, table: &str, opts: &SelectOptions, name: Option<&str>) -> &mut Self {
        let mut builder = Builder::new();
        match builder.query(table, opts) {
            Ok(()) => {
                let (sql, args) = builder.into_parts();
                self.push_query(sql, args, false, name);
            }
            Err(err) => {
                if self.defect.is_none() {
                    self.defect = Some(err);
                }
            }
        }
        self
    }

    /// Add a SELECT over `table` returning key-value entries.
    pub fn query_entries(
        &mut self,
        table: &str,
        opts: &SelectOptions,
        name: Option<&str>,
    ) -> &mut Self {
        let mut builder = Builder::new();
        match builder.query(table, opts) {
            Ok(()) => {
                let (sql, args) = builder.into_parts();
                self.push_query(sql, args, true, name);
            }
            Err(err) => {
                if self.defect.is_none() {
                    self.defect = Some(err);
                }
            }
        }
        self
    }

    /// Add a prepare item; its reply slot is the new handle.
    pub fn prepare(&mut self, sql: &str, name: Option<&str>) -> &mut Self {
        self.name_slot(name);
        self.prepares.insert(self.slots, sql.to_string());
        self.slots += 1;
        self.items.push(BatchItem::prepare(sql));
        self
    }

    /// Add a prepare item for an INSERT into `table`.
    pub fn prepare_insert(
        &mut self,
        table: &str,
        columns: &PrepareColumns,
        conflict: Option<Conflict>,
        name: Option<&str>,
    ) -> &mut Self {
        let mut builder = PrepareBuilder::new();
        match builder.insert(table, columns, conflict) {
            Ok(()) => {
                self.prepare(&builder.into_sql(), name);
            }
            Err(err) => {
                if self.defect.is_none() {
                    self.defect = Some(err);
                }
            }
        }
        self
    }

    /// Add a prepare item for a DELETE from `table`.
    pub fn prepare_delete(
        &mut self,
        table: &str,
        opts: &WhereOptions,
        name: Option<&str>,
    ) -> &mut Self {
        let mut builder = PrepareBuilder::new();
        builder.delete(table, opts);
        self.prepare(&builder.into_sql(), name);
        self
    }

    /// Add a prepare item for an UPDATE of `columns` in `table`.
    pub fn prepare_update(
        &mut self,
        table: &str,
        columns: &PrepareColumns,
        opts: &WhereOptions,
        conflict: Option<Conflict>,
        name: Option<&str>,
    ) -> &mut Self {
        let mut builder = PrepareBuilder::new();
        match builder.update(table, columns, opts, conflict) {
            Ok(()) => {
                self.prepare(&builder.into_sql(), name);
            }
            Err(err) => {
                if self.defect.is_none() {
                    self.defect = Some(err);
                }
            }
        }
        self
    }

    /// Add a prepare item for a SELECT over `table`.
    pub fn prepare_query(
        &mut self,
        table: &str,
        opts: &SelectOptions,
        name: Option<&str>,
    ) -> &mut Self {
        let mut builder = PrepareBuilder::new();
        match builder.query(table, opts) {
            Ok(()) => {
                self.prepare(&builder.into_sql(), name);
            }
            Err(err) => {
                if self.defect.is_none() {
                    self.defect = Some(err);
                }
            }
        }
        self
    }

    /// Add a method call on a previously prepared handle.
    pub fn method(
        &mut self,
        prepared: &Prepared<'_>,
        method: Method,
        args: Vec<Value>,
        name: Option<&str>,
    ) -> &mut Self {
        if prepared.is_closed() {
            if self.defect.is_none() {
                self.defect = Some(Error::prepared_closed(prepared.id()));
            }
            return self;
        }
        let result = method.returns_value();
        if result {
            self.name_slot(name);
            self.slots += 1;
        }
        match method {
            Method::First | Method::FirstEntry | Method::All | Method::AllEntries => {
                self.trace_sql(prepared.sql(), &args, Some(method));
                self.read = true;
            }
            Method::Execute => {
                self.trace_sql(prepared.sql(), &args, Some(method));
                self.write = true;
            }
            _ => {}
        }
        self.items
            .push(BatchItem::method(prepared.id(), method, args, result));
        self
    }

    /// Submit the accumulated operations as one engine batch and
    /// post-process the reply slots.
    pub async fn commit(&mut self, cx: &Cx, opts: BatchCommit) -> Outcome<Vec<BatchValue<'s>>, Error> {
        if let Some(defect) = self.defect.take() {
            return Outcome::Err(defect);
        }
        if self.items.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        let items = std::mem::take(&mut self.items);
        let traced = std::mem::take(&mut self.traced);

        let replies = match &mut self.host {
            Some(host) => {
                let locked = match batch_intent(opts.lock, self.write, self.read) {
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
                self.session
                    .batch(cx, LockMode::None, opts.savepoint, items, &traced)
                    .await
            }
            None => {
                let mode = opts.lock.unwrap_or(if self.write {
                    LockMode::Exclusive
                } else if self.read {
                    LockMode::Shared
                } else {
                    LockMode::None
                });
                self.session
                    .batch(cx, mode, opts.savepoint, items, &traced)
                    .await
            }
        };
        let replies = match replies {
            Outcome::Ok(replies) => replies,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        match self.assemble(replies) {
            Ok(values) => {
                self.publish_names(&values);
                Outcome::Ok(values)
            }
            Err(err) => Outcome::Err(err),
        }
    }

    /// The three post-processing passes. On a shape mismatch, handles
    /// already wrapped are finalized best-effort before the error surfaces.
    fn assemble(&self, replies: Vec<ItemReply>) -> Result<Vec<BatchValue<'s>>, Error> {
        let mut out = Vec::with_capacity(replies.len());
        let mut wrapped: Vec<Prepared<'s>> = Vec::new();
        for (slot, reply) in replies.into_iter().enumerate() {
            let value = if self.hooks.contains(&slot) {
                match reply {
                    ItemReply::Method(Payload::Row(Some(row))) => match row.get(0) {
                        Some(value) => BatchValue::Scalar(value.clone()),
                        None => return Err(self.poison(&wrapped, slot)),
                    },
                    _ => return Err(self.poison(&wrapped, slot)),
                }
            } else if let Some(sql) = self.prepares.get(&slot) {
                match reply {
                    ItemReply::Prepared(id) => {
                        let prepared = Prepared::new(self.session, id, sql.clone());
                        wrapped.push(prepared.clone());
                        BatchValue::Prepared(prepared)
                    }
                    _ => return Err(self.poison(&wrapped, slot)),
                }
            } else {
                match reply {
                    ItemReply::Rows(rows) => BatchValue::Rows(rows),
                    ItemReply::Entries(entries) => BatchValue::Entries(entries),
                    ItemReply::Method(payload) => BatchValue::Method(payload),
                    ItemReply::Prepared(_) => return Err(self.poison(&wrapped, slot)),
                }
            };
            out.push(value);
        }
        Ok(out)
    }

    fn poison(&self, wrapped: &[Prepared<'s>], slot: usize) -> Error {
        for prepared in wrapped {
            prepared.close();
        }
        Error::protocol(format!("batch reply slot {slot} has unexpected shape"))
    }

    fn publish_names(&mut self, values: &[BatchValue<'s>]) {
        if self.keys.is_empty() {
            self.values = None;
            return;
        }
        let mut table = BTreeMap::new();
        for (slot, name) in &self.keys {
            if let Some(value) = values.get(*slot) {
                table.insert(name.clone(), value.clone());
            }
        }
        self.values = Some(table);
    }
}

/// Lock intent for a hosted batch commit: explicit override wins, then
/// write beats read, then nothing.
fn batch_intent(over: Option<LockMode>, write: bool, read: bool) -> Option<LockIntent> {
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
        None if write => Some(LockIntent {
            write: true,
            explicit: false,
        }),
        None if read => Some(LockIntent {
            write: false,
            explicit: false,
        }),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_intent_resolution() {
        assert_eq!(batch_intent(Some(LockMode::None), true, true), None);
        assert_eq!(
            batch_intent(None, true, true),
            Some(LockIntent {
                write: true,
                explicit: false
            })
        );
        assert_eq!(
            batch_intent(None, false, true),
            Some(LockIntent {
                write: false,
                explicit: false
            })
        );
        assert_eq!(batch_intent(None, false, false), None);
        assert_eq!(
            batch_intent(Some(LockMode::Shared), true, false),
            Some(LockIntent {
                write: false,
                explicit: true
            })
        );
    }
}
