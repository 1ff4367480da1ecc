//! Worker-side request service.
//!
//! The service hosts the engine on the connection worker thread and executes
//! decoded [`Request`]s against it. It owns the two pieces of engine-adjacent
//! bookkeeping the caller side never sees: the prepared-statement handle
//! table and the auto-savepoint allocator used to wrap batches.
//!
//! Handle and savepoint ids are per-connection monotonic counters that wrap
//! around and skip ids still live, so a long-running connection can never
//! collide a recycled id with an open resource.

use crate::engine::{Engine, EngineStatement};
use crate::envelope::{BatchItem, ItemReply, Method, Payload, Request, Statement};
use sqlgate_core::{Error, Result, Row, Value};
use std::collections::HashMap;

/// Prefix of auto-generated batch savepoint names.
const AUTO_SAVEPOINT_PREFIX: &str = "auto_gate_save_";

/// Allocates ids that wrap around and never collide with live ones.
#[derive(Debug, Default)]
struct IdAllocator {
    last: u64,
}

impl IdAllocator {
    fn next(&mut self, live: impl Fn(u64) -> bool) -> u64 {
        let mut id = self.last;
        loop {
            id = if id == u64::MAX { 1 } else { id + 1 };
            if !live(id) {
                self.last = id;
                return id;
            }
        }
    }
}

/// Prepared statements registered with the engine, keyed by handle id.
struct HandleTable {
    ids: IdAllocator,
    handles: HashMap<u64, Box<dyn EngineStatement>>,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            ids: IdAllocator::default(),
            handles: HashMap::new(),
        }
    }

    fn insert(&mut self, stmt: Box<dyn EngineStatement>) -> u64 {
        let id = self.ids.next(|id| self.handles.contains_key(&id));
        self.handles.insert(id, stmt);
        id
    }

    fn get(&mut self, id: u64) -> Result<&mut Box<dyn EngineStatement>, Error> {
        self.handles
            .get_mut(&id)
            .ok_or_else(|| Error::prepared_not_found(id))
    }

    /// Finalize the handle. Dropping the statement releases engine resources.
    fn remove(&mut self, id: u64) {
        self.handles.remove(&id);
    }

    fn clear(&mut self) {
        self.handles.clear();
        self.ids.last = 0;
    }
}

/// Auto-named savepoints wrapping batch requests.
struct SavepointTable {
    ids: IdAllocator,
    live: std::collections::HashSet<u64>,
}

impl SavepointTable {
    fn new() -> Self {
        Self {
            ids: IdAllocator::default(),
            live: std::collections::HashSet::new(),
        }
    }

    fn save(&mut self, engine: &mut dyn Engine) -> Result<u64, Error> {
        let id = self.ids.next(|id| self.live.contains(&id));
        engine.execute(&format!("SAVEPOINT {AUTO_SAVEPOINT_PREFIX}{id}"), &[])?;
        self.live.insert(id);
        Ok(id)
    }

    fn release(&mut self, engine: &mut dyn Engine, id: u64) -> Result<(), Error> {
        self.live.remove(&id);
        engine.execute(&format!("RELEASE {AUTO_SAVEPOINT_PREFIX}{id}"), &[])
    }

    fn rollback(&mut self, engine: &mut dyn Engine, id: u64) -> Result<(), Error> {
        self.live.remove(&id);
        engine.execute(&format!("ROLLBACK TO {AUTO_SAVEPOINT_PREFIX}{id}"), &[])
    }

    fn clear(&mut self) {
        self.live.clear();
        self.ids.last = 0;
    }
}

/// The worker-side host: one engine plus its bookkeeping.
pub(crate) struct Service {
    engine: Box<dyn Engine>,
    handles: HandleTable,
    savepoints: SavepointTable,
}

impl Service {
    pub(crate) fn new(engine: Box<dyn Engine>) -> Self {
        Self {
            engine,
            handles: HandleTable::new(),
            savepoints: SavepointTable::new(),
        }
    }

    /// Execute one request. The coalesced [`Request::Task`] envelope is
    /// answered with per-item outcomes in submission order; its outer reply
    /// never fails.
    pub(crate) fn invoke(&mut self, request: Request) -> Result<Payload, Error> {
        match request {
            Request::Task(requests) => {
                let mut results = Vec::with_capacity(requests.len());
                for request in requests {
                    results.push(self.invoke_one(request));
                }
                Ok(Payload::Task(results))
            }
            other => self.invoke_one(other),
        }
    }

    fn invoke_one(&mut self, request: Request) -> Result<Payload, Error> {
        match request {
            Request::Execute { sql, args } => {
                self.engine.execute(&sql, &args)?;
                Ok(Payload::None)
            }
            Request::Query { sql, args, entries } => {
                let rows = self.engine.query(&sql, &args)?;
                Ok(if entries {
                    Payload::Entries(rows.iter().map(Row::entries).collect())
                } else {
                    Payload::Rows(rows)
                })
            }
            Request::Prepare { sql } => {
                let stmt = self.engine.prepare(&sql)?;
                Ok(Payload::Handle(self.handles.insert(stmt)))
            }
            Request::Method {
                handle,
                method,
                args,
                want,
            } => {
                let payload = self.run_method(handle, method, &args)?;
                Ok(if want { payload } else { Payload::None })
            }
            Request::Batch { savepoint, items } => {
                let replies = self.run_batch(savepoint, items)?;
                Ok(Payload::Items(replies))
            }
            Request::Close { force } => {
                self.savepoints.clear();
                self.handles.clear();
                self.engine.close(force)?;
                Ok(Payload::None)
            }
            Request::Task(_) => Err(Error::protocol("nested task envelope")),
        }
    }

    fn run_method(&mut self, id: u64, method: Method, args: &[Value]) -> Result<Payload, Error> {
        if method == Method::Close {
            // Lookup first so closing an unknown handle is still an error.
            self.handles.get(id)?;
            self.handles.remove(id);
            return Ok(Payload::None);
        }
        let stmt = self.handles.get(id)?;
        match method {
            Method::Columns => Ok(Payload::Columns(stmt.columns()?)),
            Method::First => Ok(Payload::Row(stmt.first(args)?)),
            Method::FirstEntry => Ok(Payload::EntriesRow(
                stmt.first(args)?.map(|row| row.entries()),
            )),
            Method::All => Ok(Payload::Rows(stmt.all(args)?)),
            Method::AllEntries => Ok(Payload::Entries(
                stmt.all(args)?.iter().map(Row::entries).collect(),
            )),
            Method::Execute => {
                stmt.execute(args)?;
                Ok(Payload::None)
            }
            Method::ExpandSql => Ok(Payload::Sql(stmt.expand_sql(args)?)),
            Method::Close => unreachable!("handled above"),
        }
    }

    /// Execute a batch. On any mid-batch failure, handles opened earlier in
    /// the same batch are finalized and the auto savepoint (if any) rolled
    /// back best-effort, so the original error propagates unmasked.
    fn run_batch(
        &mut self,
        savepoint: bool,
        items: Vec<BatchItem>,
    ) -> Result<Vec<ItemReply>, Error> {
        let auto = if savepoint {
            Some(self.savepoints.save(&mut *self.engine)?)
        } else {
            None
        };

        let mut replies = Vec::new();
        let mut opened = Vec::new();

        let run = self.run_batch_items(items, &mut replies, &mut opened);
        match run {
            Ok(()) => {
                if let Some(id) = auto {
                    if let Err(err) = self.savepoints.release(&mut *self.engine, id) {
                        self.cleanup_batch(&opened, None);
                        let _ = self.savepoints.rollback(&mut *self.engine, id);
                        return Err(err);
                    }
                }
                Ok(replies)
            }
            Err(err) => {
                self.cleanup_batch(&opened, auto);
                Err(err)
            }
        }
    }

    fn run_batch_items(
        &mut self,
        items: Vec<BatchItem>,
        replies: &mut Vec<ItemReply>,
        opened: &mut Vec<u64>,
    ) -> Result<(), Error> {
        for item in items {
            match item.statement {
                Statement::Handle(id) => {
                    let Some(method) = item.method else {
                        return Err(Error::protocol("batch handle item without a method"));
                    };
                    let payload = self.run_method(id, method, &item.args)?;
                    if item.result {
                        replies.push(ItemReply::Method(payload));
                    }
                }
                Statement::Sql(ref sql) if item.prepare => {
                    let stmt = self.engine.prepare(sql)?;
                    let id = self.handles.insert(stmt);
                    opened.push(id);
                    if item.result {
                        replies.push(ItemReply::Prepared(id));
                    }
                }
                Statement::Sql(ref sql) => {
                    if item.result {
                        let rows = self.engine.query(sql, &item.args)?;
                        replies.push(if item.entries {
                            ItemReply::Entries(rows.iter().map(Row::entries).collect())
                        } else {
                            ItemReply::Rows(rows)
                        });
                    } else {
                        self.engine.execute(sql, &item.args)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn cleanup_batch(&mut self, opened: &[u64], auto: Option<u64>) {
        for &id in opened {
            self.handles.remove(id);
        }
        if let Some(id) = auto {
            if let Err(err) = self.savepoints.rollback(&mut *self.engine, id) {
                tracing::debug!(target: "sqlgate::service", %err, "batch rollback swallowed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlgate_core::Row;

    use std::sync::{Arc, Mutex};

    /// Records every statement it sees; queries return one canned row.
    struct ScriptEngine {
        log: Arc<Mutex<Vec<String>>>,
        fail_on: Option<String>,
    }

    impl ScriptEngine {
        fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                fail_on: None,
            }
        }

        fn record(&self, entry: impl Into<String>) {
            self.log.lock().expect("log lock").push(entry.into());
        }
    }

    struct ScriptStatement;

    impl EngineStatement for ScriptStatement {
        fn columns(&mut self) -> Result<Vec<String>, Error> {
            Ok(vec!["v".to_string()])
        }
        fn first(&mut self, _args: &[Value]) -> Result<Option<Row>, Error> {
            Ok(Some(Row::new(
                vec!["v".to_string()],
                vec![Value::Integer(7)],
            )))
        }
        fn all(&mut self, _args: &[Value]) -> Result<Vec<Row>, Error> {
            Ok(vec![])
        }
        fn execute(&mut self, _args: &[Value]) -> Result<(), Error> {
            Ok(())
        }
        fn expand_sql(&mut self, _args: &[Value]) -> Result<String, Error> {
            Ok("SELECT v".to_string())
        }
    }

    impl Engine for ScriptEngine {
        fn execute(&mut self, sql: &str, _args: &[Value]) -> Result<(), Error> {
            if self.fail_on.as_deref() == Some(sql) {
                return Err(Error::query("scripted failure", Some(1)));
            }
            self.record(sql);
            Ok(())
        }
        fn query(&mut self, sql: &str, _args: &[Value]) -> Result<Vec<Row>, Error> {
            if self.fail_on.as_deref() == Some(sql) {
                return Err(Error::query("scripted failure", Some(1)));
            }
            self.record(sql);
            Ok(vec![Row::new(
                vec!["v".to_string()],
                vec![Value::Integer(1)],
            )])
        }
        fn prepare(&mut self, sql: &str) -> Result<Box<dyn EngineStatement>, Error> {
            self.record(format!("prepare:{sql}"));
            Ok(Box::new(ScriptStatement))
        }
        fn close(&mut self, _force: bool) -> Result<(), Error> {
            self.record("close");
            Ok(())
        }
    }

    #[test]
    fn test_id_allocator_skips_live_ids() {
        let mut ids = IdAllocator { last: u64::MAX - 1 };
        let live = [u64::MAX, 1, 2];
        let id = ids.next(|id| live.contains(&id));
        // Wraps past MAX and past the live low ids.
        assert_eq!(id, 3);
    }

    #[test]
    fn test_prepare_then_method() {
        let mut service = Service::new(Box::new(ScriptEngine::new()));
        let id = match service.invoke(Request::Prepare {
            sql: "SELECT v".into(),
        }) {
            Ok(Payload::Handle(id)) => id,
            other => panic!("unexpected reply: {other:?}"),
        };

        let reply = service
            .invoke(Request::Method {
                handle: id,
                method: Method::First,
                args: vec![],
                want: true,
            })
            .expect("method should succeed");
        match reply {
            Payload::Row(Some(row)) => assert_eq!(row.get(0), Some(&Value::Integer(7))),
            other => panic!("unexpected reply: {other:?}"),
        }

        service
            .invoke(Request::Method {
                handle: id,
                method: Method::Close,
                args: vec![],
                want: false,
            })
            .expect("close should succeed");

        let err = service
            .invoke(Request::Method {
                handle: id,
                method: Method::First,
                args: vec![],
                want: true,
            })
            .expect_err("closed handle should error");
        assert_eq!(err, Error::prepared_not_found(id));
    }

    #[test]
    fn test_task_envelope_returns_per_item_outcomes() {
        let mut engine = ScriptEngine::new();
        engine.fail_on = Some("BAD".to_string());
        let mut service = Service::new(Box::new(engine));

        let reply = service
            .invoke(Request::Task(vec![
                Request::Execute {
                    sql: "A".into(),
                    args: vec![],
                },
                Request::Execute {
                    sql: "BAD".into(),
                    args: vec![],
                },
                Request::Execute {
                    sql: "B".into(),
                    args: vec![],
                },
            ]))
            .expect("task envelope itself never fails");

        match reply {
            Payload::Task(results) => {
                assert_eq!(results.len(), 3);
                assert_eq!(results[0], Ok(Payload::None));
                assert!(results[1].is_err());
                // A failed item does not poison later items in the envelope.
                assert_eq!(results[2], Ok(Payload::None));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_batch_savepoint_wraps_and_releases() {
        let engine = ScriptEngine::new();
        let log = Arc::clone(&engine.log);
        let mut service = Service::new(Box::new(engine));
        service
            .invoke(Request::Batch {
                savepoint: true,
                items: vec![BatchItem::sql("INSERT", vec![])],
            })
            .expect("batch should succeed");

        let log = log.lock().expect("log lock");
        assert_eq!(
            *log,
            vec![
                "SAVEPOINT auto_gate_save_1".to_string(),
                "INSERT".to_string(),
                "RELEASE auto_gate_save_1".to_string(),
            ]
        );
    }

    #[test]
    fn test_batch_failure_finalizes_opened_handles_and_rolls_back() {
        let mut engine = ScriptEngine::new();
        engine.fail_on = Some("BAD".to_string());
        let mut service = Service::new(Box::new(engine));

        let err = service
            .invoke(Request::Batch {
                savepoint: true,
                items: vec![
                    BatchItem::prepare("SELECT v"),
                    BatchItem::sql("BAD", vec![]),
                ],
            })
            .expect_err("mid-batch failure must abort the batch");
        assert_eq!(err.status(), Some(1));

        // The speculatively opened handle was finalized.
        assert!(service.handles.handles.is_empty());
        // The auto savepoint is no longer live.
        assert!(service.savepoints.live.is_empty());
    }

    #[test]
    fn test_batch_reply_slots_match_result_items_only() {
        let mut service = Service::new(Box::new(ScriptEngine::new()));
        let reply = service
            .invoke(Request::Batch {
                savepoint: false,
                items: vec![
                    BatchItem::sql("INSERT", vec![]),
                    BatchItem::query("SELECT", vec![], false),
                    BatchItem::prepare("SELECT v"),
                ],
            })
            .expect("batch should succeed");
        match reply {
            Payload::Items(slots) => {
                assert_eq!(slots.len(), 2);
                assert!(matches!(slots[0], ItemReply::Rows(_)));
                assert!(matches!(slots[1], ItemReply::Prepared(_)));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
