//! Shared test support: a small in-memory engine honouring the SQL the
//! coordination layer emits, plus polling helpers for driving futures by
//! hand.

#![allow(dead_code)]

use sqlgate::{Engine, EngineStatement};
use sqlgate_core::{Cx, Error, Outcome, Result, Row, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;

/// SQLITE_CONSTRAINT, the status code surfaced on unique violations.
pub const CONSTRAINT: i32 = 19;

pub fn test_cx() -> Cx {
    Cx::for_testing()
}

pub fn cancelled_cx() -> Cx {
    let cx = Cx::for_testing();
    cx.set_cancel_requested(true);
    cx
}

struct NoopWaker;

impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

/// Spin-polling executor; worker threads make progress independently, so
/// pending futures resolve without a real runtime.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let waker = Waker::from(Arc::new(NoopWaker));
    let mut context = Context::from_waker(&waker);
    let mut pinned = Box::pin(future);
    loop {
        match pinned.as_mut().poll(&mut context) {
            Poll::Ready(value) => return value,
            Poll::Pending => thread::yield_now(),
        }
    }
}

pub fn poll_once<F: Future>(future: &mut Pin<Box<F>>) -> Poll<F::Output> {
    let waker = Waker::from(Arc::new(NoopWaker));
    let mut context = Context::from_waker(&waker);
    future.as_mut().poll(&mut context)
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

#[derive(Clone)]
struct Table {
    columns: Vec<String>,
    /// Index of the column with a PRIMARY KEY / UNIQUE constraint.
    unique: Option<usize>,
    rows: Vec<Vec<Value>>,
}

#[derive(Clone, Default)]
struct Snapshot {
    tables: HashMap<String, Table>,
    last_rowid: i64,
    changes: i64,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    last_rowid: i64,
    changes: i64,
    /// Stack of (name, snapshot); "" marks the transaction boundary.
    stack: Vec<(String, Snapshot)>,
    log: Vec<String>,
    closed: bool,
}

impl State {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            tables: self.tables.clone(),
            last_rowid: self.last_rowid,
            changes: self.changes,
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.tables = snapshot.tables;
        self.last_rowid = snapshot.last_rowid;
        self.changes = snapshot.changes;
    }
}

/// In-memory engine speaking exactly the SQL the builders and the
/// coordination layer emit. Statements are logged for assertions.
pub struct MemoryEngine {
    state: Arc<Mutex<State>>,
}

/// Observer half: inspect the statement log from the test thread.
#[derive(Clone)]
pub struct EngineProbe {
    state: Arc<Mutex<State>>,
}

impl EngineProbe {
    pub fn log(&self) -> Vec<String> {
        self.state.lock().expect("engine state").log.clone()
    }

    pub fn statements_matching(&self, needle: &str) -> usize {
        self.log().iter().filter(|sql| sql.contains(needle)).count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("engine state").closed
    }

    pub fn rows_of(&self, table: &str) -> usize {
        self.state
            .lock()
            .expect("engine state")
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// A fresh engine over the same stored data, as if the database file
    /// were reopened.
    pub fn reopen(&self) -> MemoryEngine {
        let mut state = self.state.lock().expect("engine state");
        state.closed = false;
        state.log.clear();
        MemoryEngine {
            state: Arc::clone(&self.state),
        }
    }
}

impl MemoryEngine {
    pub fn new() -> (Self, EngineProbe) {
        let state = Arc::new(Mutex::new(State::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            EngineProbe { state },
        )
    }
}

fn constraint_error(table: &str) -> Error {
    Error::query(format!("UNIQUE constraint failed: {table}"), Some(CONSTRAINT))
}

fn syntax_error(sql: &str) -> Error {
    Error::query(format!("unsupported statement: {sql}"), Some(1))
}

/// Strip one pair of double quotes, the builders' identifier escape.
fn unquote(name: &str) -> String {
    name.trim().trim_matches('"').to_string()
}

fn split_csv(text: &str) -> Vec<String> {
    text.split(',').map(|part| part.trim().to_string()).collect()
}

/// Bind `?` placeholders and inline NULL/integer literals of a VALUES or
/// SET list entry.
fn bind_value(token: &str, args: &[Value], next: &mut usize) -> Result<Value, Error> {
    let token = token.trim();
    if token == "?" {
        let value = args
            .get(*next)
            .cloned()
            .ok_or_else(|| Error::query("missing bound argument", Some(1)))?;
        *next += 1;
        Ok(value)
    } else if token.eq_ignore_ascii_case("null") {
        Ok(Value::Null)
    } else if let Ok(int) = token.parse::<i64>() {
        Ok(Value::Integer(int))
    } else {
        Ok(Value::Text(token.trim_matches('\'').to_string()))
    }
}

/// Parse `col = <? | literal>` equality filters.
struct Filter {
    column: String,
    value: Value,
}

fn parse_where(clause: &str, args: &[Value], next: &mut usize) -> Result<Filter, Error> {
    let (column, rhs) = clause
        .split_once('=')
        .ok_or_else(|| syntax_error(clause))?;
    Ok(Filter {
        column: unquote(column),
        value: bind_value(rhs, args, next)?,
    })
}

fn run_statement(state: &mut State, sql: &str, args: &[Value]) -> Result<Vec<Row>, Error> {
    let trimmed = sql.trim();
    state.log.push(trimmed.to_string());
    let upper = trimmed.to_ascii_uppercase();

    if upper.starts_with("BEGIN") {
        let snapshot = state.snapshot();
        state.stack.push((String::new(), snapshot));
        return Ok(Vec::new());
    }
    if upper == "COMMIT" {
        state.stack.clear();
        return Ok(Vec::new());
    }
    if upper == "ROLLBACK" {
        if let Some(at) = state.stack.iter().position(|(name, _)| name.is_empty()) {
            let (_, snapshot) = state.stack.remove(at);
            state.stack.truncate(at);
            state.restore(snapshot);
        }
        return Ok(Vec::new());
    }
    if let Some(name) = upper
        .strip_prefix("ROLLBACK TO ")
        .map(|_| trimmed[12..].trim().to_string())
    {
        let at = state
            .stack
            .iter()
            .rposition(|(sp, _)| *sp == name)
            .ok_or_else(|| syntax_error(trimmed))?;
        let (_, snapshot) = state.stack.remove(at);
        state.stack.truncate(at);
        state.restore(snapshot);
        return Ok(Vec::new());
    }
    if upper.starts_with("SAVEPOINT ") {
        let name = trimmed[10..].trim().to_string();
        let snapshot = state.snapshot();
        state.stack.push((name, snapshot));
        return Ok(Vec::new());
    }
    if upper.starts_with("RELEASE ") {
        let name = trimmed[8..].trim();
        let at = state
            .stack
            .iter()
            .rposition(|(sp, _)| sp == name)
            .ok_or_else(|| syntax_error(trimmed))?;
        state.stack.truncate(at);
        return Ok(Vec::new());
    }
    if upper.starts_with("CREATE TABLE") {
        return create_table(state, trimmed);
    }
    if upper.starts_with("INSERT") {
        return insert(state, trimmed, args);
    }
    if upper.starts_with("UPDATE") {
        return update(state, trimmed, args);
    }
    if upper.starts_with("DELETE FROM") {
        return delete(state, trimmed, args);
    }
    if upper.starts_with("SELECT") {
        return select(state, trimmed, args);
    }
    Err(syntax_error(trimmed))
}

fn create_table(state: &mut State, sql: &str) -> Result<Vec<Row>, Error> {
    let open = sql.find('(').ok_or_else(|| syntax_error(sql))?;
    let close = sql.rfind(')').ok_or_else(|| syntax_error(sql))?;
    let head = &sql[..open];
    let name = unquote(head.split_whitespace().last().ok_or_else(|| syntax_error(sql))?);
    let if_not_exists = head.to_ascii_uppercase().contains("IF NOT EXISTS");
    if state.tables.contains_key(&name) {
        if if_not_exists {
            return Ok(Vec::new());
        }
        return Err(Error::query(format!("table {name} already exists"), Some(1)));
    }
    let mut columns = Vec::new();
    let mut unique = None;
    for (index, def) in split_csv(&sql[open + 1..close]).iter().enumerate() {
        let mut words = def.split_whitespace();
        let column = unquote(words.next().ok_or_else(|| syntax_error(sql))?);
        let rest = def.to_ascii_uppercase();
        if rest.contains("PRIMARY KEY") || rest.contains("UNIQUE") {
            unique = Some(index);
        }
        columns.push(column);
    }
    state.tables.insert(
        name,
        Table {
            columns,
            unique,
            rows: Vec::new(),
        },
    );
    Ok(Vec::new())
}

fn insert(state: &mut State, sql: &str, args: &[Value]) -> Result<Vec<Row>, Error> {
    let upper = sql.to_ascii_uppercase();
    let into = upper.find(" INTO ").ok_or_else(|| syntax_error(sql))?;
    let open = sql.find('(').ok_or_else(|| syntax_error(sql))?;
    let name = unquote(&sql[into + 6..open]);
    let close = open + sql[open..].find(')').ok_or_else(|| syntax_error(sql))?;
    let columns: Vec<String> = split_csv(&sql[open + 1..close])
        .iter()
        .map(|c| unquote(c))
        .collect();

    let values_at = upper.find(" VALUES ").ok_or_else(|| syntax_error(sql))?;
    let vopen = sql[values_at..]
        .find('(')
        .map(|at| values_at + at)
        .ok_or_else(|| syntax_error(sql))?;
    let vclose = sql.rfind(')').ok_or_else(|| syntax_error(sql))?;
    let mut next = 0;
    let mut bound = Vec::new();
    for token in split_csv(&sql[vopen + 1..vclose]) {
        bound.push(bind_value(&token, args, &mut next)?);
    }

    let or_ignore = upper.contains("OR IGNORE");
    let or_replace = upper.contains("OR REPLACE");
    let table = state
        .tables
        .get_mut(&name)
        .ok_or_else(|| Error::query(format!("no such table: {name}"), Some(1)))?;

    let mut row = vec![Value::Null; table.columns.len()];
    for (column, value) in columns.iter().zip(bound) {
        let at = table
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| Error::query(format!("no such column: {column}"), Some(1)))?;
        row[at] = value;
    }

    if let Some(unique) = table.unique {
        if let Some(existing) = table
            .rows
            .iter()
            .position(|r| !row[unique].is_null() && r[unique] == row[unique])
        {
            if or_ignore {
                state.changes = 0;
                return Ok(Vec::new());
            }
            if or_replace {
                table.rows.remove(existing);
            } else {
                return Err(constraint_error(&name));
            }
        }
        if let Some(id) = row[unique].as_i64() {
            state.last_rowid = id;
        } else {
            state.last_rowid += 1;
            row[unique] = Value::Integer(state.last_rowid);
        }
    } else {
        state.last_rowid += 1;
    }
    table.rows.push(row);
    state.changes = 1;
    Ok(Vec::new())
}

fn update(state: &mut State, sql: &str, args: &[Value]) -> Result<Vec<Row>, Error> {
    let upper = sql.to_ascii_uppercase();
    let set_at = upper.find(" SET ").ok_or_else(|| syntax_error(sql))?;
    let name = unquote(
        sql[..set_at]
            .split_whitespace()
            .last()
            .ok_or_else(|| syntax_error(sql))?,
    );
    let (set_part, where_part) = match upper.find(" WHERE ") {
        Some(at) => (&sql[set_at + 5..at], Some(&sql[at + 7..])),
        None => (&sql[set_at + 5..], None),
    };

    let mut next = 0;
    let mut updates = Vec::new();
    for entry in split_csv(set_part) {
        let (column, rhs) = entry.split_once('=').ok_or_else(|| syntax_error(sql))?;
        updates.push((unquote(column), bind_value(rhs, args, &mut next)?));
    }
    let filter = match where_part {
        Some(clause) => Some(parse_where(clause, args, &mut next)?),
        None => None,
    };

    let table = state
        .tables
        .get_mut(&name)
        .ok_or_else(|| Error::query(format!("no such table: {name}"), Some(1)))?;
    let mut changed = 0_i64;
    for row in &mut table.rows {
        if let Some(filter) = &filter {
            let at = table
                .columns
                .iter()
                .position(|c| *c == filter.column)
                .ok_or_else(|| Error::query(format!("no such column: {}", filter.column), Some(1)))?;
            if row[at] != filter.value {
                continue;
            }
        }
        for (column, value) in &updates {
            let at = table
                .columns
                .iter()
                .position(|c| c == column)
                .ok_or_else(|| Error::query(format!("no such column: {column}"), Some(1)))?;
            row[at] = value.clone();
        }
        changed += 1;
    }
    state.changes = changed;
    Ok(Vec::new())
}

fn delete(state: &mut State, sql: &str, args: &[Value]) -> Result<Vec<Row>, Error> {
    let upper = sql.to_ascii_uppercase();
    let (name, filter) = match upper.find(" WHERE ") {
        Some(at) => {
            let mut next = 0;
            (
                unquote(sql[11..at].trim()),
                Some(parse_where(&sql[at + 7..], args, &mut next)?),
            )
        }
        None => (unquote(sql[11..].trim()), None),
    };
    let table = state
        .tables
        .get_mut(&name)
        .ok_or_else(|| Error::query(format!("no such table: {name}"), Some(1)))?;
    let before = table.rows.len();
    match filter {
        Some(filter) => {
            let at = table
                .columns
                .iter()
                .position(|c| *c == filter.column)
                .ok_or_else(|| Error::query(format!("no such column: {}", filter.column), Some(1)))?;
            table.rows.retain(|row| row[at] != filter.value);
        }
        None => table.rows.clear(),
    }
    state.changes = (before - table.rows.len()) as i64;
    Ok(Vec::new())
}

fn select(state: &mut State, sql: &str, args: &[Value]) -> Result<Vec<Row>, Error> {
    let upper = sql.to_ascii_uppercase();
    let Some(from_at) = upper.find(" FROM ") else {
        // Expression selects: last_insert_rowid() / changes().
        let expr = sql[6..].trim().to_string();
        let value = if upper.contains("LAST_INSERT_ROWID") {
            Value::Integer(state.last_rowid)
        } else if upper.contains("CHANGES") {
            Value::Integer(state.changes)
        } else {
            return Err(syntax_error(sql));
        };
        return Ok(vec![Row::new(vec![expr], vec![value])]);
    };

    let head = sql[6..from_at].trim();
    let tail = sql[from_at + 6..].trim();
    let (name, filter) = match tail.to_ascii_uppercase().find(" WHERE ") {
        Some(at) => {
            let mut next = 0;
            (
                unquote(tail[..at].trim()),
                Some(parse_where(&tail[at + 7..], args, &mut next)?),
            )
        }
        None => (unquote(tail), None),
    };

    let table = state
        .tables
        .get(&name)
        .ok_or_else(|| Error::query(format!("no such table: {name}"), Some(1)))?;
    let projected: Vec<usize> = if head == "*" {
        (0..table.columns.len()).collect()
    } else {
        split_csv(head)
            .iter()
            .map(|column| {
                let column = unquote(column);
                table
                    .columns
                    .iter()
                    .position(|c| *c == column)
                    .ok_or_else(|| Error::query(format!("no such column: {column}"), Some(1)))
            })
            .collect::<Result<_, _>>()?
    };
    let names: Vec<String> = projected
        .iter()
        .map(|&at| table.columns[at].clone())
        .collect();

    let mut rows = Vec::new();
    for row in &table.rows {
        if let Some(filter) = &filter {
            let at = table
                .columns
                .iter()
                .position(|c| *c == filter.column)
                .ok_or_else(|| Error::query(format!("no such column: {}", filter.column), Some(1)))?;
            if row[at] != filter.value {
                continue;
            }
        }
        rows.push(Row::new(
            names.clone(),
            projected.iter().map(|&at| row[at].clone()).collect(),
        ));
    }
    Ok(rows)
}

impl Engine for MemoryEngine {
    fn execute(&mut self, sql: &str, args: &[Value]) -> Result<(), Error> {
        let mut state = self.state.lock().expect("engine state");
        run_statement(&mut state, sql, args).map(|_| ())
    }

    fn query(&mut self, sql: &str, args: &[Value]) -> Result<Vec<Row>, Error> {
        let mut state = self.state.lock().expect("engine state");
        run_statement(&mut state, sql, args)
    }

    fn prepare(&mut self, sql: &str) -> Result<Box<dyn EngineStatement>, Error> {
        Ok(Box::new(MemoryStatement {
            state: Arc::clone(&self.state),
            sql: sql.to_string(),
        }))
    }

    fn close(&mut self, _force: bool) -> Result<(), Error> {
        let mut state = self.state.lock().expect("engine state");
        state.closed = true;
        Ok(())
    }
}

struct MemoryStatement {
    state: Arc<Mutex<State>>,
    sql: String,
}

impl EngineStatement for MemoryStatement {
    fn columns(&mut self) -> Result<Vec<String>, Error> {
        let upper = self.sql.to_ascii_uppercase();
        let Some(from_at) = upper.find(" FROM ") else {
            return Ok(vec![self.sql[6..].trim().to_string()]);
        };
        Ok(split_csv(self.sql[6..from_at].trim())
            .iter()
            .map(|c| unquote(c))
            .collect())
    }

    fn first(&mut self, args: &[Value]) -> Result<Option<Row>, Error> {
        Ok(self.all(args)?.into_iter().next())
    }

    fn all(&mut self, args: &[Value]) -> Result<Vec<Row>, Error> {
        let mut state = self.state.lock().expect("engine state");
        run_statement(&mut state, &self.sql, args)
    }

    fn execute(&mut self, args: &[Value]) -> Result<(), Error> {
        let mut state = self.state.lock().expect("engine state");
        run_statement(&mut state, &self.sql, args).map(|_| ())
    }

    fn expand_sql(&mut self, _args: &[Value]) -> Result<String, Error> {
        Ok(self.sql.clone())
    }
}
