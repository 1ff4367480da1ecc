//! SQL builders for the convenience operations.
//!
//! Plain string assembly with no concurrency semantics: [`Builder`] renders
//! one-shot statements with `?` placeholders and collected arguments, and
//! [`PrepareBuilder`] renders reusable statements whose placeholders are
//! either positional or named via [`ColumnVar`]. Reserved words used as
//! identifiers are double-quoted.

use sqlgate_core::{Error, Result, Value};

/// SQLite keywords that need quoting when used as identifiers.
const RESERVED: &[&str] = &[
    "add",
    "all",
    "alter",
    "and",
    "as",
    "autoincrement",
    "between",
    "case",
    "check",
    "collate",
    "commit",
    "constraint",
    "create",
    "default",
    "deferrable",
    "delete",
    "distinct",
    "drop",
    "else",
    "escape",
    "except",
    "exists",
    "foreign",
    "from",
    "group",
    "having",
    "if",
    "in",
    "index",
    "insert",
    "intersect",
    "into",
    "is",
    "isnull",
    "join",
    "limit",
    "not",
    "notnull",
    "null",
    "on",
    "or",
    "order",
    "primary",
    "references",
    "select",
    "set",
    "table",
    "then",
    "to",
    "transaction",
    "union",
    "unique",
    "update",
    "using",
    "values",
    "when",
    "where",
];

/// Quote `name` when it collides with a reserved word.
pub fn escape_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if RESERVED.contains(&lower.as_str()) {
        format!("\"{name}\"")
    } else {
        name.to_string()
    }
}

fn is_plain_var(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn format_var_name(name: &str) -> Result<String, Error> {
    let bare = name.strip_prefix(':').unwrap_or(name);
    let lower = bare.to_ascii_lowercase();
    if RESERVED.contains(&lower.as_str()) || !is_plain_var(&lower) {
        return Err(Error::protocol(format!("var name '{name}' not supported")));
    }
    Ok(format!(":{bare}"))
}

/// Insert/update conflict resolution algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Constraint violation rolls the enclosing transaction back
    Rollback,
    /// Abort the statement, keep prior statements (engine default)
    Abort,
    /// Abort the statement but keep its prior row changes
    Fail,
    /// Skip the violating row, continue
    Ignore,
    /// Remove pre-existing violating rows, then apply
    Replace,
}

impl Conflict {
    const fn keyword(self) -> &'static str {
        match self {
            Conflict::Rollback => " OR ROLLBACK",
            Conflict::Abort => " OR ABORT",
            Conflict::Fail => " OR FAIL",
            Conflict::Ignore => " OR IGNORE",
            Conflict::Replace => " OR REPLACE",
        }
    }
}

fn conflict_keyword(conflict: Option<Conflict>) -> &'static str {
    conflict.map_or("", Conflict::keyword)
}

/// Clauses for SELECT statements, shared by the query builders.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub distinct: bool,
    /// Selected columns; empty selects `*`
    pub columns: Vec<String>,
    pub where_clause: Option<String>,
    /// Values bound to `?` placeholders in `where_clause`
    pub args: Vec<Value>,
    pub group_by: Option<String>,
    pub having: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    pub fn columns<I: IntoIterator<Item = S>, S: Into<String>>(mut self, columns: I) -> Self {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn where_clause(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn group_by(mut self, clause: impl Into<String>) -> Self {
        self.group_by = Some(clause.into());
        self
    }

    pub fn having(mut self, clause: impl Into<String>) -> Self {
        self.having = Some(clause.into());
        self
    }

    pub fn order_by(mut self, clause: impl Into<String>) -> Self {
        self.order_by = Some(clause.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// WHERE clause and bound arguments for DELETE/UPDATE statements.
#[derive(Debug, Clone, Default)]
pub struct WhereOptions {
    pub where_clause: Option<String>,
    pub args: Vec<Value>,
}

impl WhereOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_clause(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

fn build_query(table: &str, opts: &SelectOptions) -> Result<String, Error> {
    if opts.having.is_some() && opts.group_by.is_none() {
        return Err(Error::protocol(
            "HAVING clauses are only permitted when using a groupBy clause",
        ));
    }
    let mut sql = String::from("SELECT ");
    if opts.distinct {
        sql.push_str("DISTINCT ");
    }
    if opts.columns.is_empty() {
        sql.push('*');
    } else {
        for (i, column) in opts.columns.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&escape_name(column));
        }
    }
    sql.push_str(&format!(" FROM {}", escape_name(table)));
    if let Some(where_clause) = &opts.where_clause {
        sql.push_str(&format!(" WHERE {where_clause}"));
    }
    if let Some(group_by) = &opts.group_by {
        sql.push_str(&format!(" GROUP BY {group_by}"));
    }
    if let Some(having) = &opts.having {
        sql.push_str(&format!(" HAVING {having}"));
    }
    if let Some(order_by) = &opts.order_by {
        sql.push_str(&format!(" ORDER BY {order_by}"));
    }
    if let Some(limit) = opts.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = opts.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }
    Ok(sql)
}

/// Builds one-shot statements with positional placeholders.
#[derive(Debug, Default)]
pub struct Builder {
    sql: String,
    args: Vec<Value>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The rendered statement.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The collected bound arguments.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.sql, self.args)
    }

    /// Render an INSERT of `values` into `table`.
    ///
    /// NULL values are inlined rather than bound.
    pub fn insert(&mut self, table: &str, values: &[(&str, Value)], conflict: Option<Conflict>) {
        let mut sql = format!(
            "INSERT{} INTO {} (",
            conflict_keyword(conflict),
            escape_name(table)
        );
        for (i, (column, _)) in values.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&escape_name(column));
        }
        sql.push_str(") VALUES (");
        let mut args = Vec::new();
        for (i, (_, value)) in values.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            if value.is_null() {
                sql.push_str("NULL");
            } else {
                sql.push('?');
                args.push(value.clone());
            }
        }
        sql.push(')');
        self.sql = sql;
        self.args = args;
    }

    /// Render a SELECT over `table`.
    pub fn query(&mut self, table: &str, opts: &SelectOptions) -> Result<(), Error> {
        self.sql = build_query(table, opts)?;
        self.args = opts.args.clone();
        Ok(())
    }

    /// Render an UPDATE of `values` in `table`.
    ///
    /// SET arguments precede WHERE arguments in the placeholder order.
    pub fn update(
        &mut self,
        table: &str,
        values: &[(&str, Value)],
        opts: &WhereOptions,
        conflict: Option<Conflict>,
    ) {
        let mut sql = format!(
            "UPDATE{} {} SET ",
            conflict_keyword(conflict),
            escape_name(table)
        );
        let mut args = Vec::new();
        for (i, (column, value)) in values.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            if value.is_null() {
                sql.push_str(&format!("{} = NULL", escape_name(column)));
            } else {
                sql.push_str(&format!("{} = ?", escape_name(column)));
                args.push(value.clone());
            }
        }
        if let Some(where_clause) = &opts.where_clause {
            sql.push_str(&format!(" WHERE {where_clause}"));
        }
        args.extend(opts.args.iter().cloned());
        self.sql = sql;
        self.args = args;
    }

    /// Render a DELETE from `table`.
    pub fn delete(&mut self, table: &str, opts: &WhereOptions) {
        self.sql = match &opts.where_clause {
            Some(where_clause) => {
                format!("DELETE FROM {} WHERE {where_clause}", escape_name(table))
            }
            None => format!("DELETE FROM {}", escape_name(table)),
        };
        self.args = opts.args.clone();
    }
}

/// A column paired with a named placeholder for prepared statements.
#[derive(Debug, Clone)]
pub struct ColumnVar {
    pub name: String,
    pub var: String,
}

impl ColumnVar {
    pub fn new(name: impl Into<String>, var: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            var: var.into(),
        }
    }
}

/// Column list for prepared statements: plain names bind positionally,
/// [`ColumnVar`]s bind by name.
#[derive(Debug, Clone)]
pub enum PrepareColumns {
    Named(Vec<String>),
    Vars(Vec<ColumnVar>),
}

impl PrepareColumns {
    fn len(&self) -> usize {
        match self {
            PrepareColumns::Named(names) => names.len(),
            PrepareColumns::Vars(vars) => vars.len(),
        }
    }
}

impl<S: Into<String>> FromIterator<S> for PrepareColumns {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        PrepareColumns::Named(iter.into_iter().map(Into::into).collect())
    }
}

/// Builds reusable statements for `prepare`.
#[derive(Debug, Default)]
pub struct PrepareBuilder {
    sql: String,
}

impl PrepareBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The rendered statement.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn into_sql(self) -> String {
        self.sql
    }

    /// Render a reusable INSERT into `table`.
    pub fn insert(
        &mut self,
        table: &str,
        columns: &PrepareColumns,
        conflict: Option<Conflict>,
    ) -> Result<(), Error> {
        if columns.len() == 0 {
            return Err(Error::protocol("columns.len() == 0"));
        }
        let mut sql = format!(
            "INSERT{} INTO {} (",
            conflict_keyword(conflict),
            escape_name(table)
        );
        match columns {
            PrepareColumns::Named(names) => {
                for (i, name) in names.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push_str(&escape_name(name));
                }
                sql.push_str(") VALUES (");
                for i in 0..names.len() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push('?');
                }
            }
            PrepareColumns::Vars(vars) => {
                for (i, var) in vars.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push_str(&escape_name(&var.name));
                }
                sql.push_str(") VALUES (");
                for (i, var) in vars.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push_str(&format_var_name(&var.var)?);
                }
            }
        }
        sql.push(')');
        self.sql = sql;
        Ok(())
    }

    /// Render a reusable SELECT over `table`.
    pub fn query(&mut self, table: &str, opts: &SelectOptions) -> Result<(), Error> {
        self.sql = build_query(table, opts)?;
        Ok(())
    }

    /// Render a reusable UPDATE of `columns` in `table`.
    pub fn update(
        &mut self,
        table: &str,
        columns: &PrepareColumns,
        opts: &WhereOptions,
        conflict: Option<Conflict>,
    ) -> Result<(), Error> {
        if columns.len() == 0 {
            return Err(Error::protocol("columns.len() == 0"));
        }
        let mut sql = format!(
            "UPDATE{} {} SET ",
            conflict_keyword(conflict),
            escape_name(table)
        );
        match columns {
            PrepareColumns::Named(names) => {
                for (i, name) in names.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push_str(&format!("{} = ?", escape_name(name)));
                }
            }
            PrepareColumns::Vars(vars) => {
                for (i, var) in vars.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push_str(&format!(
                        "{} = {}",
                        escape_name(&var.name),
                        format_var_name(&var.var)?
                    ));
                }
            }
        }
        if let Some(where_clause) = &opts.where_clause {
            sql.push_str(&format!(" WHERE {where_clause}"));
        }
        self.sql = sql;
        Ok(())
    }

    /// Render a reusable DELETE from `table`.
    pub fn delete(&mut self, table: &str, opts: &WhereOptions) {
        self.sql = match &opts.where_clause {
            Some(where_clause) => {
                format!("DELETE FROM {} WHERE {where_clause}", escape_name(table))
            }
            None => format!("DELETE FROM {}", escape_name(table)),
        };
    }
}
