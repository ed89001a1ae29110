//! Builds parameterized SELECT, INSERT, UPDATE, DELETE and aggregate statements from a table layout.

use crate::error::AppError;
use crate::query::{AggregateRange, Comparison, Condition, Predicate};
use crate::response::Record;
use crate::sql::layout::{Column, Link, TableLayout, ToManyLayout};
use serde_json::Value;

/// Quote identifier for PostgreSQL (safe: only from declarations).
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quoted(schema), quoted(table))
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    fn new() -> Self {
        Self::default()
    }

    fn push_param(&mut self, v: Value) -> u32 {
        let n = self.params.len() as u32 + 1;
        self.params.push(v);
        n
    }

    /// `$n::cast` so string values bind to typed columns. jsonb operands travel as their JSON
    /// text, so a bare string such as `hello` arrives as `"hello"`.
    fn placeholder(&mut self, v: Value, cast: &str) -> String {
        let v = match v {
            Value::Null => Value::Null,
            other if cast == "jsonb" => Value::String(other.to_string()),
            other => other,
        };
        let n = self.push_param(v);
        format!("${}::{}", n, cast)
    }
}

fn table_of(layout: &TableLayout) -> String {
    qualified_table(&layout.schema, &layout.table)
}

fn select_column_list(layout: &TableLayout) -> String {
    layout
        .columns
        .iter()
        .map(|c| quoted(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn key_column<'a>(layout: &'a TableLayout, key: &str) -> Result<&'a Column, AppError> {
    layout.column_for_key(key).ok_or_else(|| {
        AppError::validation(key, format!("field '{}' not found on {}", key, layout.resource))
    })
}

fn render_condition(q: &mut QueryBuf, column: &Column, condition: &Condition) -> String {
    let col = quoted(&column.name);
    match condition {
        Condition::Equals(Value::Null) => format!("{} IS NULL", col),
        Condition::Equals(v) => format!("{} = {}", col, q.placeholder(v.clone(), column.cast)),
        Condition::Compare(slots) => {
            let mut parts = Vec::new();
            for (comparison, v) in slots {
                let part = match comparison {
                    Comparison::In | Comparison::NotIn => {
                        let items = match v {
                            Value::Array(items) => items.clone(),
                            other => vec![other.clone()],
                        };
                        let negate = *comparison == Comparison::NotIn;
                        if items.is_empty() {
                            (if negate { "TRUE" } else { "FALSE" }).to_string()
                        } else {
                            let placeholders: Vec<String> =
                                items.into_iter().map(|i| q.placeholder(i, column.cast)).collect();
                            if negate {
                                format!("({} IS NULL OR {} NOT IN ({}))", col, col, placeholders.join(", "))
                            } else {
                                format!("{} IN ({})", col, placeholders.join(", "))
                            }
                        }
                    }
                    Comparison::Pattern => format!("{}::text ~ {}", col, q.placeholder(v.clone(), "text")),
                    Comparison::Gte => format!("{} >= {}", col, q.placeholder(v.clone(), column.cast)),
                    Comparison::Gt => format!("{} > {}", col, q.placeholder(v.clone(), column.cast)),
                    Comparison::Lte => format!("{} <= {}", col, q.placeholder(v.clone(), column.cast)),
                    Comparison::Lt => format!("{} < {}", col, q.placeholder(v.clone(), column.cast)),
                    Comparison::NotNull => format!("{} IS NOT NULL", col),
                };
                parts.push(part);
            }
            parts.join(" AND ")
        }
    }
}

/// ` WHERE ...` for a predicate, or the empty string when it has no conditions.
pub fn where_clause(layout: &TableLayout, predicate: &Predicate, q: &mut QueryBuf) -> Result<String, AppError> {
    let mut parts = Vec::new();
    for (key, condition) in predicate.fields() {
        let column = key_column(layout, key)?;
        parts.push(render_condition(q, column, condition));
    }
    for (key, condition) in predicate.restrictions() {
        let column = key_column(layout, key)?;
        parts.push(render_condition(q, column, condition));
    }
    if !predicate.any_of().is_empty() {
        let mut any = Vec::new();
        for (key, pattern) in predicate.any_of() {
            let column = key_column(layout, key)?;
            let ph = q.placeholder(Value::String(pattern.clone()), "text");
            any.push(format!("{}::text ~ {}", quoted(&column.name), ph));
        }
        parts.push(format!("({})", any.join(" OR ")));
    }
    Ok(if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    })
}

/// LIMIT/OFFSET literals are bigint; larger windows are clamped.
fn bigint(n: u64) -> u64 {
    n.min(i64::MAX as u64)
}

/// SELECT matching rows ordered by id, with optional LIMIT/OFFSET.
pub fn select_where(
    layout: &TableLayout,
    predicate: &Predicate,
    limit: Option<u64>,
    offset: Option<u64>,
) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(layout, predicate, &mut q)?;
    let limit_clause = limit.map(|n| format!(" LIMIT {}", bigint(n))).unwrap_or_default();
    let offset_clause = offset.map(|n| format!(" OFFSET {}", bigint(n))).unwrap_or_default();
    q.sql = format!(
        "SELECT {} FROM {}{} ORDER BY {}{}{}",
        select_column_list(layout),
        table_of(layout),
        where_sql,
        quoted("id"),
        limit_clause,
        offset_clause
    );
    Ok(q)
}

pub fn count_where(layout: &TableLayout, predicate: &Predicate) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(layout, predicate, &mut q)?;
    q.sql = format!("SELECT COUNT(*) FROM {}{}", table_of(layout), where_sql);
    Ok(q)
}

/// SELECT by primary key. Caller adds id as sole param.
pub fn select_by_id(layout: &TableLayout) -> QueryBuf {
    let mut q = QueryBuf::new();
    q.sql = format!(
        "SELECT {} FROM {} WHERE {} = $1::bigint",
        select_column_list(layout),
        table_of(layout),
        quoted("id")
    );
    q
}

/// INSERT the exposed columns present in `body`. `created_at`/`updated_at` use their defaults.
pub fn insert(layout: &TableLayout, body: &Record) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for c in &layout.columns {
        let Some(key) = c.key.as_deref() else { continue };
        if matches!(key, "id" | "created_at" | "updated_at") {
            continue;
        }
        let Some(val) = body.get(key) else { continue };
        placeholders.push(q.placeholder(val.clone(), c.cast));
        cols.push(quoted(&c.name));
    }
    let returning = select_column_list(layout);
    q.sql = if cols.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", table_of(layout), returning)
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table_of(layout),
            cols.join(", "),
            placeholders.join(", "),
            returning
        )
    };
    q
}

/// UPDATE by id: SET only exposed columns present in `body`, and bump `updated_at`.
pub fn update(layout: &TableLayout, id: &Value, body: &Record) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for c in &layout.columns {
        let Some(key) = c.key.as_deref() else { continue };
        if matches!(key, "id" | "created_at" | "updated_at") {
            continue;
        }
        let Some(val) = body.get(key) else { continue };
        let rhs = q.placeholder(val.clone(), c.cast);
        sets.push(format!("{} = {}", quoted(&c.name), rhs));
    }
    sets.push(format!("{} = NOW()", quoted("updated_at")));
    let id_ph = q.placeholder(id.clone(), "bigint");
    q.sql = format!(
        "UPDATE {} SET {} WHERE {} = {} RETURNING {}",
        table_of(layout),
        sets.join(", "),
        quoted("id"),
        id_ph,
        select_column_list(layout)
    );
    q
}

/// DELETE by id. Caller adds id as sole param.
pub fn delete(layout: &TableLayout) -> QueryBuf {
    let mut q = QueryBuf::new();
    q.sql = format!(
        "DELETE FROM {} WHERE {} = $1::bigint RETURNING {}",
        table_of(layout),
        quoted("id"),
        quoted("id")
    );
    q
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateFn {
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    fn sql(self) -> &'static str {
        match self {
            AggregateFn::Avg => "AVG",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
        }
    }
}

fn range_clause(q: &mut QueryBuf, range: &AggregateRange) -> String {
    let start = q.placeholder(Value::String(range.start.to_rfc3339()), "timestamptz");
    let end = q.placeholder(Value::String(range.end.to_rfc3339()), "timestamptz");
    format!("{} BETWEEN {} AND {}", quoted("created_at"), start, end)
}

/// COUNT of rows created within the inclusive range, as float8.
pub fn aggregate_count(layout: &TableLayout, range: &AggregateRange) -> QueryBuf {
    let mut q = QueryBuf::new();
    let range_sql = range_clause(&mut q, range);
    q.sql = format!(
        "SELECT COUNT(*)::float8 FROM {} WHERE {}",
        table_of(layout),
        range_sql
    );
    q
}

/// Fold `f` over the values of every listed column of rows created within the range.
/// Yields 0 when there are no values.
pub fn aggregate_columns(
    layout: &TableLayout,
    f: AggregateFn,
    range: &AggregateRange,
    keys: &[String],
) -> Result<QueryBuf, AppError> {
    if keys.is_empty() {
        return Err(AppError::validation("columns", "at least one column is required"));
    }
    let mut q = QueryBuf::new();
    let range_sql = range_clause(&mut q, range);
    let mut branches = Vec::new();
    for key in keys {
        let column = key_column(layout, key)?;
        branches.push(format!(
            "SELECT {}::float8 AS v FROM {} WHERE {}",
            quoted(&column.name),
            table_of(layout),
            range_sql
        ));
    }
    q.sql = format!(
        "SELECT COALESCE({}(v), 0)::float8 FROM ({}) values_in_range",
        f.sql(),
        branches.join(" UNION ALL ")
    );
    Ok(q)
}

/// Owner id → related id pairs for a to-many relationship, for a batch of owners.
pub fn select_to_many_ids(layout: &TableLayout, to_many: &ToManyLayout, owner_ids: &[Value]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let (table, owner_col, related_col) = match &to_many.link {
        Link::Foreign { fk_column } => (to_many.related_table.as_str(), fk_column.as_str(), "id"),
        Link::Junction {
            table,
            owner_column,
            related_column,
        } => (table.as_str(), owner_column.as_str(), related_column.as_str()),
    };
    let placeholders: Vec<String> = owner_ids
        .iter()
        .map(|id| q.placeholder(id.clone(), "bigint"))
        .collect();
    let filter = if placeholders.is_empty() {
        "1 = 0".to_string()
    } else {
        format!("{} IN ({})", quoted(owner_col), placeholders.join(", "))
    };
    q.sql = format!(
        "SELECT {} AS owner_id, {} AS related_id FROM {} WHERE {} ORDER BY {}",
        quoted(owner_col),
        quoted(related_col),
        qualified_table(&layout.schema, table),
        filter,
        quoted(related_col)
    );
    q
}

/// Statements linking `related_ids` to the owner. Existing links are kept.
pub fn link_to_many(layout: &TableLayout, to_many: &ToManyLayout, owner_id: &Value, related_ids: &[Value]) -> Vec<QueryBuf> {
    related_ids
        .iter()
        .map(|rid| {
            let mut q = QueryBuf::new();
            let owner = q.placeholder(owner_id.clone(), "bigint");
            let related = q.placeholder(rid.clone(), "bigint");
            q.sql = match &to_many.link {
                Link::Foreign { fk_column } => format!(
                    "UPDATE {} SET {} = {} WHERE {} = {}",
                    qualified_table(&layout.schema, &to_many.related_table),
                    quoted(fk_column),
                    owner,
                    quoted("id"),
                    related
                ),
                Link::Junction {
                    table,
                    owner_column,
                    related_column,
                } => format!(
                    "INSERT INTO {} ({}, {}) VALUES ({}, {}) ON CONFLICT DO NOTHING",
                    qualified_table(&layout.schema, table),
                    quoted(owner_column),
                    quoted(related_column),
                    owner,
                    related
                ),
            };
            q
        })
        .collect()
}

/// Unlink `related_ids` from the owner, or every related record when `related_ids` is `None`.
pub fn unlink_to_many(
    layout: &TableLayout,
    to_many: &ToManyLayout,
    owner_id: &Value,
    related_ids: Option<&[Value]>,
) -> QueryBuf {
    let mut q = QueryBuf::new();
    let owner = q.placeholder(owner_id.clone(), "bigint");
    let (owner_col, related_col) = match &to_many.link {
        Link::Foreign { fk_column } => (fk_column.as_str(), "id"),
        Link::Junction {
            owner_column,
            related_column,
            ..
        } => (owner_column.as_str(), related_column.as_str()),
    };
    let mut condition = format!("{} = {}", quoted(owner_col), owner);
    if let Some(ids) = related_ids {
        let placeholders: Vec<String> = ids.iter().map(|id| q.placeholder(id.clone(), "bigint")).collect();
        if placeholders.is_empty() {
            condition.push_str(" AND 1 = 0");
        } else {
            condition.push_str(&format!(" AND {} IN ({})", quoted(related_col), placeholders.join(", ")));
        }
    }
    q.sql = match &to_many.link {
        Link::Foreign { fk_column } => format!(
            "UPDATE {} SET {} = NULL WHERE {}",
            qualified_table(&layout.schema, &to_many.related_table),
            quoted(fk_column),
            condition
        ),
        Link::Junction { table, .. } => format!(
            "DELETE FROM {} WHERE {}",
            qualified_table(&layout.schema, table),
            condition
        ),
    };
    q
}
