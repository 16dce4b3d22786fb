//! A minimal backend-agnostic value type and bind helpers, so callers never
//! touch `sqlx::Arguments` directly: a small query builder that, given a
//! backend, emits the correct placeholder form.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::{Query, QueryAs};
use sqlx::sqlite::{Sqlite, SqliteArguments};

/// A bound query parameter, independent of the underlying database.
#[derive(Debug, Clone)]
pub enum QueryValue {
    /// UTF-8 text.
    Text(String),
    /// 64-bit signed integer.
    Int(i64),
    /// 32-bit signed integer (used for `max_retries`, `retries`).
    Int32(i32),
    /// Boolean, stored as `0`/`1` on SQLite and `boolean` on Postgres.
    Bool(bool),
    /// Arbitrary JSON payload.
    Json(Value),
    /// Point in time.
    Timestamp(DateTime<Utc>),
    /// SQL `NULL`.
    Null,
}

impl From<&str> for QueryValue {
    fn from(v: &str) -> Self {
        QueryValue::Text(v.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(v: String) -> Self {
        QueryValue::Text(v)
    }
}

impl From<i64> for QueryValue {
    fn from(v: i64) -> Self {
        QueryValue::Int(v)
    }
}

impl From<i32> for QueryValue {
    fn from(v: i32) -> Self {
        QueryValue::Int32(v)
    }
}

impl From<bool> for QueryValue {
    fn from(v: bool) -> Self {
        QueryValue::Bool(v)
    }
}

impl From<Value> for QueryValue {
    fn from(v: Value) -> Self {
        QueryValue::Json(v)
    }
}

impl From<DateTime<Utc>> for QueryValue {
    fn from(v: DateTime<Utc>) -> Self {
        QueryValue::Timestamp(v)
    }
}

impl<T> From<Option<T>> for QueryValue
where
    T: Into<QueryValue>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(QueryValue::Null, Into::into)
    }
}

macro_rules! bind_each {
    ($query:expr, $params:expr) => {{
        let mut q = $query;
        for p in $params {
            q = match p {
                QueryValue::Text(s) => q.bind(s.clone()),
                QueryValue::Int(i) => q.bind(*i),
                QueryValue::Int32(i) => q.bind(*i),
                QueryValue::Bool(b) => q.bind(*b),
                QueryValue::Json(v) => q.bind(v.clone()),
                QueryValue::Timestamp(t) => q.bind(*t),
                QueryValue::Null => q.bind(None::<String>),
            };
        }
        q
    }};
}

pub(crate) fn bind_sqlite<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [QueryValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    bind_each!(query, params)
}

pub(crate) fn bind_postgres<'q>(
    query: Query<'q, Postgres, PgArguments>,
    params: &'q [QueryValue],
) -> Query<'q, Postgres, PgArguments> {
    bind_each!(query, params)
}

pub(crate) fn bind_sqlite_as<'q, O>(
    query: QueryAs<'q, Sqlite, O, SqliteArguments<'q>>,
    params: &'q [QueryValue],
) -> QueryAs<'q, Sqlite, O, SqliteArguments<'q>> {
    bind_each!(query, params)
}

pub(crate) fn bind_postgres_as<'q, O>(
    query: QueryAs<'q, Postgres, O, PgArguments>,
    params: &'q [QueryValue],
) -> QueryAs<'q, Postgres, O, PgArguments> {
    bind_each!(query, params)
}
