#![deny(unsafe_code)]
//! amebo-store
//!
//! Backend-agnostic persistence. Exactly one type in this crate,
//! [`Store`], talks to a database; every other Amebo crate goes through
//! it.

mod filter;
mod query;
mod schema_ddl;

pub use filter::{FilterBuilder, Timeline};
pub use query::QueryValue;

use amebo_core::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Postgres, Sqlite, Transaction};
use tracing::debug;

/// Which relational backend a [`Store`] is bound to, mirroring `AMEBO_ENGINE`.
#[derive(Clone)]
enum Pool {
    Sqlite(sqlx::SqlitePool),
    Postgres(sqlx::PgPool),
}

/// Backend-agnostic handle to the database. Construct one with
/// [`Store::connect_sqlite`] or [`Store::connect_postgres`] and clone it
/// freely — both pool types are internally reference-counted.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

/// An in-flight transaction. All mutating steps of the publish pipeline
/// run inside one of these.
pub enum StoreTx<'c> {
    /// SQLite transaction.
    Sqlite(Transaction<'c, Sqlite>),
    /// Postgres transaction.
    Postgres(Transaction<'c, Postgres>),
}

impl Store {
    /// Connects to an embedded single-file SQLite database, creating it if
    /// it does not exist, and applies the schema.
    pub async fn connect_sqlite(path: &str) -> Result<Self> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        let store = Self {
            pool: Pool::Sqlite(pool),
        };
        store.apply_schema().await?;
        Ok(store)
    }

    /// Connects to a networked Postgres database and applies the schema
    /// under the `amebo` namespace.
    pub async fn connect_postgres(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(dsn).await?;
        let store = Self {
            pool: Pool::Postgres(pool),
        };
        store.apply_schema().await?;
        Ok(store)
    }

    async fn apply_schema(&self) -> Result<()> {
        let ddl = schema_ddl::ddl_for(self.is_postgres());
        match &self.pool {
            Pool::Sqlite(pool) => {
                for stmt in ddl {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
            Pool::Postgres(pool) => {
                sqlx::query("CREATE SCHEMA IF NOT EXISTS amebo")
                    .execute(pool)
                    .await?;
                for stmt in ddl {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    /// `true` if this store is bound to the networked (Postgres) backend.
    /// Callers that build their own SQL (e.g. [`FilterBuilder`] consumers)
    /// need this to pick the right placeholder numbering.
    #[must_use]
    pub fn is_postgres(&self) -> bool {
        matches!(self.pool, Pool::Postgres(_))
    }

    /// Schema qualifier prefix prepended to every table reference in
    /// caller-built SQL: empty for the embedded backend, a namespaced prefix
    /// for the networked one.
    #[must_use]
    pub fn schema(&self) -> &'static str {
        if self.is_postgres() {
            "amebo."
        } else {
            ""
        }
    }

    /// Qualifies a bare table name with [`Store::schema`].
    #[must_use]
    pub fn qualify(&self, table: &str) -> String {
        format!("{}{table}", self.schema())
    }

    /// Returns the backend's positional placeholder form for the `n`-th
    /// (1-based) bound parameter: `?` for SQLite, `$n` for Postgres.
    #[must_use]
    pub fn placeholder(&self, n: usize) -> String {
        if self.is_postgres() {
            format!("${n}")
        } else {
            "?".to_string()
        }
    }

    /// Runs `sql` without returning rows.
    pub async fn exec(&self, sql: &str, params: &[QueryValue]) -> Result<u64> {
        debug!(sql.statement = sql, "store exec");
        match &self.pool {
            Pool::Sqlite(pool) => {
                let q = query::bind_sqlite(sqlx::query(sql), params);
                Ok(q.execute(pool).await?.rows_affected())
            }
            Pool::Postgres(pool) => {
                let q = query::bind_postgres(sqlx::query(sql), params);
                Ok(q.execute(pool).await?.rows_affected())
            }
        }
    }

    /// Returns at most one row, or `Ok(None)` if the query matched nothing.
    pub async fn one<T>(&self, sql: &str, params: &[QueryValue]) -> Result<Option<T>>
    where
        T: for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow>
            + for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow>
            + Send
            + Unpin,
    {
        debug!(sql.statement = sql, "store one");
        match &self.pool {
            Pool::Sqlite(pool) => {
                let q = query::bind_sqlite_as(sqlx::query_as::<_, T>(sql), params);
                Ok(q.fetch_optional(pool).await?)
            }
            Pool::Postgres(pool) => {
                let q = query::bind_postgres_as(sqlx::query_as::<_, T>(sql), params);
                Ok(q.fetch_optional(pool).await?)
            }
        }
    }

    /// Returns all matching rows; callers paginate upstream.
    pub async fn many<T>(&self, sql: &str, params: &[QueryValue]) -> Result<Vec<T>>
    where
        T: for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow>
            + for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow>
            + Send
            + Unpin,
    {
        debug!(sql.statement = sql, "store many");
        match &self.pool {
            Pool::Sqlite(pool) => {
                let q = query::bind_sqlite_as(sqlx::query_as::<_, T>(sql), params);
                Ok(q.fetch_all(pool).await?)
            }
            Pool::Postgres(pool) => {
                let q = query::bind_postgres_as(sqlx::query_as::<_, T>(sql), params);
                Ok(q.fetch_all(pool).await?)
            }
        }
    }

    /// Begins a transaction. Every mutating step of the Publisher fan-out
    /// runs inside a single [`StoreTx`].
    pub async fn begin(&self) -> Result<StoreTx<'_>> {
        match &self.pool {
            Pool::Sqlite(pool) => Ok(StoreTx::Sqlite(pool.begin().await?)),
            Pool::Postgres(pool) => Ok(StoreTx::Postgres(pool.begin().await?)),
        }
    }

    /// Schema qualifier for use from within a transaction context, kept in
    /// sync with [`Store::schema`].
    #[must_use]
    pub fn schema_for(is_postgres: bool) -> &'static str {
        if is_postgres { "amebo." } else { "" }
    }
}

impl StoreTx<'_> {
    /// `true` if this transaction is against the networked (Postgres) backend.
    #[must_use]
    pub fn is_postgres(&self) -> bool {
        matches!(self, StoreTx::Postgres(_))
    }

    /// Schema qualifier consistent with the owning [`Store`].
    #[must_use]
    pub fn schema(&self) -> &'static str {
        Store::schema_for(self.is_postgres())
    }

    /// Qualifies a bare table name with [`StoreTx::schema`].
    #[must_use]
    pub fn qualify(&self, table: &str) -> String {
        format!("{}{table}", self.schema())
    }

    /// Returns the backend's positional placeholder form, consistent with
    /// [`Store::placeholder`].
    #[must_use]
    pub fn placeholder(&self, n: usize) -> String {
        if self.is_postgres() {
            format!("${n}")
        } else {
            "?".to_string()
        }
    }

    /// Runs `sql` without returning rows, inside this transaction.
    pub async fn exec(&mut self, sql: &str, params: &[QueryValue]) -> Result<u64> {
        match self {
            StoreTx::Sqlite(tx) => {
                let q = query::bind_sqlite(sqlx::query(sql), params);
                Ok(q.execute(&mut **tx).await?.rows_affected())
            }
            StoreTx::Postgres(tx) => {
                let q = query::bind_postgres(sqlx::query(sql), params);
                Ok(q.execute(&mut **tx).await?.rows_affected())
            }
        }
    }

    /// Returns at most one row inside this transaction.
    pub async fn one<T>(&mut self, sql: &str, params: &[QueryValue]) -> Result<Option<T>>
    where
        T: for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow>
            + for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow>
            + Send
            + Unpin,
    {
        match self {
            StoreTx::Sqlite(tx) => {
                let q = query::bind_sqlite_as(sqlx::query_as::<_, T>(sql), params);
                Ok(q.fetch_optional(&mut **tx).await?)
            }
            StoreTx::Postgres(tx) => {
                let q = query::bind_postgres_as(sqlx::query_as::<_, T>(sql), params);
                Ok(q.fetch_optional(&mut **tx).await?)
            }
        }
    }

    /// Commits the transaction.
    pub async fn commit(self) -> Result<()> {
        match self {
            StoreTx::Sqlite(tx) => tx.commit().await?,
            StoreTx::Postgres(tx) => tx.commit().await?,
        }
        Ok(())
    }

    /// Rolls back the transaction. Errors are swallowed since a rollback is
    /// already the failure path; the original error is what the caller
    /// propagates.
    pub async fn rollback(self) {
        let result = match self {
            StoreTx::Sqlite(tx) => tx.rollback().await,
            StoreTx::Postgres(tx) => tx.rollback().await,
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "rollback failed");
        }
    }
}
