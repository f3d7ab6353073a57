//! SQLite driver adapter built on sqlx.
//!
//! Used for local databases and tests. Isolation levels are ignored (SQLite
//! transactions are serializable); read-only scopes are enforced with
//! `PRAGMA query_only`.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteQueryResult, SqliteRow};
use sqlx::{Connection, Either, Executor, Row, Statement};
use tracing::{debug, warn};

use crate::config::{Backend, ConnectOptions};
use crate::db::driver::{Driver, DriverConnection, QueryOutput, connect_error};
use crate::db::params::{PlaceholderStyle, bind_sqlite_param, prepare};
use crate::db::transaction::TransactionOptions;
use crate::db::types::{describe_columns, sqlite_row_values};
use crate::error::{DbError, DbResult};
use crate::models::{Column, Params};

const MEMORY: &str = ":memory:";

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDriver;

impl SqliteDriver {
    fn connect_options(options: &ConnectOptions) -> DbResult<SqliteConnectOptions> {
        let opts = if options.database == MEMORY {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                DbError::connection(
                    format!("Invalid SQLite connection string: {}", e),
                    "Check the connection URL format: sqlite:path/to/db.sqlite",
                )
            })?
        } else {
            SqliteConnectOptions::new().filename(&options.database)
        };

        if options.readonly {
            Ok(opts.read_only(true))
        } else {
            Ok(opts.create_if_missing(true).read_only(false))
        }
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    async fn connect(&self, options: &ConnectOptions) -> DbResult<Box<dyn DriverConnection>> {
        let opts = Self::connect_options(options)?;
        let conn = SqliteConnection::connect_with(&opts)
            .await
            .map_err(|e| connect_error(Backend::Sqlite, e))?;
        Ok(Box::new(SqliteDriverConnection {
            conn,
            readonly: options.readonly,
            scope_readonly: false,
        }))
    }
}

#[derive(Debug)]
pub struct SqliteDriverConnection {
    conn: SqliteConnection,
    /// Connection opened read-only
    readonly: bool,
    /// `query_only` switched on for the current transaction
    scope_readonly: bool,
}

impl SqliteDriverConnection {
    async fn collect<S>(stream: S, columns: Option<Arc<[Column]>>) -> DbResult<QueryOutput>
    where
        S: futures_util::Stream<Item = Result<Either<SqliteQueryResult, SqliteRow>, sqlx::Error>>
            + Unpin,
    {
        let mut stream = stream;
        let mut columns = columns;
        let mut rows = Vec::new();
        let mut rows_affected = 0;

        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => rows_affected += done.rows_affected(),
                Either::Right(row) => {
                    if columns.as_ref().is_none_or(|c| c.is_empty()) {
                        columns = Some(describe_columns(row.columns()));
                    }
                    rows.push(sqlite_row_values(&row)?);
                }
            }
        }

        // SQLite reports no change count for SELECT; use the row count
        if rows_affected == 0 && !rows.is_empty() {
            rows_affected = rows.len() as u64;
        }

        Ok(QueryOutput {
            columns: columns.unwrap_or_else(|| Arc::from(Vec::new())),
            rows,
            rows_affected,
        })
    }

    /// Leave a read-only scope.
    async fn end_scope(&mut self) -> DbResult<()> {
        if self.scope_readonly && !self.readonly {
            self.execute_batch("PRAGMA query_only = OFF").await?;
        }
        self.scope_readonly = false;
        Ok(())
    }
}

#[async_trait]
impl DriverConnection for SqliteDriverConnection {
    async fn execute(&mut self, sql: &str, params: &Params) -> DbResult<QueryOutput> {
        let stmt = prepare(sql, params, PlaceholderStyle::Question)?;
        debug!(sql = %stmt.sql, params = stmt.values.len(), "Executing statement");

        if stmt.values.is_empty() {
            let stream = (&mut self.conn).fetch_many(stmt.sql.as_ref());
            return Self::collect(stream, None).await;
        }

        let prepared = (&mut self.conn).prepare(stmt.sql.as_ref()).await?;
        let columns = describe_columns(prepared.columns());
        let mut query = prepared.query();
        for value in stmt.values.iter().copied() {
            query = bind_sqlite_param(query, value);
        }
        let stream = (&mut self.conn).fetch_many(query);
        Self::collect(stream, Some(columns)).await
    }

    async fn execute_batch(&mut self, sql: &str) -> DbResult<()> {
        debug!(sql, "Executing batch");
        (&mut self.conn).execute(sql).await?;
        Ok(())
    }

    async fn begin(&mut self, options: &TransactionOptions) -> DbResult<()> {
        self.execute_batch("BEGIN").await?;
        if options.readonly && !self.readonly {
            if let Err(e) = self.execute_batch("PRAGMA query_only = ON").await {
                if let Err(rollback_err) = self.execute_batch("ROLLBACK").await {
                    warn!(error = %rollback_err, "Rollback after failed read-only setup failed");
                }
                return Err(e);
            }
            self.scope_readonly = true;
        }
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.execute_batch("COMMIT").await?;
        self.end_scope().await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let result = self.execute_batch("ROLLBACK").await;
        self.end_scope().await?;
        result
    }

    async fn ping(&mut self) -> DbResult<()> {
        self.conn.ping().await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        let this = *self;
        this.conn.close().await?;
        Ok(())
    }
}
