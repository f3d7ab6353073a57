//! PostgreSQL driver adapter built on sqlx.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Either, Executor, Postgres, Row};
use tracing::debug;

use crate::config::{Backend, ConnectOptions};
use crate::db::driver::{Driver, DriverConnection, QueryOutput, connect_error};
use crate::db::params::{PlaceholderStyle, bind_postgres_param, prepare};
use crate::db::transaction::TransactionOptions;
use crate::db::types::{describe_columns, pg_row_values};
use crate::error::{DbError, DbResult};
use crate::models::{Column, Params};

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDriver;

impl PostgresDriver {
    fn connect_options(options: &ConnectOptions) -> DbResult<PgConnectOptions> {
        let mut opts = PgConnectOptions::new()
            .host(&options.host)
            .port(options.port)
            .database(&options.database);
        if let Some(user) = &options.user {
            opts = opts.username(user);
        }
        if let Some(password) = &options.password {
            opts = opts.password(password);
        }
        if let Some(mode) = &options.sslmode {
            let mode: PgSslMode = mode.parse().map_err(|e| {
                DbError::connection(
                    format!("Invalid sslmode '{}': {}", mode, e),
                    "Use one of: disable, allow, prefer, require, verify-ca, verify-full",
                )
            })?;
            opts = opts.ssl_mode(mode);
        }
        if let Some(name) = &options.application_name {
            opts = opts.application_name(name);
        }
        if options.readonly {
            opts = opts.options([("default_transaction_read_only", "on")]);
        }
        Ok(opts)
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    async fn connect(&self, options: &ConnectOptions) -> DbResult<Box<dyn DriverConnection>> {
        let opts = Self::connect_options(options)?;
        let conn = PgConnection::connect_with(&opts)
            .await
            .map_err(|e| connect_error(Backend::Postgres, e))?;
        Ok(Box::new(PostgresConnection { conn }))
    }
}

#[derive(Debug)]
pub struct PostgresConnection {
    conn: PgConnection,
}

impl PostgresConnection {
    /// Drain a result stream, decoding rows as they arrive.
    ///
    /// Column descriptors come from the first row, so a result without rows
    /// has none.
    async fn collect<S>(stream: S) -> DbResult<QueryOutput>
    where
        S: futures_util::Stream<
                Item = Result<Either<sqlx::postgres::PgQueryResult, sqlx::postgres::PgRow>, sqlx::Error>,
            > + Unpin,
    {
        let mut stream = stream;
        let mut columns: Option<Arc<[Column]>> = None;
        let mut rows = Vec::new();
        let mut rows_affected = 0;

        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => rows_affected += done.rows_affected(),
                Either::Right(row) => {
                    if columns.is_none() {
                        columns = Some(describe_columns(row.columns()));
                    }
                    rows.push(pg_row_values(&row)?);
                }
            }
        }

        Ok(QueryOutput {
            columns: columns.unwrap_or_else(|| Arc::from(Vec::new())),
            rows,
            rows_affected,
        })
    }
}

#[async_trait]
impl DriverConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str, params: &Params) -> DbResult<QueryOutput> {
        let stmt = prepare(sql, params, PlaceholderStyle::Dollar)?;
        debug!(sql = %stmt.sql, params = stmt.values.len(), "Executing statement");

        // Without parameters, run as a simple query so DDL and multi-statement
        // scripts work
        if stmt.values.is_empty() {
            let stream = (&mut self.conn).fetch_many(stmt.sql.as_ref());
            return Self::collect(stream).await;
        }

        // Unnamed statement, parsed with the declared types of these values. A
        // cached statement would keep the parameter types of its first use.
        let mut query = sqlx::query::<Postgres>(stmt.sql.as_ref()).persistent(false);
        for value in stmt.values.iter().copied() {
            query = bind_postgres_param(query, value);
        }
        let stream = (&mut self.conn).fetch_many(query);
        Self::collect(stream).await
    }

    async fn execute_batch(&mut self, sql: &str) -> DbResult<()> {
        debug!(sql, "Executing batch");
        (&mut self.conn).execute(sql).await?;
        Ok(())
    }

    async fn begin(&mut self, options: &TransactionOptions) -> DbResult<()> {
        let mut sql = String::from("BEGIN");
        if let Some(level) = options.isolation {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level.as_sql());
        }
        sql.push_str(if options.readonly {
            " READ ONLY"
        } else {
            " READ WRITE"
        });
        self.execute_batch(&sql).await
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.execute_batch("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.execute_batch("ROLLBACK").await
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
