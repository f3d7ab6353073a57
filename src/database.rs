//! High-level entry points.
//!
//! [`Database`] runs each call in its own transaction scope on a pooled
//! connection: acquire, begin, execute, shape, commit (or roll back on error),
//! release.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::warn;

use crate::config::DatabaseConfig;
use crate::db::{
    BackAs, Cursor, Pool, PooledConnection, ResultCache, Row, Transaction, TransactionOptions,
};
use crate::error::{DbError, DbResult};
use crate::models::{Params, Value};

/// A pooled database handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool,
    cache: Arc<ResultCache>,
}

impl Database {
    /// Connect, opening the pool's `min_size` connections up front.
    pub async fn connect(config: DatabaseConfig) -> DbResult<Self> {
        Ok(Self::from_pool(Pool::connect(config).await?))
    }

    /// Connect using a connection URL such as `postgres://user@host/db?max_size=5`.
    pub async fn connect_url(url: &str) -> DbResult<Self> {
        Self::connect(DatabaseConfig::parse(url)?).await
    }

    /// Create the handle without opening any connection yet.
    pub fn connect_lazy(config: DatabaseConfig) -> DbResult<Self> {
        Ok(Self::from_pool(Pool::connect_lazy(config)?))
    }

    pub fn from_pool(pool: Pool) -> Self {
        let cache = ResultCache::new(pool.options().cache_size_or_default());
        Self {
            pool,
            cache: Arc::new(cache),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Commit on success; roll back on error, keeping the original error.
    async fn finish<R, E>(tx: Transaction<'_>, result: Result<R, E>) -> Result<R, E>
    where
        E: From<DbError>,
    {
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(error = %rollback_error, "Rollback failed while handling an error");
                }
                Err(e)
            }
        }
    }

    /// Execute a statement; returns the number of rows affected.
    pub async fn run(&self, sql: &str, params: impl Into<Params>) -> DbResult<u64> {
        let mut tx = self.begin().await?;
        let result = tx.cursor().run(sql, params).await;
        Self::finish(tx, result).await
    }

    /// Exactly one row.
    pub async fn one(&self, sql: &str, params: impl Into<Params>) -> DbResult<Row> {
        self.one_as(sql, params, None).await
    }

    /// Zero or one row.
    pub async fn one_or_none(&self, sql: &str, params: impl Into<Params>) -> DbResult<Option<Row>> {
        self.one_or_none_as(sql, params, None).await
    }

    /// Every row; empty when the query matched nothing.
    pub async fn all(&self, sql: &str, params: impl Into<Params>) -> DbResult<Vec<Row>> {
        self.all_as(sql, params, None).await
    }

    async fn one_as(
        &self,
        sql: &str,
        params: impl Into<Params>,
        back_as: Option<BackAs>,
    ) -> DbResult<Row> {
        let mut tx = self.begin().await?;
        let result = tx.cursor().one(sql, params, back_as).await;
        Self::finish(tx, result).await
    }

    async fn one_or_none_as(
        &self,
        sql: &str,
        params: impl Into<Params>,
        back_as: Option<BackAs>,
    ) -> DbResult<Option<Row>> {
        let mut tx = self.begin().await?;
        let result = tx.cursor().one_or_none(sql, params, back_as).await;
        Self::finish(tx, result).await
    }

    async fn all_as(
        &self,
        sql: &str,
        params: impl Into<Params>,
        back_as: Option<BackAs>,
    ) -> DbResult<Vec<Row>> {
        let mut tx = self.begin().await?;
        let result = tx.cursor().all(sql, params, back_as).await;
        Self::finish(tx, result).await
    }

    /// Start building a statement.
    pub fn query<'q>(&'q self, sql: &'q str) -> Query<'q> {
        Query {
            db: self,
            sql,
            params: Params::None,
            back_as: None,
            max_age: None,
            error: None,
        }
    }

    /// Run several statements through one cursor inside one transaction.
    ///
    /// Commits when the callback returns `Ok`, rolls back otherwise.
    ///
    /// ```no_run
    /// # async fn example(db: pgkit::Database) -> pgkit::error::DbResult<()> {
    /// let total = db
    ///     .get_cursor(|cursor| {
    ///         Box::pin(async move {
    ///             cursor.run("UPDATE stock SET n = n - 1 WHERE id = 1", ()).await?;
    ///             cursor.one("SELECT sum(n) FROM stock", (), None).await
    ///         })
    ///     })
    ///     .await?;
    /// # let _ = total;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_cursor<F, R>(&self, callback: F) -> DbResult<R>
    where
        F: for<'c> FnOnce(&'c mut Cursor<'_>) -> BoxFuture<'c, DbResult<R>>,
    {
        let mut tx = self.begin().await?;
        let result = {
            let mut cursor = tx.cursor();
            callback(&mut cursor).await
        };
        Self::finish(tx, result).await
    }

    /// Run `callback` inside a transaction.
    ///
    /// Commits on `Ok` and rolls back on `Err`. If the rollback itself fails
    /// the failure is logged and the callback's error is returned.
    pub async fn transaction<F, R, E>(&self, callback: F) -> Result<R, E>
    where
        F: for<'c> FnOnce(&'c mut Transaction<'static>) -> BoxFuture<'c, Result<R, E>>,
        E: From<DbError>,
    {
        let mut tx = self.begin().await?;
        let result = callback(&mut tx).await;
        Self::finish(tx, result).await
    }

    pub async fn begin(&self) -> DbResult<Transaction<'static>> {
        self.pool.begin().await
    }

    pub async fn begin_with(&self, options: TransactionOptions) -> DbResult<Transaction<'static>> {
        self.pool.begin_with(options).await
    }

    /// A raw pooled connection. A transaction left open on it is rolled back
    /// when it goes back to the pool.
    pub async fn get_connection(&self) -> DbResult<PooledConnection> {
        self.pool.acquire().await
    }

    /// Shut the pool down and forget cached results.
    pub async fn close(&self) {
        self.pool.close().await;
        self.cache.clear();
    }
}

/// Statement builder returned by [`Database::query`].
#[derive(Debug)]
#[must_use = "a query does nothing until run"]
pub struct Query<'q> {
    db: &'q Database,
    sql: &'q str,
    params: Params,
    back_as: Option<BackAs>,
    max_age: Option<Duration>,
    error: Option<DbError>,
}

impl<'q> Query<'q> {
    /// Bind the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        match &mut self.params {
            Params::None => self.params = Params::Positional(vec![value.into()]),
            Params::Positional(values) => values.push(value.into()),
            Params::Named(_) => self.mixed(),
        }
        self
    }

    /// Bind a `:name` parameter.
    pub fn bind_named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        match &mut self.params {
            Params::None => self.params = Params::Named(vec![(name.into(), value.into())]),
            Params::Named(values) => values.push((name.into(), value.into())),
            Params::Positional(_) => self.mixed(),
        }
        self
    }

    fn mixed(&mut self) {
        self.error.get_or_insert_with(|| {
            DbError::invalid_input("Cannot mix positional and named parameters")
        });
    }

    /// Replace all parameters.
    pub fn params(mut self, params: impl Into<Params>) -> Self {
        self.params = params.into();
        self
    }

    pub fn back_as(mut self, back_as: BackAs) -> Self {
        self.back_as = Some(back_as);
        self
    }

    /// Serve the rows from the result cache if they were fetched at most
    /// `max_age` ago.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    fn check(&mut self) -> DbResult<()> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn cached_rows(&self, max_age: Duration) -> DbResult<Arc<Vec<Row>>> {
        let key = ResultCache::key(self.sql, &self.params, self.back_as);
        self.db
            .cache
            .get_or_fetch(&key, max_age, || {
                self.db.all_as(self.sql, self.params.clone(), self.back_as)
            })
            .await
    }

    /// Execute; returns rows affected. Never cached.
    pub async fn run(mut self) -> DbResult<u64> {
        self.check()?;
        self.db.run(self.sql, self.params).await
    }

    pub async fn one(mut self) -> DbResult<Row> {
        self.check()?;
        match self.max_age {
            Some(max_age) => {
                let rows = self.cached_rows(max_age).await?;
                match rows.as_slice() {
                    [row] => Ok(row.clone()),
                    _ => Err(DbError::out_of_bounds(rows.len() as u64, 1, 1)),
                }
            }
            None => self.db.one_as(self.sql, self.params, self.back_as).await,
        }
    }

    pub async fn one_or_none(mut self) -> DbResult<Option<Row>> {
        self.check()?;
        match self.max_age {
            Some(max_age) => {
                let rows = self.cached_rows(max_age).await?;
                match rows.as_slice() {
                    [] => Ok(None),
                    [row] => Ok(Some(row.clone())),
                    _ => Err(DbError::out_of_bounds(rows.len() as u64, 0, 1)),
                }
            }
            None => {
                self.db
                    .one_or_none_as(self.sql, self.params, self.back_as)
                    .await
            }
        }
    }

    pub async fn all(mut self) -> DbResult<Vec<Row>> {
        self.check()?;
        match self.max_age {
            Some(max_age) => Ok(self.cached_rows(max_age).await?.as_ref().clone()),
            None => self.db.all_as(self.sql, self.params, self.back_as).await,
        }
    }
}
