//! Statement execution and row fetching on one connection.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::db::pool::PooledConnection;
use crate::db::row::{BackAs, Row, RowFactory, resolve_back_as};
use crate::error::{DbError, DbResult};
use crate::models::{Column, Params, Value};

#[derive(Debug)]
struct ResultSet {
    columns: Arc<[Column]>,
    rows: VecDeque<Vec<Value>>,
    rows_affected: u64,
}

/// Executes statements on a borrowed connection and hands out the rows of the
/// last result.
///
/// Results are buffered in full by the driver, so fetching never touches the
/// connection.
#[derive(Debug)]
pub struct Cursor<'t> {
    conn: &'t mut PooledConnection,
    back_as: BackAs,
    result: Option<ResultSet>,
}

impl<'t> Cursor<'t> {
    pub(crate) fn new(conn: &'t mut PooledConnection) -> Self {
        let back_as = conn.options().back_as_or_default();
        Self {
            conn,
            back_as,
            result: None,
        }
    }

    /// Row mode used when a fetch does not ask for one.
    pub fn with_back_as(mut self, back_as: BackAs) -> Self {
        self.back_as = back_as;
        self
    }

    pub fn back_as(&self) -> BackAs {
        self.back_as
    }

    /// Execute one statement, replacing the previous result.
    ///
    /// Returns the number of rows affected (for a query, rows returned).
    pub async fn execute(&mut self, sql: &str, params: impl Into<Params>) -> DbResult<u64> {
        self.result = None;
        let params = params.into();
        let output = self.conn.run_statement(sql, &params).await?;
        let rows_affected = output.rows_affected;
        self.result = Some(ResultSet {
            columns: output.columns,
            rows: output.rows.into(),
            rows_affected,
        });
        Ok(rows_affected)
    }

    /// Columns of the last result, if a statement has run.
    pub fn description(&self) -> Option<&[Column]> {
        self.result.as_ref().map(|r| &*r.columns)
    }

    /// Rows affected by the last statement, if a statement has run.
    pub fn rowcount(&self) -> Option<u64> {
        self.result.as_ref().map(|r| r.rows_affected)
    }

    fn result_mut(&mut self) -> DbResult<&mut ResultSet> {
        self.result
            .as_mut()
            .ok_or_else(|| DbError::invalid_input("No result set; execute a statement first"))
    }

    fn factory(columns: &[Column], back_as: BackAs) -> DbResult<RowFactory> {
        RowFactory::new(columns, back_as)
    }

    pub fn fetch_next(&mut self, back_as: Option<BackAs>) -> DbResult<Option<Row>> {
        let mode = back_as.unwrap_or(self.back_as);
        let result = self.result_mut()?;
        if result.rows.is_empty() {
            return Ok(None);
        }
        let factory = Self::factory(&result.columns, mode)?;
        Ok(result.rows.pop_front().map(|values| factory.shape(values)))
    }

    /// Up to `n` of the remaining rows.
    pub fn fetch_many(&mut self, n: usize, back_as: Option<BackAs>) -> DbResult<Vec<Row>> {
        let mode = back_as.unwrap_or(self.back_as);
        let result = self.result_mut()?;
        let take = n.min(result.rows.len());
        if take == 0 {
            return Ok(Vec::new());
        }
        let factory = Self::factory(&result.columns, mode)?;
        Ok(result
            .rows
            .drain(..take)
            .map(|values| factory.shape(values))
            .collect())
    }

    /// All remaining rows; empty when there are none.
    pub fn fetch_all(&mut self, back_as: Option<BackAs>) -> DbResult<Vec<Row>> {
        self.fetch_many(usize::MAX, back_as)
    }

    /// Exactly one remaining row.
    pub fn fetch_one(&mut self, back_as: Option<BackAs>) -> DbResult<Row> {
        let mode = back_as.unwrap_or(self.back_as);
        let result = self.result_mut()?;
        let n = result.rows.len() as u64;
        if n != 1 {
            result.rows.clear();
            return Err(DbError::out_of_bounds(n, 1, 1));
        }
        let factory = Self::factory(&result.columns, mode)?;
        let values = result.rows.pop_front().unwrap_or_default();
        Ok(factory.shape(values))
    }

    /// Mode for the convenience methods: single-column results come back as
    /// bare values unless a mode is requested.
    fn resolved(&self, back_as: Option<BackAs>) -> BackAs {
        let columns = self.description().map_or(0, <[Column]>::len);
        resolve_back_as(back_as, self.back_as, columns)
    }

    pub async fn run(&mut self, sql: &str, params: impl Into<Params>) -> DbResult<u64> {
        self.execute(sql, params).await
    }

    pub async fn one(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
        back_as: Option<BackAs>,
    ) -> DbResult<Row> {
        self.execute(sql, params).await?;
        let mode = self.resolved(back_as);
        self.fetch_one(Some(mode))
    }

    /// Zero or one row; more than one is an error.
    pub async fn one_or_none(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
        back_as: Option<BackAs>,
    ) -> DbResult<Option<Row>> {
        self.execute(sql, params).await?;
        let mode = self.resolved(back_as);
        let result = self.result_mut()?;
        let n = result.rows.len() as u64;
        if n > 1 {
            result.rows.clear();
            return Err(DbError::out_of_bounds(n, 0, 1));
        }
        self.fetch_next(Some(mode))
    }

    pub async fn all(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
        back_as: Option<BackAs>,
    ) -> DbResult<Vec<Row>> {
        self.execute(sql, params).await?;
        let mode = self.resolved(back_as);
        self.fetch_all(Some(mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectOptions, DatabaseConfig, PoolOptions};
    use crate::db::mock::{Failure, MockDriver};
    use crate::db::pool::Pool;

    async fn setup(options: PoolOptions) -> (Pool, MockDriver) {
        let driver = MockDriver::new();
        driver.respond(
            "SELECT id, name FROM users",
            &["id", "name"],
            vec![
                vec![Value::Int(1), Value::from("ann")],
                vec![Value::Int(2), Value::from("bob")],
                vec![Value::Int(3), Value::from("cy")],
            ],
        );
        driver.respond(
            "SELECT id, name FROM users WHERE id = 1",
            &["id", "name"],
            vec![vec![Value::Int(1), Value::from("ann")]],
        );
        driver.respond("SELECT id, name FROM users WHERE id = 9", &["id", "name"], vec![]);
        driver.respond(
            "INSERT INTO users (name) VALUES ('dee') RETURNING id",
            &["id"],
            vec![vec![Value::Int(4)]],
        );
        driver.respond_affected("UPDATE users SET name = 'x'", 3);
        let config = DatabaseConfig::new(ConnectOptions::postgres("test"), options).unwrap();
        let pool = Pool::connect_with_driver(config, Arc::new(driver.clone()))
            .await
            .unwrap();
        (pool, driver)
    }

    #[tokio::test]
    async fn test_fetch_before_execute_is_invalid() {
        let (pool, _) = setup(PoolOptions::default()).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut cursor = conn.cursor();
        assert!(cursor.description().is_none());
        assert!(cursor.rowcount().is_none());
        let err = cursor.fetch_next(None).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_execute_then_fetch_in_pieces() {
        let (pool, _) = setup(PoolOptions::default()).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut cursor = conn.cursor();
        assert_eq!(cursor.execute("SELECT id, name FROM users", ()).await.unwrap(), 3);
        assert_eq!(cursor.description().unwrap().len(), 2);

        let first = cursor.fetch_next(Some(BackAs::Tuple)).unwrap().unwrap();
        assert_eq!(first, Row::Tuple(vec![Value::Int(1), Value::from("ann")]));

        let many = cursor.fetch_many(5, None).unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[0].get_by_name("name"), Some(&Value::from("bob")));

        assert!(cursor.fetch_next(None).unwrap().is_none());
        assert!(cursor.fetch_all(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_mode_keeps_the_row() {
        let (pool, driver) = setup(PoolOptions::default()).await;
        driver.respond(
            "SELECT a.id, b.id FROM a, b",
            &["id", "id"],
            vec![vec![Value::Int(1), Value::Int(2)]],
        );
        let mut conn = pool.acquire().await.unwrap();
        let mut cursor = conn.cursor();
        cursor.execute("SELECT a.id, b.id FROM a, b", ()).await.unwrap();

        let err = cursor.fetch_next(Some(BackAs::Dict)).unwrap_err();
        assert!(matches!(err, DbError::DuplicateColumn { .. }));
        let row = cursor.fetch_next(Some(BackAs::Tuple)).unwrap().unwrap();
        assert_eq!(row, Row::Tuple(vec![Value::Int(1), Value::Int(2)]));
        assert!(cursor.fetch_next(None).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_cardinality() {
        let (pool, _) = setup(PoolOptions::default()).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut cursor = conn.cursor();

        let err = cursor
            .one("SELECT id, name FROM users WHERE id = 9", (), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::TooFew { n: 0, .. }));

        let err = cursor
            .one("SELECT id, name FROM users", (), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::TooMany { n: 3, .. }));
        assert_eq!(err.to_string(), "Got 3 rows; expecting exactly 1.");

        let row = cursor
            .one("SELECT id, name FROM users WHERE id = 1", (), Some(BackAs::Dict))
            .await
            .unwrap();
        assert!(matches!(row, Row::Dict(_)));
        assert_eq!(row.get_by_name("id"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_one_or_none() {
        let (pool, _) = setup(PoolOptions::default()).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut cursor = conn.cursor();
        assert!(
            cursor
                .one_or_none("SELECT id, name FROM users WHERE id = 9", (), None)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            cursor
                .one_or_none("SELECT id, name FROM users WHERE id = 1", (), None)
                .await
                .unwrap()
                .is_some()
        );
        let err = cursor
            .one_or_none("SELECT id, name FROM users", (), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::TooMany { n: 3, lo: 0, hi: 1 }));
    }

    #[tokio::test]
    async fn test_single_column_dereferences() {
        let (pool, _) = setup(PoolOptions::default()).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut cursor = conn.cursor();
        let row = cursor
            .one("INSERT INTO users (name) VALUES ('dee') RETURNING id", (), None)
            .await
            .unwrap();
        assert_eq!(row, Row::Scalar(Value::Int(4)));

        // an explicit mode is never overridden
        let row = cursor
            .one(
                "INSERT INTO users (name) VALUES ('dee') RETURNING id",
                (),
                Some(BackAs::Tuple),
            )
            .await
            .unwrap();
        assert_eq!(row, Row::Tuple(vec![Value::Int(4)]));
    }

    #[tokio::test]
    async fn test_default_back_as_from_pool_options() {
        let (pool, _) = setup(PoolOptions::default().back_as(BackAs::Tuple)).await;
        let mut conn = pool.acquire().await.unwrap();
        let rows = conn
            .cursor()
            .all("SELECT id, name FROM users", (), None)
            .await
            .unwrap();
        assert!(rows.iter().all(|r| matches!(r, Row::Tuple(_))));

        let rows = conn
            .cursor()
            .with_back_as(BackAs::Dict)
            .all("SELECT id, name FROM users", (), None)
            .await
            .unwrap();
        assert!(rows.iter().all(|r| matches!(r, Row::Dict(_))));
    }

    #[tokio::test]
    async fn test_run_reports_rows_affected() {
        let (pool, _) = setup(PoolOptions::default()).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut cursor = conn.cursor();
        assert_eq!(cursor.run("UPDATE users SET name = 'x'", ()).await.unwrap(), 3);
        assert_eq!(cursor.rowcount(), Some(3));
        assert!(cursor.all("UPDATE users SET name = 'x'", (), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_execute_clears_result() {
        let (pool, driver) = setup(PoolOptions::default()).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut cursor = conn.cursor();
        cursor.execute("SELECT id, name FROM users", ()).await.unwrap();
        driver.fail_next_statement(Failure::Programming);
        let err = cursor.execute("SELEC 1", ()).await.unwrap_err();
        assert!(matches!(err, DbError::Programming { .. }));
        assert!(cursor.description().is_none());
    }

    #[tokio::test]
    async fn test_params_reach_driver() {
        let (pool, driver) = setup(PoolOptions::default()).await;
        let mut conn = pool.acquire().await.unwrap();
        conn.cursor()
            .run("DELETE FROM users WHERE id = $1", vec![Value::Int(2)])
            .await
            .unwrap();
        assert_eq!(
            driver.params().last(),
            Some(&Params::Positional(vec![Value::Int(2)]))
        );
    }
}
