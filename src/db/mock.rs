//! Scripted in-memory driver for unit tests.
//!
//! Records every statement as `conn<id>: <sql>`, tracks each session's
//! transaction and savepoint state the way PostgreSQL would, and lets tests
//! inject connect, probe, statement, commit and rollback failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ConnectOptions;
use crate::db::driver::{Driver, DriverConnection, QueryOutput};
use crate::db::transaction::TransactionOptions;
use crate::error::{DbError, DbResult};
use crate::models::{Column, Params, Value};

/// Kinds of statement failure the mock can produce.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Programming,
    Data,
    Integrity,
    Interface,
}

impl Failure {
    fn to_error(self) -> DbError {
        match self {
            Self::Programming => {
                DbError::programming("syntax error at or near \"SELEC\"", Some("42601".into()))
            }
            Self::Data => DbError::data("division by zero", Some("22012".into())),
            Self::Integrity => DbError::integrity(
                "duplicate key value violates unique constraint",
                Some("23505".into()),
            ),
            Self::Interface => DbError::interface("server closed the connection unexpectedly"),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    log: Vec<String>,
    params: Vec<Params>,
    violations: Vec<String>,
    responses: HashMap<String, QueryOutput>,
    next_id: u64,
    opened: usize,
    closed: usize,
    pings: usize,
    fail_connects: u32,
    fail_pings: u32,
    fail_statement: Option<Failure>,
    fail_commit: bool,
    fail_rollback: bool,
    connect_delay: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Script the result of `sql`.
    pub fn respond(&self, sql: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        let columns: Arc<[Column]> = columns.iter().map(|n| Column::new(*n, "TEXT")).collect();
        let rows_affected = rows.len() as u64;
        self.state().responses.insert(
            sql.to_string(),
            QueryOutput {
                columns,
                rows,
                rows_affected,
            },
        );
    }

    /// Script the change count of a statement that returns no rows.
    pub fn respond_affected(&self, sql: &str, rows_affected: u64) {
        self.state()
            .responses
            .insert(sql.to_string(), QueryOutput::affected(rows_affected));
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.state().fail_connects = n;
    }

    pub fn fail_next_pings(&self, n: u32) {
        self.state().fail_pings = n;
    }

    pub fn fail_next_statement(&self, failure: Failure) {
        self.state().fail_statement = Some(failure);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.state().fail_commit = fail;
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.state().fail_rollback = fail;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = delay;
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    /// Parameters of every `execute` call, in order.
    pub fn params(&self) -> Vec<Params> {
        self.state().params.clone()
    }

    /// How many times `sql` was sent.
    pub fn executions(&self, sql: &str) -> usize {
        let suffix = format!(": {}", sql);
        self.state()
            .log
            .iter()
            .filter(|e| e.ends_with(&suffix))
            .count()
    }

    /// Transaction-control statements that a real server would have rejected.
    pub fn violations(&self) -> Vec<String> {
        self.state().violations.clone()
    }

    pub fn opened(&self) -> usize {
        self.state().opened
    }

    pub fn closed(&self) -> usize {
        self.state().closed
    }

    pub fn pings(&self) -> usize {
        self.state().pings
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(&self, _options: &ConnectOptions) -> DbResult<Box<dyn DriverConnection>> {
        let delay = self.state().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(DbError::connection(
                "Failed to connect: Connection refused",
                "Check that the postgres server is running and accessible",
            ));
        }
        state.next_id += 1;
        state.opened += 1;
        Ok(Box::new(MockConnection {
            id: state.next_id,
            driver: self.clone(),
            in_transaction: false,
            savepoints: Vec::new(),
        }))
    }
}

#[derive(Debug)]
struct MockConnection {
    id: u64,
    driver: MockDriver,
    in_transaction: bool,
    savepoints: Vec<String>,
}

impl MockConnection {
    fn record(&self, sql: &str) {
        self.driver.state().log.push(format!("conn{}: {}", self.id, sql));
    }

    fn violation(&self, message: String) -> DbError {
        self.driver.state().violations.push(message.clone());
        DbError::database(message, Some("25P01".into()))
    }

    fn control(&mut self, sql: &str) -> DbResult<()> {
        if let Some(name) = sql.strip_prefix("SAVEPOINT ") {
            if !self.in_transaction {
                return Err(self.violation(format!("{} outside a transaction", sql)));
            }
            self.savepoints.push(name.to_string());
        } else if let Some(name) = sql.strip_prefix("ROLLBACK TO SAVEPOINT ") {
            if self.driver.state().fail_rollback {
                return Err(DbError::interface("rollback failed"));
            }
            match self.savepoints.iter().rposition(|s| s == name) {
                Some(pos) => self.savepoints.truncate(pos + 1),
                None => return Err(self.violation(format!("no savepoint {}", name))),
            }
        } else if let Some(name) = sql.strip_prefix("RELEASE SAVEPOINT ") {
            match self.savepoints.iter().rposition(|s| s == name) {
                Some(pos) => self.savepoints.truncate(pos),
                None => return Err(self.violation(format!("no savepoint {}", name))),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn execute(&mut self, sql: &str, params: &Params) -> DbResult<QueryOutput> {
        self.record(sql);
        self.driver.state().params.push(params.clone());

        if let Some(ms) = sql.strip_prefix("SLEEP ") {
            let ms = ms.trim().parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let mut state = self.driver.state();
        if let Some(failure) = state.fail_statement.take() {
            return Err(failure.to_error());
        }
        Ok(state
            .responses
            .get(sql)
            .cloned()
            .unwrap_or_else(|| QueryOutput::affected(0)))
    }

    async fn execute_batch(&mut self, sql: &str) -> DbResult<()> {
        self.record(sql);
        self.control(sql)
    }

    async fn begin(&mut self, options: &TransactionOptions) -> DbResult<()> {
        let mut sql = String::from("BEGIN");
        if let Some(level) = options.isolation {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level.as_sql());
        }
        if options.readonly {
            sql.push_str(" READ ONLY");
        }
        self.record(&sql);
        if self.in_transaction {
            return Err(self.violation("BEGIN inside a transaction".to_string()));
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.record("COMMIT");
        if self.driver.state().fail_commit {
            return Err(DbError::interface("server closed the connection during COMMIT"));
        }
        if !self.in_transaction {
            return Err(self.violation("COMMIT outside a transaction".to_string()));
        }
        self.in_transaction = false;
        self.savepoints.clear();
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.record("ROLLBACK");
        if self.driver.state().fail_rollback {
            return Err(DbError::interface("rollback failed"));
        }
        self.in_transaction = false;
        self.savepoints.clear();
        Ok(())
    }

    async fn ping(&mut self) -> DbResult<()> {
        let mut state = self.driver.state();
        state.pings += 1;
        if state.fail_pings > 0 {
            state.fail_pings -= 1;
            return Err(DbError::interface("connection reset by peer"));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.driver.state().closed += 1;
        Ok(())
    }
}
