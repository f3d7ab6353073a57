//! Transaction scopes and savepoints.
//!
//! A connection carries a nesting depth: 0 outside any transaction, 1 inside a
//! top-level transaction, and `k` inside `k - 1` savepoints. Opening a scope at
//! depth 0 sends `BEGIN`; any deeper scope sends `SAVEPOINT pgkit_sp_<level>`
//! where `level` is the depth the scope opens at.
//!
//! A scope dropped while still active cannot run SQL from `Drop`, so it records
//! a pending rollback on the connection instead. The pending rollback runs
//! before the next statement or scope operation on that connection, or when the
//! connection goes back to the pool.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::cursor::Cursor;
use crate::db::pool::{Live, Pool, PooledConnection};
use crate::db::row::{BackAs, Row};
use crate::error::{DbError, DbResult};
use crate::models::Params;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options for a top-level transaction. Savepoint scopes inherit the outer
/// transaction's settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub readonly: bool,
    pub isolation: Option<IsolationLevel>,
}

impl TransactionOptions {
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }
}

pub(crate) fn savepoint_name(level: u32) -> String {
    format!("pgkit_sp_{}", level)
}

impl Live {
    /// Roll back everything above depth `target`.
    ///
    /// Any failure leaves the session state unknown, so the connection is
    /// marked broken.
    pub(crate) async fn rollback_to(&mut self, target: u32) -> DbResult<()> {
        if self.pending_rollback_to.is_some_and(|pending| pending >= target) {
            self.pending_rollback_to = None;
        }
        if self.depth <= target {
            return Ok(());
        }

        let result = if target == 0 {
            self.raw.rollback().await
        } else {
            let name = savepoint_name(target + 1);
            match self
                .raw
                .execute_batch(&format!("ROLLBACK TO SAVEPOINT {}", name))
                .await
            {
                Ok(()) => {
                    self.raw
                        .execute_batch(&format!("RELEASE SAVEPOINT {}", name))
                        .await
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                debug!(connection_id = self.id, from = self.depth, to = target, "Rolled back");
                self.depth = target;
                Ok(())
            }
            Err(e) => {
                warn!(connection_id = self.id, error = %e, "Rollback failed, connection is broken");
                self.broken = true;
                self.pending_rollback_to = None;
                Err(e)
            }
        }
    }

    /// Run the rollback left behind by an abandoned scope, if any.
    pub(crate) async fn resolve_pending(&mut self) -> DbResult<()> {
        match self.pending_rollback_to {
            Some(target) => self.rollback_to(target).await,
            None => Ok(()),
        }
    }

    /// Open a scope and return its level.
    async fn open_scope(&mut self, options: &TransactionOptions) -> DbResult<u32> {
        if self.broken {
            return Err(DbError::interface(
                "Connection is broken and cannot start a transaction",
            ));
        }
        self.resolve_pending().await?;

        let level = self.depth + 1;
        let result = if level == 1 {
            self.raw.begin(options).await
        } else {
            self.raw
                .execute_batch(&format!("SAVEPOINT {}", savepoint_name(level)))
                .await
        };
        if let Err(e) = result {
            if e.is_connection_error() {
                self.broken = true;
            }
            return Err(e);
        }

        self.depth = level;
        debug!(connection_id = self.id, level, "Opened transaction scope");
        Ok(level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeState {
    Active,
    Committed,
    RolledBack,
}

/// A connection either owned by a scope or borrowed from an outer one.
#[derive(Debug)]
pub enum MaybePooled<'c> {
    Owned(PooledConnection),
    Borrowed(&'c mut PooledConnection),
}

impl Deref for MaybePooled<'_> {
    type Target = PooledConnection;

    fn deref(&self) -> &PooledConnection {
        match self {
            Self::Owned(conn) => conn,
            Self::Borrowed(conn) => conn,
        }
    }
}

impl DerefMut for MaybePooled<'_> {
    fn deref_mut(&mut self) -> &mut PooledConnection {
        match self {
            Self::Owned(conn) => conn,
            Self::Borrowed(conn) => conn,
        }
    }
}

/// A transaction scope: a top-level transaction or a savepoint inside one.
///
/// Call [`commit`](Self::commit) or [`rollback`](Self::rollback) to finish it.
/// Dropping an unfinished scope (early return, `?`, panic, cancelled future)
/// rolls it back.
#[derive(Debug)]
#[must_use = "a transaction rolls back unless committed"]
pub struct Transaction<'c> {
    conn: MaybePooled<'c>,
    level: u32,
    options: TransactionOptions,
    state: ScopeState,
}

impl<'c> Transaction<'c> {
    async fn open(mut conn: MaybePooled<'c>, options: TransactionOptions) -> DbResult<Self> {
        let level = conn.live_mut()?.open_scope(&options).await?;
        Ok(Self {
            conn,
            level,
            options,
            state: ScopeState::Active,
        })
    }

    /// Nesting level: 1 for a top-level transaction.
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn is_nested(&self) -> bool {
        self.level > 1
    }

    /// Open a savepoint scope inside this one.
    pub async fn begin_nested(&mut self) -> DbResult<Transaction<'_>> {
        let options = self.options;
        Transaction::open(MaybePooled::Borrowed(&mut *self.conn), options).await
    }

    pub fn cursor(&mut self) -> Cursor<'_> {
        Cursor::new(&mut *self.conn)
    }

    /// Commit the scope.
    ///
    /// A failed top-level commit leaves the transaction in an unknown state;
    /// the connection is marked broken and discarded when released.
    pub async fn commit(mut self) -> DbResult<()> {
        let level = self.level;
        let live = self.conn.live_mut()?;
        live.resolve_pending().await?;
        if live.depth != level {
            return Err(DbError::internal(format!(
                "transaction depth {} does not match scope level {}",
                live.depth, level
            )));
        }

        if level == 1 {
            let result = live.raw.commit().await;
            live.depth = 0;
            self.state = match &result {
                Ok(()) => ScopeState::Committed,
                Err(e) => {
                    warn!(connection_id = live.id, error = %e, "Commit failed, discarding connection");
                    live.broken = true;
                    ScopeState::RolledBack
                }
            };
            result?;
        } else {
            let sql = format!("RELEASE SAVEPOINT {}", savepoint_name(level));
            match live.raw.execute_batch(&sql).await {
                Ok(()) => {
                    live.depth = level - 1;
                    self.state = ScopeState::Committed;
                }
                Err(e) => {
                    if e.is_connection_error() {
                        live.broken = true;
                    }
                    live.pending_rollback_to = Some(level - 1);
                    self.state = ScopeState::RolledBack;
                    return Err(e);
                }
            }
        }
        debug!(connection_id = live.id, level, "Committed transaction scope");
        Ok(())
    }

    /// Roll the scope back. An inner rollback leaves the outer transaction
    /// untouched.
    pub async fn rollback(mut self) -> DbResult<()> {
        let level = self.level;
        self.state = ScopeState::RolledBack;
        self.conn.live_mut()?.rollback_to(level - 1).await
    }

    pub async fn run(&mut self, sql: &str, params: impl Into<Params>) -> DbResult<u64> {
        self.cursor().run(sql, params).await
    }

    pub async fn one(&mut self, sql: &str, params: impl Into<Params>) -> DbResult<Row> {
        self.cursor().one(sql, params, None).await
    }

    pub async fn one_or_none(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
    ) -> DbResult<Option<Row>> {
        self.cursor().one_or_none(sql, params, None).await
    }

    pub async fn all(&mut self, sql: &str, params: impl Into<Params>) -> DbResult<Vec<Row>> {
        self.cursor().all(sql, params, None).await
    }

    /// Like [`all`](Self::all), with an explicit row mode.
    pub async fn all_as(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
        back_as: BackAs,
    ) -> DbResult<Vec<Row>> {
        self.cursor().all(sql, params, Some(back_as)).await
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state != ScopeState::Active {
            return;
        }
        let target = self.level - 1;
        if let Some(live) = self.conn.live.as_mut() {
            warn!(
                connection_id = live.id,
                level = self.level,
                "Transaction scope dropped while active, rolling back"
            );
            live.pending_rollback_to = Some(
                live.pending_rollback_to
                    .map_or(target, |pending| pending.min(target)),
            );
        }
    }
}

impl PooledConnection {
    /// Open a transaction scope on this connection, or a savepoint if one is
    /// already open.
    pub async fn begin(&mut self) -> DbResult<Transaction<'_>> {
        let options = TransactionOptions::default().readonly(self.options().readonly_or_default());
        self.begin_with(options).await
    }

    pub async fn begin_with(&mut self, options: TransactionOptions) -> DbResult<Transaction<'_>> {
        Transaction::open(MaybePooled::Borrowed(self), options).await
    }

    /// Open a transaction that owns this connection.
    pub async fn into_transaction(
        self,
        options: TransactionOptions,
    ) -> DbResult<Transaction<'static>> {
        Transaction::open(MaybePooled::Owned(self), options).await
    }
}

impl Pool {
    /// Acquire a connection and open a transaction on it.
    pub async fn begin(&self) -> DbResult<Transaction<'static>> {
        let options = TransactionOptions::default().readonly(self.options().readonly_or_default());
        self.begin_with(options).await
    }

    pub async fn begin_with(&self, options: TransactionOptions) -> DbResult<Transaction<'static>> {
        self.acquire().await?.into_transaction(options).await
    }
}
