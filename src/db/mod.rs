//! Database access layer.
//!
//! This module provides:
//! - The driver seam and its sqlx-backed PostgreSQL and SQLite adapters
//! - The connection pool
//! - Transaction scopes with savepoint nesting
//! - Cursors and row shaping
//! - Named parameter rewriting and value decoding
//! - The result cache

pub mod cache;
pub mod cursor;
pub mod driver;
#[macro_use]
pub mod macros;
#[cfg(test)]
pub(crate) mod mock;
pub mod params;
pub mod pool;
pub mod postgres;
pub mod row;
pub mod sqlite;
pub mod transaction;
pub mod types;

pub use cache::ResultCache;
pub use cursor::Cursor;
pub use driver::{Driver, DriverConnection, QueryOutput, driver_for};
pub use pool::{Pool, PooledConnection};
pub use row::{BackAs, Record, Row, RowFactory, resolve_back_as, shape_row};
pub use transaction::{IsolationLevel, MaybePooled, Transaction, TransactionOptions};
