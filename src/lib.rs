//! pgkit
//!
//! Pooled PostgreSQL access with scoped transactions. A bounded connection
//! pool hands out connections, each call runs inside a transaction scope
//! (nested scopes become savepoints), and result rows are shaped into tuples,
//! maps, records or bare values.
//!
//! ```no_run
//! use pgkit::{Database, params};
//!
//! # async fn example() -> pgkit::error::DbResult<()> {
//! let db = Database::connect_url("postgres://app@localhost/shop?max_size=4").await?;
//! let id = db
//!     .one("INSERT INTO items (name) VALUES (:name) RETURNING id", params! { name => "lamp" })
//!     .await?;
//! let items = db.all("SELECT id, name FROM items", ()).await?;
//! # let _ = (id, items);
//! db.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
#[macro_use]
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, ConnectOptions, DatabaseConfig, PoolOptions};
pub use database::{Database, Query};
pub use db::{BackAs, Cursor, Pool, PooledConnection, Record, Row, Transaction, TransactionOptions};
pub use error::{DbError, DbResult};
