//! Error types for pgkit.
//!
//! All errors are represented by [`DbError`], built with `thiserror`. The
//! variants follow the server's error taxonomy (programming, data, integrity)
//! plus the pool's own capacity and liveness failures, so callers can match on
//! the kind of failure without inspecting driver-specific error types.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connect { message: String, suggestion: String },

    #[error("Timed out after {waited:?} waiting for a pooled connection")]
    PoolTimeout { waited: Duration },

    #[error("Connection pool has been shut down")]
    PoolExhausted,

    #[error("No usable connection after {attempts} failed liveness probes: {last_error}")]
    PoolUnavailable { attempts: u32, last_error: String },

    #[error("Programming error: {message}")]
    Programming {
        message: String,
        /// e.g., "42601" for a syntax error
        sql_state: Option<String>,
    },

    #[error("Data error: {message}")]
    Data {
        message: String,
        sql_state: Option<String>,
    },

    #[error("Integrity error: {message}")]
    Integrity {
        message: String,
        sql_state: Option<String>,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        sql_state: Option<String>,
    },

    #[error("Got {n} rows; expecting {}", expectation(.lo, .hi))]
    TooFew { n: u64, lo: u64, hi: u64 },

    #[error("Got {n} rows; expecting {}", expectation(.lo, .hi))]
    TooMany { n: u64, lo: u64, hi: u64 },

    #[error("Interface error: {message}")]
    Interface { message: String },

    #[error("Duplicate column name '{name}' cannot be used as a mapping key")]
    DuplicateColumn { name: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn expectation(lo: &u64, hi: &u64) -> String {
    let (lo, hi) = (*lo, *hi);
    if lo == hi {
        format!("exactly {lo}.")
    } else if hi - lo == 1 {
        format!("{lo} or {hi}.")
    } else {
        format!("between {lo} and {hi} (inclusive).")
    }
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn programming(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Programming {
            message: message.into(),
            sql_state,
        }
    }

    pub fn data(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Data {
            message: message.into(),
            sql_state,
        }
    }

    pub fn integrity(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Integrity {
            message: message.into(),
            sql_state,
        }
    }

    pub fn database(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
        }
    }

    /// Create an interface error (the session itself is unusable).
    pub fn interface(message: impl Into<String>) -> Self {
        Self::Interface {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Cardinality error for a result expected to hold between `lo` and `hi` rows.
    pub fn out_of_bounds(n: u64, lo: u64, hi: u64) -> Self {
        if n < lo {
            Self::TooFew { n, lo, hi }
        } else {
            Self::TooMany { n, lo, hi }
        }
    }

    /// Classify a server error by its SQLSTATE class.
    ///
    /// Class 42 (syntax error or access rule violation) and friends are
    /// programming errors, class 22 is bad data, class 23 is a constraint
    /// violation and class 08 means the session is gone. A protocol violation
    /// reported by the server (08P01) fails only the statement.
    pub fn from_sql_state(message: impl Into<String>, sql_state: Option<String>) -> Self {
        if sql_state.as_deref() == Some("08P01") {
            return Self::database(message, sql_state);
        }
        let class = sql_state.as_deref().and_then(|code| code.get(..2));
        match class {
            Some("42" | "0A" | "26" | "34" | "3F") => Self::programming(message, sql_state),
            Some("22") => Self::data(message, sql_state),
            Some("23") => Self::integrity(message, sql_state),
            Some("08") => Self::interface(message),
            _ => Self::database(message, sql_state),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connect { suggestion, .. } => Some(suggestion),
            Self::PoolTimeout { .. } => {
                Some("Increase max_size or acquire_timeout, or release connections sooner")
            }
            Self::DuplicateColumn { .. } => {
                Some("Alias the duplicated columns or use tuple/record rows")
            }
            _ => None,
        }
    }

    /// SQLSTATE reported by the server, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Programming { sql_state, .. }
            | Self::Data { sql_state, .. }
            | Self::Integrity { sql_state, .. }
            | Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// True when the error means the physical session can no longer be trusted.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Interface { .. })
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::PoolTimeout { .. }
                | Self::PoolUnavailable { .. }
                | Self::Interface { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let message = db_err.message().to_string();
                match db_err.kind() {
                    sqlx::error::ErrorKind::UniqueViolation
                    | sqlx::error::ErrorKind::ForeignKeyViolation
                    | sqlx::error::ErrorKind::NotNullViolation
                    | sqlx::error::ErrorKind::CheckViolation => DbError::integrity(message, code),
                    _ => DbError::from_sql_state(message, code),
                }
            }
            sqlx::Error::Io(io_err) => DbError::interface(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DbError::interface(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => DbError::interface(format!("Protocol error: {}", msg)),
            sqlx::Error::PoolClosed => DbError::interface("Driver connection is closed"),
            sqlx::Error::WorkerCrashed => DbError::interface("Database worker crashed"),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::data(format!("Failed to decode column {}: {}", index, source), None)
            }
            sqlx::Error::Decode(source) => DbError::data(format!("Decode error: {}", source), None),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::programming(format!("Type not found: {}", type_name), None)
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::programming(format!("Column not found: {}", col), None)
            }
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
