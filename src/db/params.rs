//! Parameter handling for database statements.
//!
//! Named parameters (`:name`) are rewritten to the backend's positional
//! placeholders (`$1` for PostgreSQL, `?1` for SQLite) and the values are then
//! bound server-side; nothing is ever interpolated into the SQL text. The
//! scanner skips string literals, quoted identifiers, comments, dollar-quoted
//! bodies and `::` casts so that only real parameters are rewritten.

use std::borrow::Cow;
use std::collections::HashMap;

use serde_json::Value as JsonValue;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgTypeInfo};
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{Encode, Postgres, Sqlite, Type};

use crate::error::{DbError, DbResult};
use crate::models::{Params, Value};

/// Positional placeholder syntax of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, ... (PostgreSQL)
    Dollar,
    /// `?1`, `?2`, ... (SQLite)
    Question,
}

impl PlaceholderStyle {
    fn write(self, out: &mut String, index: usize) {
        match self {
            Self::Dollar => out.push('$'),
            Self::Question => out.push('?'),
        }
        out.push_str(&index.to_string());
    }
}

/// SQL text ready for the driver plus the values to bind, in order.
#[derive(Debug)]
pub struct BoundStatement<'a> {
    pub sql: Cow<'a, str>,
    pub values: Vec<&'a Value>,
}

/// Resolve `params` against `sql`.
pub fn prepare<'a>(
    sql: &'a str,
    params: &'a Params,
    style: PlaceholderStyle,
) -> DbResult<BoundStatement<'a>> {
    match params {
        Params::None => Ok(BoundStatement {
            sql: Cow::Borrowed(sql),
            values: Vec::new(),
        }),
        Params::Positional(values) => Ok(BoundStatement {
            sql: Cow::Borrowed(sql),
            values: values.iter().collect(),
        }),
        Params::Named(pairs) => rewrite_named(sql, pairs, style),
    }
}

fn rewrite_named<'a>(
    sql: &'a str,
    pairs: &'a [(String, Value)],
    style: PlaceholderStyle,
) -> DbResult<BoundStatement<'a>> {
    let lookup: HashMap<&str, &'a Value> = pairs.iter().map(|(k, v)| (k.as_str(), v)).collect();

    let mut out = String::with_capacity(sql.len() + 8);
    let mut values: Vec<&'a Value> = Vec::new();
    let mut assigned: HashMap<&str, usize> = HashMap::new();
    let mut last = 0;

    for (range, name) in scan_named(sql) {
        let index = match assigned.get(name) {
            Some(idx) => *idx,
            None => {
                let value = lookup.get(name).ok_or_else(|| {
                    DbError::invalid_input(format!("Missing value for named parameter ':{}'", name))
                })?;
                values.push(value);
                assigned.insert(name, values.len());
                values.len()
            }
        };
        out.push_str(&sql[last..range.start]);
        style.write(&mut out, index);
        last = range.end;
    }

    if values.is_empty() {
        return Ok(BoundStatement {
            sql: Cow::Borrowed(sql),
            values,
        });
    }
    out.push_str(&sql[last..]);
    Ok(BoundStatement {
        sql: Cow::Owned(out),
        values,
    })
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Find every `:name` parameter outside literals and comments.
///
/// Returns the byte range of each occurrence (including the colon) and the name.
pub fn scan_named(sql: &str) -> Vec<(std::ops::Range<usize>, &str)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                let escapes = i > 0 && matches!(bytes[i - 1], b'e' | b'E');
                i = skip_quoted(bytes, i, b'\'', escapes);
            }
            b'"' => i = skip_quoted(bytes, i, b'"', false),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = match bytes[i..].iter().position(|&b| b == b'\n') {
                    Some(off) => i + off + 1,
                    None => bytes.len(),
                };
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'$' => i = skip_dollar_quoted(sql, i),
            b':' if bytes.get(i + 1) == Some(&b':') => i += 2,
            b':' if bytes.get(i + 1).is_some_and(|&b| is_ident_start(b)) => {
                let start = i;
                i += 1;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                found.push((start..i, &sql[start + 1..i]));
            }
            _ => i += 1,
        }
    }
    found
}

/// Skip a quoted run starting at `start`; doubled quotes are escapes.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        let b = bytes[i];
        if backslash_escapes && b == b'\\' {
            i += 2;
            continue;
        }
        if b == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Block comments nest in PostgreSQL.
fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Skip `$tag$ ... $tag$`; a `$` that does not open a dollar quote (e.g. `$1`) is
/// stepped over.
fn skip_dollar_quoted(sql: &str, start: usize) -> usize {
    let bytes = sql.as_bytes();
    let mut i = start + 1;
    if i < bytes.len() && is_ident_start(bytes[i]) {
        while i < bytes.len() && is_ident_char(bytes[i]) {
            i += 1;
        }
    }
    if bytes.get(i) != Some(&b'$') {
        return start + 1;
    }
    let tag = &sql[start..=i];
    let body = i + 1;
    match sql[body..].find(tag) {
        Some(off) => body + off + tag.len(),
        None => bytes.len(),
    }
}

/// A bound PostgreSQL parameter that declares the type of the value it holds.
///
/// The server is told `int8`, `float8`, `text`, ... per value and converts to
/// the column type itself (assignment casts), instead of inferring a type from
/// the statement and misreading our binary encoding. NULL is sent with no
/// declared type so it fits any column.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PgParam<'a>(pub &'a Value);

impl PgParam<'_> {
    pub(crate) fn declared_type(&self) -> PgTypeInfo {
        match self.0 {
            Value::Null => PgTypeInfo::with_oid(Oid(0)),
            Value::Bool(_) => <bool as Type<Postgres>>::type_info(),
            Value::Int(_) => <i64 as Type<Postgres>>::type_info(),
            Value::Float(_) => <f64 as Type<Postgres>>::type_info(),
            Value::Text(_) => <&str as Type<Postgres>>::type_info(),
            Value::Bytes(_) => <&[u8] as Type<Postgres>>::type_info(),
            Value::Json(_) => <Json<&JsonValue> as Type<Postgres>>::type_info(),
        }
    }
}

impl Type<Postgres> for PgParam<'_> {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl<'q> Encode<'q, Postgres> for PgParam<'_> {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => <bool as Encode<Postgres>>::encode_by_ref(v, buf),
            Value::Int(v) => <i64 as Encode<Postgres>>::encode_by_ref(v, buf),
            Value::Float(v) => <f64 as Encode<Postgres>>::encode_by_ref(v, buf),
            Value::Text(v) => <&str as Encode<Postgres>>::encode_by_ref(&v.as_str(), buf),
            Value::Bytes(v) => <&[u8] as Encode<Postgres>>::encode_by_ref(&v.as_slice(), buf),
            Value::Json(v) => <Json<&JsonValue> as Encode<Postgres>>::encode_by_ref(&Json(v), buf),
        }
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        Some(self.declared_type())
    }
}

/// Bind a value to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q Value,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    query.bind(PgParam(param))
}

/// Bind a value to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
        // SQLite doesn't have native JSON type, store as string
        Value::Json(v) => query.bind(v.to_string()),
    }
}
