//! Backend type mappings.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Backend-specific decoders extract a [`Value`] for that category
//!
//! Types without a native `Value` variant (numeric, uuid, timestamps, dates,
//! times) decode to `Value::Text` in a canonical textual form.

use std::sync::Arc;

use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Decode, Row, Type, TypeInfo, ValueRef};

use crate::config::Backend;
use crate::error::{DbError, DbResult};
use crate::models::{Column, Value};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Unknown,
}

/// Classify a backend type name into a logical category.
pub fn categorize_type(type_name: &str, backend: Backend) -> TypeCategory {
    let lower = type_name.to_lowercase();
    match backend {
        Backend::Postgres => categorize_postgres(&lower),
        Backend::Sqlite => categorize_sqlite(&lower),
    }
}

fn categorize_postgres(lower: &str) -> TypeCategory {
    match lower {
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" => TypeCategory::Integer,
        "float4" | "float8" | "real" | "double precision" => TypeCategory::Float,
        "numeric" | "decimal" => TypeCategory::Decimal,
        "bool" | "boolean" => TypeCategory::Boolean,
        "text" | "varchar" | "bpchar" | "char" | "name" | "citext" | "character varying" => {
            TypeCategory::Text
        }
        "bytea" => TypeCategory::Binary,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "timestamp" => TypeCategory::Timestamp,
        "timestamptz" => TypeCategory::TimestampTz,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        _ => TypeCategory::Unknown,
    }
}

/// SQLite declared types follow the column affinity rules.
fn categorize_sqlite(lower: &str) -> TypeCategory {
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("int") {
        return TypeCategory::Integer;
    }
    if lower.contains("char") || lower.contains("clob") || lower.contains("text") {
        return TypeCategory::Text;
    }
    if lower.contains("blob") {
        return TypeCategory::Binary;
    }
    if lower.contains("real") || lower.contains("floa") || lower.contains("doub") {
        return TypeCategory::Float;
    }
    if lower == "json" {
        return TypeCategory::Json;
    }
    // NUMERIC affinity and expression columns: decide from the stored value
    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Raw NUMERIC value in its textual form.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => Ok(RawDecimal(numeric_to_string(value.as_bytes()?)?)),
        }
    }
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render the binary NUMERIC wire format (base-10000 digits) as decimal text.
fn numeric_to_string(buf: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    let read_u16 = |at: usize| -> Result<u16, sqlx::error::BoxDynError> {
        buf.get(at..at + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".into())
    };

    let ndigits = read_u16(0)? as usize;
    let weight = read_u16(2)? as i16 as i32;
    let sign = read_u16(4)?;
    let dscale = read_u16(6)? as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => return Err(format!("invalid NUMERIC sign 0x{:04x}", other).into()),
    }

    let mut digits = Vec::with_capacity(ndigits);
    for k in 0..ndigits {
        digits.push(read_u16(8 + 2 * k)?);
    }
    let digit = |k: i32| -> u16 {
        if k >= 0 && (k as usize) < digits.len() {
            digits[k as usize]
        } else {
            0
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG && !digits.is_empty() {
        out.push('-');
    }
    if weight >= 0 {
        out.push_str(&digit(0).to_string());
        for k in 1..=weight {
            out.push_str(&format!("{:04}", digit(k)));
        }
    } else {
        out.push('0');
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut k = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(k)));
            k += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

// =============================================================================
// Column Descriptors
// =============================================================================

/// Column descriptors of a sqlx row or statement.
pub fn describe_columns<C: sqlx::Column>(columns: &[C]) -> Arc<[Column]> {
    columns
        .iter()
        .map(|col| Column::new(col.name(), col.type_info().name()))
        .collect()
}

fn decode_err(idx: usize, type_name: &str, err: impl std::fmt::Display) -> DbError {
    DbError::data(
        format!("Failed to decode column {} ({}): {}", idx, type_name, err),
        None,
    )
}

/// Decode every cell of a PostgreSQL row.
pub fn pg_row_values(row: &PgRow) -> DbResult<Vec<Value>> {
    use sqlx::Column as _;

    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let type_name = col.type_info().name();
            let category = categorize_type(type_name, Backend::Postgres);
            postgres::decode_column(row, idx, type_name, category)
        })
        .collect()
}

/// Decode every cell of a SQLite row.
pub fn sqlite_row_values(row: &SqliteRow) -> DbResult<Vec<Value>> {
    use sqlx::Column as _;

    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let type_name = col.type_info().name();
            let category = categorize_type(type_name, Backend::Sqlite);
            sqlite::decode_column(row, idx, type_name, category)
        })
        .collect()
}

// =============================================================================
// Backend-Specific Decoders
// =============================================================================

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<Value> {
        let raw = row
            .try_get_raw(idx)
            .map_err(|e| decode_err(idx, type_name, e))?;
        if raw.is_null() {
            return Ok(Value::Null);
        }

        let err = |e: sqlx::Error| decode_err(idx, type_name, e);
        let value = match category {
            TypeCategory::Integer => match type_name {
                "INT2" => Value::Int(row.try_get::<i16, _>(idx).map_err(err)?.into()),
                "INT4" => Value::Int(row.try_get::<i32, _>(idx).map_err(err)?.into()),
                _ => Value::Int(row.try_get::<i64, _>(idx).map_err(err)?),
            },
            TypeCategory::Float => match type_name {
                "FLOAT4" => Value::Float(row.try_get::<f32, _>(idx).map_err(err)?.into()),
                _ => Value::Float(row.try_get::<f64, _>(idx).map_err(err)?),
            },
            TypeCategory::Decimal => Value::Text(row.try_get::<RawDecimal, _>(idx).map_err(err)?.0),
            TypeCategory::Boolean => Value::Bool(row.try_get::<bool, _>(idx).map_err(err)?),
            TypeCategory::Text => Value::Text(row.try_get::<String, _>(idx).map_err(err)?),
            TypeCategory::Binary => Value::Bytes(row.try_get::<Vec<u8>, _>(idx).map_err(err)?),
            TypeCategory::Json => {
                Value::Json(row.try_get::<serde_json::Value, _>(idx).map_err(err)?)
            }
            TypeCategory::Uuid => {
                Value::Text(row.try_get::<uuid::Uuid, _>(idx).map_err(err)?.to_string())
            }
            TypeCategory::TimestampTz => Value::Text(
                row.try_get::<DateTime<Utc>, _>(idx)
                    .map_err(err)?
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            TypeCategory::Timestamp => {
                Value::Text(row.try_get::<NaiveDateTime, _>(idx).map_err(err)?.to_string())
            }
            TypeCategory::Date => {
                Value::Text(row.try_get::<NaiveDate, _>(idx).map_err(err)?.to_string())
            }
            TypeCategory::Time => {
                Value::Text(row.try_get::<NaiveTime, _>(idx).map_err(err)?.to_string())
            }
            TypeCategory::Unknown => decode_unknown(row, idx, type_name)?,
        };
        Ok(value)
    }

    /// Types without a mapping come back as text when the server sent text,
    /// otherwise as their raw wire bytes.
    fn decode_unknown(row: &PgRow, idx: usize, type_name: &str) -> DbResult<Value> {
        let raw = row
            .try_get_raw(idx)
            .map_err(|e| decode_err(idx, type_name, e))?;
        let value = match raw.format() {
            PgValueFormat::Text => raw
                .as_str()
                .map(|s| Value::Text(s.to_string()))
                .map_err(|e| decode_err(idx, type_name, e))?,
            PgValueFormat::Binary => raw
                .as_bytes()
                .map(|b| Value::Bytes(b.to_vec()))
                .map_err(|e| decode_err(idx, type_name, e))?,
        };
        tracing::debug!(column = idx, type_name, "No mapping for column type, passing through");
        Ok(value)
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<Value> {
        let raw = row
            .try_get_raw(idx)
            .map_err(|e| decode_err(idx, type_name, e))?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        // The stored value's class wins over the declared type, except for
        // booleans and JSON, which SQLite stores as integers and text.
        let storage = raw.type_info().name().to_uppercase();

        let err = |e: sqlx::Error| decode_err(idx, type_name, e);
        let value = match (category, storage.as_str()) {
            (TypeCategory::Boolean, "INTEGER" | "BOOLEAN") => {
                Value::Bool(row.try_get_unchecked::<bool, _>(idx).map_err(err)?)
            }
            (TypeCategory::Json, "TEXT") => {
                let text = row.try_get_unchecked::<String, _>(idx).map_err(err)?;
                match serde_json::from_str(&text) {
                    Ok(json) => Value::Json(json),
                    Err(_) => Value::Text(text),
                }
            }
            (_, "INTEGER" | "BOOLEAN") => {
                Value::Int(row.try_get_unchecked::<i64, _>(idx).map_err(err)?)
            }
            (_, "REAL") => Value::Float(row.try_get_unchecked::<f64, _>(idx).map_err(err)?),
            (_, "BLOB") => Value::Bytes(row.try_get_unchecked::<Vec<u8>, _>(idx).map_err(err)?),
            _ => Value::Text(row.try_get_unchecked::<String, _>(idx).map_err(err)?),
        };
        Ok(value)
    }
}
