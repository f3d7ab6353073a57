//! Row shaping.
//!
//! A result set is described once by its columns; [`RowFactory`] validates the
//! requested [`BackAs`] mode against those columns a single time and then
//! shapes every row of the set without re-checking.

use std::collections::HashSet;
use std::fmt;
use std::ops::Index;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use tracing::warn;

use crate::error::{DbError, DbResult};
use crate::models::{Column, Value};

/// How fetched rows are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackAs {
    Tuple,
    Dict,
    #[default]
    Record,
    Scalar,
}

impl fmt::Display for BackAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tuple => "tuple",
            Self::Dict => "dict",
            Self::Record => "record",
            Self::Scalar => "scalar",
        };
        f.write_str(name)
    }
}

impl FromStr for BackAs {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tuple" => Ok(Self::Tuple),
            "dict" => Ok(Self::Dict),
            "record" => Ok(Self::Record),
            "scalar" => Ok(Self::Scalar),
            other => Err(DbError::invalid_input(format!(
                "Unknown row mode '{}'. Expected one of: tuple, dict, record, scalar",
                other
            ))),
        }
    }
}

/// Pick the effective row mode for a result with `column_count` columns.
///
/// An explicit request always wins. Without one, single-column results
/// dereference to the bare value.
pub fn resolve_back_as(requested: Option<BackAs>, default: BackAs, column_count: usize) -> BackAs {
    match requested {
        Some(mode) => mode,
        None if column_count == 1 => BackAs::Scalar,
        None => default,
    }
}

/// A row with both positional and by-name access.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: Arc<[String]>,
    values: Vec<Value>,
}

impl Record {
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .position(|f| f == name)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn to_dict(&self) -> IndexMap<String, Value> {
        self.fields
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl Index<usize> for Record {
    type Output = Value;

    fn index(&self, idx: usize) -> &Value {
        &self.values[idx]
    }
}

impl Index<&str> for Record {
    type Output = Value;

    fn index(&self, name: &str) -> &Value {
        match self.get_by_name(name) {
            Some(v) => v,
            None => panic!("no field named '{}' in record", name),
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.fields.iter().zip(&self.values) {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// A materialized row in one of the [`BackAs`] representations.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Row {
    Tuple(Vec<Value>),
    Dict(IndexMap<String, Value>),
    Record(Record),
    Scalar(Value),
}

impl Row {
    /// Positional access; a scalar row has a single position.
    pub fn get(&self, idx: usize) -> Option<&Value> {
        match self {
            Self::Tuple(v) => v.get(idx),
            Self::Dict(m) => m.get_index(idx).map(|(_, v)| v),
            Self::Record(r) => r.get(idx),
            Self::Scalar(v) => (idx == 0).then_some(v),
        }
    }

    /// By-name access; only dict and record rows carry names.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Dict(m) => m.get(name),
            Self::Record(r) => r.get_by_name(name),
            Self::Tuple(_) | Self::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_scalar(self) -> Option<Value> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_values(self) -> Vec<Value> {
        match self {
            Self::Tuple(v) => v,
            Self::Dict(m) => m.into_values().collect(),
            Self::Record(r) => r.into_values(),
            Self::Scalar(v) => vec![v],
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Tuple(v) => serde_json::Value::Array(v.iter().map(Value::to_json).collect()),
            Self::Dict(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Record(r) => serde_json::Value::Object(
                r.fields()
                    .iter()
                    .zip(r.values())
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::Scalar(v) => v.to_json(),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn first_duplicate(columns: &[Column]) -> Option<&str> {
    let mut seen = HashSet::with_capacity(columns.len());
    columns
        .iter()
        .map(|c| c.name.as_str())
        .find(|name| !seen.insert(*name))
}

/// Shapes rows of one result set.
#[derive(Debug, Clone)]
pub struct RowFactory {
    mode: BackAs,
    names: Arc<[String]>,
}

impl RowFactory {
    /// Validate `mode` against the result's columns.
    pub fn new(columns: &[Column], mode: BackAs) -> DbResult<Self> {
        let names: Arc<[String]> = columns.iter().map(|c| c.name.clone()).collect();

        let mode = match mode {
            BackAs::Dict => {
                if let Some(name) = first_duplicate(columns) {
                    return Err(DbError::DuplicateColumn {
                        name: name.to_string(),
                    });
                }
                BackAs::Dict
            }
            BackAs::Record => {
                let bad = columns.iter().find(|c| !is_identifier(&c.name));
                let dup = first_duplicate(columns);
                match (bad, dup) {
                    (None, None) => BackAs::Record,
                    (bad, dup) => {
                        warn!(
                            invalid = ?bad.map(|c| c.name.as_str()),
                            duplicate = ?dup,
                            "Column names unusable as record fields, returning tuples"
                        );
                        BackAs::Tuple
                    }
                }
            }
            BackAs::Scalar if columns.len() != 1 => {
                return Err(DbError::invalid_input(format!(
                    "Scalar rows need exactly one column, result has {}",
                    columns.len()
                )));
            }
            other => other,
        };

        Ok(Self { mode, names })
    }

    /// The mode actually applied, after any record fallback.
    pub fn mode(&self) -> BackAs {
        self.mode
    }

    pub fn shape(&self, values: Vec<Value>) -> Row {
        debug_assert_eq!(values.len(), self.names.len());
        match self.mode {
            BackAs::Tuple => Row::Tuple(values),
            BackAs::Dict => Row::Dict(self.names.iter().cloned().zip(values).collect()),
            BackAs::Record => Row::Record(Record {
                fields: Arc::clone(&self.names),
                values,
            }),
            BackAs::Scalar => Row::Scalar(values.into_iter().next().unwrap_or(Value::Null)),
        }
    }
}

/// Shape a single row.
pub fn shape_row(columns: &[Column], values: Vec<Value>, mode: BackAs) -> DbResult<Row> {
    Ok(RowFactory::new(columns, mode)?.shape(values))
}
