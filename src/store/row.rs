//! Typed row snapshots.
//!
//! Rows travel between peers as JSON objects. On arrival they are decoded
//! against the table's [`TableSchema`] into a map of typed [`Value`]s, so the
//! rest of the crate never handles untyped JSON.

use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value as Json};
use std::collections::BTreeMap;

use super::schema::{ColumnType, TableSchema};
use super::timestamp;

/// A typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Encodes the value as JSON. Timestamps use the canonical text form.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Integer(i) => Json::from(*i),
            Value::Real(r) => Number::from_f64(*r).map(Json::Number).unwrap_or(Json::Null),
            Value::Text(s) => Json::String(s.clone()),
            Value::Bool(b) => Json::Bool(*b),
            Value::Timestamp(ts) => Json::String(timestamp::format(ts)),
        }
    }

    /// Decodes a JSON value into the given column type.
    fn from_json(ty: ColumnType, json: &Json) -> Option<Value> {
        if json.is_null() {
            return Some(Value::Null);
        }
        match ty {
            ColumnType::Integer => json.as_i64().map(Value::Integer),
            ColumnType::Real => json.as_f64().map(Value::Real),
            ColumnType::Text => json.as_str().map(|s| Value::Text(s.to_string())),
            // Stores that lack a boolean type report 0/1.
            ColumnType::Bool => match json {
                Json::Bool(b) => Some(Value::Bool(*b)),
                Json::Number(n) => n.as_i64().map(|i| Value::Bool(i != 0)),
                _ => None,
            },
            ColumnType::Timestamp => json
                .as_str()
                .and_then(|s| timestamp::parse(s).ok())
                .map(Value::Timestamp),
        }
    }
}

/// Errors decoding a row against its schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("table '{0}' is not replicated")]
    UnknownTable(String),
    #[error("{table}.{column} is required")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },
    #[error("{table}.{column} expects a {expected} value")]
    InvalidValue {
        table: &'static str,
        column: &'static str,
        expected: ColumnType,
    },
}

/// One row of a replicated table, keyed by column name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: BTreeMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, column: &str, value: Value) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: &str, value: Value) {
        self.values.insert(column.to_string(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Primary key, if present and an integer.
    pub fn key(&self) -> Option<i64> {
        match self.get(TableSchema::KEY) {
            Some(Value::Integer(id)) => Some(*id),
            _ => None,
        }
    }

    /// Change timestamp, if present.
    pub fn changed_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp(TableSchema::CHANGED_AT)
    }

    /// Creation timestamp, if present.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp(TableSchema::CREATED_AT)
    }

    fn timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        match self.get(column) {
            Some(Value::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    /// Decodes a JSON object against a schema.
    ///
    /// Columns the schema does not know are ignored (peers attach metadata
    /// such as `change_type`). Missing nullable columns decode as `Null`.
    pub fn from_json(schema: &TableSchema, object: &Map<String, Json>) -> Result<Self, SchemaError> {
        let mut row = Row::new();
        for column in schema.columns {
            let value = match object.get(column.name) {
                Some(json) => Value::from_json(column.ty, json).ok_or(SchemaError::InvalidValue {
                    table: schema.name,
                    column: column.name,
                    expected: column.ty,
                })?,
                None => Value::Null,
            };

            if value == Value::Null && !column.nullable {
                return Err(SchemaError::MissingColumn {
                    table: schema.name,
                    column: column.name,
                });
            }
            row.set(column.name, value);
        }
        Ok(row)
    }

    /// Checks that every column of the schema is present with the right type.
    pub fn validate(&self, schema: &TableSchema) -> Result<(), SchemaError> {
        for column in schema.columns {
            let ok = match self.get(column.name) {
                None | Some(Value::Null) => {
                    if column.nullable {
                        continue;
                    }
                    return Err(SchemaError::MissingColumn {
                        table: schema.name,
                        column: column.name,
                    });
                }
                Some(Value::Integer(_)) => column.ty == ColumnType::Integer,
                Some(Value::Real(_)) => column.ty == ColumnType::Real,
                Some(Value::Text(_)) => column.ty == ColumnType::Text,
                Some(Value::Bool(_)) => column.ty == ColumnType::Bool,
                Some(Value::Timestamp(_)) => column.ty == ColumnType::Timestamp,
            };
            if !ok {
                return Err(SchemaError::InvalidValue {
                    table: schema.name,
                    column: column.name,
                    expected: column.ty,
                });
            }
        }
        Ok(())
    }

    /// Encodes the row as a JSON object.
    pub fn to_json(&self) -> Map<String, Json> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}
