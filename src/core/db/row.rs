/// Row Module
///
/// Owned representations of fetched results. Rows are detached from the
/// driver cursor as soon as they are read, so they can cross threads and
/// outlive the statement that produced them.

use crate::core::{Result, ShelfError};
use rusqlite::types::Value;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::any::Any;
use std::fmt;

/// One result row: column names paired with owned values, in select order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row from parallel column and value lists.
    ///
    /// Extra values beyond the column count are dropped.
    pub fn new(columns: Vec<String>, mut values: Vec<Value>) -> Self {
        values.truncate(columns.len());
        Row { columns, values }
    }

    /// Reads every column of the current driver row into an owned `Row`.
    pub(crate) fn from_sql_row(row: &rusqlite::Row<'_>, columns: &[String]) -> rusqlite::Result<Self> {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(row.get::<_, Value>(i)?);
        }
        Ok(Row {
            columns: columns.to_vec(),
            values,
        })
    }

    /// Looks up a value by column name. The first matching column wins.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Looks up a text value by column name.
    pub fn get_text(&self, column: &str) -> Option<&str> {
        match self.get(column) {
            Some(Value::Text(text)) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub(crate) fn values_mut(&mut self) -> &mut [Value] {
        &mut self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates `(column, value)` pairs in select order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(String::as_str).zip(self.values.iter())
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, &value_to_json(value))?;
        }
        map.end()
    }
}

/// A typed record built by a `RecordShape`.
///
/// The concrete type is erased so one fetch mode enum can carry any caller
/// type. Use `downcast` to get it back.
pub struct Record {
    type_name: &'static str,
    inner: Box<dyn Any + Send>,
}

impl Record {
    pub(crate) fn new<T: Any + Send>(value: T) -> Self {
        Record {
            type_name: std::any::type_name::<T>(),
            inner: Box::new(value),
        }
    }

    /// Name of the concrete type the record was built as.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Recovers the concrete record, or hands the record back on a type mismatch.
    pub fn downcast<T: Any>(self) -> std::result::Result<T, Record> {
        let type_name = self.type_name;
        match self.inner.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(inner) => Err(Record { type_name, inner }),
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record").field("type_name", &self.type_name).finish_non_exhaustive()
    }
}

/// One unit produced by a fetch, shaped by the fetch mode.
#[derive(Debug)]
pub enum Fetched {
    /// Associative row (column name → value)
    Row(Row),
    /// Positional row, values in select order
    Values(Vec<Value>),
    /// Caller-defined record
    Record(Record),
    /// A single column value or the result of a row function
    Scalar(Value),
}

impl Fetched {
    pub fn as_row(&self) -> Option<&Row> {
        match self {
            Fetched::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn into_row(self) -> Option<Row> {
        match self {
            Fetched::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Fetched::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_values(self) -> Option<Vec<Value>> {
        match self {
            Fetched::Values(values) => Some(values),
            Fetched::Row(row) => Some(row.into_values()),
            _ => None,
        }
    }

    /// Unwraps a record of type `T`. Any other shape or type is a configuration error.
    pub fn into_record<T: Any>(self) -> Result<T> {
        match self {
            Fetched::Record(record) => record.downcast::<T>().map_err(|record| {
                ShelfError::Config(format!(
                    "record is a [{}], not a [{}]",
                    record.type_name(),
                    std::any::type_name::<T>()
                ))
            }),
            other => Err(ShelfError::Config(format!(
                "expected a record but fetched {}",
                other.shape_name()
            ))),
        }
    }

    fn shape_name(&self) -> &'static str {
        match self {
            Fetched::Row(_) => "an associative row",
            Fetched::Values(_) => "a positional row",
            Fetched::Record(_) => "a record",
            Fetched::Scalar(_) => "a scalar",
        }
    }

    /// JSON rendering used by the command-line front end.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Fetched::Row(row) => serde_json::Value::Object(
                row.iter()
                    .map(|(column, value)| (column.to_string(), value_to_json(value)))
                    .collect(),
            ),
            Fetched::Values(values) => serde_json::Value::Array(values.iter().map(value_to_json).collect()),
            Fetched::Record(record) => serde_json::json!({ "record": record.type_name() }),
            Fetched::Scalar(value) => value_to_json(value),
        }
    }
}

/// Formats a SQLite value as JSON. Blobs are summarized, not encoded.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Real(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(t) => serde_json::Value::String(t.clone()),
        Value::Blob(b) => serde_json::Value::String(format!("<BLOB: {} bytes>", b.len())),
    }
}
