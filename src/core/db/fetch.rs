/// Fetch Shaping Module
///
/// Fetch options decide how each result row is shaped (associative row,
/// positional row, typed record, single column, row function), where a
/// single-row fetch positions the cursor, and whether text values are
/// sanitized. Options are validated when they are built: a fetch type that
/// needs a shaping argument cannot be constructed without one.

use crate::core::db::row::{Record, Row};
use crate::core::{Result, ShelfError};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Fetch type tag, the untyped half of a `FetchMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchType {
    /// Column name → value map
    #[default]
    Associative,
    /// Values in select order
    Positional,
    /// Caller-defined record type
    Record,
    /// One column per row
    Column,
    /// A function applied to the row's values
    Apply,
}

impl FetchType {
    /// Whether this fetch type needs a `FetchArgument`.
    pub fn requires_argument(self) -> bool {
        matches!(self, FetchType::Record | FetchType::Column | FetchType::Apply)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FetchType::Associative => "associative",
            FetchType::Positional => "positional",
            FetchType::Record => "record",
            FetchType::Column => "column",
            FetchType::Apply => "apply",
        }
    }
}

impl fmt::Display for FetchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type RecordFactory = Arc<dyn Fn(&[Value], &Row) -> Result<Record> + Send + Sync>;

/// Row function for `FetchType::Apply`. Receives the row's values positionally.
pub type RowFunction = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Describes how to build one record type from a row.
///
/// The factory receives the constructor arguments first and the row second,
/// so the same shape can be reused with different fixed arguments.
#[derive(Clone)]
pub struct RecordShape {
    type_name: &'static str,
    ctor_args: Vec<Value>,
    factory: RecordFactory,
}

impl RecordShape {
    pub fn new<T, F>(factory: F) -> Self
    where
        T: Any + Send,
        F: Fn(&[Value], &Row) -> Result<T> + Send + Sync + 'static,
    {
        RecordShape {
            type_name: std::any::type_name::<T>(),
            ctor_args: Vec::new(),
            factory: Arc::new(move |args: &[Value], row: &Row| factory(args, row).map(Record::new)),
        }
    }

    pub fn with_ctor_args(mut self, ctor_args: Vec<Value>) -> Self {
        self.ctor_args = ctor_args;
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn ctor_args(&self) -> &[Value] {
        &self.ctor_args
    }

    pub(crate) fn build(&self, row: &Row) -> Result<Record> {
        (self.factory)(&self.ctor_args, row)
    }
}

impl fmt::Debug for RecordShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordShape")
            .field("type_name", &self.type_name)
            .field("ctor_args", &self.ctor_args)
            .finish()
    }
}

/// The shaping data a fetch type may need.
#[derive(Clone)]
pub enum FetchArgument {
    Record(RecordShape),
    Column(usize),
    Apply(RowFunction),
}

impl FetchArgument {
    fn fetch_type(&self) -> FetchType {
        match self {
            FetchArgument::Record(_) => FetchType::Record,
            FetchArgument::Column(_) => FetchType::Column,
            FetchArgument::Apply(_) => FetchType::Apply,
        }
    }
}

impl fmt::Debug for FetchArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchArgument::Record(shape) => f.debug_tuple("Record").field(shape).finish(),
            FetchArgument::Column(index) => f.debug_tuple("Column").field(index).finish(),
            FetchArgument::Apply(_) => f.write_str("Apply(<fn>)"),
        }
    }
}

/// A validated fetch mode carrying exactly the data its shaping needs.
#[derive(Clone, Default)]
pub enum FetchMode {
    #[default]
    Associative,
    Positional,
    Record(RecordShape),
    Column(usize),
    Apply(RowFunction),
}

impl FetchMode {
    pub fn fetch_type(&self) -> FetchType {
        match self {
            FetchMode::Associative => FetchType::Associative,
            FetchMode::Positional => FetchType::Positional,
            FetchMode::Record(_) => FetchType::Record,
            FetchMode::Column(_) => FetchType::Column,
            FetchMode::Apply(_) => FetchType::Apply,
        }
    }

    /// Only whole rows go through the sanitizer.
    pub(crate) fn is_row_shaped(&self) -> bool {
        matches!(self, FetchMode::Associative | FetchMode::Positional)
    }
}

impl fmt::Debug for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchMode::Associative => f.write_str("Associative"),
            FetchMode::Positional => f.write_str("Positional"),
            FetchMode::Record(shape) => f.debug_tuple("Record").field(shape).finish(),
            FetchMode::Column(index) => f.debug_tuple("Column").field(index).finish(),
            FetchMode::Apply(_) => f.write_str("Apply(<fn>)"),
        }
    }
}

/// Where a single-row fetch reads from.
///
/// SQLite cursors are forward-only, so every position is reached by stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorPosition {
    #[default]
    Next,
    First,
    Last,
    /// Zero-based row index
    Absolute(usize),
    /// Rows to move forward from the current position. A fresh cursor sits
    /// before the first row, so `Relative(1)` is the first row.
    Relative(usize),
}

/// Typed per-statement preparation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrepareOptions {
    /// Use the connection's prepared statement cache
    pub cached: bool,
}

impl PrepareOptions {
    pub fn cached() -> Self {
        PrepareOptions { cached: true }
    }
}

/// Options for the fetch family of facade operations.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub(crate) prepare: PrepareOptions,
    pub(crate) mode: FetchMode,
    pub(crate) cursor: CursorPosition,
    pub(crate) sanitize: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            prepare: PrepareOptions::default(),
            mode: FetchMode::Associative,
            cursor: CursorPosition::Next,
            sanitize: true,
        }
    }
}

impl FetchOptions {
    pub fn builder() -> FetchOptionsBuilder {
        FetchOptionsBuilder::default()
    }

    /// Default options with sanitization switched off.
    pub fn unsanitized() -> Self {
        FetchOptions {
            sanitize: false,
            ..FetchOptions::default()
        }
    }

    pub fn positional() -> Self {
        FetchOptions {
            mode: FetchMode::Positional,
            ..FetchOptions::default()
        }
    }

    pub fn column(index: usize) -> Self {
        FetchOptions {
            mode: FetchMode::Column(index),
            ..FetchOptions::default()
        }
    }

    pub fn record(shape: RecordShape) -> Self {
        FetchOptions {
            mode: FetchMode::Record(shape),
            ..FetchOptions::default()
        }
    }

    pub fn apply<F>(function: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        FetchOptions {
            mode: FetchMode::Apply(Arc::new(function)),
            ..FetchOptions::default()
        }
    }

    pub fn mode(&self) -> &FetchMode {
        &self.mode
    }

    pub fn cursor(&self) -> CursorPosition {
        self.cursor
    }

    pub fn sanitize(&self) -> bool {
        self.sanitize
    }

    pub fn prepare_options(&self) -> PrepareOptions {
        self.prepare
    }
}

/// Builder that checks the fetch type against its shaping argument.
#[derive(Debug, Clone)]
pub struct FetchOptionsBuilder {
    fetch_type: FetchType,
    argument: Option<FetchArgument>,
    prepare: PrepareOptions,
    cursor: CursorPosition,
    sanitize: bool,
}

impl Default for FetchOptionsBuilder {
    fn default() -> Self {
        FetchOptionsBuilder {
            fetch_type: FetchType::Associative,
            argument: None,
            prepare: PrepareOptions::default(),
            cursor: CursorPosition::Next,
            sanitize: true,
        }
    }
}

impl FetchOptionsBuilder {
    pub fn fetch_type(mut self, fetch_type: FetchType) -> Self {
        self.fetch_type = fetch_type;
        self
    }

    pub fn fetch_argument(mut self, argument: FetchArgument) -> Self {
        self.argument = Some(argument);
        self
    }

    /// Shorthand for `fetch_type(Record)` plus its shape.
    pub fn record(self, shape: RecordShape) -> Self {
        self.fetch_type(FetchType::Record)
            .fetch_argument(FetchArgument::Record(shape))
    }

    pub fn column(self, index: usize) -> Self {
        self.fetch_type(FetchType::Column)
            .fetch_argument(FetchArgument::Column(index))
    }

    pub fn cursor(mut self, cursor: CursorPosition) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn sanitize(mut self, sanitize: bool) -> Self {
        self.sanitize = sanitize;
        self
    }

    pub fn prepare(mut self, prepare: PrepareOptions) -> Self {
        self.prepare = prepare;
        self
    }

    /// Validates the combination and produces the options.
    ///
    /// # Errors
    ///
    /// `MissingShapingArgument` when a record, column or apply fetch has no
    /// argument, `Config` when the argument belongs to another fetch type.
    pub fn build(self) -> Result<FetchOptions> {
        let mode = match (self.fetch_type, self.argument) {
            (FetchType::Associative, _) => FetchMode::Associative,
            (FetchType::Positional, _) => FetchMode::Positional,
            (FetchType::Record, Some(FetchArgument::Record(shape))) => FetchMode::Record(shape),
            (FetchType::Column, Some(FetchArgument::Column(index))) => FetchMode::Column(index),
            (FetchType::Apply, Some(FetchArgument::Apply(function))) => FetchMode::Apply(function),
            (fetch_type, None) => {
                return Err(ShelfError::MissingShapingArgument {
                    fetch_type: fetch_type.to_string(),
                })
            }
            (fetch_type, Some(argument)) => {
                return Err(ShelfError::Config(format!(
                    "fetch type [{}] cannot use a [{}] fetch argument",
                    fetch_type,
                    argument.fetch_type()
                )))
            }
        };

        Ok(FetchOptions {
            prepare: self.prepare,
            mode,
            cursor: self.cursor,
            sanitize: self.sanitize,
        })
    }
}
