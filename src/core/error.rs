/// sqlshelf Error Module
///
/// This module defines the error types shared by the registry, the references
/// and the query facade. Every failure that used to terminate a request is
/// reported here as a value, so the top-level caller decides what to do.
use thiserror::Error;

/// Comprehensive error type for sqlshelf.
///
/// The first group mirrors the registry life cycle:
/// - registration (duplicate names)
/// - resolution (unknown names, broken bootstrap records)
/// - materialization (openers that fail to produce a connection)
///
/// The second group covers query execution and ambient concerns.
#[derive(Error, Debug)]
pub enum ShelfError {
    /// A reference with this name is already registered. Recoverable.
    #[error("Duplicate registration: a reference with the name [{name}] already exists")]
    DuplicateRegistration { name: String },

    /// Resolution of a name that was never registered
    #[error("Unknown reference: no reference to [{name}] found in the registry")]
    UnknownReference { name: String },

    /// A bootstrap record is missing a required field or has an unknown type
    #[error("Malformed descriptor at index [{index}]: {reason}")]
    MalformedDescriptor { index: usize, reason: String },

    /// The opener could not produce a connection handle
    #[error("Connection open failed for [{name}]: {reason}")]
    ConnectionOpen { name: String, reason: String },

    /// Prepare, bind or execute failed inside a facade operation
    #[error("Query execution failed while {context}: {source}")]
    QueryExecution {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    /// The fetch mode needs a record shape, column index or function
    #[error("Missing shaping argument: fetch type [{fetch_type}] requires a fetch argument")]
    MissingShapingArgument { fetch_type: String },

    /// The connection is held by another operation or an open row stream
    #[error("Connection busy: [{db_name}] is in use by another operation")]
    ConnectionBusy { db_name: String },

    /// The facade was closed during shutdown
    #[error("Connection closed: [{db_name}] has been shut down")]
    ConnectionClosed { db_name: String },

    /// A cancel token fired while a statement or stream was running
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Database-related errors from SQLite operations outside a facade call
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<toml::de::Error> for ShelfError {
    fn from(err: toml::de::Error) -> Self {
        ShelfError::Config(err.to_string())
    }
}

impl ShelfError {
    /// Wraps a driver error with a description of the step that failed.
    pub fn query(context: impl Into<String>, source: rusqlite::Error) -> Self {
        ShelfError::QueryExecution {
            context: context.into(),
            source,
        }
    }

    /// True for the variants a caller may log and carry on from.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ShelfError::DuplicateRegistration { .. })
    }
}

/// Type alias for Result to use ShelfError as the error type.
pub type Result<T> = std::result::Result<T, ShelfError>;
