// Core infrastructure modules
pub mod core;

// Registry and references
pub mod bootstrap;
pub mod config;
pub mod reference;
pub mod registry;
pub mod sanitize;

pub use crate::core::db::{
    CancelToken, CursorPosition, FetchArgument, FetchMode, FetchOptions, FetchType, Fetched,
    LiteralSource, PrepareOptions, QueryFacade, QueryParams, RecordShape, Row, RowStream,
};
pub use crate::core::{Result, ShelfError};
pub use bootstrap::BootstrapRecord;
pub use reference::{Reference, ReferenceStatus};
pub use registry::Registry;

#[cfg(test)]
mod test_utils;
