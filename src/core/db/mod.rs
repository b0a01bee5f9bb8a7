/// Database Module
///
/// This module provides the database layer of sqlshelf, organized into
/// focused submodules.
///
/// ## Architecture
///
/// - **Connection Opening** (`connection.rs`): the `ConnectionOpener` trait, the
///   literal and handle openers and the pluggable `Driver`
/// - **External Sources** (`source.rs`): providers that yield named bindings
/// - **Query Facade** (`query.rs`): execute and fetch operations over one connection
/// - **Fetch Shaping** (`fetch.rs`): fetch modes, cursor positions, options
/// - **Rows** (`row.rs`): fetched row and value types
/// - **Streaming** (`stream.rs`): pull-based, one-row-at-a-time fetching
///
/// ## Error Handling
///
/// All operations use the standardized `ShelfError` type.
pub mod connection;
pub mod fetch;
pub mod query;
pub mod row;
pub mod source;
pub mod stream;

pub use connection::*;
pub use fetch::*;
pub use query::*;
pub use row::*;
pub use source::*;
pub use stream::*;
