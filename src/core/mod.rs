/// Core Module for sqlshelf
///
/// This module contains the building blocks the registry is assembled from:
/// the error type and the database layer (openers, the query facade, fetch
/// shaping and row streaming).

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{Result, ShelfError};
