/// # Test Utilities Module
///
/// Shared testing infrastructure for sqlshelf.
///
/// This module provides:
/// - Isolated SQLite fixtures with a sample schema
/// - An instrumented `ConnectionOpener` that counts open attempts
/// - ShelfError-specific assertion helpers

use crate::core::db::{ConnectionOpener, ReferenceKind};
use crate::core::{Result, ShelfError};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Sample schema used by fixtures. Some text holds markup so sanitization is
/// observable.
pub const SAMPLE_SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        bio TEXT,
        avatar BLOB
    );

    CREATE TABLE posts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
    );

    INSERT INTO users (username, bio, avatar) VALUES ('alice', 'Likes <b>bold</b> text', x'00FF');
    INSERT INTO users (username, bio, avatar) VALUES ('bob', 'Tom & Jerry fan', NULL);
    INSERT INTO users (username, bio, avatar) VALUES ('charlie', NULL, NULL);

    INSERT INTO posts (user_id, title) VALUES (1, 'Welcome to Rust');
    INSERT INTO posts (user_id, title) VALUES (2, 'Quotes \"and\" ''apostrophes''');
    INSERT INTO posts (user_id, title) VALUES (1, '<script>alert(1)</script>');
";

/// Isolated database test fixture
pub struct DatabaseFixture {
    pub name: String,
    pub connection: Connection,
}

impl DatabaseFixture {
    /// Create a new empty in-memory database
    pub fn new(name: &str) -> Result<Self> {
        let connection = Connection::open_in_memory()?;
        connection.execute_batch("PRAGMA journal_mode = MEMORY;")?;
        Ok(DatabaseFixture {
            name: name.to_string(),
            connection,
        })
    }

    /// Create fixture with the sample schema and data
    pub fn with_sample_data(name: &str) -> Result<Self> {
        let fixture = Self::new(name)?;
        fixture.connection.execute_batch(SAMPLE_SCHEMA)?;
        Ok(fixture)
    }

    pub fn into_connection(self) -> Connection {
        self.connection
    }
}

/// Writes the sample schema into a database file inside `dir`.
pub fn sample_database_file(dir: &std::path::Path, file_name: &str) -> Result<PathBuf> {
    let path = dir.join(file_name);
    let conn = Connection::open(&path)?;
    conn.execute_batch(SAMPLE_SCHEMA)?;
    Ok(path)
}

/// Shared view of how many times an opener ran.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Opener that hands out fresh sample databases and counts its calls.
#[derive(Default)]
pub struct CountingOpener {
    calls: CallCounter,
    delay: Option<Duration>,
    fail_first: usize,
}

impl CountingOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first `attempts` opens with a simulated error.
    pub fn failing_first(attempts: usize) -> Self {
        CountingOpener {
            fail_first: attempts,
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl ConnectionOpener for CountingOpener {
    fn kind(&self) -> ReferenceKind {
        ReferenceKind::Handle
    }

    fn open(&self) -> Result<Connection> {
        let attempt = self.calls.bump();
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if attempt <= self.fail_first {
            return Err(ShelfError::Config("simulated open failure".to_string()));
        }
        Ok(DatabaseFixture::with_sample_data("counting")?.into_connection())
    }
}

/// Error testing utilities specific to ShelfError patterns
pub mod error_testing {
    /// Test that an error message mentions a fragment (case-insensitive)
    pub fn assert_error_mentions<T, E>(
        result: &std::result::Result<T, E>,
        expected_message_fragment: &str,
        context: &str,
    ) where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => panic!("Expected ShelfError but got Ok in {}", context),
            Err(e) => {
                let error_str = e.to_string();
                assert!(
                    error_str.to_lowercase().contains(&expected_message_fragment.to_lowercase()),
                    "Expected '{}' in error message '{}' context: {}",
                    expected_message_fragment,
                    error_str,
                    context
                );
            }
        }
    }
}

#[macro_export]
macro_rules! assert_shelf_error {
    ($result:expr, $expected:pat, $context:expr) => {
        match $result {
            Err($expected) => {}
            Ok(_) => panic!("Expected {} but got Ok in {}", stringify!($expected), $context),
            Err(other) => panic!("Expected {} but got {:?} in {}", stringify!($expected), other, $context),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_data_fixture() {
        let fixture = DatabaseFixture::with_sample_data("test_sample").unwrap();
        assert_eq!(fixture.name, "test_sample");

        let count: i64 = fixture
            .connection
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_counting_opener() {
        let opener = CountingOpener::failing_first(1);
        let calls = opener.calls();

        error_testing::assert_error_mentions(&opener.open(), "simulated", "first open");
        assert!(opener.open().is_ok());
        assert_eq!(calls.get(), 2);
    }
}
