/// Connection Opening Module
///
/// This module defines how a reference turns its descriptor into a live
/// `rusqlite::Connection`. Each descriptor kind is a `ConnectionOpener`:
///
/// - **literal**: a DSN with optional credentials and driver options, opened
///   through a pluggable `Driver`
/// - **handle**: a connection the caller already opened
/// - **external-source**: a named binding produced by a `ConnectionSource`
///   (see `source.rs`)

use crate::core::{Result, ShelfError};
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Opaque key → value options handed to the driver when a connection opens.
pub type DriverOptions = BTreeMap<String, String>;

/// Descriptor kind of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Literal,
    Handle,
    ExternalSource,
}

impl ReferenceKind {
    /// Parses a descriptor type tag. The short legacy tags are accepted too.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "literal" | "string" => Some(ReferenceKind::Literal),
            "handle" | "pdo" => Some(ReferenceKind::Handle),
            "external-source" | "file" => Some(ReferenceKind::ExternalSource),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceKind::Literal => "literal",
            ReferenceKind::Handle => "handle",
            ReferenceKind::ExternalSource => "external-source",
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces the live connection for one reference.
///
/// `open` is called by the owning reference only while it is unmaterialized,
/// and never again once a connection has been produced.
pub trait ConnectionOpener: Send + Sync {
    fn kind(&self) -> ReferenceKind;

    fn open(&self) -> Result<Connection>;
}

/// What a driver is asked to connect with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectRequest<'a> {
    /// Credentials were absent or incomplete: the DSN alone is used
    DsnOnly { dsn: &'a str },
    /// Both username and password were given
    WithCredentials {
        dsn: &'a str,
        username: &'a str,
        password: &'a str,
        options: Option<&'a DriverOptions>,
    },
}

impl ConnectRequest<'_> {
    pub fn dsn(&self) -> &str {
        match self {
            ConnectRequest::DsnOnly { dsn } => dsn,
            ConnectRequest::WithCredentials { dsn, .. } => dsn,
        }
    }
}

/// Turns a connect request into a connection.
pub trait Driver: Send + Sync {
    fn connect(&self, request: &ConnectRequest<'_>) -> Result<Connection>;
}

/// The SQLite driver.
///
/// DSNs are a file path, `:memory:`, or either of those behind a `sqlite:`
/// prefix. SQLite has no user accounts, so credentials are accepted and
/// ignored. Recognized options: `mode` (`ro`, `rw`, `rwc`, `memory`) and
/// `busy_timeout_ms`; every other key is applied as a pragma.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    fn open_flags(mode: &str) -> Result<OpenFlags> {
        let base = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        match mode {
            "ro" => Ok(base | OpenFlags::SQLITE_OPEN_READ_ONLY),
            "rw" => Ok(base | OpenFlags::SQLITE_OPEN_READ_WRITE),
            "rwc" => Ok(base | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE),
            other => Err(ShelfError::Config(format!("unknown sqlite open mode [{}]", other))),
        }
    }

    fn apply_options(conn: &Connection, options: &DriverOptions) -> Result<()> {
        for (key, value) in options {
            match key.as_str() {
                "mode" => {}
                "busy_timeout_ms" => {
                    let millis: u64 = value.parse().map_err(|_| {
                        ShelfError::Config(format!("busy_timeout_ms must be an integer, got [{}]", value))
                    })?;
                    conn.busy_timeout(Duration::from_millis(millis))?;
                }
                pragma => conn.pragma_update(None, pragma, value)?,
            }
        }
        Ok(())
    }
}

impl Driver for SqliteDriver {
    fn connect(&self, request: &ConnectRequest<'_>) -> Result<Connection> {
        let path = request.dsn().strip_prefix("sqlite:").unwrap_or(request.dsn());
        let options = match request {
            ConnectRequest::DsnOnly { .. } => None,
            ConnectRequest::WithCredentials { username, options, .. } => {
                debug!("SQLite ignores credentials for user [{}]", username);
                *options
            }
        };
        let mode = options.and_then(|o| o.get("mode")).map(String::as_str);

        let conn = match mode {
            _ if path.is_empty() || path == ":memory:" => Connection::open_in_memory()?,
            Some("memory") => Connection::open_in_memory()?,
            Some(mode) => Connection::open_with_flags(path, Self::open_flags(mode)?)?,
            None => Connection::open(path)?,
        };

        if let Some(options) = options {
            Self::apply_options(&conn, options)?;
        }
        Ok(conn)
    }
}

/// Descriptor of a literal reference.
#[derive(Clone, Default, PartialEq)]
pub struct LiteralSource {
    pub dsn: String,
    pub username: String,
    pub password: String,
    pub options: DriverOptions,
}

impl LiteralSource {
    pub fn new(dsn: impl Into<String>) -> Self {
        LiteralSource {
            dsn: dsn.into(),
            ..LiteralSource::default()
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn options(mut self, options: DriverOptions) -> Self {
        self.options = options;
        self
    }

    /// Credentials are only passed when both parts are present, and options
    /// only alongside credentials.
    pub fn request(&self) -> ConnectRequest<'_> {
        if !self.username.is_empty() && !self.password.is_empty() {
            ConnectRequest::WithCredentials {
                dsn: &self.dsn,
                username: &self.username,
                password: &self.password,
                options: (!self.options.is_empty()).then_some(&self.options),
            }
        } else {
            ConnectRequest::DsnOnly { dsn: &self.dsn }
        }
    }
}

impl fmt::Debug for LiteralSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiteralSource")
            .field("dsn", &self.dsn)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("options", &self.options)
            .finish()
    }
}

/// Opens a literal reference through a driver.
pub struct LiteralOpener {
    source: LiteralSource,
    driver: std::sync::Arc<dyn Driver>,
}

impl LiteralOpener {
    pub fn new(source: LiteralSource, driver: std::sync::Arc<dyn Driver>) -> Self {
        LiteralOpener { source, driver }
    }
}

impl ConnectionOpener for LiteralOpener {
    fn kind(&self) -> ReferenceKind {
        ReferenceKind::Literal
    }

    fn open(&self) -> Result<Connection> {
        debug!("Opening literal connection to [{}]", self.source.dsn);
        self.driver.connect(&self.source.request())
    }
}

/// Hands over a connection the caller opened. It can be taken once.
pub struct HandleOpener {
    handle: Mutex<Option<Connection>>,
}

impl HandleOpener {
    pub fn new(connection: Connection) -> Self {
        HandleOpener {
            handle: Mutex::new(Some(connection)),
        }
    }
}

impl ConnectionOpener for HandleOpener {
    fn kind(&self) -> ReferenceKind {
        ReferenceKind::Handle
    }

    fn open(&self) -> Result<Connection> {
        let mut guard = self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .take()
            .ok_or_else(|| ShelfError::Config("connection handle was already handed out".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records each request instead of connecting to anything real.
    #[derive(Default)]
    struct RecordingDriver {
        requests: Mutex<Vec<String>>,
    }

    impl Driver for RecordingDriver {
        fn connect(&self, request: &ConnectRequest<'_>) -> Result<Connection> {
            let description = match request {
                ConnectRequest::DsnOnly { dsn } => format!("dsn-only {}", dsn),
                ConnectRequest::WithCredentials { dsn, username, options, .. } => format!(
                    "credentials {} {} options={}",
                    dsn,
                    username,
                    options.map(|o| o.len()).unwrap_or(0)
                ),
            };
            self.requests.lock().unwrap().push(description);
            Ok(Connection::open_in_memory()?)
        }
    }

    #[test]
    fn test_literal_request_branches() {
        let driver = Arc::new(RecordingDriver::default());

        let sources = vec![
            LiteralSource::new("a.db"),
            LiteralSource::new("b.db").credentials("user", ""),
            LiteralSource::new("c.db").credentials("user", "secret"),
            LiteralSource::new("d.db")
                .credentials("user", "secret")
                .option("foreign_keys", "ON"),
            LiteralSource::new("e.db").option("foreign_keys", "ON"),
        ];
        for source in sources {
            LiteralOpener::new(source, driver.clone()).open().unwrap();
        }

        let requests = driver.requests.lock().unwrap();
        assert_eq!(
            *requests,
            vec![
                "dsn-only a.db",
                "dsn-only b.db",
                "credentials c.db user options=0",
                "credentials d.db user options=1",
                "dsn-only e.db",
            ]
        );
    }

    #[test]
    fn test_sqlite_driver_memory_and_pragmas() {
        let source = LiteralSource::new("sqlite::memory:")
            .credentials("ignored", "ignored")
            .option("foreign_keys", "ON")
            .option("busy_timeout_ms", "250");
        let conn = SqliteDriver.connect(&source.request()).unwrap();

        let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0)).unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_sqlite_driver_rejects_bad_path() {
        let source = LiteralSource::new("/nonexistent/path/database.db");
        let result = SqliteDriver.connect(&source.request());

        match result {
            Err(ShelfError::Database(_)) => {}
            other => panic!("Expected Database error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_sqlite_driver_rejects_unknown_mode() {
        let source = LiteralSource::new("x.db")
            .credentials("u", "p")
            .option("mode", "sideways");
        assert!(matches!(
            SqliteDriver.connect(&source.request()),
            Err(ShelfError::Config(_))
        ));
    }

    #[test]
    fn test_handle_opener_hands_out_once() {
        let opener = HandleOpener::new(Connection::open_in_memory().unwrap());
        assert_eq!(opener.kind(), ReferenceKind::Handle);
        assert!(opener.open().is_ok());
        assert!(opener.open().is_err());
    }

    #[test]
    fn test_reference_kind_tags() {
        assert_eq!(ReferenceKind::from_tag("string"), Some(ReferenceKind::Literal));
        assert_eq!(ReferenceKind::from_tag("pdo"), Some(ReferenceKind::Handle));
        assert_eq!(ReferenceKind::from_tag("file"), Some(ReferenceKind::ExternalSource));
        assert_eq!(ReferenceKind::from_tag("external-source"), Some(ReferenceKind::ExternalSource));
        assert_eq!(ReferenceKind::from_tag("ftp"), None);
    }

    #[test]
    fn test_literal_debug_hides_password() {
        let source = LiteralSource::new("a.db").credentials("u", "hunter2");
        assert!(!format!("{:?}", source).contains("hunter2"));
    }
}
