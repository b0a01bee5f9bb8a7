/// Bootstrap Module
///
/// Bootstrap records and their one-time expansion into registrations.
///
/// A bootstrap list is an ordered sequence of mapping-like records:
///
/// ```toml
/// [[reference]]
/// type = "literal"
/// name = "main"
/// dbName = "app"
/// dsn = "sqlite:/var/lib/app/app.db"
/// options = { busy_timeout_ms = "500" }
///
/// [[reference]]
/// type = "external-source"
/// name = "reports"
/// dbName = "reports"
/// locator = "/etc/app/connections.toml"
/// slot = "reporting"
/// ```
///
/// Expansion is fail-fast: the first record with a missing key or an unknown
/// type stops it, and later records are never looked at.

use crate::core::db::{
    ConnectionOpener, DriverOptions, ExternalSourceOpener, HandleOpener, LiteralOpener,
    LiteralSource, ReferenceKind,
};
use crate::registry::Registry;
use rusqlite::Connection;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, error, info};

/// One value in a bootstrap record.
pub enum Field {
    Text(String),
    Options(DriverOptions),
    Handle(Connection),
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Field::Options(options) => f.debug_tuple("Options").field(options).finish(),
            Field::Handle(_) => f.write_str("Handle(..)"),
        }
    }
}

/// A mapping-like bootstrap record.
#[derive(Debug, Default)]
pub struct BootstrapRecord {
    fields: HashMap<String, Field>,
}

/// Deferred producer of the bootstrap list; called at most once.
pub type BootstrapList = Box<dyn FnOnce() -> Vec<BootstrapRecord> + Send>;

/// Where and why bootstrap expansion stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapFailure {
    pub index: usize,
    pub reason: String,
}

impl BootstrapRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), Field::Text(value.into()));
        self
    }

    pub fn options(mut self, key: impl Into<String>, options: DriverOptions) -> Self {
        self.fields.insert(key.into(), Field::Options(options));
        self
    }

    pub fn handle(mut self, key: impl Into<String>, connection: Connection) -> Self {
        self.fields.insert(key.into(), Field::Handle(connection));
        self
    }

    pub fn literal(name: &str, db_name: &str, dsn: &str) -> Self {
        Self::new()
            .text("type", "literal")
            .text("name", name)
            .text("dbName", db_name)
            .text("dsn", dsn)
    }

    pub fn handle_reference(name: &str, db_name: &str, connection: Connection) -> Self {
        Self::new()
            .text("type", "handle")
            .text("name", name)
            .text("dbName", db_name)
            .handle("db", connection)
    }

    pub fn external_source(name: &str, db_name: &str, locator: &str, slot: &str) -> Self {
        Self::new()
            .text("type", "external-source")
            .text("name", name)
            .text("dbName", db_name)
            .text("locator", locator)
            .text("slot", slot)
    }

    /// Reads a record from a TOML table. Nested tables become option sets and
    /// other scalars are kept as their text form.
    pub fn from_toml(table: &toml::value::Table) -> Self {
        let mut record = Self::new();
        for (key, value) in table {
            let field = match value {
                toml::Value::String(text) => Field::Text(text.clone()),
                toml::Value::Table(options) => Field::Options(
                    options
                        .iter()
                        .map(|(k, v)| {
                            let text = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                            (k.clone(), text)
                        })
                        .collect(),
                ),
                other => Field::Text(other.to_string()),
            };
            record.fields.insert(key.clone(), field);
        }
        record
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    fn require_text(&self, key: &str) -> Result<String, String> {
        match self.fields.get(key) {
            Some(Field::Text(text)) => Ok(text.clone()),
            Some(other) => Err(format!("key [{}] must be text, found {:?}", key, other)),
            None => Err(format!("record does not have key [{}]", key)),
        }
    }

    /// First present key among `keys`, which are aliases for one field.
    fn require_text_any(&self, keys: &[&str]) -> Result<String, String> {
        for key in keys {
            if self.fields.contains_key(*key) {
                return self.require_text(key);
            }
        }
        Err(format!("record does not have key [{}]", keys[0]))
    }

    fn optional_text(&self, key: &str) -> String {
        match self.fields.get(key) {
            Some(Field::Text(text)) => text.clone(),
            _ => String::new(),
        }
    }

    fn take_handle(&mut self, key: &str) -> Result<Connection, String> {
        match self.fields.remove(key) {
            Some(Field::Handle(connection)) => Ok(connection),
            Some(other) => Err(format!("key [{}] must be a connection handle, found {:?}", key, other)),
            None => Err(format!("record does not have key [{}]", key)),
        }
    }
}

/// A validated record, ready to register.
struct Entry {
    name: String,
    db_name: String,
    opener: Box<dyn ConnectionOpener>,
}

fn build_entry(registry: &Registry, mut record: BootstrapRecord) -> Result<Entry, String> {
    let tag = record.require_text("type")?;
    let name = record.require_text("name")?;
    let db_name = record.require_text("dbName")?;

    let kind = ReferenceKind::from_tag(&tag)
        .ok_or_else(|| format!("Cannot create reference with type [{}]", tag))?;

    let opener: Box<dyn ConnectionOpener> = match kind {
        ReferenceKind::Literal => {
            let dsn = record.require_text("dsn")?;
            let options = match record.fields.get("options") {
                Some(Field::Options(options)) => options.clone(),
                _ => DriverOptions::new(),
            };
            let source = LiteralSource::new(dsn)
                .credentials(record.optional_text("username"), record.optional_text("password"))
                .options(options);
            Box::new(LiteralOpener::new(source, registry.driver()))
        }
        ReferenceKind::Handle => Box::new(HandleOpener::new(record.take_handle("db")?)),
        ReferenceKind::ExternalSource => {
            let locator = record.require_text_any(&["locator", "filePath"])?;
            let slot = record.require_text_any(&["slot", "pdoVariable"])?;
            Box::new(ExternalSourceOpener::new(
                locator,
                slot,
                registry.sources(),
                registry.driver(),
            ))
        }
    };

    Ok(Entry {
        name,
        db_name,
        opener,
    })
}

/// Registers every record in order, stopping at the first malformed one.
///
/// Records before the failing index stay registered. Duplicate names are
/// logged by the registry and skipped.
pub fn expand(registry: &Registry, records: Vec<BootstrapRecord>) -> Result<usize, BootstrapFailure> {
    info!("Expanding {} bootstrap records", records.len());
    let mut registered = 0;

    for (index, record) in records.into_iter().enumerate() {
        let entry = build_entry(registry, record).map_err(|reason| {
            error!("Bootstrap record [{}] is malformed: {}", index, reason);
            BootstrapFailure { index, reason }
        })?;

        debug!("Bootstrap record [{}] names reference [{}]", index, entry.name);
        if registry.register(&entry.name, &entry.db_name, entry.opener).is_ok() {
            registered += 1;
        }
    }

    info!("Bootstrap registered {} references", registered);
    Ok(registered)
}
