/// External Source Module
///
/// An external source is evaluated once and yields a set of named bindings;
/// an external-source reference picks one binding out by slot name and
/// requires it to be a `rusqlite::Connection`.
///
/// Sources are looked up by locator in a `SourceCatalog`. Callers register
/// providers (any `Fn() -> Result<Bindings>`) under a locator; a locator with
/// no provider that points at a `.toml` file is read as a connection file.

use crate::core::db::connection::{
    ConnectionOpener, Driver, DriverOptions, LiteralSource, ReferenceKind,
};
use crate::core::{Result, ShelfError};
use rusqlite::Connection;
use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Named values produced by evaluating a source.
pub type Bindings = HashMap<String, Box<dyn Any + Send>>;

/// Something that, when evaluated, produces named bindings.
pub trait ConnectionSource: Send + Sync {
    fn evaluate(&self) -> Result<Bindings>;
}

impl<F> ConnectionSource for F
where
    F: Fn() -> Result<Bindings> + Send + Sync,
{
    fn evaluate(&self) -> Result<Bindings> {
        self()
    }
}

/// A TOML connection file.
///
/// Every top-level table with a `dsn` key becomes a connection binding under
/// the table's name (`username`, `password` and an `options` table are
/// honoured like a literal reference). Any other top-level value becomes a
/// plain binding holding the `toml::Value`.
///
/// ```toml
/// [reporting]
/// dsn = "sqlite:/var/lib/app/reports.db"
/// options = { foreign_keys = "ON" }
///
/// label = "not a connection"
/// ```
pub struct TomlFileSource {
    path: PathBuf,
    driver: Arc<dyn Driver>,
}

impl TomlFileSource {
    pub fn new(path: impl Into<PathBuf>, driver: Arc<dyn Driver>) -> Self {
        TomlFileSource {
            path: path.into(),
            driver,
        }
    }

    fn literal_from_table(table: &toml::value::Table) -> Option<LiteralSource> {
        let dsn = table.get("dsn")?.as_str()?;
        let text = |key: &str| {
            table
                .get(key)
                .and_then(toml::Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let options: DriverOptions = table
            .get("options")
            .and_then(toml::Value::as_table)
            .map(|options| {
                options
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Some(
            LiteralSource::new(dsn)
                .credentials(text("username"), text("password"))
                .options(options),
        )
    }
}

impl ConnectionSource for TomlFileSource {
    fn evaluate(&self) -> Result<Bindings> {
        debug!("Evaluating connection file {:?}", self.path);
        let content = fs::read_to_string(&self.path)?;
        let document: toml::value::Table = toml::from_str(&content)?;

        let mut bindings = Bindings::new();
        for (name, value) in document {
            let literal = value.as_table().and_then(Self::literal_from_table);
            match literal {
                Some(literal) => {
                    let conn = self.driver.connect(&literal.request())?;
                    bindings.insert(name, Box::new(conn));
                }
                None => {
                    bindings.insert(name, Box::new(value));
                }
            }
        }
        Ok(bindings)
    }
}

/// Locator → provider lookup shared by all external-source references of a registry.
#[derive(Default)]
pub struct SourceCatalog {
    providers: RwLock<HashMap<String, Arc<dyn ConnectionSource>>>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider. Returns false, keeping the existing one, if the
    /// locator is taken.
    pub fn register<S>(&self, locator: impl Into<String>, source: S) -> bool
    where
        S: ConnectionSource + 'static,
    {
        let locator = locator.into();
        let mut providers = self.providers.write().unwrap_or_else(|p| p.into_inner());
        if providers.contains_key(&locator) {
            warn!("A source for locator [{}] already exists! Skipping...", locator);
            return false;
        }
        providers.insert(locator, Arc::new(source));
        true
    }

    pub fn contains(&self, locator: &str) -> bool {
        self.providers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(locator)
    }

    /// Finds the provider for a locator, falling back to a TOML connection file.
    pub fn lookup(&self, locator: &str, driver: &Arc<dyn Driver>) -> Result<Arc<dyn ConnectionSource>> {
        if let Some(source) = self
            .providers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(locator)
        {
            return Ok(source.clone());
        }

        let path = Path::new(locator);
        if path.extension().map_or(false, |ext| ext == "toml") {
            return Ok(Arc::new(TomlFileSource::new(path, driver.clone())));
        }

        Err(ShelfError::Config(format!(
            "no source is registered for locator [{}]",
            locator
        )))
    }
}

/// Opens an external-source reference: evaluate, then extract one slot.
pub struct ExternalSourceOpener {
    locator: String,
    slot: String,
    catalog: Arc<SourceCatalog>,
    driver: Arc<dyn Driver>,
}

impl ExternalSourceOpener {
    pub fn new(
        locator: impl Into<String>,
        slot: impl Into<String>,
        catalog: Arc<SourceCatalog>,
        driver: Arc<dyn Driver>,
    ) -> Self {
        ExternalSourceOpener {
            locator: locator.into(),
            slot: slot.into(),
            catalog,
            driver,
        }
    }
}

impl ConnectionOpener for ExternalSourceOpener {
    fn kind(&self) -> ReferenceKind {
        ReferenceKind::ExternalSource
    }

    fn open(&self) -> Result<Connection> {
        let source = self.catalog.lookup(&self.locator, &self.driver)?;
        let mut bindings = source.evaluate()?;

        let binding = bindings.remove(&self.slot).ok_or_else(|| {
            ShelfError::Config(format!(
                "no binding with name [{}] was found in [{}]",
                self.slot, self.locator
            ))
        })?;

        binding.downcast::<Connection>().map(|conn| *conn).map_err(|_| {
            ShelfError::Config(format!(
                "binding with name [{}] is not a connection handle",
                self.slot
            ))
        })
    }
}
