/// Connection Registry Module
///
/// A `Registry` maps unique names to `Reference`s. Registration does no I/O;
/// resolving a name materializes its reference on first use and hands back
/// the shared `QueryFacade`.
///
/// A registry may carry a bootstrap list. It is expanded into registrations
/// the first time anything is resolved, exactly once per registry, and the
/// outcome is remembered: a malformed bootstrap list fails every `resolve`
/// with the same `MalformedDescriptor`.

use crate::bootstrap::{self, BootstrapFailure, BootstrapList, BootstrapRecord};
use crate::config::Config;
use crate::core::db::{
    ConnectionOpener, Driver, ExternalSourceOpener, HandleOpener, LiteralOpener, LiteralSource,
    QueryFacade, SourceCatalog, SqliteDriver,
};
use crate::core::{Result, ShelfError};
use crate::reference::{Reference, ReferenceStatus};
use crate::sanitize::{HtmlEscaper, SanitizeError, Sanitizer};
use once_cell::sync::OnceCell;
use rusqlite::Connection;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

pub struct Registry {
    references: RwLock<HashMap<String, Arc<Reference>>>,
    pending: Mutex<Option<BootstrapList>>,
    bootstrapped: OnceCell<std::result::Result<(), BootstrapFailure>>,
    driver: Arc<dyn Driver>,
    sources: Arc<SourceCatalog>,
    sanitizer: Arc<dyn Sanitizer>,
}

/// Builder for registries that need a non-default driver, sanitizer, source
/// catalog or bootstrap list.
pub struct RegistryBuilder {
    driver: Arc<dyn Driver>,
    sanitizer: Arc<dyn Sanitizer>,
    sources: Arc<SourceCatalog>,
    bootstrap: Option<BootstrapList>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        RegistryBuilder {
            driver: Arc::new(SqliteDriver),
            sanitizer: Arc::new(HtmlEscaper),
            sources: Arc::new(SourceCatalog::new()),
            bootstrap: None,
        }
    }
}

impl RegistryBuilder {
    pub fn driver<D: Driver + 'static>(mut self, driver: D) -> Self {
        self.driver = Arc::new(driver);
        self
    }

    pub fn sanitizer<S: Sanitizer + 'static>(mut self, sanitizer: S) -> Self {
        self.sanitizer = Arc::new(sanitizer);
        self
    }

    pub fn sources(mut self, sources: Arc<SourceCatalog>) -> Self {
        self.sources = sources;
        self
    }

    pub fn bootstrap<F>(mut self, list: F) -> Self
    where
        F: FnOnce() -> Vec<BootstrapRecord> + Send + 'static,
    {
        self.bootstrap = Some(Box::new(list));
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            references: RwLock::new(HashMap::new()),
            pending: Mutex::new(self.bootstrap),
            bootstrapped: OnceCell::new(),
            driver: self.driver,
            sources: self.sources,
            sanitizer: self.sanitizer,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        RegistryBuilder::default().build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// A registry whose bootstrap list is produced by `list` on first resolve.
    pub fn with_bootstrap<F>(list: F) -> Self
    where
        F: FnOnce() -> Vec<BootstrapRecord> + Send + 'static,
    {
        Self::builder().bootstrap(list).build()
    }

    /// Builds a registry from a loaded configuration file. The `[[reference]]`
    /// tables become the bootstrap list.
    pub fn from_config(config: Config) -> Self {
        let mut builder = Self::builder();
        if !config.html_escaping() {
            debug!("HTML escaping disabled by configuration");
            builder = builder.sanitizer(|raw: &str| Ok::<_, SanitizeError>(raw.to_string()));
        }
        let tables = config.references;
        builder
            .bootstrap(move || tables.iter().map(BootstrapRecord::from_toml).collect())
            .build()
    }

    pub(crate) fn driver(&self) -> Arc<dyn Driver> {
        self.driver.clone()
    }

    /// Catalog consulted by external-source references.
    pub fn sources(&self) -> Arc<SourceCatalog> {
        self.sources.clone()
    }

    /// Registers an unmaterialized reference.
    ///
    /// # Errors
    ///
    /// `DuplicateRegistration` when the name is taken. The existing reference
    /// is kept and the new opener is dropped unused.
    pub fn register(&self, name: &str, db_name: &str, opener: Box<dyn ConnectionOpener>) -> Result<()> {
        let mut references = self.references.write().unwrap_or_else(|p| p.into_inner());
        if references.contains_key(name) {
            warn!("A reference to [{}] already exists! Skipping...", name);
            return Err(ShelfError::DuplicateRegistration {
                name: name.to_string(),
            });
        }

        let kind = opener.kind();
        references.insert(
            name.to_string(),
            Arc::new(Reference::new(name, db_name, opener, self.sanitizer.clone())),
        );
        debug!("Registered {} reference [{}] for database [{}]", kind, name, db_name);
        Ok(())
    }

    pub fn add_literal_reference(&self, name: &str, db_name: &str, source: LiteralSource) -> Result<()> {
        self.register(name, db_name, Box::new(LiteralOpener::new(source, self.driver())))
    }

    pub fn add_handle_reference(&self, name: &str, db_name: &str, connection: Connection) -> Result<()> {
        self.register(name, db_name, Box::new(HandleOpener::new(connection)))
    }

    pub fn add_external_source_reference(
        &self,
        name: &str,
        db_name: &str,
        locator: &str,
        slot: &str,
    ) -> Result<()> {
        let opener = ExternalSourceOpener::new(locator, slot, self.sources(), self.driver());
        self.register(name, db_name, Box::new(opener))
    }

    /// A list closure that panics is recorded as a failure at record 0, so the
    /// broken bootstrap is reported on every later `resolve`.
    fn run_bootstrap(&self) -> std::result::Result<(), BootstrapFailure> {
        let list = self.pending.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(list) = list else {
            return Ok(());
        };
        match panic::catch_unwind(AssertUnwindSafe(list)) {
            Ok(records) => bootstrap::expand(self, records).map(|_| ()),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|m| m.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Bootstrap list could not be produced: {}", message);
                Err(BootstrapFailure {
                    index: 0,
                    reason: format!("bootstrap list could not be produced: {}", message),
                })
            }
        }
    }

    fn ensure_bootstrapped(&self) -> Result<()> {
        match self.bootstrapped.get_or_init(|| self.run_bootstrap()) {
            Ok(()) => Ok(()),
            Err(failure) => Err(ShelfError::MalformedDescriptor {
                index: failure.index,
                reason: failure.reason.clone(),
            }),
        }
    }

    /// Returns the facade registered under `name`, opening it on first use.
    ///
    /// # Errors
    ///
    /// - `MalformedDescriptor` when the bootstrap list is broken
    /// - `UnknownReference` when nothing is registered under `name`
    /// - `ConnectionOpen` when the reference cannot be materialized
    pub fn resolve(&self, name: &str) -> Result<Arc<QueryFacade>> {
        self.ensure_bootstrapped()?;

        let reference = self
            .references
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned();

        match reference {
            Some(reference) => reference.facade(),
            None => {
                error!("Could not find a reference to [{}]", name);
                Err(ShelfError::UnknownReference {
                    name: name.to_string(),
                })
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.references
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.references.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .references
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Status of every reference, sorted by name.
    pub fn describe(&self) -> Vec<ReferenceStatus> {
        let mut statuses: Vec<ReferenceStatus> = self
            .references
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|reference| reference.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Closes every materialized facade. Every reference is attempted; the
    /// first failure is returned.
    pub fn shutdown(&self) -> Result<()> {
        let references: Vec<Arc<Reference>> = self
            .references
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();

        let mut first_failure = None;
        let mut closed = 0;
        for reference in references.iter().filter(|r| r.is_materialized()) {
            match reference.close() {
                Ok(()) => closed += 1,
                Err(e) => {
                    error!("Failed to close [{}]: {}", reference.name(), e);
                    first_failure.get_or_insert(e);
                }
            }
        }

        info!("Registry shut down, closed {} connections", closed);
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("references", &self.names())
            .field("bootstrapped", &self.bootstrapped.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_shelf_error;
    use crate::core::db::{Bindings, FetchOptions, QueryParams};
    use crate::test_utils::CountingOpener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_duplicate_registration_keeps_original() {
        let registry = Registry::new();
        let first = CountingOpener::new();
        let first_calls = first.calls();
        let second = CountingOpener::new();
        let second_calls = second.calls();

        registry.register("main", "first", Box::new(first)).unwrap();
        let err = registry.register("main", "second", Box::new(second)).unwrap_err();
        assert!(err.is_recoverable());
        assert_shelf_error!(Err::<(), _>(err), ShelfError::DuplicateRegistration { .. }, "duplicate");

        let facade = registry.resolve("main").unwrap();
        assert_eq!(facade.db_name(), "first");
        assert_eq!(first_calls.get(), 1);
        assert_eq!(second_calls.get(), 0);
    }

    #[test]
    fn test_registration_does_no_io() {
        let registry = Registry::new();
        let opener = CountingOpener::new();
        let calls = opener.calls();
        registry.register("main", "main", Box::new(opener)).unwrap();
        assert_eq!(calls.get(), 0);
        assert!(!registry.describe()[0].materialized);
    }

    #[test]
    fn test_resolve_opens_once() {
        let registry = Registry::new();
        let opener = CountingOpener::new();
        let calls = opener.calls();
        registry.register("main", "main", Box::new(opener)).unwrap();

        let first = registry.resolve("main").unwrap();
        for _ in 0..10 {
            assert!(Arc::ptr_eq(&first, &registry.resolve("main").unwrap()));
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_unknown_reference() {
        let registry = Registry::new();
        assert_shelf_error!(
            registry.resolve("nope"),
            ShelfError::UnknownReference { .. },
            "resolving an unregistered name"
        );
    }

    #[test]
    fn test_bootstrap_runs_exactly_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let registry = Registry::with_bootstrap(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![BootstrapRecord::literal("main", "app", ":memory:")]
        });

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());

        registry.resolve("main").unwrap();
        registry
            .add_handle_reference("late", "late", Connection::open_in_memory().unwrap())
            .unwrap();
        registry.resolve("late").unwrap();
        let _ = registry.resolve("missing");
        registry.resolve("main").unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(registry.names(), vec!["late", "main"]);
    }

    #[test]
    fn test_bootstrap_failure_is_remembered() {
        let registry = Registry::with_bootstrap(|| {
            vec![
                BootstrapRecord::literal("ok", "app", ":memory:"),
                BootstrapRecord::new().text("type", "handle").text("name", "broken"),
                BootstrapRecord::literal("never", "app", ":memory:"),
            ]
        });

        for _ in 0..2 {
            match registry.resolve("ok") {
                Err(ShelfError::MalformedDescriptor { index, reason }) => {
                    assert_eq!(index, 1);
                    assert_eq!(reason, "record does not have key [dbName]");
                }
                other => panic!("Expected MalformedDescriptor, got {:?}", other),
            }
        }
        assert!(registry.contains("ok"));
        assert!(!registry.contains("never"));
    }

    #[test]
    fn test_panicking_bootstrap_list_is_remembered() {
        let registry = Registry::with_bootstrap(|| -> Vec<BootstrapRecord> { panic!("config unreadable") });

        for _ in 0..2 {
            match registry.resolve("anything") {
                Err(ShelfError::MalformedDescriptor { index, reason }) => {
                    assert_eq!(index, 0);
                    assert!(reason.contains("config unreadable"));
                }
                other => panic!("Expected MalformedDescriptor, got {:?}", other),
            }
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_resolve_shares_one_facade() {
        let registry = Arc::new(Registry::new());
        let opener = CountingOpener::new().with_delay(Duration::from_millis(50));
        let calls = opener.calls();
        registry.register("main", "main", Box::new(opener)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.resolve("main").unwrap())
            })
            .collect();
        let facades: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.get(), 1);
        assert!(facades.iter().all(|f| Arc::ptr_eq(f, &facades[0])));
    }

    #[test]
    fn test_concurrent_resolve_shares_failure() {
        let registry = Arc::new(Registry::new());
        let opener = CountingOpener::failing_first(100).with_delay(Duration::from_millis(50));
        registry.register("main", "main", Box::new(opener)).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.resolve("main").map(|_| ()).unwrap_err().to_string())
            })
            .collect();
        let errors: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(errors[0], errors[1]);
        assert!(!registry.describe()[0].materialized);
    }

    #[test]
    fn test_external_source_reference() {
        let registry = Registry::new();
        registry.sources().register("app/connect", || -> Result<Bindings> {
            let mut bindings = Bindings::new();
            bindings.insert("dbh".to_string(), Box::new(Connection::open_in_memory()?));
            Ok(bindings)
        });
        registry
            .add_external_source_reference("ext", "ext_db", "app/connect", "dbh")
            .unwrap();
        registry
            .add_external_source_reference("wrong", "ext_db", "app/connect", "missing")
            .unwrap();

        assert!(registry.resolve("ext").is_ok());
        let err = registry.resolve("wrong").unwrap_err();
        assert!(err.to_string().contains("[missing]"), "{}", err);
    }

    #[test]
    fn test_from_config_without_escaping() {
        let config: Config = toml::from_str(
            r#"
[sanitize]
html = false

[[reference]]
type = "handle"
name = "bad"
dbName = "bad"
"#,
        )
        .unwrap();
        let registry = Registry::from_config(config);
        assert_shelf_error!(registry.resolve("bad"), ShelfError::MalformedDescriptor { index: 0, .. }, "handle from toml");

        let config: Config = toml::from_str(
            r#"
[sanitize]
html = false

[[reference]]
type = "literal"
name = "main"
dbName = "app"
dsn = ":memory:"
"#,
        )
        .unwrap();
        let registry = Registry::from_config(config);
        let facade = registry.resolve("main").unwrap();
        let row = facade
            .fetch_one("SELECT '<b>' AS markup", QueryParams::None, &FetchOptions::default())
            .unwrap()
            .and_then(|f| f.into_row())
            .unwrap();
        assert_eq!(row.get_text("markup"), Some("<b>"));
    }

    #[test]
    fn test_shutdown_closes_materialized_facades() {
        let registry = Registry::new();
        registry.register("open", "open", Box::new(CountingOpener::new())).unwrap();
        registry.register("idle", "idle", Box::new(CountingOpener::new())).unwrap();

        let facade = registry.resolve("open").unwrap();
        registry.shutdown().unwrap();

        assert!(facade.is_closed());
        assert_shelf_error!(
            facade.fetch_all("SELECT 1", QueryParams::None, &FetchOptions::default()),
            ShelfError::ConnectionClosed { .. },
            "fetch after shutdown"
        );
        assert!(!registry.describe().iter().any(|s| s.name == "idle" && s.materialized));
    }
}
