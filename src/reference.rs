/// Reference Module
///
/// A reference is one named connection descriptor plus its memoized facade.
///
/// A reference starts unmaterialized and does no I/O until `facade()` is first
/// called. That call runs the opener, wraps the connection in a `QueryFacade`
/// and caches it; every later call returns the cached facade.
///
/// Materialization is serialized by a gate mutex. Callers that queued behind
/// a failing attempt get that attempt's error instead of opening again; a
/// caller that arrives after the failure retries.

use crate::core::db::{ConnectionOpener, QueryFacade, ReferenceKind};
use crate::core::{Result, ShelfError};
use crate::sanitize::Sanitizer;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Attempts {
    failures: u64,
    last_failure: Option<String>,
}

/// Descriptor and memoized facade for one named connection.
pub struct Reference {
    name: String,
    db_name: String,
    opener: Box<dyn ConnectionOpener>,
    sanitizer: Arc<dyn Sanitizer>,
    facade: OnceCell<Arc<QueryFacade>>,
    gate: Mutex<Attempts>,
    failures: AtomicU64,
}

/// Snapshot of a reference for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceStatus {
    pub name: String,
    pub db_name: String,
    pub kind: ReferenceKind,
    pub materialized: bool,
    pub facade_id: Option<Uuid>,
    pub opened_at: Option<DateTime<Utc>>,
    pub failed_attempts: u64,
}

impl Reference {
    pub fn new(
        name: impl Into<String>,
        db_name: impl Into<String>,
        opener: Box<dyn ConnectionOpener>,
        sanitizer: Arc<dyn Sanitizer>,
    ) -> Self {
        Reference {
            name: name.into(),
            db_name: db_name.into(),
            opener,
            sanitizer,
            facade: OnceCell::new(),
            gate: Mutex::new(Attempts::default()),
            failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn kind(&self) -> ReferenceKind {
        self.opener.kind()
    }

    pub fn is_materialized(&self) -> bool {
        self.facade.get().is_some()
    }

    /// Returns the facade, opening the connection on first use.
    ///
    /// # Errors
    ///
    /// `ConnectionOpen` when the opener fails. The reference stays
    /// unmaterialized.
    pub fn facade(&self) -> Result<Arc<QueryFacade>> {
        if let Some(facade) = self.facade.get() {
            return Ok(facade.clone());
        }

        let seen_failures = self.failures.load(Ordering::SeqCst);
        let mut attempts = self.gate.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(facade) = self.facade.get() {
            return Ok(facade.clone());
        }
        if attempts.failures != seen_failures {
            if let Some(reason) = &attempts.last_failure {
                debug!("Sharing failed open of [{}] with a waiting caller", self.name);
                return Err(ShelfError::ConnectionOpen {
                    name: self.name.clone(),
                    reason: reason.clone(),
                });
            }
        }

        debug!("Materializing {} reference [{}]", self.kind(), self.name);
        match self.opener.open() {
            Ok(connection) => {
                let facade = Arc::new(QueryFacade::new(
                    self.db_name.clone(),
                    connection,
                    self.sanitizer.clone(),
                ));
                // The gate is held, so nobody else can have filled the cell.
                let facade = self.facade.get_or_init(|| facade).clone();
                info!("Opened [{}] (database [{}])", self.name, self.db_name);
                Ok(facade)
            }
            Err(e) => {
                let reason = e.to_string();
                error!("Error generating facade for [{}]: {}", self.name, reason);
                attempts.failures += 1;
                attempts.last_failure = Some(reason.clone());
                self.failures.store(attempts.failures, Ordering::SeqCst);
                Err(ShelfError::ConnectionOpen {
                    name: self.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Closes the facade if it was ever opened.
    pub fn close(&self) -> Result<()> {
        match self.facade.get() {
            Some(facade) => facade.close(),
            None => Ok(()),
        }
    }

    pub fn status(&self) -> ReferenceStatus {
        let facade = self.facade.get();
        ReferenceStatus {
            name: self.name.clone(),
            db_name: self.db_name.clone(),
            kind: self.kind(),
            materialized: facade.is_some(),
            facade_id: facade.map(|f| f.id()),
            opened_at: facade.map(|f| f.opened_at()),
            failed_attempts: self.failures.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reference")
            .field("name", &self.name)
            .field("db_name", &self.db_name)
            .field("kind", &self.kind())
            .field("materialized", &self.is_materialized())
            .finish()
    }
}
