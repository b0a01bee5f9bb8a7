/// Query Facade Module
///
/// `QueryFacade` is the operations surface over one opened connection:
/// `execute`, `fetch_one`, `fetch_all` and `fetch_one_by_one`. It keeps no
/// statements or results between calls.
///
/// The connection sits behind a mutex and is taken with `try_lock`: a facade
/// is single-owner-at-a-time, so a call made while another operation or an
/// open `RowStream` holds the connection fails with `ConnectionBusy` instead
/// of waiting.

use crate::core::db::fetch::{CursorPosition, FetchMode, FetchOptions, PrepareOptions};
use crate::core::db::row::{Fetched, Row};
use crate::core::db::stream::{CancelToken, RowStream, StreamSpec};
use crate::core::{Result, ShelfError};
use crate::sanitize::{self, Sanitizer};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{CachedStatement, Connection, InterruptHandle, Statement};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Bind values for one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum QueryParams {
    #[default]
    None,
    /// Bound to `?`/`?N` placeholders in order
    Positional(Vec<Value>),
    /// Bound by placeholder name, e.g. `:id`
    Named(Vec<(String, Value)>),
}

impl QueryParams {
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        QueryParams::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        QueryParams::Named(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub(crate) fn bind(&self, stmt: &mut Statement<'_>) -> rusqlite::Result<()> {
        match self {
            QueryParams::None => {
                if stmt.parameter_count() != 0 {
                    return Err(rusqlite::Error::InvalidParameterCount(0, stmt.parameter_count()));
                }
            }
            QueryParams::Positional(values) => {
                if values.len() != stmt.parameter_count() {
                    return Err(rusqlite::Error::InvalidParameterCount(
                        values.len(),
                        stmt.parameter_count(),
                    ));
                }
                for (i, value) in values.iter().enumerate() {
                    stmt.raw_bind_parameter(i + 1, value)?;
                }
            }
            QueryParams::Named(pairs) => {
                // Every placeholder must be bound; SQLite would quietly use NULL.
                let mut bound = vec![false; stmt.parameter_count()];
                for (name, value) in pairs {
                    let index = stmt
                        .parameter_index(name)?
                        .ok_or_else(|| rusqlite::Error::InvalidParameterName(name.clone()))?;
                    stmt.raw_bind_parameter(index, value)?;
                    bound[index - 1] = true;
                }
                let supplied = bound.iter().filter(|b| **b).count();
                if supplied != bound.len() {
                    return Err(rusqlite::Error::InvalidParameterCount(supplied, bound.len()));
                }
            }
        }
        Ok(())
    }
}

impl From<Vec<Value>> for QueryParams {
    fn from(values: Vec<Value>) -> Self {
        QueryParams::Positional(values)
    }
}

/// Either a one-off or a cached prepared statement.
pub(crate) enum Prepared<'conn> {
    Fresh(Statement<'conn>),
    Cached(CachedStatement<'conn>),
}

impl<'conn> Deref for Prepared<'conn> {
    type Target = Statement<'conn>;

    fn deref(&self) -> &Self::Target {
        match self {
            Prepared::Fresh(stmt) => stmt,
            Prepared::Cached(stmt) => &**stmt,
        }
    }
}

impl DerefMut for Prepared<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Prepared::Fresh(stmt) => stmt,
            Prepared::Cached(stmt) => &mut **stmt,
        }
    }
}

/// Prepares and binds a statement, mapping failures to `QueryExecution`.
pub(crate) fn prepare_bound<'conn>(
    conn: &'conn Connection,
    sql: &str,
    params: &QueryParams,
    options: PrepareOptions,
) -> Result<Prepared<'conn>> {
    let prepared = if options.cached {
        conn.prepare_cached(sql).map(Prepared::Cached)
    } else {
        conn.prepare(sql).map(Prepared::Fresh)
    };
    let mut stmt = prepared.map_err(|e| ShelfError::query("preparing statement", e))?;
    params
        .bind(&mut stmt)
        .map_err(|e| ShelfError::query("binding parameters", e))?;
    Ok(stmt)
}

pub(crate) fn column_names(stmt: &Statement<'_>) -> Vec<String> {
    stmt.column_names().into_iter().map(String::from).collect()
}

/// Applies a fetch mode and the sanitization policy to one row.
#[derive(Clone)]
pub(crate) struct Shaper {
    mode: FetchMode,
    sanitize: bool,
    sanitizer: Arc<dyn Sanitizer>,
}

impl Shaper {
    pub(crate) fn new(options: &FetchOptions, sanitizer: Arc<dyn Sanitizer>) -> Self {
        Shaper {
            mode: options.mode.clone(),
            sanitize: options.sanitize,
            sanitizer,
        }
    }

    /// Shapes without sanitizing.
    pub(crate) fn shape_raw(&self, row: Row) -> Result<Fetched> {
        match &self.mode {
            FetchMode::Associative => Ok(Fetched::Row(row)),
            FetchMode::Positional => Ok(Fetched::Values(row.into_values())),
            FetchMode::Record(shape) => shape.build(&row).map(Fetched::Record),
            FetchMode::Column(index) => row
                .into_values()
                .into_iter()
                .nth(*index)
                .map(Fetched::Scalar)
                .ok_or_else(|| {
                    ShelfError::query("reading column", rusqlite::Error::InvalidColumnIndex(*index))
                }),
            FetchMode::Apply(function) => Ok(Fetched::Scalar(function(row.values()))),
        }
    }

    /// Shapes one row and applies the flat sanitizer to row-shaped output.
    pub(crate) fn shape(&self, row: Row) -> Result<Fetched> {
        let mut fetched = self.shape_raw(row)?;
        if self.applies_sanitizer() {
            sanitize::sanitize_fetched(self.sanitizer.as_ref(), &mut fetched);
        }
        Ok(fetched)
    }

    fn applies_sanitizer(&self) -> bool {
        self.sanitize && self.mode.is_row_shaped()
    }
}

/// Operations surface over one opened connection.
pub struct QueryFacade {
    id: Uuid,
    db_name: String,
    conn: Arc<Mutex<Option<Connection>>>,
    interrupt: Arc<InterruptHandle>,
    sanitizer: Arc<dyn Sanitizer>,
    opened_at: DateTime<Utc>,
}

impl std::fmt::Debug for QueryFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryFacade")
            .field("id", &self.id)
            .field("db_name", &self.db_name)
            .field("opened_at", &self.opened_at)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the facade's live connection.
pub struct ConnectionGuard<'a> {
    guard: MutexGuard<'a, Option<Connection>>,
}

impl Deref for ConnectionGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Checked when the guard was created.
        self.guard.as_ref().expect("connection guard holds an open connection")
    }
}

impl QueryFacade {
    pub fn new(db_name: impl Into<String>, connection: Connection, sanitizer: Arc<dyn Sanitizer>) -> Self {
        let interrupt = Arc::new(connection.get_interrupt_handle());
        QueryFacade {
            id: Uuid::new_v4(),
            db_name: db_name.into(),
            conn: Arc::new(Mutex::new(Some(connection))),
            interrupt,
            sanitizer,
            opened_at: Utc::now(),
        }
    }

    /// Unique id of this facade instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Logical database name the facade was built with.
    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        match self.conn.try_lock() {
            Ok(guard) => guard.is_none(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_none(),
            Err(TryLockError::WouldBlock) => false,
        }
    }

    /// Takes the connection for one operation.
    pub fn lock(&self) -> Result<ConnectionGuard<'_>> {
        let guard = take_connection(&self.conn, &self.db_name)?;
        Ok(ConnectionGuard { guard })
    }

    /// Runs a closure with direct access to the underlying connection.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Runs one or more semicolon-separated statements without parameters.
    pub fn exec_batch(&self, sql: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql).map_err(|e| {
            error!("Error executing batch on [{}]: {}", self.db_name, e);
            ShelfError::query("executing batch", e)
        })
    }

    /// Prepares, binds and runs a statement, discarding any result rows.
    pub fn execute(&self, sql: &str, params: QueryParams, options: PrepareOptions) -> Result<()> {
        let conn = self.lock()?;
        let result = prepare_bound(&conn, sql, &params, options).and_then(|mut stmt| {
            let mut rows = stmt.raw_query();
            let stepped = rows.next().map(|_| ());
            stepped.map_err(|e| ShelfError::query("executing statement", e))
        });
        if let Err(e) = &result {
            error!("Error executing call on [{}]: {}", self.db_name, e);
        }
        result
    }

    /// Fetches a single unit at the requested cursor position.
    ///
    /// Row-shaped results are sanitized when the options ask for it; records,
    /// columns and row-function results are returned as produced.
    pub fn fetch_one(&self, sql: &str, params: QueryParams, options: &FetchOptions) -> Result<Option<Fetched>> {
        let shaper = Shaper::new(options, self.sanitizer.clone());
        let conn = self.lock()?;
        let result = prepare_bound(&conn, sql, &params, options.prepare).and_then(|mut stmt| {
            let columns = column_names(&stmt);
            let mut rows = stmt.raw_query();
            let row = position_cursor(&mut rows, &columns, options.cursor)
                .map_err(|e| ShelfError::query("fetching row", e))?;
            row.map(|row| shaper.shape(row)).transpose()
        });
        if let Err(e) = &result {
            error!("Error fetching from [{}]: {}", self.db_name, e);
        }
        result
    }

    /// Fetches every row of the result set.
    ///
    /// Row-shaped results go through the two-level sanitizer when the options
    /// ask for it.
    pub fn fetch_all(&self, sql: &str, params: QueryParams, options: &FetchOptions) -> Result<Vec<Fetched>> {
        let shaper = Shaper::new(options, self.sanitizer.clone());
        let conn = self.lock()?;
        let result = prepare_bound(&conn, sql, &params, options.prepare).and_then(|mut stmt| {
            let columns = column_names(&stmt);
            let mut rows = stmt.raw_query();
            let mut fetched = Vec::new();
            while let Some(row) = rows.next().map_err(|e| ShelfError::query("fetching rows", e))? {
                let row = Row::from_sql_row(row, &columns).map_err(|e| ShelfError::query("reading row", e))?;
                fetched.push(shaper.shape_raw(row)?);
            }
            Ok(fetched)
        });

        match result {
            Ok(mut fetched) => {
                if shaper.applies_sanitizer() {
                    sanitize::sanitize_set(self.sanitizer.as_ref(), &mut fetched);
                }
                debug!("Fetched {} rows from [{}]", fetched.len(), self.db_name);
                Ok(fetched)
            }
            Err(e) => {
                error!("Error fetching from [{}]: {}", self.db_name, e);
                Err(e)
            }
        }
    }

    /// Streams results one at a time.
    ///
    /// The statement is prepared and bound before this returns, so syntax and
    /// binding errors surface here. The stream reads one row ahead and holds
    /// the connection until the last item is handed over or the stream is
    /// dropped. Cursor positions other than `Next` do not apply to streams.
    pub fn fetch_one_by_one(&self, sql: &str, params: QueryParams, options: FetchOptions) -> Result<RowStream> {
        self.fetch_one_by_one_with(sql, params, options, CancelToken::new())
    }

    /// `fetch_one_by_one` with a caller-supplied cancel token.
    pub fn fetch_one_by_one_with(
        &self,
        sql: &str,
        params: QueryParams,
        options: FetchOptions,
        cancel: CancelToken,
    ) -> Result<RowStream> {
        if options.cursor != CursorPosition::Next {
            debug!("Ignoring cursor position {:?} for a row stream", options.cursor);
        }
        let shaper = Shaper::new(&options, self.sanitizer.clone());
        RowStream::start(
            StreamSpec {
                db_name: self.db_name.clone(),
                conn: self.conn.clone(),
                interrupt: self.interrupt.clone(),
                sql: sql.to_string(),
                params,
                prepare: options.prepare,
                shaper,
            },
            cancel,
        )
    }

    /// Interrupts whatever statement is running on this connection.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// Closes the connection. Later operations fail with `ConnectionClosed`.
    pub fn close(&self) -> Result<()> {
        let mut guard = match self.conn.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(ShelfError::ConnectionBusy {
                    db_name: self.db_name.clone(),
                })
            }
        };
        match guard.take() {
            Some(conn) => {
                conn.close().map_err(|(_, e)| ShelfError::Database(e))?;
                info!("Closed connection to [{}]", self.db_name);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Takes the connection mutex without waiting.
pub(crate) fn take_connection<'a>(
    conn: &'a Mutex<Option<Connection>>,
    db_name: &str,
) -> Result<MutexGuard<'a, Option<Connection>>> {
    let guard = match conn.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => {
            return Err(ShelfError::ConnectionBusy {
                db_name: db_name.to_string(),
            })
        }
    };
    if guard.is_none() {
        return Err(ShelfError::ConnectionClosed {
            db_name: db_name.to_string(),
        });
    }
    Ok(guard)
}

/// Steps a forward-only cursor to the requested position and reads that row.
fn position_cursor(
    rows: &mut rusqlite::Rows<'_>,
    columns: &[String],
    cursor: CursorPosition,
) -> rusqlite::Result<Option<Row>> {
    match cursor {
        CursorPosition::Next | CursorPosition::First => match rows.next()? {
            Some(row) => Row::from_sql_row(row, columns).map(Some),
            None => Ok(None),
        },
        CursorPosition::Relative(0) => Ok(None),
        CursorPosition::Relative(offset) => position_cursor(rows, columns, CursorPosition::Absolute(offset - 1)),
        CursorPosition::Absolute(index) => {
            for _ in 0..index {
                if rows.next()?.is_none() {
                    return Ok(None);
                }
            }
            match rows.next()? {
                Some(row) => Row::from_sql_row(row, columns).map(Some),
                None => Ok(None),
            }
        }
        CursorPosition::Last => {
            let mut last = None;
            while let Some(row) = rows.next()? {
                last = Some(Row::from_sql_row(row, columns)?);
            }
            Ok(last)
        }
    }
}
