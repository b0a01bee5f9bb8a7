/// Row Streaming Module
///
/// `RowStream` is the pull-based form of a fetch. A producer thread owns the
/// facade's connection for the life of the stream and hands rows over a
/// rendezvous channel. It reads one row ahead of the consumer, so when the
/// cursor runs out it releases the connection before handing over the last
/// item. Stopping early is just dropping the stream: the producer's next
/// hand-off fails, it finalizes the statement and releases the connection,
/// and `drop` waits for that before returning.

use crate::core::db::fetch::PrepareOptions;
use crate::core::db::query::{column_names, prepare_bound, take_connection, QueryParams, Shaper};
use crate::core::db::row::{Fetched, Row};
use crate::core::{Result, ShelfError};
use rusqlite::{Connection, InterruptHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, error, warn};

/// Shared flag for cancelling a stream from anywhere.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Whether a stream's producer currently owns the connection.
///
/// The producer clears it under the lock before releasing the connection, and
/// `interrupt` only fires while it is set, so a finished stream can never
/// interrupt a statement that someone else started afterwards.
#[derive(Debug, Clone, Default)]
struct Holding(Arc<Mutex<bool>>);

impl Holding {
    fn set(&self, holding: bool) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = holding;
    }

    fn interrupt(&self, handle: &InterruptHandle) -> bool {
        let holding = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *holding {
            handle.interrupt();
        }
        *holding
    }
}

/// Everything the producer thread needs to run one statement.
pub(crate) struct StreamSpec {
    pub(crate) db_name: String,
    pub(crate) conn: Arc<Mutex<Option<Connection>>>,
    pub(crate) interrupt: Arc<InterruptHandle>,
    pub(crate) sql: String,
    pub(crate) params: QueryParams,
    pub(crate) prepare: PrepareOptions,
    pub(crate) shaper: Shaper,
}

/// A lazy, finite sequence of fetched results.
///
/// Yields `Err` at most once, as its last item.
pub struct RowStream {
    db_name: String,
    items: Option<Receiver<Result<Fetched>>>,
    producer: Option<thread::JoinHandle<()>>,
    interrupt: Arc<InterruptHandle>,
    holding: Holding,
    cancel: CancelToken,
    yielded: usize,
}

impl RowStream {
    /// Spawns the producer and waits until the statement is prepared.
    pub(crate) fn start(spec: StreamSpec, cancel: CancelToken) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let (item_tx, item_rx) = mpsc::sync_channel::<Result<Fetched>>(0);
        let db_name = spec.db_name.clone();
        let interrupt = spec.interrupt.clone();
        let producer_cancel = cancel.clone();
        let holding = Holding::default();
        let producer_holding = holding.clone();

        let producer = thread::Builder::new()
            .name(format!("sqlshelf-stream-{}", db_name))
            .spawn(move || produce(spec, producer_cancel, producer_holding, ready_tx, item_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                debug!("Row stream started on [{}]", db_name);
                Ok(RowStream {
                    db_name,
                    items: Some(item_rx),
                    producer: Some(producer),
                    interrupt,
                    holding,
                    cancel,
                    yielded: 0,
                })
            }
            Ok(Err(e)) => {
                let _ = producer.join();
                error!("Error fetching from [{}]: {}", db_name, e);
                Err(e)
            }
            Err(_) => {
                let _ = producer.join();
                Err(ShelfError::Cancelled(format!(
                    "row stream on [{}] stopped before it started",
                    db_name
                )))
            }
        }
    }

    /// Cancels the stream and interrupts the statement if it is mid-step.
    ///
    /// Once the producer has released the connection this only sets the
    /// token; statements run later on the same facade are left alone.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if !self.holding.interrupt(&self.interrupt) {
            debug!("Row stream on [{}] no longer holds the connection", self.db_name);
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Number of items handed out so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// True once the producer has finished and the cursor is released.
    pub fn is_finished(&self) -> bool {
        self.producer.is_none()
    }

    fn finish(&mut self) {
        self.items.take();
        if let Some(producer) = self.producer.take() {
            if producer.join().is_err() {
                error!("Row stream producer for [{}] panicked", self.db_name);
            }
        }
    }
}

impl Iterator for RowStream {
    type Item = Result<Fetched>;

    fn next(&mut self) -> Option<Self::Item> {
        let received = self.items.as_ref()?.recv();
        match received {
            Ok(item) => {
                self.yielded += 1;
                Some(item)
            }
            Err(_) => {
                debug!("Row stream on [{}] finished after {} items", self.db_name, self.yielded);
                self.finish();
                None
            }
        }
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        if !self.is_finished() {
            debug!("Row stream on [{}] abandoned after {} items", self.db_name, self.yielded);
        }
        self.finish();
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("db_name", &self.db_name)
            .field("yielded", &self.yielded)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Producer thread body. The connection guard is released, and the holding
/// flag cleared, before the buffered tail of the stream is handed over.
fn produce(
    spec: StreamSpec,
    cancel: CancelToken,
    holding: Holding,
    ready: SyncSender<Result<()>>,
    items: SyncSender<Result<Fetched>>,
) {
    let guard = match take_connection(&spec.conn, &spec.db_name) {
        Ok(guard) => guard,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    holding.set(true);
    let tail = match guard.as_ref() {
        Some(conn) => step_rows(conn, &spec, &cancel, &ready, &items),
        None => {
            let _ = ready.send(Err(ShelfError::ConnectionClosed {
                db_name: spec.db_name.clone(),
            }));
            Vec::new()
        }
    };
    holding.set(false);
    drop(guard);

    for item in tail {
        if items.send(item).is_err() {
            break;
        }
    }
}

/// Steps the cursor one row ahead of the consumer.
///
/// Returns what is left to hand over once the connection is released: the
/// buffered row, if any, followed by the error that stopped the stream.
/// Returns nothing when the consumer went away.
fn step_rows(
    conn: &Connection,
    spec: &StreamSpec,
    cancel: &CancelToken,
    ready: &SyncSender<Result<()>>,
    items: &SyncSender<Result<Fetched>>,
) -> Vec<Result<Fetched>> {
    let mut stmt = match prepare_bound(conn, &spec.sql, &spec.params, spec.prepare) {
        Ok(stmt) => stmt,
        Err(e) => {
            let _ = ready.send(Err(e));
            return Vec::new();
        }
    };
    let columns = column_names(&stmt);
    let mut rows = stmt.raw_query();
    if ready.send(Ok(())).is_err() {
        return Vec::new();
    }

    let mut buffered: Option<Fetched> = None;
    let stopped = loop {
        if cancel.is_cancelled() {
            break Some(ShelfError::Cancelled(format!(
                "row stream on [{}] was cancelled",
                spec.db_name
            )));
        }

        let item = match rows.next() {
            Ok(Some(row)) => Row::from_sql_row(row, &columns)
                .map_err(|e| ShelfError::query("reading row", e))
                .and_then(|row| spec.shaper.shape(row)),
            Ok(None) => break None,
            Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == rusqlite::ErrorCode::OperationInterrupted => {
                Err(ShelfError::Cancelled(format!(
                    "row stream on [{}] was interrupted",
                    spec.db_name
                )))
            }
            Err(e) => Err(ShelfError::query("fetching row", e)),
        };

        match item {
            Ok(fetched) => {
                if let Some(previous) = buffered.replace(fetched) {
                    if items.send(Ok(previous)).is_err() {
                        return Vec::new();
                    }
                }
            }
            Err(e) => {
                warn!("Row stream on [{}] stopped on an error", spec.db_name);
                break Some(e);
            }
        }
    };

    buffered.map(Ok).into_iter().chain(stopped.map(Err)).collect()
}
