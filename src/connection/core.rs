use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ConnectionOptions;
use crate::error::LaneError;
use crate::events::{
    EventHub, EventStream, ProfileEvent, RollbackEvent, RowUpdateEvent, TraceEvent,
};
use crate::queue::{ElementSink, ElementStream, OperationHandle, OperationQueue, ScopedView};
use crate::session::Session;

static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

/// Blocking part of [`Connection::open`]; runs on the blocking pool.
fn open_native(options: &ConnectionOptions) -> Result<rusqlite::Connection, LaneError> {
    let conn = rusqlite::Connection::open_with_flags(options.path(), options.open_flags())?;
    if let Some(timeout) = options.busy_timeout() {
        conn.busy_timeout(timeout)?;
    }
    conn.set_prepared_statement_cache_capacity(options.statement_cache_capacity);
    Ok(conn)
}

/// An open `SQLite` connection whose every call is serialized through one
/// operation queue.
///
/// Any number of tasks may share a `&Connection`; their operations run one at a
/// time, in the order they were submitted, on the connection's worker thread.
/// Statements and blob streams opened from it share the same queue.
pub struct Connection {
    pub(crate) queue: OperationQueue<Session>,
    pub(crate) events: Arc<EventHub>,
    pub(crate) options: Arc<ConnectionOptions>,
}

impl Connection {
    /// Open a connection and start its worker.
    ///
    /// # Errors
    /// Returns `LaneError::ConfigError` for invalid options, or the native error if
    /// the database cannot be opened or configured.
    pub async fn open(options: ConnectionOptions) -> Result<Self, LaneError> {
        options.validate()?;
        let native_options = options.clone();
        let conn = tokio::task::spawn_blocking(move || open_native(&native_options))
            .await
            .map_err(|e| LaneError::ConnectionError(format!("sqlite open join error: {e}")))??;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let queue = OperationQueue::spawn(
            format!("sqlite-lane-{id}"),
            Session::new(conn, options.progress_interval),
            Session::release,
        )?;

        let events = EventHub::new(options.event_capacity);
        let hub = Arc::clone(&events);
        let journal_mode = options.journal_mode;
        let init = queue
            .submit(&CancellationToken::new(), move |view, _| {
                view.with(|session| {
                    let blob_watch = session.blob_watch();
                    let conn = session.connection();
                    hub.install(conn, blob_watch);
                    if let Some(mode) = journal_mode {
                        conn.execute_batch(&format!(
                            "PRAGMA journal_mode = {};",
                            mode.as_pragma_value()
                        ))?;
                    }
                    Ok(())
                })
            })
            .await;
        if let Err(err) = init {
            let _ = queue.shutdown().await;
            return Err(err);
        }

        debug!(queue = queue.name(), path = %options.db_path, "sqlite connection opened");
        Ok(Self {
            queue,
            events,
            options: Arc::new(options),
        })
    }

    /// Open a private in-memory database with default options.
    ///
    /// # Errors
    /// See [`open`](Self::open).
    pub async fn open_in_memory() -> Result<Self, LaneError> {
        Self::open(ConnectionOptions::in_memory()).await
    }

    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Name of the worker thread serving this connection.
    #[must_use]
    pub fn name(&self) -> &str {
        self.queue.name()
    }

    /// Queue `func` against a scoped view of the session.
    ///
    /// The view is valid only while `func` runs. The returned handle may be
    /// dropped; the operation still runs in turn.
    pub fn with_view<T, F>(&self, cancel: &CancellationToken, func: F) -> OperationHandle<T>
    where
        F: FnOnce(&ScopedView<Session>, &CancellationToken) -> Result<T, LaneError>
            + Send
            + 'static,
        T: Send + 'static,
    {
        self.queue.submit(cancel, func)
    }

    /// Streaming form of [`with_view`](Self::with_view).
    pub fn with_view_streaming<T, F>(&self, cancel: &CancellationToken, func: F) -> ElementStream<T>
    where
        F: FnOnce(&ScopedView<Session>, &mut ElementSink<T>) -> Result<(), LaneError>
            + Send
            + 'static,
        T: Send + 'static,
    {
        self.queue
            .submit_streaming(cancel, self.options.stream_backlog, func)
    }

    /// Run `func` with exclusive access to the underlying `rusqlite` connection.
    ///
    /// # Errors
    /// Returns whatever `func` returns, or `Disposed` once the connection is closed.
    pub async fn with_connection<F, R>(&self, func: F) -> Result<R, LaneError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, LaneError> + Send + 'static,
        R: Send + 'static,
    {
        self.with_connection_cancellable(&CancellationToken::new(), func)
            .await
    }

    /// # Errors
    /// See [`with_connection`](Self::with_connection); also `Cancelled`.
    pub async fn with_connection_cancellable<F, R>(
        &self,
        cancel: &CancellationToken,
        func: F,
    ) -> Result<R, LaneError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, LaneError> + Send + 'static,
        R: Send + 'static,
    {
        self.queue
            .submit(cancel, move |view, token| {
                view.with(|session| {
                    session.interruptible(token, |session| func(session.connection()))
                })
            })
            .await
    }

    /// Run `func` on the worker, streaming whatever it pushes into the sink.
    ///
    /// Each call is one independent execution.
    pub fn with_connection_streaming<T, F>(
        &self,
        cancel: &CancellationToken,
        func: F,
    ) -> ElementStream<T>
    where
        F: FnOnce(&mut rusqlite::Connection, &mut ElementSink<T>) -> Result<(), LaneError>
            + Send
            + 'static,
        T: Send + 'static,
    {
        self.with_view_streaming(cancel, move |view, sink| {
            let token = sink.token().clone();
            view.with(|session| {
                session.interruptible(&token, |session| func(session.connection(), sink))
            })
        })
    }

    /// Statements executed on this connection, as the engine expands them.
    #[must_use]
    pub fn trace(&self) -> EventStream<TraceEvent> {
        self.events.trace()
    }

    /// Statements with their wall-clock execution time.
    #[must_use]
    pub fn profile(&self) -> EventStream<ProfileEvent> {
        self.events.profile()
    }

    #[must_use]
    pub fn row_updates(&self) -> EventStream<RowUpdateEvent> {
        self.events.row_updates()
    }

    #[must_use]
    pub fn rollbacks(&self) -> EventStream<RollbackEvent> {
        self.events.rollbacks()
    }

    /// Stop accepting work, wait for queued operations to finish, then close
    /// every remaining statement and blob handle and the connection itself.
    ///
    /// Later calls return `Ok(())`.
    ///
    /// # Errors
    /// `CloseError` if the engine refuses to close the connection.
    pub async fn close(&self) -> Result<(), LaneError> {
        self.queue.shutdown().await
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.queue.begin_shutdown() {
            debug!(queue = self.queue.name(), "connection dropped without close");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.options.db_path)
            .field("queue", &self.queue)
            .finish()
    }
}
