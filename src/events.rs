//! Lifecycle notifications re-published from SQLite callbacks.
//!
//! Each kind of event has its own broadcast channel, independent from the
//! operation queue: publishing never waits on queued work, and subscribers get
//! no ordering guarantee relative to it. Treat these streams as diagnostics.

use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use futures::stream::{self, BoxStream};
use rusqlite::hooks::Action;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::session::BlobWatch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileEvent {
    pub sql: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
    Unknown,
}

impl From<Action> for RowAction {
    fn from(action: Action) -> Self {
        match action {
            Action::SQLITE_INSERT => RowAction::Insert,
            Action::SQLITE_UPDATE => RowAction::Update,
            Action::SQLITE_DELETE => RowAction::Delete,
            _ => RowAction::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdateEvent {
    pub action: RowAction,
    pub database: String,
    pub table: String,
    pub rowid: i64,
}

/// A transaction on the connection was rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackEvent;

pub(crate) struct EventHub {
    trace: broadcast::Sender<TraceEvent>,
    profile: broadcast::Sender<ProfileEvent>,
    row_update: broadcast::Sender<RowUpdateEvent>,
    rollback: broadcast::Sender<RollbackEvent>,
}

thread_local! {
    // Bound on a connection's worker thread; the trace and profile callbacks
    // are plain function pointers and find their hub here.
    static WORKER_HUB: RefCell<Option<Arc<EventHub>>> = const { RefCell::new(None) };
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            trace: broadcast::channel(capacity).0,
            profile: broadcast::channel(capacity).0,
            row_update: broadcast::channel(capacity).0,
            rollback: broadcast::channel(capacity).0,
        })
    }

    /// Register the native callbacks. Must run on the connection's worker thread.
    ///
    /// Row changes also go to `blob_watch` so open blob streams on a changed row expire.
    #[allow(deprecated)]
    pub(crate) fn install(self: &Arc<Self>, conn: &mut rusqlite::Connection, blob_watch: BlobWatch) {
        WORKER_HUB.with(|slot| *slot.borrow_mut() = Some(Arc::clone(self)));
        conn.trace(Some(on_trace));
        conn.profile(Some(on_profile));

        let hub = AssertUnwindSafe(Arc::clone(self));
        let blob_watch = AssertUnwindSafe(blob_watch);
        conn.update_hook(Some(
            move |action: Action, database: &str, table: &str, rowid: i64| {
                blob_watch.row_changed(database, table, rowid);
                publish(
                    &hub.row_update,
                    RowUpdateEvent {
                        action: action.into(),
                        database: database.to_owned(),
                        table: table.to_owned(),
                        rowid,
                    },
                );
            },
        ));
        let hub = AssertUnwindSafe(Arc::clone(self));
        conn.rollback_hook(Some(move || publish(&hub.rollback, RollbackEvent)));
    }

    /// Undo [`install`](Self::install) on the worker thread before the connection closes.
    #[allow(deprecated)]
    pub(crate) fn uninstall(conn: &mut rusqlite::Connection) {
        conn.trace(None);
        conn.profile(None);
        conn.update_hook(None::<fn(Action, &str, &str, i64)>);
        conn.rollback_hook(None::<fn()>);
        WORKER_HUB.with(|slot| slot.borrow_mut().take());
    }

    pub(crate) fn trace(&self) -> EventStream<TraceEvent> {
        EventStream::new("trace", self.trace.subscribe())
    }

    pub(crate) fn profile(&self) -> EventStream<ProfileEvent> {
        EventStream::new("profile", self.profile.subscribe())
    }

    pub(crate) fn row_updates(&self) -> EventStream<RowUpdateEvent> {
        EventStream::new("row_update", self.row_update.subscribe())
    }

    pub(crate) fn rollbacks(&self) -> EventStream<RollbackEvent> {
        EventStream::new("rollback", self.rollback.subscribe())
    }
}

fn publish<T>(sender: &broadcast::Sender<T>, event: T) {
    if sender.receiver_count() > 0 {
        // Only fails when every receiver dropped since the check.
        let _ = sender.send(event);
    }
}

fn on_trace(sql: &str) {
    trace!(target: "sqlite_lane::sql", sql, "statement");
    WORKER_HUB.with(|slot| {
        if let Some(hub) = slot.borrow().as_ref() {
            publish(&hub.trace, TraceEvent { sql: sql.to_owned() });
        }
    });
}

fn on_profile(sql: &str, elapsed: Duration) {
    WORKER_HUB.with(|slot| {
        if let Some(hub) = slot.borrow().as_ref() {
            publish(
                &hub.profile,
                ProfileEvent {
                    sql: sql.to_owned(),
                    elapsed,
                },
            );
        }
    });
}

/// Independent subscription to one kind of connection event.
///
/// A subscriber that falls more than the configured capacity behind skips the
/// missed events (logged as a warning) and continues with the newest ones. The
/// stream ends once the connection is closed and dropped.
pub struct EventStream<T> {
    inner: BoxStream<'static, T>,
}

impl<T: Clone + Send + 'static> EventStream<T> {
    fn new(kind: &'static str, receiver: broadcast::Receiver<T>) -> Self {
        let inner = stream::unfold(receiver, move |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(kind, skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.as_mut().poll_next(cx)
    }
}
