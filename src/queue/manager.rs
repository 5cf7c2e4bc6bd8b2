use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::LaneError;

use super::channel::{Command, Job, Operation, Turn};
use super::dispatcher::run_queue_worker;
use super::handle::{ElementSink, ElementStream, OperationHandle};
use super::view::ScopedView;
use super::{lock, panic_message};

pub(super) struct QueueShared {
    pub(super) name: String,
    pub(super) closing: CancellationToken,
    pub(super) drained: CancellationToken,
    pub(super) release_result: Mutex<Option<Result<(), LaneError>>>,
}

struct QueueInner<R> {
    sender: Mutex<Option<Sender<Command<R>>>>,
    next_id: AtomicU64,
    shared: Arc<QueueShared>,
}

/// FIFO mutual-exclusion lane over one native resource.
///
/// A dedicated worker thread owns the resource and runs submitted operations one
/// at a time, in submission order. Clones share the same lane; this is how a
/// connection and the statements and blob streams derived from it stay mutually
/// exclusive.
pub struct OperationQueue<R> {
    inner: Arc<QueueInner<R>>,
}

impl<R> Clone for OperationQueue<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Send + 'static> OperationQueue<R> {
    /// Move `resource` onto a new worker thread named `name`.
    ///
    /// `release` runs on the worker once the queue has drained after shutdown; its
    /// result is what [`shutdown`](Self::shutdown) reports.
    ///
    /// # Errors
    /// Returns [`LaneError::ConnectionError`] if the worker thread cannot be spawned.
    pub fn spawn<F>(name: impl Into<String>, resource: R, release: F) -> Result<Self, LaneError>
    where
        F: FnOnce(R) -> Result<(), LaneError> + Send + 'static,
    {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Command<R>>();
        let shared = Arc::new(QueueShared {
            name: name.clone(),
            closing: CancellationToken::new(),
            drained: CancellationToken::new(),
            release_result: Mutex::new(None),
        });
        let worker_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(name)
            .spawn(move || run_queue_worker(resource, &receiver, release, &worker_shared))
            .map_err(|err| {
                LaneError::ConnectionError(format!("failed to spawn queue worker thread: {err}"))
            })?;

        Ok(Self {
            inner: Arc::new(QueueInner {
                sender: Mutex::new(Some(sender)),
                next_id: AtomicU64::new(1),
                shared,
            }),
        })
    }

    /// Queue `func` for exclusive execution against the resource.
    ///
    /// If `cancel` has fired by the time the operation reaches the front of the
    /// queue, `func` is never invoked and the handle resolves to
    /// [`LaneError::Cancelled`]. After shutdown the handle resolves to
    /// [`LaneError::Disposed`].
    pub fn submit<T, F>(&self, cancel: &CancellationToken, func: F) -> OperationHandle<T>
    where
        F: FnOnce(&ScopedView<R>, &CancellationToken) -> Result<T, LaneError> + Send + 'static,
        T: Send + 'static,
    {
        self.try_submit(cancel, func)
            .unwrap_or_else(OperationHandle::failed)
    }

    /// Like [`submit`](Self::submit), but reports a closed queue synchronously.
    ///
    /// # Errors
    /// Returns [`LaneError::Disposed`] once shutdown has begun.
    pub fn try_submit<T, F>(
        &self,
        cancel: &CancellationToken,
        func: F,
    ) -> Result<OperationHandle<T>, LaneError>
    where
        F: FnOnce(&ScopedView<R>, &CancellationToken) -> Result<T, LaneError> + Send + 'static,
        T: Send + 'static,
    {
        let (respond_to, receiver) = oneshot::channel();
        let token = cancel.clone();
        let job: Job<R> = Box::new(move |turn| {
            let result = match turn {
                Turn::Skip(err) => Err(err),
                Turn::Run(view) => invoke_guarded(|| func(&view, &token)),
            };
            let _ = respond_to.send(result);
        });
        self.enqueue(cancel.clone(), job)?;
        Ok(OperationHandle::waiting(receiver))
    }

    /// Queue a streaming operation whose elements flow back to the returned stream.
    ///
    /// The worker never waits for the subscriber. `backlog` caps how many unread
    /// elements may pile up before the stream fails with
    /// [`LaneError::StreamBacklog`]; `None` lets them pile up without limit.
    /// Each call starts an independent execution; nothing is cached between
    /// subscriptions.
    pub fn submit_streaming<T, F>(
        &self,
        cancel: &CancellationToken,
        backlog: Option<usize>,
        func: F,
    ) -> ElementStream<T>
    where
        F: FnOnce(&ScopedView<R>, &mut ElementSink<T>) -> Result<(), LaneError> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = tokio_mpsc::unbounded_channel();
        let delivered = Arc::new(AtomicBool::new(false));
        let unread = Arc::new(AtomicUsize::new(0));
        // Child token: dropping the stream cancels this operation only.
        let token = cancel.child_token();
        let mut sink = ElementSink::new(
            sender,
            token.clone(),
            self.inner.shared.closing.clone(),
            Arc::clone(&unread),
            backlog,
        );
        let worker_delivered = Arc::clone(&delivered);
        let job: Job<R> = Box::new(move |turn| {
            let outcome = match turn {
                Turn::Skip(err) => Err(err),
                Turn::Run(view) => invoke_guarded(|| func(&view, &mut sink)),
            };
            let sent = match outcome {
                Ok(()) => Ok(()),
                Err(err) => sink.send(Err(err)),
            };
            if sent.is_ok() {
                worker_delivered.store(true, Ordering::Release);
            }
        });

        match self.enqueue(token.clone(), job) {
            Ok(()) => ElementStream::new(receiver, delivered, unread, token),
            Err(err) => ElementStream::failed(err),
        }
    }

    /// Phase one of shutdown: stop accepting work and tell the worker no more is
    /// coming. Never blocks. Returns `true` for the call that initiated shutdown.
    pub fn begin_shutdown(&self) -> bool {
        let Some(sender) = lock(&self.inner.sender).take() else {
            return false;
        };
        self.inner.shared.closing.cancel();
        let _ = sender.send(Command::Shutdown);
        debug!(queue = %self.inner.shared.name, "operation queue shutdown requested");
        true
    }

    /// Both phases of shutdown: stop accepting work, then wait until every queued
    /// operation has finished and the resource has been released.
    ///
    /// Must not be awaited from inside an operation running on this queue.
    ///
    /// # Errors
    /// The first caller to observe completion receives the release error, if any.
    pub async fn shutdown(&self) -> Result<(), LaneError> {
        self.begin_shutdown();
        self.inner.shared.drained.cancelled().await;
        lock(&self.inner.shared.release_result)
            .take()
            .unwrap_or(Ok(()))
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shared.closing.is_cancelled()
    }

    /// Whether the worker has drained and released the resource.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.inner.shared.drained.is_cancelled()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    fn enqueue(&self, cancel: CancellationToken, job: Job<R>) -> Result<(), LaneError> {
        let guard = lock(&self.inner.sender);
        let Some(sender) = guard.as_ref() else {
            return Err(LaneError::Disposed("operation queue"));
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        sender
            .send(Command::Run(Operation { id, cancel, job }))
            .map_err(|_| LaneError::ConnectionError("operation queue worker exited".into()))
    }
}

impl<R> fmt::Debug for OperationQueue<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("name", &self.inner.shared.name)
            .field("closed", &self.inner.shared.closing.is_cancelled())
            .field("drained", &self.inner.shared.drained.is_cancelled())
            .finish()
    }
}

fn invoke_guarded<T>(func: impl FnOnce() -> Result<T, LaneError>) -> Result<T, LaneError> {
    std::panic::catch_unwind(AssertUnwindSafe(func))
        .unwrap_or_else(|payload| Err(LaneError::OperationPanicked(panic_message(&*payload))))
}
