use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::LaneError;

/// Completion of one queued operation.
///
/// Dropping the handle does not withdraw the operation; it still runs in turn and
/// its result is discarded.
#[must_use = "the operation runs regardless; await the handle to observe its result"]
pub struct OperationHandle<T> {
    state: HandleState<T>,
}

enum HandleState<T> {
    Waiting(oneshot::Receiver<Result<T, LaneError>>),
    Failed(Option<LaneError>),
}

impl<T> OperationHandle<T> {
    pub(super) fn waiting(receiver: oneshot::Receiver<Result<T, LaneError>>) -> Self {
        Self {
            state: HandleState::Waiting(receiver),
        }
    }

    pub(crate) fn failed(err: LaneError) -> Self {
        Self {
            state: HandleState::Failed(Some(err)),
        }
    }
}

impl<T> Future for OperationHandle<T> {
    type Output = Result<T, LaneError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Waiting(receiver) => match ready!(Pin::new(receiver).poll(cx)) {
                Ok(result) => Poll::Ready(result),
                Err(_) => Poll::Ready(Err(worker_gone())),
            },
            HandleState::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or_else(worker_gone)))
            }
        }
    }
}

fn worker_gone() -> LaneError {
    LaneError::ConnectionError("operation queue worker dropped the operation".into())
}

/// Producer side of a streaming operation, used on the worker thread.
///
/// Every [`push`](Self::push) is a cancellation checkpoint. Pushing never waits
/// for the subscriber: elements queue up in the stream until it reads them. With
/// a backlog limit set, a push that would exceed it fails the stream instead.
pub struct ElementSink<T> {
    sender: mpsc::UnboundedSender<Result<T, LaneError>>,
    cancel: CancellationToken,
    closing: CancellationToken,
    backlog: Arc<AtomicUsize>,
    limit: Option<usize>,
}

impl<T> ElementSink<T> {
    pub(super) fn new(
        sender: mpsc::UnboundedSender<Result<T, LaneError>>,
        cancel: CancellationToken,
        closing: CancellationToken,
        backlog: Arc<AtomicUsize>,
        limit: Option<usize>,
    ) -> Self {
        Self {
            sender,
            cancel,
            closing,
            backlog,
            limit,
        }
    }

    /// Emit one element to the subscriber.
    ///
    /// # Errors
    /// [`LaneError::Cancelled`] when the token fired or the subscriber dropped the
    /// stream; [`LaneError::Disposed`] when the queue is shutting down and the
    /// subscriber has unread elements; [`LaneError::StreamBacklog`] when the
    /// subscriber is a full backlog behind.
    pub fn push(&mut self, item: T) -> Result<(), LaneError> {
        self.checkpoint()?;
        let unread = self.backlog.load(Ordering::Acquire);
        if unread > 0 && self.closing.is_cancelled() {
            return Err(LaneError::Disposed("connection"));
        }
        if let Some(limit) = self.limit.filter(|limit| unread >= *limit) {
            return Err(LaneError::StreamBacklog(limit));
        }
        self.backlog.fetch_add(1, Ordering::AcqRel);
        self.send(Ok(item))
    }

    /// Fails with [`LaneError::Cancelled`] once the operation should stop.
    ///
    /// # Errors
    /// See above.
    pub fn checkpoint(&self) -> Result<(), LaneError> {
        if self.cancel.is_cancelled() || self.sender.is_closed() {
            Err(LaneError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Token of the operation this sink belongs to; wire it to native
    /// interruption hooks.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(super) fn send(&self, item: Result<T, LaneError>) -> Result<(), LaneError> {
        self.sender.send(item).map_err(|_| LaneError::Cancelled)
    }
}

/// Consumer side of a streaming operation.
///
/// Yields elements in production order, then at most one error. If the stream
/// ends before the producer could deliver its outcome, a final error is yielded
/// instead of a silent end: [`LaneError::Cancelled`] when the operation was
/// cancelled, [`LaneError::Disposed`] when the queue shut down under it.
/// Dropping the stream cancels the operation.
pub struct ElementStream<T> {
    receiver: mpsc::UnboundedReceiver<Result<T, LaneError>>,
    delivered: Arc<AtomicBool>,
    backlog: Arc<AtomicUsize>,
    exhausted: bool,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
}

impl<T> ElementStream<T> {
    pub(super) fn new(
        receiver: mpsc::UnboundedReceiver<Result<T, LaneError>>,
        delivered: Arc<AtomicBool>,
        backlog: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            delivered,
            backlog,
            exhausted: false,
            cancel: cancel.clone(),
            _cancel_on_drop: cancel.drop_guard(),
        }
    }

    pub(crate) fn failed(err: LaneError) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(Err(err));
        Self::new(
            receiver,
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicUsize::new(0)),
            CancellationToken::new(),
        )
    }

    /// Receive the next element, or `None` once the stream is finished.
    pub async fn next_item(&mut self) -> Option<Result<T, LaneError>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Drain the stream into a vector, stopping at the first error.
    ///
    /// # Errors
    /// Returns the first error the producer reported.
    pub async fn try_collect_vec(mut self) -> Result<Vec<T>, LaneError> {
        let mut items = Vec::new();
        while let Some(item) = self.next_item().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl<T> Stream for ElementStream<T> {
    type Item = Result<T, LaneError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.exhausted {
            return Poll::Ready(None);
        }
        match ready!(this.receiver.poll_recv(cx)) {
            Some(item) => {
                if item.is_ok() {
                    this.backlog.fetch_sub(1, Ordering::AcqRel);
                }
                Poll::Ready(Some(item))
            }
            None => {
                this.exhausted = true;
                if this.delivered.load(Ordering::Acquire) {
                    Poll::Ready(None)
                } else if this.cancel.is_cancelled() {
                    Poll::Ready(Some(Err(LaneError::Cancelled)))
                } else {
                    Poll::Ready(Some(Err(LaneError::Disposed("connection"))))
                }
            }
        }
    }
}
