// Operation queue - serializes all work against one native resource
//
// - channel: command and operation types crossing into the worker
// - dispatcher: the worker loop
// - manager: `OperationQueue`, submission and two-phase shutdown
// - handle: futures and streams handed back to callers
// - view: `ScopedView`, the per-operation borrow of the resource

mod channel;
mod dispatcher;
mod handle;
mod manager;
mod view;

use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use handle::{ElementSink, ElementStream, OperationHandle};
pub use manager::OperationQueue;
pub use view::ScopedView;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::LaneError;

    fn counter_queue() -> OperationQueue<Vec<u32>> {
        OperationQueue::spawn("test-queue", Vec::new(), |_| Ok(())).unwrap()
    }

    #[tokio::test]
    async fn failed_operation_does_not_stop_the_worker() {
        let queue = counter_queue();
        let failing = queue.submit(&CancellationToken::new(), |_, _| -> Result<(), _> {
            Err(LaneError::ArgumentError("boom".into()))
        });
        let next = queue.submit(&CancellationToken::new(), |view, _| {
            view.with(|items| {
                items.push(7);
                Ok(items.len())
            })
        });
        assert!(matches!(failing.await, Err(LaneError::ArgumentError(_))));
        assert_eq!(next.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn panicking_operation_is_reported_and_resource_survives() {
        let queue = counter_queue();
        let panicked = queue.submit(&CancellationToken::new(), |view, _| -> Result<(), _> {
            view.with(|items| {
                items.push(1);
                panic!("callback exploded");
            })
        });
        let err = panicked.await.unwrap_err();
        assert!(matches!(err, LaneError::OperationPanicked(ref msg) if msg.contains("exploded")));

        let len = queue
            .submit(&CancellationToken::new(), |view, _| view.with(|items| Ok(items.len())))
            .await
            .unwrap();
        assert_eq!(len, 1);
    }

    #[tokio::test]
    async fn nested_with_is_rejected_as_reentrant() {
        let queue = counter_queue();
        let result = queue
            .submit(&CancellationToken::new(), |view, _| {
                view.with(|_| view.with(|_| Ok(())))
            })
            .await;
        assert!(matches!(result, Err(LaneError::Reentrant)));
    }

    #[tokio::test]
    async fn release_runs_once_after_drain() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let queue = OperationQueue::spawn("release-queue", 0_u32, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LaneError::ConnectionError("close failed".into()))
        })
        .unwrap();

        assert!(queue.begin_shutdown());
        assert!(!queue.begin_shutdown());
        let first = queue.shutdown().await;
        let second = queue.shutdown().await;
        assert!(matches!(first, Err(LaneError::ConnectionError(_))));
        assert!(second.is_ok());
        assert!(queue.is_drained());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_message_handles_both_payload_kinds() {
        let borrowed: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(&*borrowed), "static");
        assert_eq!(panic_message(&*owned), "owned");
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }
}
