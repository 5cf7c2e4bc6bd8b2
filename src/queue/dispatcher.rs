use std::sync::Arc;
use std::sync::mpsc::Receiver;

use tracing::{debug, trace, warn};

use crate::error::LaneError;

use super::channel::{Command, Operation, Turn};
use super::manager::QueueShared;
use super::view::ScopedView;
use super::{lock, panic_message};

pub(super) fn run_queue_worker<R, F>(
    resource: R,
    receiver: &Receiver<Command<R>>,
    release: F,
    shared: &Arc<QueueShared>,
) where
    F: FnOnce(R) -> Result<(), LaneError>,
{
    debug!(queue = %shared.name, "operation queue worker started");
    let mut resource = Some(resource);
    let mut completed: u64 = 0;

    // A dropped sender ends the loop too; queued commands are still yielded first.
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Shutdown => break,
            Command::Run(operation) => {
                run_operation(&mut resource, operation);
                completed += 1;
            }
        }
    }

    let outcome = match resource.take() {
        Some(resource) => {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| release(resource)))
                .unwrap_or_else(|payload| Err(LaneError::OperationPanicked(panic_message(&*payload))))
        }
        None => Err(LaneError::Disposed("operation queue resource")),
    };
    match &outcome {
        Ok(()) => debug!(queue = %shared.name, completed, "operation queue drained and released"),
        Err(err) => warn!(queue = %shared.name, completed, error = %err, "releasing queue resource failed"),
    }
    *lock(&shared.release_result) = Some(outcome);
    shared.drained.cancel();
}

fn run_operation<R>(resource: &mut Option<R>, operation: Operation<R>) {
    let Operation { id, cancel, job } = operation;
    if cancel.is_cancelled() {
        trace!(operation = id, "skipping operation cancelled before start");
        job(Turn::Skip(LaneError::Cancelled));
        return;
    }
    let Some(lent) = resource.take() else {
        job(Turn::Skip(LaneError::Disposed("operation queue resource")));
        return;
    };

    trace!(operation = id, "running operation");
    let view = ScopedView::lend(lent, id);
    job(Turn::Run(view.clone()));
    *resource = view.reclaim();
    if resource.is_none() {
        warn!(operation = id, "queue resource was not returned by its view");
    }
}
