use tokio_util::sync::CancellationToken;

use crate::error::LaneError;

use super::view::ScopedView;

/// What the worker hands an operation when its turn comes up.
pub(super) enum Turn<R> {
    Run(ScopedView<R>),
    /// The operation never reaches native code; the job only reports the error.
    Skip(LaneError),
}

pub(super) type Job<R> = Box<dyn FnOnce(Turn<R>) + Send>;

pub(super) struct Operation<R> {
    pub(super) id: u64,
    pub(super) cancel: CancellationToken,
    pub(super) job: Job<R>,
}

pub(super) enum Command<R> {
    Run(Operation<R>),
    /// Sent exactly once, after the last accepted operation.
    Shutdown,
}
