use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use crate::error::LaneError;

/// Exclusive, time-boxed access to a queue's native resource.
///
/// The worker lends the resource to a fresh view for exactly one operation and
/// takes it back when the operation returns. Clones share the same slot, so a
/// view smuggled out of its operation (returned, stored, sent to another thread)
/// finds the slot empty and every call fails with [`LaneError::Disposed`].
pub struct ScopedView<R> {
    slot: Arc<Mutex<Option<R>>>,
    operation_id: u64,
}

impl<R> ScopedView<R> {
    pub(super) fn lend(resource: R, operation_id: u64) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(resource))),
            operation_id,
        }
    }

    /// Take the resource back, permanently invalidating this view and its clones.
    pub(super) fn reclaim(&self) -> Option<R> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Run `func` against the native resource.
    ///
    /// # Errors
    /// Returns [`LaneError::Disposed`] once the originating operation has returned,
    /// [`LaneError::Reentrant`] if called from inside another `with` on the same view,
    /// and otherwise whatever `func` returns.
    pub fn with<T, F>(&self, func: F) -> Result<T, LaneError>
    where
        F: FnOnce(&mut R) -> Result<T, LaneError>,
    {
        let mut guard = match self.slot.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(LaneError::Reentrant),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let resource = guard
            .as_mut()
            .ok_or(LaneError::Disposed("scoped view"))?;
        func(resource)
    }

    /// Whether the operation that created this view is still running.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self.slot.try_lock() {
            Ok(guard) => guard.is_some(),
            Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_some(),
        }
    }

    /// Sequence number of the operation this view was created for.
    #[must_use]
    pub fn operation_id(&self) -> u64 {
        self.operation_id
    }
}

impl<R> Clone for ScopedView<R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            operation_id: self.operation_id,
        }
    }
}

impl<R> fmt::Debug for ScopedView<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedView")
            .field("operation_id", &self.operation_id)
            .field("valid", &self.is_valid())
            .finish()
    }
}
