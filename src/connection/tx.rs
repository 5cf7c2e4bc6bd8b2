use std::thread;
use std::time::Duration;

use rusqlite::{DropBehavior, TransactionBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::LaneError;

use super::Connection;

const ROLLBACK_BUSY_RETRIES: &[Duration] =
    &[Duration::from_millis(10), Duration::from_millis(25), Duration::from_millis(50)];

/// Roll back an open transaction, retrying while another connection holds the lock.
pub(crate) fn rollback_with_busy_retries(conn: &rusqlite::Connection) -> Result<(), LaneError> {
    for (idx, delay) in ROLLBACK_BUSY_RETRIES.iter().copied().enumerate() {
        match conn.execute_batch("ROLLBACK") {
            Ok(()) => return Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    && idx + 1 < ROLLBACK_BUSY_RETRIES.len() =>
            {
                thread::sleep(delay);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(LaneError::ConnectionError("rollback retries exhausted".into()))
}

impl Connection {
    /// Run `func` inside a deferred transaction, as a single queued operation.
    ///
    /// Commits when `func` succeeds and rolls back when it fails. No other
    /// operation on this connection can interleave with the transaction.
    ///
    /// # Errors
    /// Returns the error from `func`, or the native error from BEGIN/COMMIT.
    pub async fn transaction<F, T>(&self, func: F) -> Result<T, LaneError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, LaneError> + Send + 'static,
        T: Send + 'static,
    {
        self.transaction_with_behavior(TransactionBehavior::Deferred, &CancellationToken::new(), func)
            .await
    }

    /// # Errors
    /// See [`transaction`](Self::transaction); also `Cancelled`.
    pub async fn transaction_with_behavior<F, T>(
        &self,
        behavior: TransactionBehavior,
        cancel: &CancellationToken,
        func: F,
    ) -> Result<T, LaneError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, LaneError> + Send + 'static,
        T: Send + 'static,
    {
        self.queue
            .submit(cancel, move |view, token| {
                view.with(|session| {
                    session.interruptible(token, |session| {
                        let conn = session.connection();
                        let outcome = {
                            let mut tx = conn.transaction_with_behavior(behavior)?;
                            tx.set_drop_behavior(DropBehavior::Ignore);
                            match func(&tx) {
                                Ok(value) => tx.commit().map(|()| value).map_err(LaneError::from),
                                Err(err) => Err(err),
                            }
                        };
                        if outcome.is_err() && !conn.is_autocommit() {
                            if let Err(rollback_err) = rollback_with_busy_retries(conn) {
                                warn!(error = %rollback_err, "transaction rollback failed");
                            }
                        }
                        outcome
                    })
                })
            })
            .await
    }
}
