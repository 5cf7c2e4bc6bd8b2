use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::blob::{BlobLocator, BlobStream};
use crate::error::LaneError;
use crate::statement::Statement;

use super::Connection;

impl Connection {
    /// Compile `query` once and keep it open for repeated execution.
    ///
    /// # Errors
    /// Returns `LaneError` if the SQL does not compile.
    pub async fn prepare(&self, query: &str) -> Result<Statement, LaneError> {
        self.prepare_cancellable(query, &CancellationToken::new())
            .await
    }

    /// # Errors
    /// See [`prepare`](Self::prepare); also `Cancelled`.
    pub async fn prepare_cancellable(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Statement, LaneError> {
        let sql: Arc<str> = Arc::from(query);
        let sql_owned = Arc::clone(&sql);
        let info = self
            .queue
            .submit(cancel, move |view, _| {
                view.with(|session| session.prepare_statement(&sql_owned))
            })
            .await?;
        Ok(Statement::new(
            self.queue.clone(),
            sql,
            info,
            self.options.stream_backlog,
        ))
    }

    /// Open incremental I/O on one BLOB cell.
    ///
    /// # Errors
    /// Returns the native error if the cell does not exist, or if `writable` is
    /// requested on a read-only connection.
    pub async fn open_blob(
        &self,
        locator: BlobLocator,
        writable: bool,
    ) -> Result<BlobStream, LaneError> {
        self.open_blob_cancellable(locator, writable, &CancellationToken::new())
            .await
    }

    /// # Errors
    /// See [`open_blob`](Self::open_blob); also `Cancelled`.
    pub async fn open_blob_cancellable(
        &self,
        locator: BlobLocator,
        writable: bool,
        cancel: &CancellationToken,
    ) -> Result<BlobStream, LaneError> {
        let registered = locator.clone();
        let (key, len) = self
            .queue
            .submit(cancel, move |view, _| {
                view.with(|session| session.register_blob(registered, writable))
            })
            .await?;
        Ok(BlobStream::new(
            self.queue.clone(),
            key,
            locator,
            len,
            writable,
        ))
    }
}
