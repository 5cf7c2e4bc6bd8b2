use tokio_util::sync::CancellationToken;

use crate::error::LaneError;
use crate::params::Params;
use crate::query::bind_positional;
use crate::types::RowValues;

use super::Connection;

impl Connection {
    /// Execute one statement that returns no rows and report the rows changed.
    ///
    /// # Errors
    /// Returns `LaneError` if preparing, binding or executing the statement fails.
    pub async fn execute(&self, query: &str, params: &[RowValues]) -> Result<usize, LaneError> {
        self.execute_cancellable(query, params, &CancellationToken::new())
            .await
    }

    /// # Errors
    /// See [`execute`](Self::execute); also `Cancelled`.
    pub async fn execute_cancellable(
        &self,
        query: &str,
        params: &[RowValues],
        cancel: &CancellationToken,
    ) -> Result<usize, LaneError> {
        let sql_owned = query.to_owned();
        let params_owned = Params::convert(params);
        self.queue
            .submit(cancel, move |view, token| {
                view.with(|session| {
                    session.interruptible(token, |session| {
                        let mut stmt = session.connection().prepare_cached(&sql_owned)?;
                        bind_positional(&mut stmt, params_owned.as_values())?;
                        Ok(stmt.raw_execute()?)
                    })
                })
            })
            .await
    }

    /// Execute a batch of `;`-separated statements without parameters.
    ///
    /// # Errors
    /// Returns `LaneError` if any statement in the batch fails; earlier statements
    /// stay applied unless the batch manages its own transaction.
    pub async fn execute_all(&self, query: &str) -> Result<(), LaneError> {
        self.execute_all_cancellable(query, &CancellationToken::new())
            .await
    }

    /// # Errors
    /// See [`execute_all`](Self::execute_all); also `Cancelled`.
    pub async fn execute_all_cancellable(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<(), LaneError> {
        let sql_owned = query.to_owned();
        self.queue
            .submit(cancel, move |view, token| {
                view.with(|session| {
                    session.interruptible(token, |session| {
                        Ok(session.connection().execute_batch(&sql_owned)?)
                    })
                })
            })
            .await
    }

    /// Rowid of the most recent successful insert on this connection.
    ///
    /// # Errors
    /// `Disposed` once the connection is closed.
    pub async fn last_insert_rowid(&self) -> Result<i64, LaneError> {
        self.with_connection(|conn| Ok(conn.last_insert_rowid()))
            .await
    }

    /// Rows changed by the most recent statement on this connection.
    ///
    /// # Errors
    /// `Disposed` once the connection is closed.
    pub async fn changes(&self) -> Result<u64, LaneError> {
        self.with_connection(|conn| Ok(conn.changes() as u64)).await
    }
}
