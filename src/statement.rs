use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::LaneError;
use crate::params::row_value_to_sqlite_value;
use crate::query::bind_all;
use crate::queue::OperationQueue;
use crate::registry::RegistryKey;
use crate::results::ResultSet;
use crate::session::{PreparedInfo, Session};
use crate::stream::RowQuery;
use crate::types::RowValues;

/// A prepared statement compiled on a connection's lane.
///
/// Every call is queued on the parent connection's operation queue, so a
/// statement never runs concurrently with other work on that connection.
/// Bindings live with the native handle and persist between executions until
/// replaced or cleared.
///
/// Close statements before closing their connection. If the connection closes
/// first, it closes the statement along with itself and every later call here
/// fails with [`LaneError::Disposed`].
pub struct Statement {
    key: RegistryKey,
    queue: OperationQueue<Session>,
    sql: Arc<str>,
    parameter_names: Vec<Option<String>>,
    column_names: Vec<String>,
    stream_backlog: Option<usize>,
    closed: bool,
}

impl Statement {
    pub(crate) fn new(
        queue: OperationQueue<Session>,
        sql: Arc<str>,
        info: PreparedInfo,
        stream_backlog: Option<usize>,
    ) -> Self {
        Self {
            key: info.key,
            queue,
            sql,
            parameter_names: info.parameter_names,
            column_names: info.column_names,
            stream_backlog,
            closed: false,
        }
    }

    /// Access the raw SQL string of the prepared statement.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.parameter_names.len()
    }

    /// Parameter name at a 1-based index, if the parameter is named.
    #[must_use]
    pub fn parameter_name(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|idx| self.parameter_names.get(idx))
            .and_then(|name| name.as_deref())
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed || self.queue.is_closed()
    }

    /// Replace the bindings, positionally from parameter 1. Parameters beyond
    /// `params.len()` are left unbound (NULL).
    ///
    /// # Errors
    /// [`LaneError::ArgumentError`] if more values than parameters are supplied;
    /// [`LaneError::Disposed`] once the statement or its connection is closed.
    pub async fn bind(&self, params: &[RowValues]) -> Result<(), LaneError> {
        self.ensure_open()?;
        if params.len() > self.parameter_count() {
            return Err(LaneError::ArgumentError(format!(
                "statement takes {} parameters but {} were supplied",
                self.parameter_count(),
                params.len()
            )));
        }
        let mut values: Vec<_> = params
            .iter()
            .map(|p| Some(row_value_to_sqlite_value(p)))
            .collect();
        values.resize(self.parameter_count(), None);
        let key = self.key;
        self.queue
            .submit(&CancellationToken::new(), move |view, _| {
                view.with(|session| {
                    session.statement_mut(key)?.bindings = values;
                    Ok(())
                })
            })
            .await
    }

    /// Set individual parameters by name (`:id`, `@id`, `$id`, or bare `id`),
    /// keeping the other bindings.
    ///
    /// # Errors
    /// [`LaneError::ArgumentError`] for a name the statement does not declare.
    pub async fn bind_named(&self, params: &[(&str, RowValues)]) -> Result<(), LaneError> {
        self.ensure_open()?;
        let mut resolved = Vec::with_capacity(params.len());
        for (name, value) in params {
            let idx = self.resolve_name(name).ok_or_else(|| {
                LaneError::ArgumentError(format!("statement has no parameter named {name}"))
            })?;
            resolved.push((idx, row_value_to_sqlite_value(value)));
        }
        let key = self.key;
        self.queue
            .submit(&CancellationToken::new(), move |view, _| {
                view.with(|session| {
                    let entry = session.statement_mut(key)?;
                    for (idx, value) in resolved {
                        entry.bindings[idx] = Some(value);
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Reset every parameter to NULL.
    ///
    /// # Errors
    /// [`LaneError::Disposed`] once the statement or its connection is closed.
    pub async fn clear_bindings(&self) -> Result<(), LaneError> {
        self.ensure_open()?;
        let key = self.key;
        self.queue
            .submit(&CancellationToken::new(), move |view, _| {
                view.with(|session| {
                    session
                        .statement_mut(key)?
                        .bindings
                        .iter_mut()
                        .for_each(|slot| *slot = None);
                    Ok(())
                })
            })
            .await
    }

    /// Cold row query over the current bindings; each subscription re-executes.
    ///
    /// Bindings are read when the execution reaches the front of the queue, not
    /// when this method is called.
    #[must_use]
    pub fn query(&self) -> RowQuery {
        RowQuery::from_statement(self.queue.clone(), self.key, self.stream_backlog)
    }

    /// Execute once and materialise every row.
    ///
    /// # Errors
    /// Propagates native errors and [`LaneError::Disposed`].
    pub async fn query_all(&self) -> Result<ResultSet, LaneError> {
        self.ensure_open()?;
        self.query().collect().await
    }

    /// Execute a statement that returns no rows and report the number of rows changed.
    ///
    /// # Errors
    /// Propagates native errors, [`LaneError::Cancelled`], and [`LaneError::Disposed`].
    pub async fn execute(&self) -> Result<usize, LaneError> {
        self.execute_cancellable(&CancellationToken::new()).await
    }

    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn execute_cancellable(&self, cancel: &CancellationToken) -> Result<usize, LaneError> {
        self.ensure_open()?;
        let key = self.key;
        self.queue
            .submit(cancel, move |view, token| {
                view.with(|session| {
                    session.interruptible(token, |session| {
                        session.with_statement(key, |stmt, bindings| {
                            bind_all(stmt, bindings)?;
                            Ok(stmt.raw_execute()?)
                        })
                    })
                })
            })
            .await
    }

    /// Close the native statement through the connection's queue.
    ///
    /// Closing twice, or after the connection already closed, is a no-op.
    ///
    /// # Errors
    /// Reserved for failures reaching the worker.
    pub async fn close(&mut self) -> Result<(), LaneError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let key = self.key;
        match self
            .queue
            .submit(&CancellationToken::new(), move |view, _| {
                view.with(|session| Ok(session.close_statement(key)))
            })
            .await
        {
            Ok(_) | Err(LaneError::Disposed(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn ensure_open(&self) -> Result<(), LaneError> {
        if self.closed {
            Err(LaneError::Disposed("statement"))
        } else {
            Ok(())
        }
    }

    fn resolve_name(&self, name: &str) -> Option<usize> {
        let matches = |declared: &str| {
            declared == name
                || declared
                    .strip_prefix([':', '@', '$'])
                    .is_some_and(|bare| bare == name)
        };
        self.parameter_names
            .iter()
            .position(|declared| declared.as_deref().is_some_and(matches))
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let key = self.key;
        // Best effort: nobody observes the outcome, and a closed queue already
        // released the statement.
        if self
            .queue
            .try_submit(&CancellationToken::new(), move |view, _| {
                view.with(|session| Ok(session.close_statement(key)))
            })
            .is_ok()
        {
            trace!(sql = %self.sql, "statement dropped without close; close queued");
        }
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("parameters", &self.parameter_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
