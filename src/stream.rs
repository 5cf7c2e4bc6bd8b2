use std::sync::Arc;

use rusqlite::types::Value;
use tokio_util::sync::CancellationToken;

use crate::error::LaneError;
use crate::query::{bind_all, bind_positional, stream_bound_rows};
use crate::queue::{ElementStream, OperationQueue};
use crate::registry::RegistryKey;
use crate::results::{DbRow, ResultSet};
use crate::session::Session;

/// Rows of one query execution, delivered as they are stepped on the worker.
pub type RowStream = ElementStream<DbRow>;

#[derive(Clone)]
enum RowSource {
    Sql { sql: Arc<str>, params: Arc<Vec<Value>> },
    Statement { key: RegistryKey },
}

/// A cold query definition.
///
/// Nothing runs until [`subscribe`](Self::subscribe) is called, and every
/// subscription queues its own independent execution on the connection's lane.
/// Results are never shared between subscriptions.
#[derive(Clone)]
pub struct RowQuery {
    queue: OperationQueue<Session>,
    source: RowSource,
    backlog: Option<usize>,
}

impl RowQuery {
    pub(crate) fn from_sql(
        queue: OperationQueue<Session>,
        sql: Arc<str>,
        params: Vec<Value>,
        backlog: Option<usize>,
    ) -> Self {
        Self {
            queue,
            source: RowSource::Sql {
                sql,
                params: Arc::new(params),
            },
            backlog,
        }
    }

    pub(crate) fn from_statement(
        queue: OperationQueue<Session>,
        key: RegistryKey,
        backlog: Option<usize>,
    ) -> Self {
        Self {
            queue,
            source: RowSource::Statement { key },
            backlog,
        }
    }

    /// Start a new execution.
    pub fn subscribe(&self) -> RowStream {
        self.subscribe_cancellable(&CancellationToken::new())
    }

    /// Start a new execution that stops at the next checkpoint once `cancel` fires.
    pub fn subscribe_cancellable(&self, cancel: &CancellationToken) -> RowStream {
        let source = self.source.clone();
        self.queue
            .submit_streaming(cancel, self.backlog, move |view, sink| {
                let token = sink.token().clone();
                view.with(|session| {
                    session.interruptible(&token, |session| match &source {
                        RowSource::Sql { sql, params } => {
                            let mut stmt = session.connection().prepare_cached(sql)?;
                            bind_positional(&mut stmt, params)?;
                            stream_bound_rows(&mut stmt, sink)
                        }
                        RowSource::Statement { key } => {
                            session.with_statement(*key, |stmt, bindings| {
                                bind_all(stmt, bindings)?;
                                stream_bound_rows(stmt, sink)
                            })
                        }
                    })
                })
            })
    }

    /// Run one execution and materialise every row.
    ///
    /// # Errors
    /// Returns the first error reported by the execution.
    pub async fn collect(&self) -> Result<ResultSet, LaneError> {
        let rows = self.subscribe().try_collect_vec().await?;
        let mut result_set = ResultSet::with_capacity(rows.len());
        for row in rows {
            result_set.add_row(row);
        }
        Ok(result_set)
    }
}
