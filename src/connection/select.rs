use std::sync::Arc;

use crate::error::LaneError;
use crate::params::Params;
use crate::results::ResultSet;
use crate::stream::RowQuery;
use crate::types::RowValues;

use super::Connection;

impl Connection {
    /// Define a cold row query. Nothing runs until the query is subscribed, and
    /// each subscription executes the SQL again.
    #[must_use]
    pub fn query(&self, query: &str, params: &[RowValues]) -> RowQuery {
        RowQuery::from_sql(
            self.queue.clone(),
            Arc::from(query),
            Params::convert(params).0,
            self.options.stream_backlog,
        )
    }

    /// Execute a SELECT and materialize into a `ResultSet`.
    ///
    /// # Errors
    /// Returns `LaneError` if preparing or executing the query fails.
    pub async fn query_all(
        &self,
        query: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, LaneError> {
        self.query(query, params).collect().await
    }
}
