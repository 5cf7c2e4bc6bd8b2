//! Convenient imports for common functionality.

pub use crate::blob::{BlobLocator, BlobStream};
pub use crate::config::{ConnectionOptions, ConnectionOptionsBuilder, JournalMode};
pub use crate::connection::Connection;
pub use crate::error::LaneError;
pub use crate::queue::{ElementSink, ElementStream, OperationHandle, OperationQueue, ScopedView};
pub use crate::results::{DbRow, ResultSet};
pub use crate::statement::Statement;
pub use crate::stream::{RowQuery, RowStream};
pub use crate::types::RowValues;

pub use tokio_util::sync::CancellationToken;
