//! Serialized async access to `rusqlite`.
//!
//! A `SQLite` connection handle, and every statement and blob handle derived
//! from it, must only be used by one thread at a time. [`Connection`] moves the
//! handle onto a dedicated worker thread and turns every call into an operation
//! on a FIFO [`OperationQueue`](queue::OperationQueue): callers on any number of
//! tasks submit work, the worker runs it one operation at a time, and results
//! come back as futures or as [`RowStream`]s.
//!
//! ```rust,no_run
//! use sqlite_lane::prelude::*;
//!
//! # async fn demo() -> Result<(), LaneError> {
//! let conn = Connection::open(ConnectionOptions::new("app.db")).await?;
//! conn.execute_all("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, name TEXT)")
//!     .await?;
//! conn.execute("INSERT INTO t (name) VALUES (?1)", &[RowValues::Text("a".into())])
//!     .await?;
//! let rows = conn.query_all("SELECT id, name FROM t", &[]).await?;
//! assert_eq!(rows.len(), 1);
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod params;
pub mod prelude;
pub mod query;
pub mod queue;
pub mod results;
pub mod session;
pub mod statement;
pub mod stream;
pub mod types;

mod registry;

pub use blob::{BlobLocator, BlobStream};
pub use config::{ConnectionOptions, ConnectionOptionsBuilder, JournalMode};
pub use connection::Connection;
pub use error::LaneError;
pub use events::{
    EventStream, ProfileEvent, RollbackEvent, RowAction, RowUpdateEvent, TraceEvent,
};
pub use params::Params;
pub use registry::RegistryKey;
pub use results::{DbRow, ResultSet};
pub use session::Session;
pub use statement::Statement;
pub use stream::{RowQuery, RowStream};
pub use types::RowValues;

pub use rusqlite;
pub use tokio_util::sync::CancellationToken;
