use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::types::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::blob::BlobLocator;
use crate::error::LaneError;
use crate::events::EventHub;
use crate::queue::lock;
use crate::registry::{Registry, RegistryKey};

/// The native state serialized behind one connection's operation queue: the
/// `rusqlite` connection plus every statement and blob handle derived from it.
///
/// Only reachable through a [`ScopedView`](crate::queue::ScopedView) while an
/// operation is running.
pub struct Session {
    conn: rusqlite::Connection,
    statements: Registry<StatementEntry>,
    blobs: Registry<BlobEntry>,
    blob_watch: BlobWatch,
    progress_interval: Option<i32>,
}

pub(crate) struct StatementEntry {
    pub(crate) sql: Arc<str>,
    pub(crate) bindings: Vec<Option<Value>>,
}

pub(crate) struct BlobEntry {
    pub(crate) locator: BlobLocator,
    pub(crate) read_only: bool,
    expired: Arc<AtomicBool>,
}

/// Rows that have an open blob stream.
///
/// The connection's update hook reports every changed row here. Like a native
/// incremental blob handle, a stream expires once its row is updated or deleted,
/// even when the change touched another column.
#[derive(Clone, Default)]
pub(crate) struct BlobWatch {
    rows: Arc<Mutex<Vec<WatchedRow>>>,
}

struct WatchedRow {
    database: String,
    table: String,
    rowid: i64,
    expired: Arc<AtomicBool>,
}

impl BlobWatch {
    fn watch(&self, locator: &BlobLocator) -> Arc<AtomicBool> {
        let expired = Arc::new(AtomicBool::new(false));
        lock(&self.rows).push(WatchedRow {
            database: locator.database.clone(),
            table: locator.table.clone(),
            rowid: locator.rowid,
            expired: Arc::clone(&expired),
        });
        expired
    }

    fn unwatch(&self, expired: &Arc<AtomicBool>) {
        lock(&self.rows).retain(|row| !Arc::ptr_eq(&row.expired, expired));
    }

    fn clear(&self) {
        lock(&self.rows).clear();
    }

    pub(crate) fn row_changed(&self, database: &str, table: &str, rowid: i64) {
        for row in lock(&self.rows).iter() {
            if row.rowid == rowid
                && row.table.eq_ignore_ascii_case(table)
                && row.database.eq_ignore_ascii_case(database)
            {
                row.expired.store(true, Ordering::Release);
            }
        }
    }
}

fn blob_expired() -> LaneError {
    LaneError::SqliteError(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ABORT),
        Some("blob row was changed after the stream was opened".to_owned()),
    ))
}

/// What a freshly prepared statement reports back to its facade.
pub(crate) struct PreparedInfo {
    pub(crate) key: RegistryKey,
    pub(crate) parameter_names: Vec<Option<String>>,
    pub(crate) column_names: Vec<String>,
}

impl Session {
    pub(crate) fn new(conn: rusqlite::Connection, progress_interval: Option<i32>) -> Self {
        Self {
            conn,
            statements: Registry::default(),
            blobs: Registry::default(),
            blob_watch: BlobWatch::default(),
            progress_interval,
        }
    }

    /// The underlying `rusqlite` connection.
    pub fn connection(&mut self) -> &mut rusqlite::Connection {
        &mut self.conn
    }

    pub(crate) fn blob_watch(&self) -> BlobWatch {
        self.blob_watch.clone()
    }

    /// Number of statements prepared through this session and not yet closed.
    #[must_use]
    pub fn open_statements(&self) -> usize {
        self.statements.len()
    }

    /// Number of blob streams opened through this session and not yet closed.
    #[must_use]
    pub fn open_blobs(&self) -> usize {
        self.blobs.len()
    }

    /// Run `func` with the native progress handler wired to `cancel`, so a long
    /// native call aborts between virtual machine steps once the token fires.
    pub(crate) fn interruptible<T>(
        &mut self,
        cancel: &CancellationToken,
        func: impl FnOnce(&mut Self) -> Result<T, LaneError>,
    ) -> Result<T, LaneError> {
        let Some(interval) = self.progress_interval else {
            return func(self);
        };
        let token = AssertUnwindSafe(cancel.clone());
        self.conn
            .progress_handler(interval, Some(move || token.is_cancelled()));
        let result = panic::catch_unwind(AssertUnwindSafe(|| func(&mut *self)));
        self.conn.progress_handler(interval, None::<fn() -> bool>);
        let result = result.unwrap_or_else(|payload| panic::resume_unwind(payload));
        result.map_err(|err| match err {
            LaneError::SqliteError(native) => {
                LaneError::from_interruptible(native, cancel.is_cancelled())
            }
            other => other,
        })
    }

    pub(crate) fn prepare_statement(&mut self, sql: &str) -> Result<PreparedInfo, LaneError> {
        let (parameter_names, column_names) = {
            let stmt = self.conn.prepare_cached(sql)?;
            let parameter_names = (1..=stmt.parameter_count())
                .map(|idx| stmt.parameter_name(idx).map(str::to_owned))
                .collect::<Vec<_>>();
            let column_names = stmt
                .column_names()
                .iter()
                .map(std::string::ToString::to_string)
                .collect::<Vec<_>>();
            (parameter_names, column_names)
        };
        let key = self.statements.insert(StatementEntry {
            sql: Arc::from(sql),
            bindings: vec![None; parameter_names.len()],
        })?;
        Ok(PreparedInfo {
            key,
            parameter_names,
            column_names,
        })
    }

    pub(crate) fn statement_mut(
        &mut self,
        key: RegistryKey,
    ) -> Result<&mut StatementEntry, LaneError> {
        self.statements
            .get_mut(key)
            .ok_or(LaneError::Disposed("statement"))
    }

    pub(crate) fn close_statement(&mut self, key: RegistryKey) -> bool {
        self.statements.remove(key).is_some()
    }

    /// Execute a registered statement with its stored bindings.
    pub(crate) fn with_statement<T>(
        &mut self,
        key: RegistryKey,
        func: impl FnOnce(&mut rusqlite::Statement<'_>, &[Option<Value>]) -> Result<T, LaneError>,
    ) -> Result<T, LaneError> {
        let entry = self
            .statements
            .get(key)
            .ok_or(LaneError::Disposed("statement"))?;
        let mut stmt = self.conn.prepare_cached(&entry.sql)?;
        func(&mut stmt, &entry.bindings)
    }

    /// Open the blob once to validate the locator and learn its length.
    pub(crate) fn register_blob(
        &mut self,
        locator: BlobLocator,
        writable: bool,
    ) -> Result<(RegistryKey, u64), LaneError> {
        let len = {
            let blob = self.conn.blob_open(
                locator.database.as_str(),
                locator.table.as_str(),
                locator.column.as_str(),
                locator.rowid,
                !writable,
            )?;
            blob.len()
        };
        let expired = self.blob_watch.watch(&locator);
        let key = match self.blobs.insert(BlobEntry {
            locator,
            read_only: !writable,
            expired: Arc::clone(&expired),
        }) {
            Ok(key) => key,
            Err(err) => {
                self.blob_watch.unwatch(&expired);
                return Err(err);
            }
        };
        Ok((key, len as u64))
    }

    pub(crate) fn with_blob<T>(
        &mut self,
        key: RegistryKey,
        func: impl FnOnce(&mut rusqlite::blob::Blob<'_>) -> Result<T, LaneError>,
    ) -> Result<T, LaneError> {
        let entry = self.blobs.get(key).ok_or(LaneError::Disposed("blob stream"))?;
        if entry.expired.load(Ordering::Acquire) {
            return Err(blob_expired());
        }
        let mut blob = self.conn.blob_open(
            entry.locator.database.as_str(),
            entry.locator.table.as_str(),
            entry.locator.column.as_str(),
            entry.locator.rowid,
            entry.read_only,
        )?;
        func(&mut blob)
    }

    pub(crate) fn close_blob(&mut self, key: RegistryKey) -> bool {
        match self.blobs.remove(key) {
            Some(entry) => {
                self.blob_watch.unwatch(&entry.expired);
                true
            }
            None => false,
        }
    }

    /// Final step on the worker: close every derived handle, then the connection.
    pub(crate) fn release(mut self) -> Result<(), LaneError> {
        let statements = self.statements.clear();
        let blobs = self.blobs.clear();
        self.blob_watch.clear();
        if statements > 0 || blobs > 0 {
            debug!(statements, blobs, "closing handles still open at connection shutdown");
        }
        EventHub::uninstall(&mut self.conn);
        self.conn.flush_prepared_statement_cache();
        self.conn.close().map_err(|(_, err)| LaneError::CloseError(err))
    }
}
