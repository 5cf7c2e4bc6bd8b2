use std::path::PathBuf;
use std::time::Duration;

use rusqlite::OpenFlags;
use serde::Deserialize;

use crate::connection::Connection;
use crate::error::LaneError;

/// `SQLite` journal modes that can be applied when a connection opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    Wal,
    Off,
}

impl JournalMode {
    #[must_use]
    pub fn as_pragma_value(self) -> &'static str {
        match self {
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::Persist => "PERSIST",
            JournalMode::Memory => "MEMORY",
            JournalMode::Wal => "WAL",
            JournalMode::Off => "OFF",
        }
    }
}

/// Options for opening a [`Connection`].
///
/// Deserializable so the options can live in an application's own config file:
///
/// ```rust
/// let opts: sqlite_lane::ConnectionOptions =
///     serde_json::from_str(r#"{ "db_path": "app.db", "journal_mode": "wal" }"#).unwrap();
/// assert_eq!(opts.stream_backlog, None);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Database file path; `:memory:` opens a private in-memory database.
    pub db_path: String,
    pub read_only: bool,
    pub create_if_missing: bool,
    pub journal_mode: Option<JournalMode>,
    /// Milliseconds to wait on a locked database before failing with `SQLITE_BUSY`.
    pub busy_timeout_ms: Option<u64>,
    /// Unread rows a stream subscriber may fall behind before its stream fails with
    /// [`LaneError::StreamBacklog`]. `None` never cuts a stream off.
    pub stream_backlog: Option<usize>,
    /// Virtual machine steps between cancellation polls inside one native call.
    /// `None` disables the native hook; cancellation is then only checked
    /// before an operation starts and between rows.
    pub progress_interval: Option<i32>,
    pub statement_cache_capacity: usize,
    /// Capacity of each lifecycle event channel (trace, profile, row update, rollback).
    pub event_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_owned(),
            read_only: false,
            create_if_missing: true,
            journal_mode: None,
            busy_timeout_ms: Some(5_000),
            stream_backlog: None,
            progress_interval: Some(1_000),
            statement_cache_capacity: 32,
            event_capacity: 256,
        }
    }
}

impl ConnectionOptions {
    #[must_use]
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub(crate) fn validate(&self) -> Result<(), LaneError> {
        if self.db_path.is_empty() {
            return Err(LaneError::ConfigError("db_path must not be empty".into()));
        }
        if self.stream_backlog == Some(0) {
            return Err(LaneError::ConfigError("stream_backlog must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(LaneError::ConfigError("event_capacity must be at least 1".into()));
        }
        if matches!(self.progress_interval, Some(steps) if steps <= 0) {
            return Err(LaneError::ConfigError(
                "progress_interval must be positive".into(),
            ));
        }
        if self.read_only && self.journal_mode == Some(JournalMode::Wal) {
            return Err(LaneError::ConfigError(
                "journal_mode = wal cannot be applied to a read-only connection".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn open_flags(&self) -> OpenFlags {
        let mut flags = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if self.read_only {
            flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
        } else {
            flags |= OpenFlags::SQLITE_OPEN_READ_WRITE;
            if self.create_if_missing {
                flags |= OpenFlags::SQLITE_OPEN_CREATE;
            }
        }
        flags
    }

    pub(crate) fn path(&self) -> PathBuf {
        PathBuf::from(&self.db_path)
    }

    pub(crate) fn busy_timeout(&self) -> Option<Duration> {
        self.busy_timeout_ms.map(Duration::from_millis)
    }
}

/// Fluent builder for [`ConnectionOptions`].
#[derive(Debug, Clone)]
pub struct ConnectionOptionsBuilder {
    opts: ConnectionOptions,
}

impl ConnectionOptionsBuilder {
    #[must_use]
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            opts: ConnectionOptions::new(db_path),
        }
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.opts.read_only = read_only;
        self
    }

    #[must_use]
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.opts.create_if_missing = create;
        self
    }

    #[must_use]
    pub fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.opts.journal_mode = Some(mode);
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.opts.busy_timeout_ms =
            timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn stream_backlog(mut self, rows: Option<usize>) -> Self {
        self.opts.stream_backlog = rows;
        self
    }

    #[must_use]
    pub fn progress_interval(mut self, steps: Option<i32>) -> Self {
        self.opts.progress_interval = steps;
        self
    }

    #[must_use]
    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.opts.statement_cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.opts.event_capacity = capacity;
        self
    }

    #[must_use]
    pub fn finish(self) -> ConnectionOptions {
        self.opts
    }

    /// Open a [`Connection`] with these options.
    ///
    /// # Errors
    ///
    /// Returns `LaneError` if the options are invalid or the database cannot be opened.
    pub async fn open(self) -> Result<Connection, LaneError> {
        Connection::open(self.finish()).await
    }
}
