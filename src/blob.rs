use std::fmt;
use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::LaneError;
use crate::queue::{OperationHandle, OperationQueue};
use crate::registry::RegistryKey;
use crate::session::Session;

/// Address of one BLOB cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocator {
    /// Schema name: `main`, `temp`, or the alias of an attached database.
    pub database: String,
    pub table: String,
    pub column: String,
    pub rowid: i64,
}

impl BlobLocator {
    /// Locate a cell in the `main` schema.
    #[must_use]
    pub fn new(table: impl Into<String>, column: impl Into<String>, rowid: i64) -> Self {
        Self {
            database: "main".to_string(),
            table: table.into(),
            column: column.into(),
            rowid,
        }
    }

    #[must_use]
    pub fn in_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }
}

enum Pending {
    Idle,
    Read(OperationHandle<Vec<u8>>),
    Write(OperationHandle<usize>),
    Flush(OperationHandle<()>),
    Seek(OperationHandle<u64>, SeekFrom),
}

/// Incremental I/O over one BLOB cell.
///
/// Every read, write, seek and flush is an operation on the parent connection's
/// queue. The length of a BLOB cannot change through incremental I/O, so writes
/// must fit inside the existing value; grow it with `zeroblob()` first.
///
/// The async-trait implementations ([`AsyncRead`], [`AsyncWrite`], [`AsyncSeek`])
/// allow one outstanding operation at a time.
pub struct BlobStream {
    key: RegistryKey,
    queue: OperationQueue<Session>,
    locator: BlobLocator,
    len: u64,
    position: u64,
    writable: bool,
    closed: bool,
    pending: Pending,
}

impl BlobStream {
    pub(crate) fn new(
        queue: OperationQueue<Session>,
        key: RegistryKey,
        locator: BlobLocator,
        len: u64,
        writable: bool,
    ) -> Self {
        Self {
            key,
            queue,
            locator,
            len,
            position: 0,
            writable,
            closed: false,
            pending: Pending::Idle,
        }
    }

    #[must_use]
    pub fn locator(&self) -> &BlobLocator {
        &self.locator
    }

    /// Length of the BLOB in bytes, as of the last open or seek.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the cursor without a round trip through the queue.
    ///
    /// # Errors
    /// [`LaneError::ArgumentError`] if `position` lies beyond the end of the BLOB.
    pub fn set_position(&mut self, position: u64) -> Result<(), LaneError> {
        self.ensure_open()?;
        if position > self.len {
            return Err(past_end(position, self.len));
        }
        self.position = position;
        Ok(())
    }

    /// Whether the BLOB was opened read-write. Unaffected by closing; see
    /// [`is_closed`](Self::is_closed).
    #[must_use]
    pub fn can_write(&self) -> bool {
        self.writable
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed || self.queue.is_closed()
    }

    /// Read up to `buf.len()` bytes at the cursor and advance it.
    ///
    /// Returns 0 at the end of the BLOB.
    ///
    /// # Errors
    /// [`LaneError::Cancelled`], [`LaneError::Disposed`], or the native error.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LaneError> {
        self.read_cancellable(buf, &CancellationToken::new()).await
    }

    /// # Errors
    /// See [`read`](Self::read).
    pub async fn read_cancellable(
        &mut self,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize, LaneError> {
        self.ensure_open()?;
        let want = self.readable(buf.len());
        if want == 0 {
            return Ok(0);
        }
        let bytes = self.submit_read(want, cancel)?.await?;
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        self.position += n as u64;
        Ok(n)
    }

    /// Write all of `data` at the cursor and advance it.
    ///
    /// # Errors
    /// [`LaneError::ReadOnly`] on a stream opened read-only;
    /// [`LaneError::ArgumentError`] if the write would run past the end.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, LaneError> {
        self.write_cancellable(data, &CancellationToken::new()).await
    }

    /// # Errors
    /// See [`write`](Self::write).
    pub async fn write_cancellable(
        &mut self,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<usize, LaneError> {
        self.ensure_writable()?;
        let end = self.position + data.len() as u64;
        if end > self.len {
            return Err(past_end(end, self.len));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let written = self.submit_write(data.to_vec(), cancel)?.await?;
        self.position += written as u64;
        Ok(written)
    }

    /// Move the cursor. The BLOB's length is re-read on the worker first.
    ///
    /// # Errors
    /// [`LaneError::ArgumentError`] for a target before the start or past the end.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64, LaneError> {
        self.ensure_open()?;
        resolve_seek(pos, self.position, self.len)?;
        self.len = self.submit_len()?.await?;
        self.position = resolve_seek(pos, self.position, self.len)?;
        Ok(self.position)
    }

    /// Writes land in the database when their operation completes; flushing only
    /// confirms the BLOB is still reachable.
    ///
    /// # Errors
    /// [`LaneError::Disposed`] once the stream or its connection is closed.
    pub async fn flush(&mut self) -> Result<(), LaneError> {
        self.ensure_open()?;
        self.submit_flush()?.await
    }

    /// Close the stream through the connection's queue. Closing twice is a no-op.
    ///
    /// # Errors
    /// Reserved for failures reaching the worker.
    pub async fn close(&mut self) -> Result<(), LaneError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending = Pending::Idle;
        let key = self.key;
        match self
            .queue
            .submit(&CancellationToken::new(), move |view, _| {
                view.with(|session| Ok(session.close_blob(key)))
            })
            .await
        {
            Ok(_) | Err(LaneError::Disposed(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn ensure_open(&self) -> Result<(), LaneError> {
        if self.closed {
            Err(LaneError::Disposed("blob stream"))
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self) -> Result<(), LaneError> {
        self.ensure_open()?;
        if self.writable {
            Ok(())
        } else {
            Err(LaneError::ReadOnly)
        }
    }

    fn readable(&self, requested: usize) -> usize {
        let remaining = self.len.saturating_sub(self.position);
        usize::try_from(remaining).map_or(requested, |remaining| remaining.min(requested))
    }

    fn offset(&self) -> Result<usize, LaneError> {
        usize::try_from(self.position)
            .map_err(|_| LaneError::ArgumentError(format!("offset {} is out of range", self.position)))
    }

    fn submit_read(
        &self,
        want: usize,
        cancel: &CancellationToken,
    ) -> Result<OperationHandle<Vec<u8>>, LaneError> {
        let key = self.key;
        let offset = self.offset()?;
        Ok(self.queue.submit(cancel, move |view, _| {
            view.with(|session| {
                session.with_blob(key, |blob| {
                    let mut data = vec![0u8; want];
                    let n = blob.read_at(&mut data, offset)?;
                    data.truncate(n);
                    Ok(data)
                })
            })
        }))
    }

    fn submit_write(
        &self,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<OperationHandle<usize>, LaneError> {
        let key = self.key;
        let offset = self.offset()?;
        Ok(self.queue.submit(cancel, move |view, _| {
            view.with(|session| {
                session.with_blob(key, |blob| {
                    blob.write_at(&data, offset)?;
                    Ok(data.len())
                })
            })
        }))
    }

    fn submit_len(&self) -> Result<OperationHandle<u64>, LaneError> {
        self.ensure_open()?;
        let key = self.key;
        Ok(self
            .queue
            .submit(&CancellationToken::new(), move |view, _| {
                view.with(|session| session.with_blob(key, |blob| Ok(blob.len() as u64)))
            }))
    }

    fn submit_flush(&self) -> Result<OperationHandle<()>, LaneError> {
        self.ensure_open()?;
        let key = self.key;
        Ok(self
            .queue
            .submit(&CancellationToken::new(), move |view, _| {
                view.with(|session| session.with_blob(key, |_| Ok(())))
            }))
    }
}

fn past_end(target: u64, len: u64) -> LaneError {
    LaneError::ArgumentError(format!("position {target} is past the end of a {len}-byte blob"))
}

fn resolve_seek(pos: SeekFrom, position: u64, len: u64) -> Result<u64, LaneError> {
    let target = match pos {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::End(delta) => len.checked_add_signed(delta),
        SeekFrom::Current(delta) => position.checked_add_signed(delta),
    };
    match target {
        None => Err(LaneError::ArgumentError(
            "cannot seek before the start of a blob".into(),
        )),
        Some(target) if target > len => Err(past_end(target, len)),
        Some(target) => Ok(target),
    }
}

fn busy() -> io::Error {
    io::Error::other("another blob operation is still pending")
}

impl AsyncRead for BlobStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.pending {
                Pending::Idle => {
                    this.ensure_open()?;
                    let want = this.readable(buf.remaining());
                    if want == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    this.pending =
                        Pending::Read(this.submit_read(want, &CancellationToken::new())?);
                }
                Pending::Read(handle) => {
                    let result = ready!(Pin::new(handle).poll(cx));
                    this.pending = Pending::Idle;
                    let bytes = result?;
                    let n = bytes.len().min(buf.remaining());
                    buf.put_slice(&bytes[..n]);
                    this.position += n as u64;
                    return Poll::Ready(Ok(()));
                }
                _ => return Poll::Ready(Err(busy())),
            }
        }
    }
}

impl AsyncWrite for BlobStream {
    /// Writes what fits before the end of the BLOB; a write at the very end fails.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.pending {
                Pending::Idle => {
                    this.ensure_writable()?;
                    if data.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let n = this.readable(data.len());
                    if n == 0 {
                        return Poll::Ready(Err(past_end(
                            this.position + data.len() as u64,
                            this.len,
                        )
                        .into()));
                    }
                    this.pending = Pending::Write(
                        this.submit_write(data[..n].to_vec(), &CancellationToken::new())?,
                    );
                }
                Pending::Write(handle) => {
                    let result = ready!(Pin::new(handle).poll(cx));
                    this.pending = Pending::Idle;
                    let n = result?;
                    this.position += n as u64;
                    return Poll::Ready(Ok(n));
                }
                _ => return Poll::Ready(Err(busy())),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.pending {
                Pending::Idle => this.pending = Pending::Flush(this.submit_flush()?),
                Pending::Flush(handle) => {
                    let result = ready!(Pin::new(handle).poll(cx));
                    this.pending = Pending::Idle;
                    return Poll::Ready(result.map_err(io::Error::from));
                }
                _ => return Poll::Ready(Err(busy())),
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

impl AsyncSeek for BlobStream {
    fn start_seek(self: Pin<&mut Self>, pos: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        if !matches!(this.pending, Pending::Idle) {
            return Err(busy());
        }
        resolve_seek(pos, this.position, this.len)?;
        this.pending = Pending::Seek(this.submit_len()?, pos);
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        match &mut this.pending {
            Pending::Idle => Poll::Ready(Ok(this.position)),
            Pending::Seek(handle, pos) => {
                let pos = *pos;
                let result = ready!(Pin::new(handle).poll(cx));
                this.pending = Pending::Idle;
                this.len = result?;
                this.position = resolve_seek(pos, this.position, this.len)?;
                Poll::Ready(Ok(this.position))
            }
            _ => Poll::Ready(Err(busy())),
        }
    }
}

impl Drop for BlobStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let key = self.key;
        if self
            .queue
            .try_submit(&CancellationToken::new(), move |view, _| {
                view.with(|session| Ok(session.close_blob(key)))
            })
            .is_ok()
        {
            trace!(table = %self.locator.table, rowid = self.locator.rowid, "blob stream dropped without close; close queued");
        }
    }
}

impl fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStream")
            .field("locator", &self.locator)
            .field("len", &self.len)
            .field("position", &self.position)
            .field("writable", &self.writable)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_targets_are_clamped_to_the_blob() {
        assert_eq!(resolve_seek(SeekFrom::Start(4), 0, 10).unwrap(), 4);
        assert_eq!(resolve_seek(SeekFrom::End(-3), 0, 10).unwrap(), 7);
        assert_eq!(resolve_seek(SeekFrom::Current(2), 5, 10).unwrap(), 7);
        assert_eq!(resolve_seek(SeekFrom::End(0), 0, 10).unwrap(), 10);
        assert!(matches!(
            resolve_seek(SeekFrom::Current(-6), 5, 10),
            Err(LaneError::ArgumentError(_))
        ));
        assert!(matches!(
            resolve_seek(SeekFrom::Start(11), 0, 10),
            Err(LaneError::ArgumentError(_))
        ));
    }

    #[test]
    fn locator_defaults_to_main_schema() {
        let locator = BlobLocator::new("files", "data", 7).in_database("aux");
        assert_eq!(locator.database, "aux");
        assert_eq!(locator.rowid, 7);
        assert_eq!(BlobLocator::new("t", "c", 1).database, "main");
    }
}
