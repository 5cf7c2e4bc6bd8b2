use std::io::SeekFrom;

use sqlite_lane::prelude::*;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

async fn files_db() -> Result<Connection, LaneError> {
    let conn = Connection::open_in_memory().await?;
    conn.execute_all(
        "CREATE TABLE files (id INTEGER PRIMARY KEY, data BLOB);
         INSERT INTO files (id, data) VALUES (1, zeroblob(16));
         INSERT INTO files (id, data) VALUES (2, x'0102030405');",
    )
    .await?;
    Ok(conn)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_seek_and_read_back() -> Result<(), Box<dyn std::error::Error>> {
    let conn = files_db().await?;
    let mut blob = conn.open_blob(BlobLocator::new("files", "data", 1), true).await?;
    assert_eq!(blob.len(), 16);
    assert!(blob.can_write());
    assert_eq!(blob.position(), 0);

    assert_eq!(blob.write(b"hello").await?, 5);
    assert_eq!(blob.position(), 5);
    blob.flush().await?;

    assert_eq!(blob.seek(SeekFrom::Start(0)).await?, 0);
    let mut buf = [0_u8; 5];
    assert_eq!(blob.read(&mut buf).await?, 5);
    assert_eq!(&buf, b"hello");

    // Reads stop at the end of the value.
    blob.set_position(14)?;
    let mut tail = [0xff_u8; 8];
    assert_eq!(blob.read(&mut tail).await?, 2);
    assert_eq!(&tail[..2], &[0, 0]);
    assert_eq!(blob.read(&mut tail).await?, 0);

    blob.close().await?;

    let stored = conn
        .query_all("SELECT data FROM files WHERE id = 1", &[])
        .await?;
    let bytes = stored.results[0].get("data").and_then(RowValues::as_blob).map(<[u8]>::to_vec);
    assert_eq!(bytes.as_deref().map(|b| &b[..5]), Some(&b"hello"[..]));

    conn.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tokio_io_traits_route_through_the_queue() -> Result<(), Box<dyn std::error::Error>> {
    let conn = files_db().await?;
    let mut blob = conn.open_blob(BlobLocator::new("files", "data", 1), true).await?;

    blob.write_all(b"0123456789").await?;
    AsyncWriteExt::flush(&mut blob).await?;
    assert_eq!(AsyncSeekExt::seek(&mut blob, SeekFrom::End(-6)).await?, 10);

    let mut rest = Vec::new();
    blob.read_to_end(&mut rest).await?;
    assert_eq!(rest, vec![0_u8; 6]);

    AsyncSeekExt::seek(&mut blob, SeekFrom::Start(2)).await?;
    let mut three = [0_u8; 3];
    blob.read_exact(&mut three).await?;
    assert_eq!(&three, b"234");

    // A write that runs off the end is cut short, then fails.
    AsyncSeekExt::seek(&mut blob, SeekFrom::Start(14)).await?;
    let err = blob.write_all(b"abcd").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    assert_eq!(blob.position(), 16);

    blob.close().await?;
    conn.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_only_and_out_of_range_access_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let conn = files_db().await?;
    let mut blob = conn.open_blob(BlobLocator::new("files", "data", 2), false).await?;
    assert!(!blob.can_write());
    assert_eq!(blob.len(), 5);

    assert!(matches!(blob.write(b"x").await, Err(LaneError::ReadOnly)));
    let io_err = blob.write_all(b"x").await.unwrap_err();
    assert_eq!(io_err.kind(), std::io::ErrorKind::PermissionDenied);

    let mut buf = [0_u8; 5];
    blob.read(&mut buf).await?;
    assert_eq!(buf, [1, 2, 3, 4, 5]);

    assert!(matches!(
        blob.seek(SeekFrom::Current(-6)).await,
        Err(LaneError::ArgumentError(_))
    ));
    assert!(matches!(
        blob.seek(SeekFrom::Start(6)).await,
        Err(LaneError::ArgumentError(_))
    ));
    assert!(matches!(blob.set_position(6), Err(LaneError::ArgumentError(_))));
    assert_eq!(blob.position(), 5);
    blob.close().await?;

    let mut writable = conn.open_blob(BlobLocator::new("files", "data", 2), true).await?;
    writable.seek(SeekFrom::End(-2)).await?;
    assert!(matches!(
        writable.write(b"abc").await,
        Err(LaneError::ArgumentError(_))
    ));
    writable.close().await?;

    let missing = conn.open_blob(BlobLocator::new("files", "data", 99), false).await;
    assert!(matches!(missing, Err(LaneError::SqliteError(_))));

    conn.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_blob_stream_is_disposed() -> Result<(), Box<dyn std::error::Error>> {
    let conn = files_db().await?;
    let mut blob = conn.open_blob(BlobLocator::new("files", "data", 1), true).await?;

    blob.close().await?;
    blob.close().await?;
    assert!(blob.is_closed());
    // The open mode survives disposal.
    assert!(blob.can_write());

    let mut buf = [0_u8; 4];
    assert!(blob.read(&mut buf).await.unwrap_err().is_disposed());
    assert!(blob.write(b"x").await.unwrap_err().is_disposed());
    assert!(blob.seek(SeekFrom::Start(0)).await.unwrap_err().is_disposed());
    assert!(blob.flush().await.unwrap_err().is_disposed());
    let io_err = blob.read_exact(&mut buf).await.unwrap_err();
    assert_eq!(io_err.kind(), std::io::ErrorKind::NotConnected);

    let open = conn
        .with_view(&CancellationToken::new(), |view, _| view.with(|s| Ok(s.open_blobs())))
        .await?;
    assert_eq!(open, 0);
    conn.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_expires_once_its_row_changes() -> Result<(), Box<dyn std::error::Error>> {
    let conn = Connection::open_in_memory().await?;
    conn.execute_all(
        "CREATE TABLE files (id INTEGER PRIMARY KEY, name TEXT, data BLOB);
         INSERT INTO files VALUES (1, 'a', x'41414141');
         INSERT INTO files VALUES (2, 'b', x'43434343');",
    )
    .await?;
    let mut replaced = conn.open_blob(BlobLocator::new("files", "data", 1), false).await?;
    let mut renamed = conn.open_blob(BlobLocator::new("files", "data", 2), true).await?;
    let mut second_reader = conn.open_blob(BlobLocator::new("files", "data", 2), false).await?;

    let mut buf = [0_u8; 4];
    assert_eq!(second_reader.read(&mut buf).await?, 4);
    second_reader.set_position(0)?;

    conn.execute_all(
        "DELETE FROM files WHERE id = 1;
         INSERT INTO files VALUES (1, 'a', x'42424242');",
    )
    .await?;
    let err = replaced.read(&mut buf).await.unwrap_err();
    assert_eq!(
        err.sqlite_code().map(|(code, _)| code),
        Some(sqlite_lane::rusqlite::ErrorCode::OperationAborted)
    );
    assert_eq!(buf, [0x43; 4]);

    // Any change to the row expires it, even in another column.
    conn.execute("UPDATE files SET name = 'z' WHERE id = 2", &[]).await?;
    let err = renamed.write(b"x").await.unwrap_err();
    assert_eq!(
        err.sqlite_code().map(|(code, _)| code),
        Some(sqlite_lane::rusqlite::ErrorCode::OperationAborted)
    );
    assert!(second_reader.read(&mut buf).await.is_err());

    // A stream opened after the change sees the new row.
    let mut fresh = conn.open_blob(BlobLocator::new("files", "data", 1), false).await?;
    assert_eq!(fresh.read(&mut buf).await?, 4);
    assert_eq!(buf, [0x42; 4]);

    replaced.close().await?;
    renamed.close().await?;
    second_reader.close().await?;
    fresh.close().await?;
    conn.close().await?;
    Ok(())
}
