use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use futures::StreamExt;
use sqlite_lane::prelude::*;
use tokio::time::{sleep, timeout};

const COUNT_FOREVER: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                             SELECT count(*) FROM c";
const ROWS_FOREVER: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                            SELECT x FROM c";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_before_start_skips_the_statement() -> Result<(), Box<dyn std::error::Error>> {
    let conn = Connection::open_in_memory().await?;
    conn.execute_all("CREATE TABLE t (id INTEGER PRIMARY KEY);").await?;

    let (unblock, blocked) = mpsc::channel::<()>();
    let blocker = conn.with_view(&CancellationToken::new(), move |_, _| {
        blocked
            .recv_timeout(Duration::from_secs(5))
            .map_err(|err| LaneError::ArgumentError(err.to_string()))
    });

    let token = CancellationToken::new();
    let touched = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&touched);
    let skipped = conn.with_view(&token, move |view, _| {
        flag.store(true, Ordering::SeqCst);
        view.with(|session| {
            session.connection().execute("INSERT INTO t (id) VALUES (1)", [])?;
            Ok(())
        })
    });

    token.cancel();
    unblock.send(())?;
    blocker.await?;

    assert!(skipped.await.unwrap_err().is_cancelled());
    assert!(!touched.load(Ordering::SeqCst));
    let rows = conn.query_all("SELECT id FROM t", &[]).await?;
    assert!(rows.is_empty());

    // A token that already fired never reaches the worker's callback either.
    let err = conn
        .execute_cancellable("INSERT INTO t (id) VALUES (2)", &[], &token)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());

    conn.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn long_native_call_is_interrupted() -> Result<(), Box<dyn std::error::Error>> {
    let conn = ConnectionOptionsBuilder::new(":memory:")
        .progress_interval(Some(100))
        .open()
        .await?;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = timeout(
        Duration::from_secs(10),
        conn.with_connection_cancellable(&token, |c| {
            Ok(c.query_row(COUNT_FOREVER, [], |row| row.get::<_, i64>(0))?)
        }),
    )
    .await?;
    assert!(matches!(result, Err(LaneError::Cancelled)));

    // The connection stays usable afterwards.
    let rows = conn.query_all("SELECT 1 AS one", &[]).await?;
    assert_eq!(rows.len(), 1);
    conn.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_row_stream_stops_the_query() -> Result<(), Box<dyn std::error::Error>> {
    let conn = Connection::open_in_memory().await?;
    let token = CancellationToken::new();
    let mut rows = conn.query(ROWS_FOREVER, &[]).subscribe_cancellable(&token);

    for expected in 1..=10_i64 {
        let row = timeout(Duration::from_secs(5), rows.next())
            .await?
            .ok_or("row stream ended early")??;
        assert_eq!(row.get_by_index(0).and_then(RowValues::as_int).copied(), Some(expected));
    }
    token.cancel();

    let mut outcome = None;
    while let Some(item) = timeout(Duration::from_secs(5), rows.next()).await? {
        if let Err(err) = item {
            outcome = Some(err);
            break;
        }
    }
    assert!(matches!(outcome, Some(LaneError::Cancelled)));

    // The worker moved on to the next operation.
    let rows = timeout(Duration::from_secs(5), conn.query_all("SELECT 1", &[])).await??;
    assert_eq!(rows.len(), 1);
    conn.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_a_row_stream_releases_the_worker() -> Result<(), Box<dyn std::error::Error>> {
    let conn = Connection::open_in_memory().await?;
    let mut rows = conn.query(ROWS_FOREVER, &[]).subscribe();
    rows.next().await.transpose()?;
    drop(rows);

    let changed = timeout(
        Duration::from_secs(5),
        conn.execute("CREATE TABLE after_stream (id INTEGER)", &[]),
    )
    .await??;
    assert_eq!(changed, 0);
    conn.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_callback_leaves_no_interrupt_hook_behind() -> Result<(), Box<dyn std::error::Error>> {
    let conn = Connection::open_in_memory().await?;

    let stale = CancellationToken::new();
    let panicked = conn
        .with_connection_cancellable(&stale, |_| -> Result<(), LaneError> {
            panic!("callback failed")
        })
        .await;
    assert!(matches!(panicked, Err(LaneError::OperationPanicked(_))));
    stale.cancel();

    // A later operation with its own token must not observe the old one.
    let count = conn
        .with_connection(|c| {
            Ok(c.query_row(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 100000) \
                 SELECT count(*) FROM c",
                [],
                |row| row.get::<_, i64>(0),
            )?)
        })
        .await?;
    assert_eq!(count, 100_000);
    conn.close().await?;
    Ok(())
}
