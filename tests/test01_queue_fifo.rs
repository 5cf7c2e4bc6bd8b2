use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use futures::StreamExt;
use sqlite_lane::prelude::*;

type Log = Arc<Mutex<Vec<String>>>;

fn logging_queue(log: &Log) -> Result<OperationQueue<Log>, LaneError> {
    let release_log = Arc::clone(log);
    OperationQueue::spawn("test-log-queue", Arc::clone(log), move |_| {
        release_log.lock().unwrap().push("release".into());
        Ok(())
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn operations_run_in_submission_order() -> Result<(), Box<dyn std::error::Error>> {
    let queue = OperationQueue::spawn("fifo", Vec::<usize>::new(), |_| Ok(()))?;
    let token = CancellationToken::new();

    let handles: Vec<_> = (0..200)
        .map(|i| {
            queue.submit(&token, move |view, _| {
                view.with(|items| {
                    items.push(i);
                    Ok(())
                })
            })
        })
        .collect();
    for handle in handles {
        handle.await?;
    }

    let seen = queue
        .submit(&token, |view, _| view.with(|items| Ok(items.clone())))
        .await?;
    assert_eq!(seen, (0..200).collect::<Vec<_>>());
    queue.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submitters_never_overlap() -> Result<(), Box<dyn std::error::Error>> {
    // The resource counts callers currently inside it.
    let queue = OperationQueue::spawn("exclusive", (), |()| Ok(()))?;
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for task in 0..8_usize {
        let queue = queue.clone();
        let active = Arc::clone(&active);
        let max_seen = Arc::clone(&max_seen);
        tasks.push(tokio::spawn(async move {
            let mut order = Vec::new();
            for step in 0..25 {
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                let id = queue
                    .submit(&CancellationToken::new(), move |view, _| {
                        view.with(|_| {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_micros(200));
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(task * 100 + step)
                        })
                    })
                    .await?;
                order.push(id);
            }
            Ok::<_, LaneError>(order)
        }));
    }

    for (task, handle) in tasks.into_iter().enumerate() {
        let order = handle.await??;
        let expected: Vec<_> = (0..25).map(|step| task * 100 + step).collect();
        assert_eq!(order, expected);
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    queue.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drains_queued_work_before_release() -> Result<(), Box<dyn std::error::Error>> {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let queue = logging_queue(&log)?;

    for i in 0..5 {
        // Handles are dropped on purpose: the operations still run.
        let _ = queue.submit(&CancellationToken::new(), move |view, _| {
            view.with(|log| {
                std::thread::sleep(Duration::from_millis(5));
                log.lock().unwrap().push(format!("op{i}"));
                Ok(())
            })
        });
    }
    queue.shutdown().await?;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["op0", "op1", "op2", "op3", "op4", "release"]
    );
    assert!(queue.is_closed());
    assert!(queue.is_drained());

    let late = queue
        .submit(&CancellationToken::new(), |_, _| Ok(()))
        .await;
    assert!(matches!(late, Err(LaneError::Disposed(_))));
    assert!(matches!(
        queue.try_submit(&CancellationToken::new(), |_, _| Ok(())),
        Err(LaneError::Disposed(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn view_is_invalid_once_its_operation_returns() -> Result<(), Box<dyn std::error::Error>> {
    let queue = OperationQueue::spawn("views", 41_u32, |_| Ok(()))?;

    let leaked = queue
        .submit(&CancellationToken::new(), |view, _| {
            assert!(view.is_valid());
            view.with(|value| {
                *value += 1;
                Ok(())
            })?;
            Ok(view.clone())
        })
        .await?;

    assert!(!leaked.is_valid());
    let err = leaked.with(|value| Ok(*value)).unwrap_err();
    assert!(err.is_disposed());

    // The resource itself went back to the worker untouched by the leak.
    let value = queue
        .submit(&CancellationToken::new(), |view, _| view.with(|value| Ok(*value)))
        .await?;
    assert_eq!(value, 42);
    queue.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn operation_cancelled_before_start_never_runs() -> Result<(), Box<dyn std::error::Error>> {
    let queue = OperationQueue::spawn("cancel", (), |()| Ok(()))?;
    let (unblock, blocked) = mpsc::channel::<()>();
    let blocker = queue.submit(&CancellationToken::new(), move |_, _| {
        blocked
            .recv_timeout(Duration::from_secs(5))
            .map_err(|err| LaneError::ArgumentError(err.to_string()))
    });

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let token = CancellationToken::new();
    let cancelled = queue.submit(&token, move |_, _| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    let after = queue.submit(&CancellationToken::new(), |_, _| Ok("after"));

    token.cancel();
    unblock.send(())?;

    blocker.await?;
    assert!(matches!(cancelled.await, Err(LaneError::Cancelled)));
    assert_eq!(after.await?, "after");
    assert!(!ran.load(Ordering::SeqCst));
    queue.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_operation_delivers_elements_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let queue = OperationQueue::spawn("streams", 3_u32, |_| Ok(()))?;

    let mut stream = queue.submit_streaming(&CancellationToken::new(), None, |view, sink| {
        let limit = view.with(|limit| Ok(*limit))?;
        for i in 1..=limit * 4 {
            sink.push(i)?;
        }
        Ok(())
    });
    let mut seen = Vec::new();
    while let Some(item) = stream.next().await {
        seen.push(item?);
    }
    assert_eq!(seen, (1..=12).collect::<Vec<_>>());

    // A failing producer yields what it pushed, then its error.
    let items = queue
        .submit_streaming(&CancellationToken::new(), None, |_, sink| {
            sink.push(1)?;
            Err(LaneError::ArgumentError("stop".into()))
        })
        .collect::<Vec<_>>()
        .await;
    assert_eq!(items.len(), 2);
    assert!(matches!(items[0], Ok(1)));
    assert!(matches!(items[1], Err(LaneError::ArgumentError(_))));
    queue.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_stream_cancels_its_producer() -> Result<(), Box<dyn std::error::Error>> {
    let queue = OperationQueue::spawn("dropped", (), |()| Ok(()))?;
    let produced = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&produced);

    let mut stream = queue.submit_streaming(&CancellationToken::new(), None, move |_, sink| {
        loop {
            sink.push(())?;
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
        }
    });
    stream.next().await.transpose()?;
    drop(stream);

    // Reaching the next operation proves the producer gave up.
    tokio::time::timeout(
        Duration::from_secs(5),
        queue.submit(&CancellationToken::new(), |_, _| Ok(())),
    )
    .await??;
    assert!(produced.load(Ordering::SeqCst) < 1_000);
    queue.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unread_stream_never_holds_up_the_lane() -> Result<(), Box<dyn std::error::Error>> {
    let queue = OperationQueue::spawn("unread", (), |()| Ok(()))?;

    let mut unread = queue.submit_streaming(&CancellationToken::new(), None, |_, sink| {
        for i in 0..500_u32 {
            sink.push(i)?;
        }
        Ok(())
    });
    let mut capped = queue.submit_streaming(&CancellationToken::new(), Some(3), |_, sink| {
        for i in 0..10_u32 {
            sink.push(i)?;
        }
        Ok(())
    });

    // Neither stream has been read, yet later work still gets its turn.
    tokio::time::timeout(
        Duration::from_secs(5),
        queue.submit(&CancellationToken::new(), |_, _| Ok(())),
    )
    .await??;

    let mut seen = 0_u32;
    while let Some(item) = unread.next().await {
        assert_eq!(item?, seen);
        seen += 1;
    }
    assert_eq!(seen, 500);

    let mut delivered = Vec::new();
    let mut outcome = None;
    while let Some(item) = capped.next().await {
        match item {
            Ok(value) => delivered.push(value),
            Err(err) => outcome = Some(err),
        }
    }
    assert_eq!(delivered, vec![0, 1, 2]);
    assert!(matches!(outcome, Some(LaneError::StreamBacklog(3))));
    queue.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn producer_between_pushes_observes_cancellation() -> Result<(), Box<dyn std::error::Error>> {
    let queue = OperationQueue::spawn("checkpoint", (), |()| Ok(()))?;
    let token = CancellationToken::new();

    let mut stream = queue.submit_streaming(&token, None, |_, sink| {
        sink.push("started")?;
        loop {
            sink.checkpoint()?;
            std::thread::sleep(Duration::from_millis(1));
        }
    });
    assert_eq!(stream.next().await.transpose()?, Some("started"));
    token.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), stream.next()).await?;
    assert!(matches!(outcome, Some(Err(LaneError::Cancelled))));
    assert!(stream.next().await.is_none());
    queue.shutdown().await?;
    Ok(())
}
