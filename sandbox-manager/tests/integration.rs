//! End-to-end tests against the real `sandbox-worker` binary.

use std::time::Duration;

use sandbox_manager::{CallError, RemoteChannel, SpawnError, Worker, WorkerConfig};
use sandbox_protocol::RemoteError;

fn worker_exe() -> String {
    let mut path = std::env::current_exe().expect("current test exe path");
    path.pop(); // deps
    if path.ends_with("deps") {
        path.pop();
    }
    path.push(if cfg!(windows) {
        "sandbox-worker.exe"
    } else {
        "sandbox-worker"
    });
    path.to_str().expect("utf-8 path").to_string()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn spawns_calls_and_stops_cleanly() {
    init_tracing();
    let worker = Worker::spawn(WorkerConfig::new(worker_exe()))
        .await
        .expect("worker should spawn");

    assert!(worker.is_running().await);

    let sum: i64 = worker
        .fetch("sandbox.add", (2_i64, 40_i64))
        .await
        .expect("add should succeed");
    assert_eq!(sum, 42);

    assert!(worker.stop().await);
    worker
        .wait_for_exit(Duration::from_secs(5))
        .await
        .expect("worker should exit after Stop");
    assert!(!worker.is_running().await);
}

#[tokio::test]
async fn a_failed_decode_does_not_desync_the_next_call() {
    init_tracing();
    let worker = Worker::spawn(WorkerConfig::new(worker_exe()))
        .await
        .expect("worker should spawn");

    // "sandbox.identity" echoes its argument bytes back unmodified; decoding
    // them as a type they don't actually encode fails on the manager side,
    // without touching the wire codec's framing.
    let echoed = worker
        .fetch::<String>("sandbox.identity", 7_i64)
        .await;
    assert!(matches!(echoed, Err(sandbox_manager::CallError::Decode(_))));

    let sum: i64 = worker
        .fetch("sandbox.add", (1_i64, 1_i64))
        .await
        .expect("a later call should still succeed");
    assert_eq!(sum, 2);

    worker.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn interrupting_a_long_call_lets_the_next_call_through() {
    init_tracing();
    let worker = Worker::spawn(WorkerConfig::new(worker_exe()))
        .await
        .expect("worker should spawn");

    let stuck = worker
        .call::<()>("demo.sleep_forever", ())
        .expect("call should enqueue");
    tokio::time::sleep(Duration::from_millis(50)).await;

    worker.interrupt().await.expect("interrupt should be deliverable");

    let sum: i64 = worker
        .fetch("sandbox.add", (20_i64, 22_i64))
        .await
        .expect("the worker should still be responsive after an interrupt");
    assert_eq!(sum, 42);

    let interrupted = stuck.await.expect("the call should resolve after the interrupt");
    assert!(matches!(
        interrupted,
        Err(CallError::Remote(RemoteError::Interrupted))
    ));

    worker.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn spawning_a_nonexistent_executable_fails_within_the_timeout() {
    init_tracing();
    let config = WorkerConfig::new("/no/such/sandbox-worker-binary")
        .connect_timeout(Duration::from_secs(15));

    let result = Worker::spawn(config).await;
    assert!(matches!(result, Err(SpawnError::Io(_))));
}

#[tokio::test]
async fn remote_channel_preserves_fifo_order_under_concurrent_put_and_take() {
    init_tracing();
    let worker = Worker::spawn(WorkerConfig::new(worker_exe()))
        .await
        .expect("worker should spawn");

    let channel = RemoteChannel::with_capacity(&worker, 20)
        .await
        .expect("channel should be creatable");

    let reader = {
        let channel = channel.clone();
        tokio::spawn(async move {
            let mut values = Vec::new();
            for _ in 1..40u32 {
                values.push(channel.take::<u32>().await.unwrap());
            }
            values
        })
    };

    for i in 1..40u32 {
        channel.put(&i).await.unwrap();
    }

    let values = reader.await.unwrap();
    assert_eq!(values, (1..40u32).collect::<Vec<_>>());

    channel.close().await.expect("close should succeed");
    worker.shutdown(Duration::from_secs(5)).await;
}
