//! Process substrate specifics: isolation, exit status and teardown.
//!
//! No tracing subscriber is installed in this binary; workers here are forked
//! from a multi-threaded test harness.

#![cfg(unix)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use safe_parallel::{ProcessWorker, ResultQueue, Target, UpdateLoop, WorkContext, WorkerOptions};

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Snapshot {
    client: String,
    frame: u64,
    position: (f32, f32),
}

#[test]
fn test_child_has_its_own_address_space() {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    let mut worker: ProcessWorker<usize> = ProcessWorker::from_target(move || {
        Ok(seen.fetch_add(1, Ordering::SeqCst) + 1)
    })
    .unwrap();
    worker.start().unwrap();
    worker.join(Some(TIMEOUT)).unwrap();

    assert_eq!(worker.results().get(Some(TIMEOUT)).unwrap(), Some(1));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_pid_and_exit_code() {
    let mut worker: ProcessWorker = ProcessWorker::from_target(|| Ok(())).unwrap();
    assert!(worker.pid().is_none());

    worker.start().unwrap();
    let pid = worker.pid().unwrap();
    assert_ne!(pid, std::process::id());

    worker.join(Some(TIMEOUT)).unwrap();
    assert_eq!(worker.exit_code(), Some(0));
}

#[test]
fn test_failed_routine_still_exits_cleanly() {
    let mut worker: ProcessWorker =
        ProcessWorker::from_target(|| -> anyhow::Result<()> { panic!("lost connection") }).unwrap();
    worker.start().unwrap();
    worker.join(Some(TIMEOUT)).unwrap();

    assert_eq!(worker.exception().unwrap().message(), "lost connection");
    assert_eq!(worker.exit_code(), Some(0));
}

#[test]
fn test_structured_results_cross_the_boundary() {
    let mut worker: ProcessWorker<Snapshot> = ProcessWorker::from_target(|| {
        Ok(Snapshot {
            client: "client-0".to_string(),
            frame: 120,
            position: (1.5, -2.0),
        })
    })
    .unwrap();
    worker.start().unwrap();
    worker.join(Some(TIMEOUT)).unwrap();

    let snapshot = worker.results().get(Some(TIMEOUT)).unwrap().unwrap();
    assert_eq!(snapshot.client, "client-0");
    assert_eq!(snapshot.frame, 120);
    assert_eq!(snapshot.position, (1.5, -2.0));
}

#[test]
fn test_oversized_result_is_reported() {
    let mut worker: ProcessWorker<Vec<u8>> =
        ProcessWorker::from_target(|| Ok(vec![7u8; 256 * 1024])).unwrap();
    worker.start().unwrap();
    worker.join(Some(TIMEOUT)).unwrap();

    let exception = worker.exception().expect("put should fail");
    assert!(exception.message().contains("too large"), "{}", exception.message());
}

#[test]
fn test_dropping_daemon_worker_kills_it() {
    let mut worker: ProcessWorker = ProcessWorker::from_target(|| {
        std::thread::sleep(Duration::from_secs(30));
        Ok(())
    })
    .unwrap();
    worker.start().unwrap();
    let pid = worker.pid().unwrap() as libc::pid_t;

    let started = Instant::now();
    drop(worker);
    assert!(started.elapsed() < Duration::from_secs(5));

    // SAFETY: signal 0 only probes for existence.
    assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
}

#[test]
fn test_non_daemon_worker_is_waited_for() {
    let mut worker: ProcessWorker = ProcessWorker::with_options(
        Target::new(|| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        }),
        WorkerOptions::default().daemon(false),
    )
    .unwrap();
    worker.start().unwrap();

    let started = Instant::now();
    drop(worker);
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_update_loop_in_child_process() {
    let ticker = UpdateLoop::new(|elapsed: Duration, ctx: &WorkContext<'_, u64>| {
        ctx.put(elapsed.as_millis() as u64)?;
        Ok(())
    })
    .with_interval(Duration::from_millis(5));
    let mut worker: ProcessWorker<u64> = ProcessWorker::new(ticker).unwrap();
    worker.start().unwrap();

    assert!(worker.results().get(Some(TIMEOUT)).unwrap().is_some());
    worker.stop().unwrap();
    worker.join(Some(TIMEOUT)).unwrap();
    assert!(!worker.is_alive());
    assert!(worker.exception().is_none());
}
