//! Tests for ordering, panic capture, re-entrancy and drain-on-drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{QueueError, TaskQueue, TaskQueueConfig};

fn queue() -> TaskQueue<Vec<u32>> {
    TaskQueue::spawn(Vec::new(), &TaskQueueConfig::default()).unwrap()
}

#[test]
fn tasks_run_in_fifo_order() {
    let q = queue();
    for i in 0..50 {
        q.submit("push", move |v| v.push(i)).unwrap();
    }
    let seen = q.run_and_wait("read", |v| v.clone()).unwrap();
    assert_eq!(seen, (0..50).collect::<Vec<_>>());
}

#[test]
fn closure_results_come_back_verbatim() {
    let q = queue();
    let ok: Result<u32, String> = q.run_and_wait("ok", |_| Ok(7)).unwrap();
    assert_eq!(ok, Ok(7));
    let err: Result<u32, String> = q.run_and_wait("err", |_| Err("nope".to_string())).unwrap();
    assert_eq!(err, Err("nope".to_string()));
}

#[test]
fn panics_reach_the_waiting_caller() {
    let q = queue();
    let result: Result<(), _> = q.run_and_wait("boom", |_| panic!("kaboom"));
    match result {
        Err(QueueError::TaskPanicked { task, message }) => {
            assert_eq!(task, "boom");
            assert!(message.contains("kaboom"));
        }
        other => panic!("expected TaskPanicked, got {other:?}"),
    }
    // The worker survives.
    assert_eq!(q.run_and_wait("after", |v| v.len()).unwrap(), 0);
}

#[test]
fn fire_and_forget_panic_does_not_kill_worker() {
    let q = queue();
    q.submit("boom", |_| panic!("ignored")).unwrap();
    q.submit("push", |v| v.push(1)).unwrap();
    assert_eq!(q.run_and_wait("len", |v| v.len()).unwrap(), 1);
}

#[test]
fn blocking_from_worker_is_rejected() {
    let q = Arc::new(queue());
    let inner = Arc::clone(&q);
    let result = q
        .run_and_wait("outer", move |_| matches!(inner.run_and_wait("inner", |_| ()), Err(QueueError::Reentrant)))
        .unwrap();
    assert!(result);
}

#[test]
fn drop_drains_pending_tasks() {
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let q = TaskQueue::spawn((), &TaskQueueConfig::default()).unwrap();
        for _ in 0..100 {
            let c = Arc::clone(&counter);
            q.submit("count", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
    }
    assert_eq!(counter.load(Ordering::SeqCst), 100);
}

#[test]
fn idle_worker_picks_up_late_work() {
    let q = TaskQueue::spawn(0u32, &TaskQueueConfig { backoff_min_ms: 1, backoff_max_ms: 8 }).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(40));
    assert_eq!(q.run_and_wait("inc", |n| { *n += 1; *n }).unwrap(), 1);
}

#[tokio::test]
async fn tickets_can_be_awaited() {
    let q = queue();
    let ticket = q.run("async", |v| { v.push(9); v.len() }).unwrap();
    assert_eq!(ticket.wait_async().await.unwrap(), 1);
}
