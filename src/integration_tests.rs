// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! End-to-end scenarios across queues, groups and the scheduler.

use crate::{
    Bundle, DispatchConfig, DispatchContext, DispatchGroup, DispatchQueue, Scheduler, Status,
    TaskRef, idle, reusable_idle,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_keys_run_in_submission_order() {
    let queue = DispatchQueue::new("Q");
    let order = Arc::new(Mutex::new(Vec::new()));

    for key in ["A", "B", "C"] {
        let order = order.clone();
        queue
            .submit_with(
                Duration::ZERO,
                Some(Bundle::new().with("key", key.to_string())),
                move |context| {
                    let key = context.bundle().unwrap().get_string("key", "?");
                    order.lock().unwrap().push(key);
                },
            )
            .unwrap();
    }
    queue.sync(Duration::ZERO, None, |_| {}).unwrap();

    assert_eq!(*order.lock().unwrap(), ["A", "B", "C"]);
    queue.shutdown_await(true);
}

#[test]
fn test_group_on_io_notifies_standard_once() {
    let scheduler = Scheduler::new(DispatchConfig::default());
    let printed = Arc::new(Mutex::new(Vec::new()));
    let group = DispatchGroup::with_scheduler(&scheduler, false);

    for i in 0..3 {
        let printed = printed.clone();
        group
            .dispatch_fn(scheduler.io(), move |_| {
                printed.lock().unwrap().push(format!("task {i}"));
            })
            .unwrap();
    }

    let callbacks = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let (seen, count) = (printed.clone(), callbacks.clone());
    group
        .notify_fn(scheduler.standard(), move |context| {
            count.fetch_add(1, Ordering::SeqCst);
            let observed = seen.lock().unwrap().len();
            tx.send((observed, context.queue().name().to_string())).unwrap();
        })
        .unwrap();

    let (observed, queue_name) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(observed, 3);
    assert_eq!(queue_name, scheduler.standard().name());

    thread::sleep(Duration::from_millis(50));
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    scheduler.shutdown(true);
}

#[test]
fn test_chained_submissions_compose() {
    let queue = DispatchQueue::new("chain");
    let (tx, rx) = mpsc::channel();

    queue
        .submit(move |context| {
            let tx = tx.clone();
            context
                .queue()
                .submit(move |inner| {
                    tx.send(inner.task_id()).unwrap();
                })
                .unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 1);
    queue.shutdown_await(true);
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn beats(log: &[&str]) -> usize {
    log.iter().filter(|entry| **entry == "beat").count()
}

#[test]
fn test_idle_work_yields_to_late_normal_work() {
    let queue = DispatchQueue::new("idle-yield");
    let log = Arc::new(Mutex::new(Vec::new()));

    let heartbeat_log = log.clone();
    queue
        .add_idle(
            Duration::from_millis(30),
            reusable_idle(move |_| heartbeat_log.lock().unwrap().push("beat")),
        )
        .unwrap();
    assert!(wait_until(|| beats(&log.lock().unwrap()) >= 2));

    let before = log.lock().unwrap().len();
    let normal_log = log.clone();
    queue
        .submit(move |_| normal_log.lock().unwrap().push("normal"))
        .unwrap();
    assert!(wait_until(|| log.lock().unwrap().contains(&"normal")));

    // Only a beat already running when the work arrived may precede it
    let at = log.lock().unwrap().iter().position(|entry| *entry == "normal").unwrap();
    assert!(at - before <= 1);

    // The heartbeat picks up again once the queue is idle
    assert!(wait_until(|| beats(&log.lock().unwrap()[at..]) >= 2));
    queue.shutdown_await(true);
}

#[test]
fn test_heartbeat_and_slower_idle_task_share_the_queue() {
    let queue = DispatchQueue::new("idle-mix");
    let beats_seen = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let counter = beats_seen.clone();
    queue
        .add_idle(
            Duration::from_millis(10),
            reusable_idle(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    let flush_counter = beats_seen.clone();
    queue
        .add_idle(
            Duration::from_millis(60),
            idle(move |_| tx.send(flush_counter.load(Ordering::SeqCst)).unwrap()),
        )
        .unwrap();

    // The one-shot task still runs, after the heartbeat has fired a few times
    let beats_before_flush = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(beats_before_flush >= 2);
    assert!(wait_until(|| beats_seen.load(Ordering::SeqCst) > beats_before_flush));
    queue.shutdown_await(true);
}

#[test]
fn test_observer_order_survives_worker_restart() {
    let queue = DispatchQueue::new("observer-restart");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (dormant_tx, dormant_rx) = mpsc::channel();

    let recorder = seen.clone();
    queue.add_status_observer(move |_, status| {
        if status == Status::Dormant {
            let _ = dormant_tx.send(());
            thread::sleep(Duration::from_millis(100));
        }
        recorder.lock().unwrap().push(status);
    });

    for _ in 0..3 {
        queue.submit(|_| {}).unwrap();
        dormant_rx.recv_timeout(TIMEOUT).unwrap();
    }
    assert!(wait_until(|| seen.lock().unwrap().len() == 9));

    let seen = seen.lock().unwrap();
    for cycle in seen.chunks(3) {
        assert_eq!(cycle, [Status::Busy, Status::Idle, Status::Dormant]);
    }
    drop(seen);
    queue.shutdown_await(true);
}

#[test]
fn test_idle_budget_resets_when_queue_becomes_idle_again() {
    let queue = DispatchQueue::new("idle-reset");
    let (tx, rx) = mpsc::channel();

    // Keep the queue busy past the idle task's delay
    queue
        .submit(|_| thread::sleep(Duration::from_millis(100)))
        .unwrap();
    let submitted = Instant::now();
    queue
        .add_idle(
            Duration::from_millis(50),
            idle(move |_| tx.send(Instant::now()).unwrap()),
        )
        .unwrap();

    let ran_at = rx.recv_timeout(TIMEOUT).unwrap();
    // 100ms busy, then a fresh 50ms idle budget
    assert!(ran_at.duration_since(submitted) >= Duration::from_millis(140));
    queue.shutdown_await(true);
}

#[test]
fn test_status_observer_sees_drain_for_cleanup() {
    let queue = DispatchQueue::new("file-serializer");
    let open_files = Arc::new(Mutex::new(vec!["a.txt".to_string()]));

    let files = open_files.clone();
    queue.add_status_observer(move |_, status| {
        if status == Status::Dormant {
            files.lock().unwrap().clear();
        }
    });

    queue.submit(|_| {}).unwrap();
    let deadline = Instant::now() + TIMEOUT;
    while !open_files.lock().unwrap().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(open_files.lock().unwrap().is_empty());
    queue.shutdown_await(true);
}

#[test]
fn test_coroutine_fan_out_completes_everything() {
    let scheduler = Scheduler::new(DispatchConfig {
        pool_core_threads: 2,
        pool_max_threads: 2,
        pool_queue_capacity: 1,
        ..DispatchConfig::default()
    });
    let queue = scheduler.coroutine_queue("fan-out");
    let done = Arc::new(AtomicUsize::new(0));

    // More work than the pool accepts: the overflow runs inline
    let tasks: Vec<TaskRef> = (0..32)
        .map(|_| {
            let done = done.clone();
            Arc::new(move |_: &DispatchContext| {
                thread::sleep(Duration::from_millis(2));
                done.fetch_add(1, Ordering::SeqCst);
            }) as TaskRef
        })
        .collect();
    for task in tasks {
        queue.submit_task(Duration::ZERO, None, task).unwrap();
    }

    let deadline = Instant::now() + TIMEOUT;
    while done.load(Ordering::SeqCst) < 32 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(done.load(Ordering::SeqCst), 32);

    queue.shutdown_await(true);
    scheduler.shutdown(true);
    assert!(!scheduler.pool().is_active());
}

#[test]
fn test_global_once() {
    let runs = Arc::new(AtomicUsize::new(0));
    let make = |runs: &Arc<AtomicUsize>| -> TaskRef {
        let runs = runs.clone();
        Arc::new(move |_: &DispatchContext| {
            runs.fetch_add(1, Ordering::SeqCst);
        })
    };

    assert!(crate::once("integration-once", Duration::ZERO, make(&runs))
        .unwrap()
        .is_some());
    assert!(crate::once("integration-once", Duration::ZERO, make(&runs))
        .unwrap()
        .is_none());
    DispatchQueue::standard()
        .sync(Duration::ZERO, None, |_| {})
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
