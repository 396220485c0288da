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

//! The worker loop driving one queue.

use std::cell::Cell;
use std::cmp::Reverse;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;

use super::item::earliest_idle;
use super::{Shared, Status};
use crate::context::DispatchContext;
use crate::pool::{Job, PoolRegistry};
use crate::sync_utils::panic_message;
use crate::task::{TaskKind, TaskRef, task_identity};

thread_local! {
    /// Address of the queue whose worker is running on this thread.
    static CURRENT_QUEUE: Cell<usize> = const { Cell::new(0) };
}

fn queue_key(shared: &Arc<Shared>) -> usize {
    Arc::as_ptr(shared) as usize
}

/// Whether the calling thread is `shared`'s worker.
pub(super) fn is_current(shared: &Arc<Shared>) -> bool {
    CURRENT_QUEUE.with(|current| current.get() == queue_key(shared))
}

struct Dequeued {
    task: TaskRef,
    kind: TaskKind,
    delay: Duration,
}

enum Fetched {
    Run(Dequeued),
    /// Both structures are empty; the worker has given up ownership.
    Drained,
    Destroyed,
}

pub(super) fn run(shared: Arc<Shared>, epoch: u64) {
    CURRENT_QUEUE.with(|current| current.set(queue_key(&shared)));

    loop {
        if shared.is_destroyed() {
            break;
        }
        let dequeued = match fetch(&shared) {
            Fetched::Run(dequeued) => dequeued,
            Fetched::Drained => {
                tracing::debug!(queue = %shared.name, "Queue drained, worker exiting");
                break;
            }
            Fetched::Destroyed => break,
        };
        let key = task_identity(&dequeued.task);
        if let Err(payload) = execute(&shared, dequeued) {
            tracing::error!(
                queue = %shared.name,
                panic = %panic_message(payload.as_ref()),
                "Task panicked, retiring worker"
            );
            shared.contexts.lock().remove(&key);
            retire(&shared, epoch);
            break;
        }
    }

    if shared.is_destroyed() {
        discard_pending(&shared);
    }
    CURRENT_QUEUE.with(|current| current.set(0));
}

/// Drops whatever is still queued on a destroyed queue so waiters holding
/// those tasks are released.
fn discard_pending(shared: &Arc<Shared>) {
    let discarded = {
        let mut tasks = shared.tasks.lock();
        shared.take_pending(&mut tasks, true)
    };
    if !discarded.is_empty() {
        tracing::debug!(queue = %shared.name, count = discarded.len(), "Discarding tasks of destroyed queue");
    }
}

/// Gives up worker ownership after a fault so the next submission starts a
/// fresh thread.
fn retire(shared: &Arc<Shared>, epoch: u64) {
    {
        let mut tasks = shared.tasks.lock();
        if tasks.epoch != epoch {
            return;
        }
        tasks.worker_alive = false;
        tasks.draining_idle = false;
        shared.store_status(Status::Dormant);
    }
    shared.deliver_status();
}

/// Blocks until a task is due, the queue drains, or it is destroyed.
fn fetch(shared: &Arc<Shared>) -> Fetched {
    let mut tasks = shared.tasks.lock();
    loop {
        if shared.is_destroyed() {
            return Fetched::Destroyed;
        }
        let now = Instant::now();
        let mut changed = false;

        if tasks.normal.is_empty() {
            if !tasks.draining_idle {
                tasks.draining_idle = true;
                tasks.idle_since = now;
                changed |= shared.store_status(Status::Idle);
            }
            if tasks.idle.is_empty() {
                tasks.worker_alive = false;
                tasks.draining_idle = false;
                shared.store_status(Status::Dormant);
                drop(tasks);
                shared.deliver_status();
                return Fetched::Drained;
            }
        } else if tasks.draining_idle {
            tasks.draining_idle = false;
            changed |= shared.store_status(Status::Busy);
        }

        if changed {
            MutexGuard::unlocked(&mut tasks, || shared.deliver_status());
            continue;
        }

        let idle_since = tasks.idle_since;
        let head = if tasks.draining_idle {
            earliest_idle(&tasks.idle, idle_since)
                .map(|index| (tasks.idle[index].due(idle_since), Some(index)))
        } else {
            tasks
                .normal
                .peek()
                .map(|Reverse(head)| (head.due(idle_since), None))
        };
        let Some((due, index)) = head else {
            continue;
        };
        if due > now {
            shared.available.wait_for(&mut tasks, due - now);
            continue;
        }

        let item = match index {
            Some(index) => Some(tasks.idle.swap_remove(index)),
            None => tasks.normal.pop().map(|Reverse(item)| item),
        };
        let Some(mut item) = item else {
            continue;
        };
        let task = item.task.take();
        let (kind, delay) = (item.kind, item.delay);
        shared.items.lock().recycle(item);
        if let Some(task) = task {
            return Fetched::Run(Dequeued { task, kind, delay });
        }
    }
}

/// Runs one dequeued task. Returns the panic payload if it faulted on this
/// thread.
fn execute(shared: &Arc<Shared>, dequeued: Dequeued) -> thread::Result<()> {
    let Dequeued { task, kind, delay } = dequeued;
    let key = task_identity(&task);
    let context = {
        let mut contexts = shared.contexts.lock();
        if kind.is_reusable() {
            contexts.get(&key).cloned()
        } else {
            contexts.remove(&key)
        }
    };
    let Some(context) = context else {
        return Ok(());
    };
    if context.is_cancelled() {
        if kind.is_reusable() {
            shared.contexts.lock().remove(&key);
        }
        tracing::trace!(queue = %shared.name, task_id = context.task_id(), "Skipping cancelled task");
        return Ok(());
    }

    match (&shared.registry, kind) {
        (Some(registry), TaskKind::Normal) => hand_off(shared, registry, task, context),
        _ => {
            panic::catch_unwind(AssertUnwindSafe(|| task.run(&context)))?;
            if kind.is_reusable() {
                rearm(shared, task, delay);
            }
            Ok(())
        }
    }
}

/// Passes a coroutine task to the overflow pool, running it inline when the
/// pool is saturated or unavailable.
fn hand_off(
    shared: &Arc<Shared>,
    registry: &Arc<PoolRegistry>,
    task: TaskRef,
    context: DispatchContext,
) -> thread::Result<()> {
    let job: Job = Box::new(move || task.run(&context));
    let job = match registry.get_or_create() {
        Some(pool) => match pool.execute(job) {
            Ok(()) => return Ok(()),
            Err(job) => job,
        },
        None => {
            tracing::warn!(queue = %shared.name, "Overflow pool unavailable, running inline");
            job
        }
    };
    panic::catch_unwind(AssertUnwindSafe(job))
}

/// Re-enqueues a reusable idle task, due one full delay after this run.
fn rearm(shared: &Arc<Shared>, task: TaskRef, delay: Duration) {
    let key = task_identity(&task);
    let contexts = shared.contexts.lock();
    if !contexts.contains_key(&key) {
        return;
    }
    let mut tasks = shared.tasks.lock();
    if shared.is_destroyed() {
        return;
    }
    let id = tasks.next_id;
    tasks.next_id += 1;
    let mut item = shared
        .items
        .lock()
        .obtain(task, TaskKind::Idle { reusable: true }, delay, id);
    item.anchor = Some(Instant::now());
    tasks.idle.push(item);
    tracing::trace!(queue = %shared.name, id, ?delay, "Re-armed idle task");
}
