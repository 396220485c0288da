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

//! Fan-out/fan-in over dispatch queues.
//!
//! A [`DispatchGroup`] collects tasks with [`dispatch`](DispatchGroup::dispatch)
//! and submits them all when [`notify`](DispatchGroup::notify) is called. A
//! waiter on the I/O queue blocks until every batch task has finished (or, in
//! manual-leave mode, until [`leave`](DispatchGroup::leave) was called once per
//! task) and then submits the completion task. A group fires once; afterwards
//! it rejects every operation.
//!
//! A batch task that never runs, because its queue rejected it, cancelled it
//! or was destroyed with the task still pending, counts as finished when it is
//! dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::bundle::Bundle;
use crate::context::DispatchContext;
use crate::error::DispatchError;
use crate::queue::DispatchQueue;
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskKind, TaskRef};

/// Counting semaphore used to collect batch completions.
struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    fn release(&self) {
        *self.permits.lock() += 1;
        self.available.notify_all();
    }

    fn acquire(&self, count: usize) {
        let mut permits = self.permits.lock();
        while *permits < count {
            self.available.wait(&mut permits);
        }
        *permits -= count;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Notified,
    Done,
}

struct Entry {
    queue: DispatchQueue,
    bundle: Option<Bundle>,
    task: TaskRef,
}

struct GroupState {
    phase: Phase,
    batch: Vec<Entry>,
}

struct GroupInner {
    manual_leave: bool,
    waiter: DispatchQueue,
    state: Mutex<GroupState>,
    permits: Semaphore,
}

/// Batch task wrapper that releases one permit: when its first run finishes
/// (even by panicking), or when it is dropped without ever running.
struct Tracked {
    task: TaskRef,
    /// `None` in manual-leave mode.
    group: Option<Arc<GroupInner>>,
    ran: AtomicBool,
}

impl Tracked {
    fn new(task: TaskRef, group: Option<Arc<GroupInner>>) -> Self {
        Self {
            task,
            group,
            ran: AtomicBool::new(false),
        }
    }
}

struct Release<'a>(&'a Option<Arc<GroupInner>>);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        if let Some(group) = self.0 {
            group.permits.release();
        }
    }
}

impl Task for Tracked {
    fn run(&self, context: &DispatchContext) {
        let _release = (!self.ran.swap(true, Ordering::AcqRel)).then(|| Release(&self.group));
        self.task.run(context);
    }

    fn kind(&self) -> TaskKind {
        self.task.kind()
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        if !*self.ran.get_mut() {
            if let Some(group) = &self.group {
                tracing::trace!("Group task dropped before running, counting it as finished");
                group.permits.release();
            }
        }
    }
}

/// One-shot fan-out/fan-in coordinator. Clones share the same group.
#[derive(Clone)]
pub struct DispatchGroup {
    inner: Arc<GroupInner>,
}

impl DispatchGroup {
    /// A group whose completion waiter runs on the global I/O queue.
    pub fn new() -> Self {
        Self::build(Scheduler::instance(), false)
    }

    /// A group where finishing a batch task does not count toward completion;
    /// callers call [`leave`](Self::leave) once per unit of work instead.
    pub fn manual_leave() -> Self {
        Self::build(Scheduler::instance(), true)
    }

    pub fn with_scheduler(scheduler: &Scheduler, manual_leave: bool) -> Self {
        Self::build(scheduler, manual_leave)
    }

    fn build(scheduler: &Scheduler, manual_leave: bool) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                manual_leave,
                waiter: scheduler.io().clone(),
                state: Mutex::new(GroupState {
                    phase: Phase::Open,
                    batch: Vec::new(),
                }),
                permits: Semaphore::new(),
            }),
        }
    }

    /// Adds `task` to the batch. Nothing runs until [`notify`](Self::notify).
    pub fn dispatch(
        &self,
        queue: &DispatchQueue,
        bundle: Option<Bundle>,
        task: TaskRef,
    ) -> Result<(), DispatchError> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Open {
            return Err(DispatchError::GroupDone);
        }
        state.batch.push(Entry {
            queue: queue.clone(),
            bundle,
            task,
        });
        Ok(())
    }

    /// Closure form of [`dispatch`](Self::dispatch).
    pub fn dispatch_fn<F>(&self, queue: &DispatchQueue, task: F) -> Result<(), DispatchError>
    where
        F: Fn(&DispatchContext) + Send + Sync + 'static,
    {
        self.dispatch(queue, None, Arc::new(task))
    }

    /// Finalizes the batch, submits it, and schedules `task` on `queue` once
    /// every batch task has finished.
    pub fn notify(
        &self,
        queue: &DispatchQueue,
        bundle: Option<Bundle>,
        task: TaskRef,
    ) -> Result<(), DispatchError> {
        let batch = {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Open {
                return Err(DispatchError::GroupDone);
            }
            if queue.is_destroyed() {
                return Err(DispatchError::QueueDestroyed(queue.name().to_string()));
            }
            state.phase = Phase::Notified;
            std::mem::take(&mut state.batch)
        };
        let expected = batch.len();
        tracing::debug!(tasks = expected, notify_queue = %queue.name(), "Dispatching group");

        for entry in batch {
            let group = (!self.inner.manual_leave).then(|| self.inner.clone());
            let tracked: TaskRef = Arc::new(Tracked::new(entry.task, group));
            // A rejected task is dropped here, which counts it as finished
            if let Err(err) = entry.queue.submit_task(Duration::ZERO, entry.bundle, tracked) {
                tracing::warn!(%err, queue = %entry.queue.name(), "Group task rejected");
            }
        }

        let group = self.inner.clone();
        let notify_queue = queue.clone();
        let waiter = move || {
            group.permits.acquire(expected);
            group.state.lock().phase = Phase::Done;
            if let Err(err) = notify_queue.submit_task(Duration::ZERO, bundle.clone(), task.clone()) {
                tracing::warn!(%err, "Group completion task rejected");
            }
        };
        self.spawn_waiter(waiter)
    }

    /// Closure form of [`notify`](Self::notify).
    pub fn notify_fn<F>(&self, queue: &DispatchQueue, task: F) -> Result<(), DispatchError>
    where
        F: Fn(&DispatchContext) + Send + Sync + 'static,
    {
        self.notify(queue, None, Arc::new(task))
    }

    /// Counts one unit of work as finished. Fails once the group is done.
    pub fn leave(&self) -> Result<(), DispatchError> {
        let state = self.inner.state.lock();
        if state.phase == Phase::Done {
            return Err(DispatchError::GroupDone);
        }
        self.inner.permits.release();
        Ok(())
    }

    /// Whether the completion task has been released.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().phase == Phase::Done
    }

    /// Runs the completion waiter on the I/O queue, or on a dedicated thread
    /// if that queue has been shut down.
    fn spawn_waiter<F>(&self, waiter: F) -> Result<(), DispatchError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let waiter = Arc::new(waiter);
        let on_queue = waiter.clone();
        let task: TaskRef = Arc::new(move |_: &DispatchContext| on_queue());
        match self.inner.waiter.submit_task(Duration::ZERO, None, task) {
            Ok(_) => Ok(()),
            Err(DispatchError::QueueDestroyed(name)) => {
                tracing::debug!(queue = %name, "Waiter queue destroyed, waiting on a dedicated thread");
                let spawned = thread::Builder::new()
                    .name("DispatchGroup#waiter".to_string())
                    .spawn(move || waiter());
                spawned.map(|_| ()).map_err(|source| DispatchError::Spawn {
                    name: "DispatchGroup#waiter".to_string(),
                    source,
                })
            }
            Err(err) => Err(err),
        }
    }
}

impl Default for DispatchGroup {
    fn default() -> Self {
        Self::new()
    }
}
