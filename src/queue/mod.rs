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

//! Per-queue task scheduler.
//!
//! A [`DispatchQueue`] keeps two priority structures: normal tasks ordered by
//! run time and idle tasks picked by earliest due time, measured from the
//! moment the queue went idle. A single worker thread, started lazily on submission and retired
//! once both structures drain, pops due tasks in order. Coroutine queues hand
//! normal tasks to the shared overflow pool instead of running them inline.

mod item;
mod worker;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::AHasher;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::bundle::Bundle;
use crate::config::{ANONYMOUS_QUEUE_NAME, DispatchConfig};
use crate::context::DispatchContext;
use crate::error::DispatchError;
use crate::pool::PoolRegistry;
use crate::scheduler::Scheduler;
use crate::task::{TaskRef, task_identity};

use item::{ItemPool, QueueItem};

/// How often a blocked `sync` caller re-checks whether its task can still run.
const SYNC_POLL: Duration = Duration::from_millis(50);

/// Lifecycle of a queue. `Destroy` is terminal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Init = 0,
    /// Normal tasks are being drained.
    Busy = 1,
    /// No normal task is pending; the worker drains idle tasks.
    Idle = 2,
    /// Both structures drained and the worker thread exited.
    Dormant = 3,
    Destroy = 4,
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        match value {
            0 => Status::Init,
            1 => Status::Busy,
            2 => Status::Idle,
            3 => Status::Dormant,
            _ => Status::Destroy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&DispatchQueue, Status) + Send + Sync>;

pub(crate) struct TaskQueues {
    normal: BinaryHeap<Reverse<Box<QueueItem>>>,
    /// Few entries; the worker scans for the earliest due item.
    idle: Vec<Box<QueueItem>>,
    draining_idle: bool,
    idle_since: Instant,
    next_id: u64,
    worker_alive: bool,
    /// Bumped on every worker spawn so a retiring worker can tell whether it
    /// still owns the queue.
    epoch: u64,
    /// Join handle of the newest worker, tagged with its epoch.
    worker: Option<(u64, JoinHandle<()>)>,
}

/// Status changes waiting for observers, in the order they were stored.
#[derive(Default)]
struct Outbox {
    pending: VecDeque<Status>,
    delivering: bool,
}

/// Hands delivery back if an observer panics.
struct Delivery<'a> {
    outbox: &'a Mutex<Outbox>,
    finished: bool,
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.outbox.lock().delivering = false;
        }
    }
}

pub(crate) struct Shared {
    name: String,
    registry: Option<Arc<PoolRegistry>>,
    status: AtomicU8,
    observers: RwLock<im::Vector<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
    outbox: Mutex<Outbox>,
    contexts: Mutex<HashMap<usize, DispatchContext, BuildHasherDefault<AHasher>>>,
    tasks: Mutex<TaskQueues>,
    available: Condvar,
    items: Mutex<ItemPool>,
}

impl Shared {
    fn status(&self) -> Status {
        Status::from(self.status.load(Ordering::Acquire))
    }

    fn is_destroyed(&self) -> bool {
        self.status() == Status::Destroy
    }

    /// Stores `status` unless the queue is destroyed or already there, and
    /// queues it for observers. Callers hold the tasks lock so the outbox
    /// order matches the store order.
    fn store_status(&self, status: Status) -> bool {
        let changed = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current = Status::from(current);
                (current != Status::Destroy && current != status).then_some(status as u8)
            })
            .is_ok();
        if changed {
            self.outbox.lock().pending.push_back(status);
        }
        changed
    }

    /// Runs observers for every queued status change, oldest first. Must be
    /// called with no queue lock held. If another thread is already
    /// delivering, it picks up our changes after its current ones.
    fn deliver_status(self: &Arc<Self>) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.delivering || outbox.pending.is_empty() {
                return;
            }
            outbox.delivering = true;
        }
        let mut delivery = Delivery {
            outbox: &self.outbox,
            finished: false,
        };
        let queue = DispatchQueue {
            shared: self.clone(),
        };
        loop {
            let status = {
                let mut outbox = self.outbox.lock();
                match outbox.pending.pop_front() {
                    Some(status) => status,
                    None => {
                        outbox.delivering = false;
                        delivery.finished = true;
                        return;
                    }
                }
            };
            tracing::trace!(queue = %self.name, ?status, "Queue status changed");
            let snapshot = self.observers.read().clone();
            for (_, observer) in snapshot.iter() {
                observer(&queue, status);
            }
        }
    }

    /// Removes pending items and returns their tasks so the caller can drop
    /// them once no lock is held.
    fn take_pending(&self, tasks: &mut TaskQueues, include_idle: bool) -> Vec<TaskRef> {
        let idle = if include_idle {
            std::mem::take(&mut tasks.idle)
        } else {
            Vec::new()
        };
        let mut items = self.items.lock();
        let mut taken = Vec::new();
        for mut item in tasks.normal.drain().map(|Reverse(item)| item).chain(idle) {
            taken.extend(item.task.take());
            items.recycle(item);
        }
        taken
    }
}

/// A named task queue with a lazily created worker thread.
///
/// Handles are cheap to clone and all refer to the same queue. A queue runs
/// until [`shutdown`](Self::shutdown) is called; dropping handles does not
/// stop it.
#[derive(Clone)]
pub struct DispatchQueue {
    shared: Arc<Shared>,
}

impl DispatchQueue {
    /// A serial queue with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), &DispatchConfig::default(), None)
    }

    pub fn with_config(name: impl Into<String>, config: &DispatchConfig) -> Self {
        Self::build(name.into(), config, None)
    }

    /// A coroutine queue sharing the global scheduler's overflow pool.
    pub fn coroutine(name: impl Into<String>) -> Self {
        Scheduler::instance().coroutine_queue(name)
    }

    /// The global serial queue.
    pub fn standard() -> Self {
        Scheduler::instance().standard().clone()
    }

    /// The global coroutine queue for blocking work.
    pub fn io() -> Self {
        Scheduler::instance().io().clone()
    }

    pub(crate) fn build(
        name: String,
        config: &DispatchConfig,
        registry: Option<Arc<PoolRegistry>>,
    ) -> Self {
        if let Some(registry) = &registry {
            registry.retain();
        }
        Self {
            shared: Arc::new(Shared {
                name,
                registry,
                status: AtomicU8::new(Status::Init as u8),
                observers: RwLock::new(im::Vector::new()),
                next_observer: AtomicU64::new(0),
                outbox: Mutex::new(Outbox::default()),
                contexts: Mutex::new(HashMap::default()),
                tasks: Mutex::new(TaskQueues {
                    normal: BinaryHeap::new(),
                    idle: Vec::new(),
                    draining_idle: false,
                    idle_since: Instant::now(),
                    next_id: 0,
                    worker_alive: false,
                    epoch: 0,
                    worker: None,
                }),
                available: Condvar::new(),
                items: Mutex::new(ItemPool::new(config.item_pool_max)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether dequeued normal tasks run on the shared overflow pool.
    pub fn is_coroutine(&self) -> bool {
        self.shared.registry.is_some()
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Number of pending (normal, idle) items.
    pub fn pending(&self) -> (usize, usize) {
        let tasks = self.shared.tasks.lock();
        (tasks.normal.len(), tasks.idle.len())
    }

    pub fn ptr_eq(&self, other: &DispatchQueue) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Registers a callback run on every status change, in the order the
    /// changes happened.
    pub fn add_status_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&DispatchQueue, Status) + Send + Sync + 'static,
    {
        let id = ObserverId(self.shared.next_observer.fetch_add(1, Ordering::Relaxed));
        self.shared
            .observers
            .write()
            .push_back((id, Arc::new(observer)));
        id
    }

    pub fn remove_status_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.shared.observers.write();
        match observers.iter().position(|(each, _)| *each == id) {
            Some(index) => {
                observers.remove(index);
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Submits `task` to run once `delay` has passed.
    ///
    /// Submitting a task instance that is still pending returns its existing
    /// context and schedules nothing new.
    pub fn submit_task(
        &self,
        delay: Duration,
        bundle: Option<Bundle>,
        task: TaskRef,
    ) -> Result<DispatchContext, DispatchError> {
        let shared = &self.shared;
        if shared.is_destroyed() {
            return Err(DispatchError::QueueDestroyed(shared.name.clone()));
        }
        let key = task_identity(&task);
        let kind = task.kind();

        let mut contexts = shared.contexts.lock();
        if let Some(existing) = contexts.get(&key) {
            return Ok(existing.clone());
        }

        let (context, spawn) = {
            let mut tasks = shared.tasks.lock();
            if shared.is_destroyed() {
                return Err(DispatchError::QueueDestroyed(shared.name.clone()));
            }
            let id = tasks.next_id;
            tasks.next_id += 1;
            let context = DispatchContext::new(id, self.clone(), bundle);
            let item = shared.items.lock().obtain(task, kind, delay, id);
            if kind.is_idle() {
                tasks.idle.push(item);
            } else {
                tasks.normal.push(Reverse(item));
            }

            let spawn = if tasks.worker_alive {
                None
            } else {
                tasks.worker_alive = true;
                tasks.epoch += 1;
                tasks.draining_idle = false;
                tasks.idle_since = Instant::now();
                shared.store_status(Status::Busy);
                Some(tasks.epoch)
            };
            shared.available.notify_all();
            (context, spawn)
        };
        contexts.insert(key, context.clone());
        drop(contexts);

        tracing::trace!(queue = %shared.name, task_id = context.task_id(), ?delay, ?kind, "Task submitted");

        if let Some(epoch) = spawn {
            shared.deliver_status();
            self.spawn_worker(epoch)?;
        }
        Ok(context)
    }

    /// Submits a closure to run as soon as possible.
    pub fn submit<F>(&self, task: F) -> Result<DispatchContext, DispatchError>
    where
        F: Fn(&DispatchContext) + Send + Sync + 'static,
    {
        self.submit_task(Duration::ZERO, None, Arc::new(task))
    }

    pub fn submit_after<F>(&self, delay: Duration, task: F) -> Result<DispatchContext, DispatchError>
    where
        F: Fn(&DispatchContext) + Send + Sync + 'static,
    {
        self.submit_task(delay, None, Arc::new(task))
    }

    pub fn submit_with<F>(
        &self,
        delay: Duration,
        bundle: Option<Bundle>,
        task: F,
    ) -> Result<DispatchContext, DispatchError>
    where
        F: Fn(&DispatchContext) + Send + Sync + 'static,
    {
        self.submit_task(delay, bundle, Arc::new(task))
    }

    /// Submits an idle task, typically built with [`crate::idle`] or
    /// [`crate::reusable_idle`]. A normal task passed here is scheduled as a
    /// normal task.
    pub fn add_idle(&self, delay: Duration, task: TaskRef) -> Result<DispatchContext, DispatchError> {
        self.submit_task(delay, None, task)
    }

    /// Submits `task` and blocks until it has run.
    ///
    /// Fails with [`DispatchError::SyncFromWorker`] when called from this
    /// queue's own worker, and with [`DispatchError::Abandoned`] if the task is
    /// cancelled, panics, or the queue is destroyed before it starts.
    pub fn sync<F>(&self, delay: Duration, bundle: Option<Bundle>, task: F) -> Result<(), DispatchError>
    where
        F: Fn(&DispatchContext) + Send + Sync + 'static,
    {
        if worker::is_current(&self.shared) {
            return Err(DispatchError::SyncFromWorker(self.shared.name.clone()));
        }
        let started = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let flag = started.clone();
        self.submit_with(delay, bundle, move |context| {
            flag.store(true, Ordering::Release);
            task(context);
            let _ = done_tx.send(());
        })?;

        loop {
            match done_rx.recv_timeout(SYNC_POLL) {
                Ok(()) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DispatchError::Abandoned(self.shared.name.clone()));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_destroyed() && !started.load(Ordering::Acquire) {
                        return Err(DispatchError::Abandoned(self.shared.name.clone()));
                    }
                }
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Destroys the queue without waiting for its worker. With `clear`, pending
    /// normal tasks are discarded right away; otherwise the worker discards
    /// whatever is left when it exits.
    pub fn shutdown(&self, clear: bool) {
        self.shutdown_inner(false, clear);
    }

    /// Destroys the queue and blocks until its worker thread has exited.
    pub fn shutdown_await(&self, clear: bool) {
        self.shutdown_inner(true, clear);
    }

    fn shutdown_inner(&self, wait: bool, clear: bool) {
        let shared = &self.shared;
        let (discarded, handle) = {
            let mut tasks = shared.tasks.lock();
            if !shared.store_status(Status::Destroy) {
                return;
            }
            let discarded = if clear || !tasks.worker_alive {
                // Without a live worker nothing would ever release these
                let include_idle = !tasks.worker_alive;
                shared.take_pending(&mut tasks, include_idle)
            } else {
                Vec::new()
            };
            shared.available.notify_all();
            let handle = if wait { tasks.worker.take() } else { None };
            (discarded, handle)
        };
        tracing::debug!(queue = %shared.name, wait, clear, "Shutting down queue");

        let retired = std::mem::take(&mut *shared.contexts.lock());
        drop(retired);
        drop(discarded);
        shared.deliver_status();

        if let Some((epoch, handle)) = handle {
            if worker::is_current(shared) {
                tracing::trace!(queue = %shared.name, epoch, "Shutdown from worker, not joining");
            } else if handle.join().is_err() {
                tracing::warn!(queue = %shared.name, epoch, "Worker thread ended with a panic");
            }
        }
        if let Some(registry) = &shared.registry {
            registry.release(wait);
        }
    }

    fn spawn_worker(&self, epoch: u64) -> Result<(), DispatchError> {
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}#Worker", self.shared.name))
            .spawn(move || worker::run(shared, epoch));
        match spawned {
            Ok(handle) => {
                let mut tasks = self.shared.tasks.lock();
                // An older generation finishing late must not replace a newer handle
                if tasks.epoch == epoch {
                    tasks.worker = Some((epoch, handle));
                }
                drop(tasks);
                tracing::debug!(queue = %self.shared.name, epoch, "Started worker thread");
                Ok(())
            }
            Err(source) => {
                let mut tasks = self.shared.tasks.lock();
                if tasks.epoch == epoch {
                    tasks.worker_alive = false;
                }
                Err(DispatchError::Spawn {
                    name: self.shared.name.clone(),
                    source,
                })
            }
        }
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new(ANONYMOUS_QUEUE_NAME)
    }
}

impl Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("name", &self.shared.name)
            .field("coroutine", &self.is_coroutine())
            .field("status", &self.status())
            .finish()
    }
}
