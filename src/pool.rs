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

//! Shared overflow pool used by coroutine queues.
//!
//! A coroutine queue orders its tasks on its own worker thread but hands each
//! dequeued normal task to this pool for parallel execution. Jobs first go to
//! `pool_core_threads` threads with a backlog of `pool_queue_capacity`. Once
//! that backlog is full, up to `pool_max_threads - pool_core_threads` burst
//! threads take one job each. Past that, [`OverflowPool::execute`] hands the
//! job back and the caller runs it inline, so saturation degrades to serial
//! execution instead of dropping work.
//!
//! The [`PoolRegistry`] reference counts coroutine queues. The pool is built on
//! first use and torn down when the last coroutine queue releases it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

use crate::config::DispatchConfig;
use crate::sync_utils::panic_message;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Core,
    Burst,
}

pub struct OverflowPool {
    core: rayon::ThreadPool,
    /// Started the first time the core backlog overflows.
    burst: OnceCell<rayon::ThreadPool>,
    core_threads: usize,
    burst_threads: usize,
    /// Running plus queued jobs the core tier accepts.
    core_limit: usize,
    core_in_flight: AtomicUsize,
    burst_in_flight: AtomicUsize,
    closed: AtomicBool,
    drain_lock: Mutex<()>,
    drained: Condvar,
}

/// Releases one in-flight slot when dropped, even if the job panicked.
struct InFlight {
    pool: Arc<OverflowPool>,
    tier: Tier,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.pool.finish(self.tier);
    }
}

fn build_threads(
    count: usize,
    first_index: usize,
) -> Result<rayon::ThreadPool, rayon::ThreadPoolBuildError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(count.max(1))
        .thread_name(move |index| format!("DispatchPool#{}", first_index + index))
        .panic_handler(|payload| {
            tracing::error!(
                panic = %panic_message(payload.as_ref()),
                "Task panicked on overflow pool"
            );
        })
        .build()
}

fn reserve(counter: &AtomicUsize, limit: usize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current < limit).then_some(current + 1)
        })
        .is_ok()
}

impl OverflowPool {
    pub(crate) fn new(config: &DispatchConfig) -> Result<Arc<Self>, rayon::ThreadPoolBuildError> {
        let core_threads = config.pool_core_threads.max(1);
        Ok(Arc::new(Self {
            core: build_threads(core_threads, 0)?,
            burst: OnceCell::new(),
            core_threads,
            burst_threads: config.pool_max_threads.saturating_sub(core_threads),
            core_limit: core_threads + config.pool_queue_capacity,
            core_in_flight: AtomicUsize::new(0),
            burst_in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
        }))
    }

    /// Schedules `job` on the pool. Returns the job untouched if the pool is
    /// closed or saturated; the caller is expected to run it.
    pub(crate) fn execute(self: &Arc<Self>, job: Job) -> Result<(), Job> {
        if self.closed.load(Ordering::Acquire) {
            return Err(job);
        }
        if reserve(&self.core_in_flight, self.core_limit) {
            self.spawn(Tier::Core, &self.core, job);
            return Ok(());
        }
        if self.burst_threads > 0 && reserve(&self.burst_in_flight, self.burst_threads) {
            let burst = self
                .burst
                .get_or_try_init(|| build_threads(self.burst_threads, self.core_threads));
            match burst {
                Ok(burst) => {
                    tracing::trace!(
                        burst_in_flight = self.burst_in_flight.load(Ordering::Relaxed),
                        "Core backlog full, using burst thread"
                    );
                    self.spawn(Tier::Burst, burst, job);
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(%err, "Failed to start burst threads");
                    self.finish(Tier::Burst);
                }
            }
        }
        tracing::debug!(capacity = self.capacity(), "Overflow pool saturated, running inline");
        Err(job)
    }

    fn spawn(self: &Arc<Self>, tier: Tier, threads: &rayon::ThreadPool, job: Job) {
        let slot = InFlight {
            pool: self.clone(),
            tier,
        };
        threads.spawn(move || {
            let _slot = slot;
            job();
        });
    }

    fn finish(&self, tier: Tier) {
        let counter = match tier {
            Tier::Core => &self.core_in_flight,
            Tier::Burst => &self.burst_in_flight,
        };
        counter.fetch_sub(1, Ordering::AcqRel);
        if self.in_flight() == 0 {
            let _guard = self.drain_lock.lock();
            self.drained.notify_all();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.core_in_flight.load(Ordering::Acquire) + self.burst_in_flight.load(Ordering::Acquire)
    }

    /// Jobs accepted before callers run inline.
    pub fn capacity(&self) -> usize {
        self.core_limit + self.burst_threads
    }

    /// Threads started so far, burst threads included.
    pub fn threads(&self) -> usize {
        match self.burst.get() {
            Some(burst) => self.core_threads + burst.current_num_threads(),
            None => self.core_threads,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting jobs. With `wait`, blocks until in-flight jobs finish or
    /// the timeout passes; returns whether the pool fully drained.
    pub(crate) fn shutdown(&self, wait: Option<Duration>) -> bool {
        self.closed.store(true, Ordering::Release);
        let Some(timeout) = wait else {
            return self.in_flight() == 0;
        };
        let deadline = Instant::now() + timeout;
        let mut guard = self.drain_lock.lock();
        while self.in_flight() > 0 {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    in_flight = self.in_flight(),
                    "Overflow pool did not drain before timeout"
                );
                return false;
            }
            self.drained.wait_for(&mut guard, deadline - now);
        }
        true
    }
}

/// Reference-counted owner of the overflow pool.
pub struct PoolRegistry {
    config: DispatchConfig,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    refs: usize,
    pool: Option<Arc<OverflowPool>>,
}

impl PoolRegistry {
    pub fn new(config: DispatchConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Registers one more coroutine queue.
    pub(crate) fn retain(&self) {
        self.state.lock().refs += 1;
    }

    /// Drops one coroutine queue reference. The last release tears the pool
    /// down, optionally waiting for it to drain.
    pub(crate) fn release(&self, wait: bool) {
        let retired = {
            let mut state = self.state.lock();
            state.refs = state.refs.saturating_sub(1);
            if state.refs == 0 {
                state.pool.take()
            } else {
                None
            }
        };
        if let Some(pool) = retired {
            tracing::debug!(in_flight = pool.in_flight(), wait, "Tearing down overflow pool");
            let timeout = wait.then(|| self.config.pool_shutdown_timeout());
            pool.shutdown(timeout);
        }
    }

    /// The live pool, built on first use. `None` when no coroutine queue holds
    /// a reference or the pool cannot be built.
    pub(crate) fn get_or_create(&self) -> Option<Arc<OverflowPool>> {
        let mut state = self.state.lock();
        if state.refs == 0 {
            return None;
        }
        if let Some(pool) = &state.pool {
            return Some(pool.clone());
        }
        match OverflowPool::new(&self.config) {
            Ok(pool) => {
                tracing::debug!(
                    threads = self.config.pool_core_threads,
                    capacity = pool.capacity(),
                    "Created overflow pool"
                );
                state.pool = Some(pool.clone());
                Some(pool)
            }
            Err(err) => {
                tracing::warn!(%err, "Failed to build overflow pool");
                None
            }
        }
    }

    pub fn refs(&self) -> usize {
        self.state.lock().refs
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().pool.is_some()
    }
}
