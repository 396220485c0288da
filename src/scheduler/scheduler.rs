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

//! Central dispatch scheduler owning all process-wide state.

use ahash::AHasher;
use once_cell::sync::OnceCell;
use papaya::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DispatchConfig;
use crate::context::DispatchContext;
use crate::error::DispatchError;
use crate::pool::PoolRegistry;
use crate::queue::DispatchQueue;
use crate::task::TaskRef;

/// Owner of the default queues, the overflow pool registry and the `once`
/// registry.
///
/// Most callers use the lazily built [`Scheduler::instance`]. Tests and
/// embedders can build their own with [`Scheduler::new`] and tear it down
/// deterministically with [`Scheduler::shutdown`].
pub struct Scheduler {
    config: DispatchConfig,
    pool: Arc<PoolRegistry>,
    /// Tokens already used by [`Scheduler::once`]. Append-only.
    once_tokens: HashMap<String, Instant, BuildHasherDefault<AHasher>>,
    standard: DispatchQueue,
    io: DispatchQueue,
}

impl Scheduler {
    pub fn new(config: DispatchConfig) -> Self {
        let pool = PoolRegistry::new(config.clone());
        let standard = DispatchQueue::build(config.standard_queue_name.clone(), &config, None);
        let io = DispatchQueue::build(config.io_queue_name.clone(), &config, Some(pool.clone()));
        Self {
            config,
            pool,
            once_tokens: HashMap::default(),
            standard,
            io,
        }
    }

    /// The global scheduler, configured from `DISPATCHQ_*` environment
    /// variables on first use.
    pub fn instance() -> &'static Scheduler {
        static SCHEDULER: OnceCell<Scheduler> = OnceCell::new();
        SCHEDULER.get_or_init(|| Scheduler::new(DispatchConfig::from_env()))
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// General purpose serial queue.
    pub fn standard(&self) -> &DispatchQueue {
        &self.standard
    }

    /// Coroutine queue for blocking work; tasks fan out over the overflow pool.
    pub fn io(&self) -> &DispatchQueue {
        &self.io
    }

    pub fn pool(&self) -> &Arc<PoolRegistry> {
        &self.pool
    }

    pub fn serial_queue(&self, name: impl Into<String>) -> DispatchQueue {
        DispatchQueue::build(name.into(), &self.config, None)
    }

    /// A queue whose normal tasks run on this scheduler's overflow pool.
    pub fn coroutine_queue(&self, name: impl Into<String>) -> DispatchQueue {
        DispatchQueue::build(name.into(), &self.config, Some(self.pool.clone()))
    }

    /// Submits `task` to the standard queue the first time `token` is seen.
    ///
    /// Tokens are never forgotten, so each one fires at most once for the
    /// lifetime of the scheduler. Later calls return `Ok(None)`.
    pub fn once(
        &self,
        token: impl Into<String>,
        delay: Duration,
        task: TaskRef,
    ) -> Result<Option<DispatchContext>, DispatchError> {
        let token = token.into();
        if self.once_tokens.pin().try_insert(token.clone(), Instant::now()).is_err() {
            tracing::trace!(%token, "Once token already used");
            return Ok(None);
        }
        self.standard.submit_task(delay, None, task).map(Some)
    }

    pub fn has_fired(&self, token: &str) -> bool {
        self.once_tokens.pin().contains_key(token)
    }

    /// Shuts down both default queues. With `wait`, blocks until their workers
    /// exit and the overflow pool drains.
    pub fn shutdown(&self, wait: bool) {
        if wait {
            self.standard.shutdown_await(false);
            self.io.shutdown_await(false);
        } else {
            self.standard.shutdown(false);
            self.io.shutdown(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counting_task(counter: &Arc<AtomicUsize>) -> TaskRef {
        let counter = counter.clone();
        Arc::new(move |_: &DispatchContext| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_scheduler_singleton() {
        let s1 = Scheduler::instance();
        let s2 = Scheduler::instance();
        assert!(std::ptr::eq(s1, s2));
        assert!(DispatchQueue::standard().ptr_eq(s1.standard()));
        assert!(DispatchQueue::io().ptr_eq(s1.io()));
    }

    #[test]
    fn test_default_queues() {
        let scheduler = Scheduler::new(DispatchConfig::default());
        assert_eq!(scheduler.standard().name(), "DispatchQueue#default");
        assert!(!scheduler.standard().is_coroutine());
        assert_eq!(scheduler.io().name(), "DispatchQueue#IO");
        assert!(scheduler.io().is_coroutine());
        assert_eq!(scheduler.pool().refs(), 1);
        scheduler.shutdown(true);
        assert_eq!(scheduler.pool().refs(), 0);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let scheduler = Scheduler::new(DispatchConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));

        let first = scheduler
            .once("warmup", Duration::ZERO, counting_task(&runs))
            .unwrap();
        assert!(first.is_some());
        assert!(scheduler.has_fired("warmup"));

        let second = scheduler
            .once("warmup", Duration::ZERO, counting_task(&runs))
            .unwrap();
        assert!(second.is_none());

        scheduler.standard().sync(Duration::ZERO, None, |_| {}).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Still registered after the task ran
        let third = scheduler
            .once("warmup", Duration::ZERO, counting_task(&runs))
            .unwrap();
        assert!(third.is_none());
        scheduler.shutdown(true);
    }

    #[test]
    fn test_once_is_race_free() {
        let scheduler = Arc::new(Scheduler::new(DispatchConfig::default()));
        let runs = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let scheduler = scheduler.clone();
                let runs = runs.clone();
                thread::spawn(move || {
                    scheduler
                        .once("contended", Duration::ZERO, counting_task(&runs))
                        .unwrap()
                        .is_some()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);

        scheduler.standard().sync(Duration::ZERO, None, |_| {}).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        scheduler.shutdown(true);
    }

    #[test]
    fn test_queues_share_pool_registry() {
        let scheduler = Scheduler::new(DispatchConfig::default());
        let a = scheduler.coroutine_queue("a");
        let b = scheduler.coroutine_queue("b");
        let serial = scheduler.serial_queue("serial");
        assert!(!serial.is_coroutine());
        assert_eq!(scheduler.pool().refs(), 3);

        a.shutdown(false);
        b.shutdown(false);
        // Re-shutdown does not release twice
        b.shutdown(false);
        assert_eq!(scheduler.pool().refs(), 1);
        scheduler.shutdown(false);
        serial.shutdown(false);
        assert_eq!(scheduler.pool().refs(), 0);
    }
}
