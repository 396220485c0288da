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

//! Handle identifying one submission to a dispatch queue.

use once_cell::sync::OnceCell;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bundle::Bundle;
use crate::queue::DispatchQueue;

/// Task handle returned by a submission and passed to the task when it runs.
///
/// Clones share the same cancellation flag and bundle. Cancelling only takes
/// effect if the worker has not started the task yet.
#[derive(Clone)]
pub struct DispatchContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    queue: DispatchQueue,
    task_id: u64,
    cancelled: AtomicBool,
    bundle: OnceCell<Bundle>,
}

impl DispatchContext {
    pub(crate) fn new(task_id: u64, queue: DispatchQueue, bundle: Option<Bundle>) -> Self {
        let context = Self {
            inner: Arc::new(ContextInner {
                queue,
                task_id,
                cancelled: AtomicBool::new(false),
                bundle: OnceCell::new(),
            }),
        };
        if let Some(bundle) = bundle {
            context.set_bundle(bundle);
        }
        context
    }

    /// The queue this task was submitted to.
    pub fn queue(&self) -> &DispatchQueue {
        &self.inner.queue
    }

    /// Submission id, unique and monotonic per queue.
    pub fn task_id(&self) -> u64 {
        self.inner.task_id
    }

    pub fn bundle(&self) -> Option<&Bundle> {
        self.inner.bundle.get()
    }

    /// Attaches a bundle. Only the first call has an effect.
    pub fn set_bundle(&self, bundle: Bundle) -> bool {
        self.inner.bundle.set(bundle).is_ok()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &DispatchContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("queue", &self.inner.queue.name())
            .field("task_id", &self.inner.task_id)
            .field("cancelled", &self.is_cancelled())
            .field("bundle", &self.inner.bundle.get())
            .finish()
    }
}
