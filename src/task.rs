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

//! Units of work accepted by a dispatch queue.
//!
//! Every task carries an explicit [`TaskKind`]. Plain closures are `Normal`
//! tasks; [`idle`] and [`reusable_idle`] wrap a closure so it only runs while
//! its queue has no normal work pending.

use std::sync::Arc;

use crate::context::DispatchContext;

/// Scheduling tier of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Normal,
    /// Runs only when no normal task is pending. A `reusable` idle task is
    /// re-enqueued after every run until its queue shuts down.
    Idle { reusable: bool },
}

impl TaskKind {
    pub fn is_idle(self) -> bool {
        matches!(self, TaskKind::Idle { .. })
    }

    pub fn is_reusable(self) -> bool {
        matches!(self, TaskKind::Idle { reusable: true })
    }
}

pub trait Task: Send + Sync + 'static {
    fn run(&self, context: &DispatchContext);

    fn kind(&self) -> TaskKind {
        TaskKind::Normal
    }
}

impl<F> Task for F
where
    F: Fn(&DispatchContext) + Send + Sync + 'static,
{
    fn run(&self, context: &DispatchContext) {
        self(context)
    }
}

/// Shared task reference. Its allocation address is the task's identity while
/// it is pending on a queue.
pub type TaskRef = Arc<dyn Task>;

pub(crate) fn task_identity(task: &TaskRef) -> usize {
    Arc::as_ptr(task) as *const () as usize
}

/// A closure tagged as an idle task.
pub struct IdleTask<F> {
    body: F,
    reusable: bool,
}

impl<F> Task for IdleTask<F>
where
    F: Fn(&DispatchContext) + Send + Sync + 'static,
{
    fn run(&self, context: &DispatchContext) {
        (self.body)(context)
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Idle {
            reusable: self.reusable,
        }
    }
}

/// Wraps `body` as a one-shot idle task.
pub fn idle<F>(body: F) -> TaskRef
where
    F: Fn(&DispatchContext) + Send + Sync + 'static,
{
    Arc::new(IdleTask {
        body,
        reusable: false,
    })
}

/// Wraps `body` as an idle task that re-arms itself after each run.
pub fn reusable_idle<F>(body: F) -> TaskRef
where
    F: Fn(&DispatchContext) + Send + Sync + 'static,
{
    Arc::new(IdleTask {
        body,
        reusable: true,
    })
}
