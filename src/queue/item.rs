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

//! Queue items and their recycling pool.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use crate::task::{TaskKind, TaskRef};

/// One pending submission.
///
/// Normal items order by absolute run time, idle items by their delay from the
/// start of the idle period; both break ties by submission id, and any normal
/// item sorts before any idle item.
pub(crate) struct QueueItem {
    pub(crate) task: Option<TaskRef>,
    pub(crate) kind: TaskKind,
    pub(crate) run_at: Instant,
    pub(crate) delay: Duration,
    /// Earliest idle-period start a re-armed idle item may count from.
    pub(crate) anchor: Option<Instant>,
    pub(crate) id: u64,
}

impl QueueItem {
    fn blank() -> Self {
        Self {
            task: None,
            kind: TaskKind::Normal,
            run_at: Instant::now(),
            delay: Duration::ZERO,
            anchor: None,
            id: u64::MAX,
        }
    }

    /// When this item becomes runnable, given the current idle-period start.
    pub(crate) fn due(&self, idle_since: Instant) -> Instant {
        match self.kind {
            TaskKind::Normal => self.run_at,
            TaskKind::Idle { .. } => {
                let base = match self.anchor {
                    Some(anchor) => anchor.max(idle_since),
                    None => idle_since,
                };
                base + self.delay
            }
        }
    }

    fn tier(&self) -> u8 {
        match self.kind {
            TaskKind::Normal => 0,
            TaskKind::Idle { .. } => 1,
        }
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tier()
            .cmp(&other.tier())
            .then_with(|| match self.kind {
                TaskKind::Normal => self.run_at.cmp(&other.run_at),
                TaskKind::Idle { .. } => self.delay.cmp(&other.delay),
            })
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueItem {}

/// Index of the idle item that becomes runnable first. Ties fall back to the
/// item ordering, so fresh items still run by delay, then submission id.
pub(crate) fn earliest_idle(idle: &[Box<QueueItem>], idle_since: Instant) -> Option<usize> {
    idle.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.due(idle_since)
                .cmp(&b.due(idle_since))
                .then_with(|| a.cmp(b))
        })
        .map(|(index, _)| index)
}

/// Bounded free list of recycled items.
pub(crate) struct ItemPool {
    free: Vec<Box<QueueItem>>,
    max: usize,
}

impl ItemPool {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            free: Vec::with_capacity(max),
            max,
        }
    }

    pub(crate) fn obtain(
        &mut self,
        task: TaskRef,
        kind: TaskKind,
        delay: Duration,
        id: u64,
    ) -> Box<QueueItem> {
        let mut item = self.free.pop().unwrap_or_else(|| Box::new(QueueItem::blank()));
        item.task = Some(task);
        item.kind = kind;
        item.run_at = Instant::now() + delay;
        item.delay = delay;
        item.anchor = None;
        item.id = id;
        item
    }

    /// Clears `item` and keeps it for reuse if there is room.
    pub(crate) fn recycle(&mut self, mut item: Box<QueueItem>) {
        item.task = None;
        item.delay = Duration::ZERO;
        item.anchor = None;
        item.id = u64::MAX;
        if self.free.len() < self.max {
            self.free.push(item);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.free.len()
    }
}
