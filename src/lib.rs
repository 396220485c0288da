//! dispatchq task dispatch runtime
//!
//! Named queues with a lazily started worker thread each, priority ordering
//! of delayed and idle tasks, cancellation handles carrying a payload bundle,
//! a shared overflow pool for parallel queues, and fan-out/fan-in groups.

pub mod bundle;
pub mod config;
pub mod context;
pub mod error;
pub mod group;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod task;

mod sync_utils;

#[cfg(test)]
mod integration_tests;

use std::time::Duration;

// Re-export main public APIs
pub use bundle::Bundle;
pub use config::DispatchConfig;
pub use context::DispatchContext;
pub use error::{ConfigError, DispatchError};
pub use group::DispatchGroup;
pub use queue::{DispatchQueue, ObserverId, Status};
pub use scheduler::Scheduler;
pub use task::{Task, TaskKind, TaskRef, idle, reusable_idle};

/// Runs `task` on the global standard queue the first time `token` is seen.
pub fn once(
    token: impl Into<String>,
    delay: Duration,
    task: TaskRef,
) -> Result<Option<DispatchContext>, DispatchError> {
    Scheduler::instance().once(token, delay, task)
}
