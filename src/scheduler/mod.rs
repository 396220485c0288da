//! Process-scoped dispatch state: the default queues, the shared overflow pool
//! and the `once` token registry.
//! The global [`Scheduler::instance`] backs the free functions of this crate.

pub mod scheduler;
pub use scheduler::*;
