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

//! Error types for the dispatch runtime.
//!
//! Usage errors are reported synchronously at the call site. Faults raised by
//! task bodies never surface here; they are contained at the worker boundary.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by queue, group and scheduler operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The target queue has been shut down and rejects all further work.
    #[error("{0} dispatch queue is destroyed")]
    QueueDestroyed(String),

    /// The group was finalized by `notify` and cannot be reused.
    #[error("dispatch group has been marked done, create a new group instead of reusing this one")]
    GroupDone,

    /// `sync` was called from the worker thread of the queue it targets.
    #[error("sync on {0} from its own worker thread would never complete")]
    SyncFromWorker(String),

    /// A blocking wait was abandoned because the task can no longer run.
    #[error("task on {0} was abandoned before it ran")]
    Abandoned(String),

    /// The operating system refused to start a worker thread.
    #[error("failed to spawn worker thread for {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while loading a [`DispatchConfig`](crate::config::DispatchConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
