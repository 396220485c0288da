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

//! Runtime configuration: overflow pool sizing, item pooling and queue names.
//!
//! Values come from [`Default`], optionally a TOML file, then `DISPATCHQ_*`
//! environment overrides.

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_QUEUE_NAME: &str = "DispatchQueue#default";
pub const IO_QUEUE_NAME: &str = "DispatchQueue#IO";
pub const ANONYMOUS_QUEUE_NAME: &str = "DispatchQueue#anonymous";

const DEFAULT_POOL_QUEUE_CAPACITY: usize = 128;
const DEFAULT_ITEM_POOL_MAX: usize = 20;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Threads the shared overflow pool always runs.
    pub pool_core_threads: usize,
    /// Upper bound on overflow pool threads. Threads past `pool_core_threads`
    /// start only once the backlog is full.
    pub pool_max_threads: usize,
    /// Jobs queued behind busy core threads before the pool grows.
    pub pool_queue_capacity: usize,
    pub pool_shutdown_timeout_ms: u64,
    /// Recycled queue items retained per queue.
    pub item_pool_max: usize,
    pub standard_queue_name: String,
    pub io_queue_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            pool_core_threads: (cpus / 2).max(1),
            pool_max_threads: (cpus * 2).max(2),
            pool_queue_capacity: DEFAULT_POOL_QUEUE_CAPACITY,
            pool_shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            item_pool_max: DEFAULT_ITEM_POOL_MAX,
            standard_queue_name: DEFAULT_QUEUE_NAME.to_string(),
            io_queue_name: IO_QUEUE_NAME.to_string(),
        }
    }
}

impl DispatchConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DispatchConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        if let Err(err) = config.validate() {
            tracing::warn!(%err, "Ignoring invalid dispatch environment, using defaults");
            return Self::default();
        }
        config
    }

    pub fn apply_env(&mut self) {
        override_from_env("DISPATCHQ_POOL_CORE_THREADS", &mut self.pool_core_threads);
        override_from_env("DISPATCHQ_POOL_MAX_THREADS", &mut self.pool_max_threads);
        override_from_env("DISPATCHQ_POOL_QUEUE_CAPACITY", &mut self.pool_queue_capacity);
        override_from_env("DISPATCHQ_ITEM_POOL_MAX", &mut self.item_pool_max);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_core_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "pool_core_threads",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pool_max_threads < self.pool_core_threads {
            return Err(ConfigError::Invalid {
                field: "pool_max_threads",
                reason: format!(
                    "{} is below pool_core_threads ({})",
                    self.pool_max_threads, self.pool_core_threads
                ),
            });
        }
        Ok(())
    }

    pub fn pool_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_shutdown_timeout_ms)
    }

    /// Total jobs the overflow pool accepts before callers run inline: every
    /// thread busy plus a full backlog.
    pub fn pool_capacity(&self) -> usize {
        self.pool_max_threads + self.pool_queue_capacity
    }
}

fn override_from_env<T: FromStr>(var: &str, slot: &mut T) {
    let Ok(raw) = env::var(var) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(var, value = %raw, "Failed to parse dispatch override"),
    }
}
