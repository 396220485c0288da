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

//! Named payload attached to a dispatched task.
//!
//! A [`Bundle`] maps string keys to values of any `Send + Sync` type. Cloning a
//! bundle shares the underlying map, so every task holding it observes the same
//! entries. All operations are lock-free and safe from any thread.

use ahash::AHasher;
use papaya::HashMap;
use std::any::Any;
use std::fmt::Debug;
use std::hash::BuildHasherDefault;
use std::sync::Arc;

type Value = Arc<dyn Any + Send + Sync>;

macro_rules! typed_getters {
    ($($name:ident => $ty:ty),* $(,)?) => {
        paste::paste! {
            $(
                /// Returns the stored value, or `default` when the key is absent
                /// or holds a value of another type.
                pub fn [<get_ $name>](&self, key: &str, default: $ty) -> $ty {
                    self.get::<$ty>(key).unwrap_or(default)
                }
            )*
        }
    };
}

/// Thread-safe heterogeneous map shared by reference.
#[derive(Clone, Default)]
pub struct Bundle {
    elements: Arc<HashMap<String, Value, BuildHasherDefault<AHasher>>>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous entry.
    pub fn put<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.elements.pin().insert(key.into(), Arc::new(value));
    }

    /// Builder-style [`put`](Self::put).
    pub fn with<T: Any + Send + Sync>(self, key: impl Into<String>, value: T) -> Self {
        self.put(key, value);
        self
    }

    /// Returns a clone of the value under `key` if it is a `T`.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        let guard = self.elements.pin();
        let value = guard
            .get(key)
            .and_then(|value| (**value).downcast_ref::<T>())
            .cloned();
        value
    }

    pub fn get_or<T: Any + Clone>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// The raw shared value, whatever its type.
    pub fn get_extra(&self, key: &str) -> Option<Value> {
        self.elements.pin().get(key).cloned()
    }

    typed_getters! {
        int => i32,
        long => i64,
        float => f32,
        double => f64,
        bool => bool,
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        let guard = self.elements.pin();
        match guard.get(key) {
            Some(value) => {
                if let Some(s) = (**value).downcast_ref::<String>() {
                    s.clone()
                } else if let Some(s) = (**value).downcast_ref::<&'static str>() {
                    (*s).to_string()
                } else {
                    default.to_string()
                }
            }
            None => default.to_string(),
        }
    }

    pub fn remove(&self, key: &str) {
        self.elements.pin().remove(key);
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.elements.pin().clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.elements.pin().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when both handles share the same map.
    pub fn ptr_eq(&self, other: &Bundle) -> bool {
        Arc::ptr_eq(&self.elements, &other.elements)
    }
}

impl Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.elements.pin();
        let mut keys: Vec<&String> = guard.keys().collect();
        keys.sort();
        f.debug_struct("Bundle").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_typed_getters() {
        let bundle = Bundle::new();
        bundle.put("count", 42i32);
        bundle.put("total", 7i64);
        bundle.put("ratio", 0.5f32);
        bundle.put("precise", 1.25f64);
        bundle.put("flag", true);
        bundle.put("name", String::from("io"));

        assert_eq!(bundle.get_int("count", 0), 42);
        assert_eq!(bundle.get_long("total", 0), 7);
        assert_eq!(bundle.get_float("ratio", 0.0), 0.5);
        assert_eq!(bundle.get_double("precise", 0.0), 1.25);
        assert!(bundle.get_bool("flag", false));
        assert_eq!(bundle.get_string("name", "none"), "io");
    }

    #[test]
    fn test_missing_or_mismatched_returns_default() {
        let bundle = Bundle::new();
        bundle.put("count", 42i64);

        // Stored as i64, asked for i32
        assert_eq!(bundle.get_int("count", -1), -1);
        assert_eq!(bundle.get_int("absent", -1), -1);
        assert_eq!(bundle.get_string("count", "fallback"), "fallback");
        assert_eq!(bundle.get::<Vec<u8>>("count"), None);
    }

    #[test]
    fn test_static_str_reads_as_string() {
        let bundle = Bundle::new().with("key", "A");
        assert_eq!(bundle.get_string("key", ""), "A");
    }

    #[test]
    fn test_custom_types() {
        #[derive(Debug, Clone, PartialEq)]
        struct Payload {
            id: u32,
        }

        let bundle = Bundle::new();
        bundle.put("payload", Payload { id: 9 });
        assert_eq!(bundle.get::<Payload>("payload"), Some(Payload { id: 9 }));
        assert!(bundle.get_extra("payload").is_some());
    }

    #[test]
    fn test_remove_clear_contains() {
        let bundle = Bundle::new().with("a", 1i32).with("b", 2i32);
        assert!(bundle.contains("a"));
        assert_eq!(bundle.len(), 2);

        bundle.remove("a");
        assert!(!bundle.contains("a"));
        assert_eq!(bundle.len(), 1);

        bundle.clear();
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_clones_share_entries() {
        let bundle = Bundle::new();
        let shared = bundle.clone();
        shared.put("seen", true);

        assert!(bundle.get_bool("seen", false));
        assert!(bundle.ptr_eq(&shared));
        assert!(!bundle.ptr_eq(&Bundle::new()));
    }

    #[test]
    fn test_concurrent_puts() {
        let bundle = Bundle::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let bundle = bundle.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        bundle.put(format!("{t}_{i}"), i as i32);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(bundle.len(), 800);
        assert_eq!(bundle.get_int("7_99", -1), 99);
    }
}
