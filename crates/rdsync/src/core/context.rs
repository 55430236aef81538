// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol context values.
//!
//! Contexts are a small key/value map that travels with outbound work. The
//! buffering ext wire snapshots them when it queues a frame and restores the
//! snapshot around the replay, so a frame is sent with the values that were
//! current when the application sent it.
//!
//! Values are swapped atomically (`ArcSwap`): taking a snapshot is a pointer
//! clone and never blocks a concurrent sender.

use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Immutable, ordered set of context values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextSnapshot {
    values: BTreeMap<String, String>,
}

impl ContextSnapshot {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Current context values of a protocol (shared with its extensions).
#[derive(Debug, Default)]
pub struct ProtocolContexts {
    current: ArcSwap<ContextSnapshot>,
}

impl ProtocolContexts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.current.load().get(key).map(str::to_string)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        self.current.rcu(|current| {
            let mut next = ContextSnapshot::clone(current);
            next.values.insert(key.clone(), value.clone());
            next
        });
    }

    pub fn remove(&self, key: &str) {
        self.current.rcu(|current| {
            let mut next = ContextSnapshot::clone(current);
            next.values.remove(key);
            next
        });
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot::clone(&self.current.load())
    }

    /// Run `body` with `snapshot` installed, restoring the previous values
    /// afterwards (also on panic).
    pub fn with_snapshot<R>(&self, snapshot: &ContextSnapshot, body: impl FnOnce() -> R) -> R {
        struct Restore<'a> {
            contexts: &'a ProtocolContexts,
            previous: Arc<ContextSnapshot>,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.contexts.current.store(self.previous.clone());
            }
        }

        let previous = self.current.swap(Arc::new(snapshot.clone()));
        let _restore = Restore {
            contexts: self,
            previous,
        };
        body()
    }
}
