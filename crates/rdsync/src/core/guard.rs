// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Overlapping-mutation detector for free-threaded entities.

use std::sync::atomic::{AtomicBool, Ordering};

/// Panics when two mutations of the same entity overlap.
///
/// Free-threaded entities skip the scheduler thread check; callers must still
/// serialize their mutations, and this guard catches those that don't.
#[derive(Debug, Default)]
pub struct ConcurrentAccessGuard {
    busy: AtomicBool,
}

/// Held for the duration of one mutation.
#[must_use]
pub struct AccessToken<'a> {
    guard: &'a ConcurrentAccessGuard,
}

impl ConcurrentAccessGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, what: &str) -> AccessToken<'_> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            panic!("concurrent access detected: `{}` overlaps another mutation", what);
        }
        AccessToken { guard: self }
    }
}

impl Drop for AccessToken<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}
