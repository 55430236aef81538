// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-endpoint identity allocation.
//!
//! Static children derive their id from the parent and their name; dynamic
//! entities (RPC tasks, bindable results) take the next value of a role
//! counter mixed into a parent. Client and server counters start one apart and
//! both step by two, so the two peers never hand out the same counter value.

use super::id::RdId;
use crate::config::{DYNAMIC_ID_STEP, MAX_STATIC_ID};
use std::sync::atomic::{AtomicI64, Ordering};

/// Which half of the dynamic id space an endpoint allocates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdKind {
    Client,
    Server,
}

impl IdKind {
    pub fn is_client(self) -> bool {
        matches!(self, IdKind::Client)
    }

    /// First counter value handed out by this role.
    pub fn counter_base(self) -> i64 {
        match self {
            IdKind::Client => MAX_STATIC_ID,
            IdKind::Server => MAX_STATIC_ID + 1,
        }
    }
}

/// Identity allocator for one endpoint.
#[derive(Debug)]
pub struct Identities {
    kind: IdKind,
    counter: AtomicI64,
}

impl Identities {
    pub fn new(kind: IdKind) -> Self {
        Self {
            kind,
            counter: AtomicI64::new(kind.counter_base()),
        }
    }

    pub fn kind(&self) -> IdKind {
        self.kind
    }

    /// Pure derivation, identical on both peers.
    pub fn derive(parent: RdId, discriminant: &str) -> RdId {
        parent.mix_str(discriminant)
    }

    /// Allocate the next dynamic id under `parent`.
    pub fn next(&self, parent: RdId) -> RdId {
        let value = self.counter.fetch_add(DYNAMIC_ID_STEP, Ordering::Relaxed);
        parent.mix_i64(value)
    }
}
