// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Core building blocks: identifiers, scopes, schedulers, contexts.

pub mod context;
pub mod guard;
pub mod id;
pub mod identities;
pub mod lifetime;
pub mod scheduler;

pub use context::{ContextSnapshot, ProtocolContexts};
pub use guard::{AccessToken, ConcurrentAccessGuard};
pub use id::{hash_i64, hash_str, platform_independent_hash, RdId};
pub use identities::{IdKind, Identities};
pub use lifetime::{Lifetime, LifetimeDef, LifetimeStatus};
pub use scheduler::{
    Job, Scheduler, SequentialScheduler, SynchronousScheduler, TestScheduler,
};
