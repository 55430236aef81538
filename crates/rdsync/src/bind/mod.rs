// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Binding lifecycle.
//!
//! Every wire-visible entity goes through three phases:
//!
//! ```text
//! NotBound --identify--> (has id) --pre_bind--> PreBound --bind--> Bound
//!     ^                                                               |
//!     +--------------------- unbind (scope termination) --------------+
//! ```
//!
//! - **identify** assigns the id (children derive theirs from it).
//! - **pre_bind** attaches the entity to its parent, computes its location,
//!   registers its wire subscriptions and recurses into children. Frames that
//!   arrive from now on are already routed.
//! - **bind** recurses into children, runs the entity's init hook, then marks
//!   it bound.
//!
//! Unbind is registered on the binding scope and runs once when it
//! terminates; children unbind before their parent.
//!
//! Environmental conditions (no protocol yet, no id yet, dead scope) are
//! reported as a [`BindOutcome`], never as errors. Misuse (double identify,
//! re-parenting) panics.

pub mod base;
pub mod ext;
pub mod model;
pub mod signal;

pub use base::BindableBase;
pub use ext::{ExtState, RdExt};
pub use model::RdModel;
pub use signal::RdSignal;

use crate::core::{Identities, Lifetime, RdId};
use crate::protocol::Protocol;
use crate::ser::Polymorphic;
use std::fmt;
use std::sync::Arc;

/// Binding phase of an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindState {
    NotBound,
    PreBound,
    Bound,
}

/// Result of a `pre_bind` / `bind` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindOutcome {
    /// The phase ran.
    Bound,
    /// Nothing to do yet (no protocol, or the parent is not far enough).
    Deferred,
    /// The binding scope is already terminated.
    Dead,
}

/// Where an entity is attached.
#[derive(Clone)]
pub enum BindParent {
    /// Top-level entity, directly under a protocol.
    Protocol(Arc<Protocol>),
    /// Child of another entity.
    Entity(Arc<dyn Bindable>),
}

impl BindParent {
    /// Protocol a child of this parent binds into.
    pub fn protocol(&self) -> Option<Arc<Protocol>> {
        match self {
            BindParent::Protocol(p) => Some(p.clone()),
            BindParent::Entity(e) => e.child_protocol().or_else(|| e.protocol()),
        }
    }

    pub fn location(&self) -> String {
        match self {
            BindParent::Protocol(p) => p.name().to_string(),
            BindParent::Entity(e) => e.location(),
        }
    }
}

impl fmt::Debug for BindParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindParent::Protocol(p) => write!(f, "Protocol({})", p.name()),
            BindParent::Entity(e) => write!(f, "Entity({})", e.location()),
        }
    }
}

/// A wire-visible entity.
///
/// Implementors own a [`BindableBase`] and may override the lifecycle hooks;
/// everything else is provided.
pub trait Bindable: Send + Sync + 'static {
    fn base(&self) -> &BindableBase;

    /// Runs during pre-bind, once location and protocol are known. Register
    /// wire subscriptions here.
    fn pre_init(&self, _lifetime: Lifetime, _protocol: &Arc<Protocol>) {}

    /// Runs during bind, after children are bound.
    fn init(&self, _lifetime: Lifetime, _protocol: &Arc<Protocol>) {}

    /// Protocol children bind into, when it differs from this entity's own.
    fn child_protocol(&self) -> Option<Arc<Protocol>> {
        None
    }

    fn rd_id(&self) -> RdId {
        self.base().rd_id()
    }

    fn location(&self) -> String {
        self.base().location()
    }

    fn bind_state(&self) -> BindState {
        self.base().state()
    }

    fn is_bound(&self) -> bool {
        self.bind_state() == BindState::Bound
    }

    fn protocol(&self) -> Option<Arc<Protocol>> {
        self.base().protocol()
    }

    fn identify(&self, identities: &Identities, id: RdId) {
        self.base().identify(identities, id);
    }

    fn pre_bind(&self, lifetime: Lifetime, parent: BindParent, name: &str) -> BindOutcome {
        self.base().pre_bind(lifetime, parent, name)
    }

    fn bind(&self) -> BindOutcome {
        self.base().bind()
    }
}

/// Values that may carry a bindable entity (RPC results, signal payloads).
pub trait MaybeBindable {
    fn as_bindable(&self) -> Option<Arc<dyn Bindable>> {
        None
    }
}

macro_rules! impl_not_bindable {
    ($($type:ty),* $(,)?) => {
        $(impl MaybeBindable for $type {})*
    };
}

impl_not_bindable!(u8, i16, u16, i32, u32, i64, u64, bool, f64, RdId, (), String, Polymorphic);

impl<T> MaybeBindable for Vec<T> {}

impl<A, B> MaybeBindable for (A, B) {}

impl<T: MaybeBindable> MaybeBindable for Option<T> {
    fn as_bindable(&self) -> Option<Arc<dyn Bindable>> {
        self.as_ref().and_then(|v| v.as_bindable())
    }
}

impl<T: Bindable> MaybeBindable for Arc<T> {
    fn as_bindable(&self) -> Option<Arc<dyn Bindable>> {
        let entity: Arc<dyn Bindable> = self.clone();
        Some(entity)
    }
}
