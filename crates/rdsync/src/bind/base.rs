// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared state and lifecycle logic of every bindable entity.

use super::{BindOutcome, BindParent, BindState, Bindable};
use crate::core::{Identities, Lifetime, RdId};
use crate::protocol::Protocol;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, Weak};

const UNBOUND_LOCATION: &str = "<<not bound>>";

#[derive(Clone)]
struct Child {
    name: String,
    entity: Arc<dyn Bindable>,
    typed: Arc<dyn Any + Send + Sync>,
}

enum ParentRef {
    Protocol(Arc<Protocol>),
    Entity(Weak<dyn Bindable>),
}

impl ParentRef {
    fn from_parent(parent: &BindParent) -> Self {
        match parent {
            BindParent::Protocol(p) => ParentRef::Protocol(p.clone()),
            BindParent::Entity(e) => ParentRef::Entity(Arc::downgrade(e)),
        }
    }
}

struct BaseState {
    rd_id: RdId,
    state: BindState,
    /// Inside `bind`, children may already bind
    binding: bool,
    location: String,
    parent: Option<ParentRef>,
    protocol: Option<Arc<Protocol>>,
    bind_lifetime: Lifetime,
    children: Vec<Child>,
}

/// Identity, location, parent link and ordered children of an entity.
///
/// Built with `Arc::new_cyclic` so lifecycle hooks can reach the owner.
pub struct BindableBase {
    owner: Weak<dyn Bindable>,
    inner: Mutex<BaseState>,
}

impl BindableBase {
    pub fn new(owner: Weak<dyn Bindable>) -> Self {
        Self {
            owner,
            inner: Mutex::new(BaseState {
                rd_id: RdId::NULL,
                state: BindState::NotBound,
                binding: false,
                location: UNBOUND_LOCATION.to_string(),
                parent: None,
                protocol: None,
                bind_lifetime: Lifetime::terminated(),
                children: Vec::new(),
            }),
        }
    }

    pub fn rd_id(&self) -> RdId {
        self.inner.lock().rd_id
    }

    pub fn location(&self) -> String {
        self.inner.lock().location.clone()
    }

    pub fn state(&self) -> BindState {
        self.inner.lock().state
    }

    pub fn protocol(&self) -> Option<Arc<Protocol>> {
        self.inner.lock().protocol.clone()
    }

    /// Scope the entity is bound under (terminated when not bound).
    pub fn bind_lifetime(&self) -> Lifetime {
        self.inner.lock().bind_lifetime
    }

    fn is_bound_or_binding(&self) -> bool {
        let s = self.inner.lock();
        s.state == BindState::Bound || s.binding
    }

    // =======================================================================
    // Children
    // =======================================================================

    /// Attach a named child. Children added before identify/pre-bind follow
    /// the parent through every phase.
    ///
    /// # Panics
    ///
    /// When the entity is already pre-bound (use
    /// [`get_or_create_extension`](Self::get_or_create_extension)) or the
    /// name is taken.
    pub fn add_child<E: Bindable>(&self, name: &str, child: Arc<E>) -> Arc<E> {
        let mut s = self.inner.lock();
        assert!(
            s.state == BindState::NotBound,
            "cannot add child `{}` to `{}` after pre-bind",
            name,
            s.location
        );
        assert!(
            !s.children.iter().any(|c| c.name == name),
            "duplicate child `{}` under `{}`",
            name,
            s.location
        );
        s.children.push(Child {
            name: name.to_string(),
            entity: child.clone(),
            typed: child.clone(),
        });
        child
    }

    /// Typed child lookup.
    pub fn child<E: Bindable>(&self, name: &str) -> Option<Arc<E>> {
        let typed = {
            let s = self.inner.lock();
            s.children.iter().find(|c| c.name == name)?.typed.clone()
        };
        typed.downcast::<E>().ok()
    }

    pub fn child_names(&self) -> Vec<String> {
        self.inner.lock().children.iter().map(|c| c.name.clone()).collect()
    }

    /// Named child created on demand. A child created while this entity is
    /// identified or bound catches up immediately: id `derive(id, "." + name)`,
    /// then pre-bind and (if bound) bind.
    ///
    /// # Panics
    ///
    /// When a child with that name exists with a different type.
    pub fn get_or_create_extension<E: Bindable>(
        &self,
        name: &str,
        create: impl FnOnce() -> Arc<E>,
    ) -> Arc<E> {
        let existing = {
            let s = self.inner.lock();
            s.children
                .iter()
                .find(|c| c.name == name)
                .map(|c| (c.typed.clone(), s.location.clone()))
        };
        if let Some((typed, location)) = existing {
            return match typed.downcast::<E>() {
                Ok(ext) => ext,
                Err(_) => panic!(
                    "extension `{}` under `{}` exists with a different type",
                    name, location
                ),
            };
        }

        let ext = create();
        let (rd_id, state, lifetime, location) = {
            let mut s = self.inner.lock();
            if let Some(protocol) = &s.protocol {
                if s.state == BindState::Bound {
                    protocol.scheduler().assert_thread(&format_args!("{}.{}", s.location, name));
                }
            }
            s.children.push(Child {
                name: name.to_string(),
                entity: ext.clone(),
                typed: ext.clone(),
            });
            (s.rd_id, s.state, s.bind_lifetime, s.location.clone())
        };

        if !rd_id.is_null() {
            ext.base().assign_id(Identities::derive(rd_id, &format!(".{}", name)));
        }
        if state != BindState::NotBound {
            if let Some(owner) = self.owner.upgrade() {
                log::debug!(target: "rdsync::init", "late extension `{}` under `{}`", name, location);
                ext.pre_bind(lifetime, BindParent::Entity(owner), name);
                if state == BindState::Bound {
                    ext.bind();
                }
            }
        }
        ext
    }

    // =======================================================================
    // Identify
    // =======================================================================

    /// Assign `id` and derive children ids as `derive(id, "." + name)`.
    ///
    /// # Panics
    ///
    /// When already identified or `id` is null.
    pub fn identify(&self, _identities: &Identities, id: RdId) {
        self.assign_id(id);
    }

    /// Identify without an allocator, for entities read off the wire.
    pub(crate) fn assign_id(&self, id: RdId) {
        let children = {
            let mut s = self.inner.lock();
            assert!(!id.is_null(), "assigned id for `{}` must not be null", s.location);
            assert!(
                s.rd_id.is_null(),
                "already has id {}: `{}`, cannot assign {}",
                s.rd_id,
                s.location,
                id
            );
            s.rd_id = id;
            s.children.clone()
        };
        for child in children {
            child
                .entity
                .base()
                .assign_id(Identities::derive(id, &format!(".{}", child.name)));
        }
    }

    // =======================================================================
    // PreBind / Bind / Unbind
    // =======================================================================

    pub fn pre_bind(&self, lifetime: Lifetime, parent: BindParent, name: &str) -> BindOutcome {
        let Some(protocol) = parent.protocol() else {
            log::trace!(target: "rdsync::init", "`{}` has no protocol yet, pre-bind deferred", name);
            return BindOutcome::Deferred;
        };
        if !lifetime.is_alive() {
            log::trace!(target: "rdsync::init", "scope of `{}` is dead, pre-bind skipped", name);
            return BindOutcome::Dead;
        }
        let location = format!("{}.{}", parent.location(), name);
        {
            let s = self.inner.lock();
            assert!(
                s.parent.is_none(),
                "trying to pre-bind already bound `{}` to `{}`",
                s.location,
                location
            );
            if s.rd_id.is_null() {
                log::debug!(target: "rdsync::init", "`{}` is not identified, pre-bind deferred", location);
                return BindOutcome::Deferred;
            }
        }
        let Some(owner) = self.owner.upgrade() else {
            return BindOutcome::Dead;
        };

        let weak_owner = self.owner.clone();
        let opened = lifetime.bracket_if_alive(
            || {
                let rd_id = {
                    let mut s = self.inner.lock();
                    s.parent = Some(ParentRef::from_parent(&parent));
                    s.location = location.clone();
                    s.protocol = Some(protocol.clone());
                    s.bind_lifetime = lifetime;
                    s.state = BindState::PreBound;
                    s.rd_id
                };
                log::debug!(target: "rdsync::init", "pre-bind `{}` ({})", location, rd_id);
                owner.pre_init(lifetime, &protocol);
            },
            move || {
                if let Some(owner) = weak_owner.upgrade() {
                    owner.base().unbind();
                }
            },
        );
        if opened.is_none() {
            return BindOutcome::Dead;
        }

        // After our unbind is registered: children unbind first.
        let children = self.inner.lock().children.clone();
        for child in children {
            child
                .entity
                .pre_bind(lifetime, BindParent::Entity(owner.clone()), &child.name);
        }
        BindOutcome::Bound
    }

    pub fn bind(&self) -> BindOutcome {
        let (lifetime, protocol, parent_ready, location) = {
            let s = self.inner.lock();
            if s.state != BindState::PreBound {
                log::trace!(target: "rdsync::init", "`{}` is {:?}, bind deferred", s.location, s.state);
                return BindOutcome::Deferred;
            }
            let parent_ready = match &s.parent {
                Some(ParentRef::Protocol(_)) => true,
                Some(ParentRef::Entity(parent)) => parent
                    .upgrade()
                    .is_some_and(|p| p.base().is_bound_or_binding()),
                None => false,
            };
            (s.bind_lifetime, s.protocol.clone(), parent_ready, s.location.clone())
        };
        if !parent_ready {
            log::trace!(target: "rdsync::init", "parent of `{}` is not bound, bind deferred", location);
            return BindOutcome::Deferred;
        }
        let (Some(protocol), Some(owner)) = (protocol, self.owner.upgrade()) else {
            return BindOutcome::Dead;
        };

        let bound = lifetime.execute_if_alive(|| {
            let children = {
                let mut s = self.inner.lock();
                s.binding = true;
                s.children.clone()
            };
            for child in children {
                child.entity.bind();
            }
            owner.init(lifetime, &protocol);
            let mut s = self.inner.lock();
            s.binding = false;
            if s.state == BindState::PreBound {
                s.state = BindState::Bound;
            }
        });
        match bound {
            Some(()) => {
                log::trace!(target: "rdsync::init", "bound `{}`", location);
                BindOutcome::Bound
            }
            None => BindOutcome::Dead,
        }
    }

    /// Teardown registered by pre-bind. Safe to run more than once.
    fn unbind(&self) {
        let mut s = self.inner.lock();
        if s.state == BindState::NotBound {
            return;
        }
        log::debug!(target: "rdsync::init", "unbind `{}` ({})", s.location, s.rd_id);
        s.state = BindState::NotBound;
        s.binding = false;
        s.parent = None;
        s.protocol = None;
        s.bind_lifetime = Lifetime::terminated();
        s.location = UNBOUND_LOCATION.to_string();
        s.rd_id = RdId::NULL;
    }
}
