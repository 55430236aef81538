// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Extension sub-protocols.
//!
//! An [`RdExt`] is a bindable node that owns a nested [`Protocol`] over an
//! [`ExtWire`]. Its children bind into the nested protocol and may send
//! right away: frames are queued until the counterpart extension answers the
//! handshake.
//!
//! # Handshake
//!
//! Sent under the extension's own id on the parent wire:
//!
//! ```text
//! +----------------+---------------------------+
//! | state (i32 LE) | serialization hash (i64)  |
//! +----------------+---------------------------+
//! ```
//!
//! Bind sends `Ready`. Receiving `Ready` answers `ReceivedCounterpart` and
//! connects; receiving `ReceivedCounterpart` connects; `Disconnected` (sent
//! on unbind) disconnects. A hash different from ours flags the extension out
//! of sync on the parent protocol; it stays connected.

use super::{Bindable, BindableBase};
use crate::config::SkewPolicy;
use crate::core::{Lifetime, RdId};
use crate::protocol::Protocol;
use crate::ser::{ReadCursor, SerResult, WriteCursor};
use crate::wire::{DispatchHelper, ExtWire, Wire, WireSubscriber};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Handshake state carried by extension control frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtState {
    Ready,
    ReceivedCounterpart,
    Disconnected,
}

impl ExtState {
    fn to_i32(self) -> i32 {
        match self {
            ExtState::Ready => 0,
            ExtState::ReceivedCounterpart => 1,
            ExtState::Disconnected => 2,
        }
    }

    fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(ExtState::Ready),
            1 => Some(ExtState::ReceivedCounterpart),
            2 => Some(ExtState::Disconnected),
            _ => None,
        }
    }
}

#[derive(Default)]
struct ExtInner {
    wire: Option<Arc<ExtWire>>,
    protocol: Option<Arc<Protocol>>,
    parent_protocol: Option<Weak<Protocol>>,
    counterpart_hash: Option<i64>,
}

pub struct RdExt {
    base: BindableBase,
    this: Weak<RdExt>,
    serialization_hash: i64,
    out_of_sync: AtomicBool,
    inner: Mutex<ExtInner>,
}

impl RdExt {
    /// Extension whose schema is identified by `serialization_hash`.
    pub fn new(serialization_hash: i64) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<RdExt>| {
            let owner: Weak<dyn Bindable> = weak.clone();
            RdExt {
                base: BindableBase::new(owner),
                this: weak.clone(),
                serialization_hash,
                out_of_sync: AtomicBool::new(false),
                inner: Mutex::new(ExtInner::default()),
            }
        })
    }

    pub fn serialization_hash(&self) -> i64 {
        self.serialization_hash
    }

    /// Hash the counterpart reported, once it did.
    pub fn counterpart_hash(&self) -> Option<i64> {
        self.inner.lock().counterpart_hash
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.out_of_sync.load(Ordering::Acquire)
    }

    /// True once the handshake completed (queued frames are flowing).
    pub fn is_connected(&self) -> bool {
        self.inner
            .lock()
            .wire
            .as_ref()
            .is_some_and(|w| w.is_connected())
    }

    /// Nested protocol children bind into (while pre-bound or bound).
    pub fn ext_protocol(&self) -> Option<Arc<Protocol>> {
        self.inner.lock().protocol.clone()
    }

    pub fn ext_wire(&self) -> Option<Arc<ExtWire>> {
        self.inner.lock().wire.clone()
    }

    pub fn add_child<E: Bindable>(&self, name: &str, child: Arc<E>) -> Arc<E> {
        self.base.add_child(name, child)
    }

    pub fn get_or_create_extension<E: Bindable>(
        &self,
        name: &str,
        create: impl FnOnce() -> Arc<E>,
    ) -> Arc<E> {
        self.base.get_or_create_extension(name, create)
    }

    fn send_state(wire: &dyn Wire, id: RdId, state: ExtState, hash: i64) {
        let result = wire.send(id, &mut |out: &mut WriteCursor| {
            out.write_i32(state.to_i32());
            out.write_i64(hash);
            Ok(())
        });
        match result {
            Ok(()) => log::trace!(target: "rdsync::send", "ext {} -> {:?}", id, state),
            Err(e) => log::debug!(target: "rdsync::send", "ext {} could not send {:?}: {}", id, state, e),
        }
    }

    fn on_counterpart(&self, state: ExtState, hash: i64) {
        let (wire, parent) = {
            let mut inner = self.inner.lock();
            inner.counterpart_hash = Some(hash);
            (inner.wire.clone(), inner.parent_protocol.as_ref().and_then(Weak::upgrade))
        };
        let (Some(wire), Some(parent)) = (wire, parent) else {
            return;
        };
        log::debug!(target: "rdsync::recv", "ext `{}` counterpart is {:?}", self.base.location(), state);

        match state {
            ExtState::Ready => {
                Self::send_state(
                    parent.wire().as_ref(),
                    self.base.rd_id(),
                    ExtState::ReceivedCounterpart,
                    self.serialization_hash,
                );
                self.check_hash(&parent, hash);
                wire.set_connected(true);
            }
            ExtState::ReceivedCounterpart => {
                self.check_hash(&parent, hash);
                wire.set_connected(true);
            }
            ExtState::Disconnected => wire.set_connected(false),
        }
    }

    fn check_hash(&self, parent: &Protocol, remote: i64) {
        if remote == self.serialization_hash {
            return;
        }
        let location = self.base.location();
        self.out_of_sync.store(true, Ordering::Release);
        parent.mark_out_of_sync(&location);
        match parent.config().schema_skew {
            SkewPolicy::Warn => log::warn!(
                target: "rdsync::recv",
                "extension `{}` is out of sync: local hash {}, counterpart hash {}",
                location,
                self.serialization_hash,
                remote
            ),
            SkewPolicy::Assert => panic!(
                "extension `{}` is out of sync: local hash {}, counterpart hash {}",
                location, self.serialization_hash, remote
            ),
        }
    }
}

fn read_handshake(payload: &[u8]) -> SerResult<(i32, i64)> {
    let mut input = ReadCursor::new(payload);
    let state = input.read_i32()?;
    let hash = input.read_i64()?;
    Ok((state, hash))
}

impl Bindable for RdExt {
    fn base(&self) -> &BindableBase {
        &self.base
    }

    fn pre_init(&self, lifetime: Lifetime, protocol: &Arc<Protocol>) {
        let location = self.base.location();
        let wire = ExtWire::new(protocol.wire().clone(), protocol.contexts().clone());
        let nested = protocol.nested(&location, wire.clone(), lifetime);
        {
            let mut inner = self.inner.lock();
            inner.wire = Some(wire.clone());
            inner.protocol = Some(nested);
            inner.parent_protocol = Some(Arc::downgrade(protocol));
            inner.counterpart_hash = None;
        }
        if let Some(this) = self.this.upgrade() {
            protocol.wire().advise(lifetime, this);
        }

        let id = self.base.rd_id();
        let hash = self.serialization_hash;
        let parent_wire = protocol.wire().clone();
        let this = self.this.clone();
        lifetime.on_termination(move || {
            Self::send_state(parent_wire.as_ref(), id, ExtState::Disconnected, hash);
            wire.set_connected(false);
            if let Some(ext) = this.upgrade() {
                let mut inner = ext.inner.lock();
                inner.wire = None;
                inner.protocol = None;
                inner.parent_protocol = None;
            }
        });
    }

    fn init(&self, _lifetime: Lifetime, protocol: &Arc<Protocol>) {
        Self::send_state(
            protocol.wire().as_ref(),
            self.base.rd_id(),
            ExtState::Ready,
            self.serialization_hash,
        );
    }

    fn child_protocol(&self) -> Option<Arc<Protocol>> {
        self.ext_protocol()
    }
}

impl WireSubscriber for RdExt {
    fn wire_id(&self) -> RdId {
        self.base.rd_id()
    }

    fn on_wire_received(&self, payload: Vec<u8>, helper: &DispatchHelper) {
        let (raw_state, hash) = match read_handshake(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!(target: "rdsync::recv", "ext `{}`: bad handshake frame: {}", self.base.location(), e);
                return;
            }
        };
        let Some(state) = ExtState::from_i32(raw_state) else {
            log::warn!(target: "rdsync::recv", "ext `{}`: unknown handshake state {}", self.base.location(), raw_state);
            return;
        };
        let (Some(this), Some(protocol)) = (self.this.upgrade(), self.base.protocol()) else {
            return;
        };
        helper.dispatch(protocol.scheduler().as_ref(), move || this.on_counterpart(state, hash));
    }
}
