// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fire-and-forget signal, the smallest wire entity.
//!
//! `fire` notifies local listeners and, when bound, sends the value to the
//! counterpart, whose listeners run on its protocol scheduler. Signals are
//! also [`RdSerialize`] by id, so they can travel as bindable RPC results.

use super::{Bindable, BindableBase};
use crate::core::{ConcurrentAccessGuard, Lifetime, RdId};
use crate::protocol::Protocol;
use crate::ser::{RdSerialize, ReadCursor, SerResult, Serializers, WriteCursor};
use crate::wire::{DispatchHelper, WireResult, WireSubscriber};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct RdSignal<T> {
    base: BindableBase,
    this: Weak<RdSignal<T>>,
    /// Skip the scheduler thread check; overlapping fires panic instead
    free_threaded: bool,
    guard: ConcurrentAccessGuard,
    listeners: Mutex<Vec<(Lifetime, Listener<T>)>>,
}

impl<T> RdSignal<T>
where
    T: RdSerialize + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Self::create(false)
    }

    /// Signal that may be fired from any thread, one fire at a time.
    pub fn free_threaded() -> Arc<Self> {
        Self::create(true)
    }

    /// Signal already identified as `id` (counterpart of a remote one).
    pub fn with_id(id: RdId) -> Arc<Self> {
        let signal = Self::create(false);
        signal.base.assign_id(id);
        signal
    }

    fn create(free_threaded: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<RdSignal<T>>| {
            let owner: Weak<dyn Bindable> = weak.clone();
            RdSignal {
                base: BindableBase::new(owner),
                this: weak.clone(),
                free_threaded,
                guard: ConcurrentAccessGuard::new(),
                listeners: Mutex::new(Vec::new()),
            }
        })
    }

    /// Call `handler` for every fired or received value while `lifetime` is
    /// alive.
    ///
    /// # Panics
    ///
    /// Off the protocol scheduler thread for a bound, non free-threaded
    /// signal.
    pub fn advise(&self, lifetime: Lifetime, handler: impl Fn(&T) + Send + Sync + 'static) {
        if self.is_bound() && !self.free_threaded {
            if let Some(protocol) = self.base.protocol() {
                protocol.scheduler().assert_thread(&self.base.location());
            }
        }
        if !lifetime.is_alive() {
            return;
        }
        self.listeners.lock().push((lifetime, Arc::new(handler)));
    }

    /// Notify local listeners, then send to the counterpart if bound.
    ///
    /// # Panics
    ///
    /// Off the protocol scheduler thread for a bound, non free-threaded
    /// signal; on overlapping fires of a free-threaded one.
    pub fn fire(&self, value: T) -> WireResult<()> {
        let location = self.base.location();
        let _token = self.free_threaded.then(|| self.guard.enter(&location));
        let protocol = if self.is_bound() { self.base.protocol() } else { None };
        if let Some(protocol) = &protocol {
            if !self.free_threaded {
                protocol.scheduler().assert_thread(&location);
            }
        }

        self.notify(&value);

        if let Some(protocol) = protocol {
            let serializers = protocol.serializers().clone();
            protocol
                .wire()
                .send(self.base.rd_id(), &mut |out: &mut WriteCursor| {
                    value.write(&serializers, out)
                })?;
        }
        Ok(())
    }

    fn notify(&self, value: &T) {
        let listeners: Vec<(Lifetime, Listener<T>)> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|(lifetime, _)| lifetime.is_alive());
            listeners.clone()
        };
        for (lifetime, listener) in listeners {
            lifetime.execute_if_alive(|| listener(value));
        }
    }
}

impl<T> Bindable for RdSignal<T>
where
    T: RdSerialize + Send + Sync + 'static,
{
    fn base(&self) -> &BindableBase {
        &self.base
    }

    fn pre_init(&self, lifetime: Lifetime, protocol: &Arc<Protocol>) {
        if let Some(this) = self.this.upgrade() {
            protocol.wire().advise(lifetime, this);
        }
    }
}

impl<T> WireSubscriber for RdSignal<T>
where
    T: RdSerialize + Send + Sync + 'static,
{
    fn wire_id(&self) -> RdId {
        self.base.rd_id()
    }

    fn on_wire_received(&self, payload: Vec<u8>, helper: &DispatchHelper) {
        let Some(protocol) = self.base.protocol() else {
            return;
        };
        let mut input = ReadCursor::new(&payload);
        let value = match T::read(protocol.serializers(), &mut input) {
            Ok(value) => value,
            Err(e) => {
                log::warn!(target: "rdsync::recv", "`{}`: cannot read signal value: {}", self.base.location(), e);
                return;
            }
        };
        log::trace!(target: "rdsync::recv", "`{}` received {} byte(s)", self.base.location(), payload.len());
        let Some(this) = self.this.upgrade() else {
            return;
        };
        helper.dispatch(protocol.scheduler().as_ref(), move || this.notify(&value));
    }
}

impl<T> RdSerialize for Arc<RdSignal<T>>
where
    T: RdSerialize + Send + Sync + 'static,
{
    fn write(&self, _ser: &Serializers, out: &mut WriteCursor) -> SerResult<()> {
        out.write_rd_id(self.rd_id());
        Ok(())
    }

    fn read(_ser: &Serializers, input: &mut ReadCursor<'_>) -> SerResult<Self> {
        let id = input.read_rd_id()?;
        if id.is_null() {
            return Err(crate::ser::SerError::UnexpectedNull);
        }
        Ok(RdSignal::with_id(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::core::{IdKind, LifetimeDef, Scheduler, SynchronousScheduler, TestScheduler};
    use crate::wire::DirectWire;

    fn pair(lifetime: Lifetime, server_scheduler: Arc<dyn Scheduler>) -> (Arc<Protocol>, Arc<Protocol>) {
        let (left, right) = DirectWire::pair();
        let ser = Arc::new(Serializers::new());
        let client = Protocol::new(
            ProtocolConfig::client("p"),
            ser.clone(),
            Arc::new(SynchronousScheduler),
            left,
            lifetime,
        );
        let server = Protocol::new(ProtocolConfig::server("p"), ser, server_scheduler, right, lifetime);
        (client, server)
    }

    #[test]
    fn test_fire_reaches_counterpart_on_its_scheduler() {
        let def = LifetimeDef::new();
        let scheduler = TestScheduler::new("server");
        let (client, server) = pair(def.lifetime(), scheduler.clone());

        let local = RdSignal::<String>::new();
        let remote = RdSignal::<String>::new();
        client.bind_top_level(local.as_ref(), "sig");
        server.bind_top_level(remote.as_ref(), "sig");
        assert_eq!(local.rd_id(), remote.rd_id());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        remote.advise(def.lifetime(), move |v: &String| s.lock().push(v.clone()));

        local.fire("hello".to_string()).unwrap();
        assert!(seen.lock().is_empty());
        scheduler.flush();
        assert_eq!(*seen.lock(), vec!["hello".to_string()]);
        def.terminate();
    }

    #[test]
    #[should_panic(expected = "illegal scheduler")]
    fn test_advise_bound_signal_off_thread_panics() {
        let def = LifetimeDef::new();
        let foreign = std::thread::spawn(|| TestScheduler::new("elsewhere"))
            .join()
            .unwrap();
        let (_client, server) = pair(def.lifetime(), foreign);
        let signal = RdSignal::<i32>::new();
        server.bind_top_level(signal.as_ref(), "sig");
        signal.advise(def.lifetime(), |_v: &i32| {});
    }

    #[test]
    fn test_free_threaded_signal_advises_from_any_thread() {
        let def = LifetimeDef::new();
        let foreign = std::thread::spawn(|| TestScheduler::new("elsewhere"))
            .join()
            .unwrap();
        let (_client, server) = pair(def.lifetime(), foreign);
        let signal = RdSignal::<i32>::free_threaded();
        server.bind_top_level(signal.as_ref(), "sig");
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        signal.advise(def.lifetime(), move |v: &i32| *h.lock() += *v);
        signal.fire(4).unwrap();
        assert_eq!(*hits.lock(), 4);
        def.terminate();
    }

    #[test]
    fn test_unbound_fire_is_local_only() {
        let signal = RdSignal::<i32>::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let def = LifetimeDef::new();
        signal.advise(def.lifetime(), move |v: &i32| *h.lock() += *v);
        signal.fire(2).unwrap();
        def.terminate();
        signal.fire(3).unwrap();
        assert_eq!(*hits.lock(), 2);
    }

    #[test]
    fn test_serialized_by_id() {
        let ser = Serializers::new();
        let identities = crate::core::Identities::new(IdKind::Server);
        let signal = RdSignal::<i32>::new();
        signal.identify(&identities, RdId::new(99));
        let mut out = WriteCursor::new();
        signal.write(&ser, &mut out).unwrap();
        let bytes = out.into_vec();
        let copy = <Arc<RdSignal<i32>>>::read(&ser, &mut ReadCursor::new(&bytes)).unwrap();
        assert_eq!(copy.rd_id(), RdId::new(99));
        assert!(!copy.is_bound());
    }
}
