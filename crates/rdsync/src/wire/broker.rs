// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound dispatch table.
//!
//! Routes each inbound frame to the subscriber advised under its id.
//!
//! - At most one live subscription per id; a second one is a programming
//!   error and panics.
//! - Frames for unknown ids are dropped (trace log), never an error.
//! - Optionally, frames are held until [`MessageBroker::start_delivering_messages`]
//!   so nothing is lost while a protocol is still being assembled.

use super::WireSubscriber;
use crate::core::{Job, Lifetime, RdId, Scheduler};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

struct Subscription {
    subscriber: Arc<dyn WireSubscriber>,
    lifetime: Lifetime,
}

/// Context handed to a subscriber with each inbound payload.
#[derive(Clone, Copy, Debug)]
pub struct DispatchHelper {
    pub rd_id: RdId,
    pub lifetime: Lifetime,
}

impl DispatchHelper {
    /// Queue `action` on `scheduler`, running it only while the
    /// subscription's lifetime is still alive.
    pub fn dispatch(&self, scheduler: &dyn Scheduler, action: impl FnOnce() + Send + 'static) {
        if !self.lifetime.is_alive() {
            log::trace!(
                target: "rdsync::mq",
                "subscription for id {} is terminated, message dropped",
                self.rd_id
            );
            return;
        }
        let lifetime = self.lifetime;
        let rd_id = self.rd_id;
        let job: Job = Box::new(move || {
            if lifetime.execute_if_alive(action).is_none() {
                log::trace!(
                    target: "rdsync::mq",
                    "subscription for id {} terminated before dispatch, message dropped",
                    rd_id
                );
            }
        });
        scheduler.queue(job);
    }
}

/// Per-wire subscription registry.
pub struct MessageBroker {
    subscriptions: DashMap<RdId, Subscription>,
    delivering: AtomicBool,
    held: Mutex<Vec<(RdId, Vec<u8>)>>,
    dropped: AtomicU64,
}

impl MessageBroker {
    /// Broker that delivers immediately.
    pub fn new() -> Arc<Self> {
        Self::with_delivery(true)
    }

    /// Broker that holds inbound frames until started.
    pub fn held() -> Arc<Self> {
        Self::with_delivery(false)
    }

    fn with_delivery(delivering: bool) -> Arc<Self> {
        Arc::new(Self {
            subscriptions: DashMap::new(),
            delivering: AtomicBool::new(delivering),
            held: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        })
    }

    /// Register `subscriber` under its id until `lifetime` terminates.
    ///
    /// # Panics
    ///
    /// When another live subscription already owns the id.
    pub fn advise(self: &Arc<Self>, lifetime: Lifetime, subscriber: Arc<dyn WireSubscriber>) {
        let id = subscriber.wire_id();
        assert!(!id.is_null(), "cannot advise a subscriber with a null id");
        let broker = Arc::downgrade(self);
        let registered = subscriber.clone();
        lifetime.bracket_if_alive(
            || match self.subscriptions.entry(id) {
                Entry::Occupied(_) => {
                    panic!("duplicate live subscription for id {}", id);
                }
                Entry::Vacant(slot) => {
                    slot.insert(Subscription {
                        subscriber,
                        lifetime,
                    });
                }
            },
            move || {
                if let Some(broker) = broker.upgrade() {
                    broker
                        .subscriptions
                        .remove_if(&id, |_, s| Arc::ptr_eq(&s.subscriber, &registered));
                }
            },
        );
    }

    pub fn is_subscribed(&self, id: RdId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    /// Live subscriber under `id`, if any.
    pub fn try_get_by_id(&self, id: RdId) -> Option<Arc<dyn WireSubscriber>> {
        self.subscriptions.get(&id).map(|s| s.subscriber.clone())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Frames dropped because nothing was advised under their id.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_delivering(&self) -> bool {
        self.delivering.load(Ordering::Acquire)
    }

    /// Route one inbound frame.
    pub fn dispatch(&self, id: RdId, payload: Vec<u8>) {
        if !self.delivering.load(Ordering::Acquire) {
            let mut held = self.held.lock();
            if !self.delivering.load(Ordering::Acquire) {
                held.push((id, payload));
                return;
            }
        }
        self.deliver(id, payload);
    }

    /// Deliver held frames in arrival order, then switch to direct delivery.
    ///
    /// Must not be called from inside a subscriber of this broker.
    pub fn start_delivering_messages(&self) {
        let mut held = self.held.lock();
        if self.delivering.load(Ordering::Acquire) {
            return;
        }
        let frames = std::mem::take(&mut *held);
        log::debug!(target: "rdsync::mq", "delivering {} held frame(s)", frames.len());
        for (id, payload) in frames {
            self.deliver(id, payload);
        }
        self.delivering.store(true, Ordering::Release);
    }

    fn deliver(&self, id: RdId, payload: Vec<u8>) {
        // Clone out of the map: subscribers may advise or terminate re-entrantly.
        let target = self
            .subscriptions
            .get(&id)
            .map(|s| (s.subscriber.clone(), s.lifetime));
        match target {
            Some((subscriber, lifetime)) => {
                let helper = DispatchHelper {
                    rd_id: id,
                    lifetime,
                };
                subscriber.on_wire_received(payload, &helper);
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!(
                    target: "rdsync::mq",
                    "handler for id {} is not found, {} byte frame dropped",
                    id,
                    payload.len()
                );
            }
        }
    }
}
