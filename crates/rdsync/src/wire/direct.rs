// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process wire pair.
//!
//! Two [`DirectWire`]s are linked back to back: what one sends, the other's
//! broker receives. With auto-flush on, delivery happens inside `send`; with
//! it off, frames wait in the receiver's inbox until
//! [`DirectWire::process_all_messages`], which lets tests interleave both
//! peers by hand. Sends while disconnected are held in order and flushed on
//! reconnect.

use super::{serialize_payload, MessageBroker, PayloadWriter, Wire, WireResult};
use crate::core::RdId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Default)]
struct Outbox {
    frames: VecDeque<(RdId, Vec<u8>)>,
    /// Reconnect flush in progress; new sends queue behind it
    flushing: bool,
}

pub struct DirectWire {
    name: String,
    broker: Arc<MessageBroker>,
    counterpart: Mutex<Weak<DirectWire>>,
    connected: AtomicBool,
    auto_flush: AtomicBool,
    /// Frames delivered to this wire, waiting for `process_all_messages`
    inbox: Mutex<VecDeque<(RdId, Vec<u8>)>>,
    /// Frames sent while disconnected
    outbox: Mutex<Outbox>,
    /// (id, payload length) of every frame sent, in order
    sent: Mutex<Vec<(RdId, usize)>>,
}

impl DirectWire {
    fn new(name: &str, broker: Arc<MessageBroker>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            broker,
            counterpart: Mutex::new(Weak::new()),
            connected: AtomicBool::new(true),
            auto_flush: AtomicBool::new(true),
            inbox: Mutex::new(VecDeque::new()),
            outbox: Mutex::new(Outbox::default()),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Connected pair with immediate delivery.
    pub fn pair() -> (Arc<DirectWire>, Arc<DirectWire>) {
        Self::pair_with(MessageBroker::new(), MessageBroker::new())
    }

    /// Pair over caller-provided brokers (e.g. held brokers).
    pub fn pair_with(
        left: Arc<MessageBroker>,
        right: Arc<MessageBroker>,
    ) -> (Arc<DirectWire>, Arc<DirectWire>) {
        let a = Self::new("left", left);
        let b = Self::new("right", right);
        *a.counterpart.lock() = Arc::downgrade(&b);
        *b.counterpart.lock() = Arc::downgrade(&a);
        (a, b)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_auto_flush(&self, auto_flush: bool) {
        self.auto_flush.store(auto_flush, Ordering::Release);
    }

    /// Connect or disconnect this side; reconnecting flushes held frames.
    ///
    /// Sends made during the flush, from any thread, are delivered after
    /// the held frames.
    pub fn set_connected(&self, connected: bool) {
        {
            let mut outbox = self.outbox.lock();
            self.connected.store(connected, Ordering::Release);
            if !connected || outbox.flushing {
                return;
            }
            outbox.flushing = true;
        }
        loop {
            let next = {
                let mut outbox = self.outbox.lock();
                let next = if self.connected.load(Ordering::Acquire) {
                    outbox.frames.pop_front()
                } else {
                    None
                };
                if next.is_none() {
                    outbox.flushing = false;
                }
                next
            };
            match next {
                Some((id, payload)) => self.deliver(id, payload),
                None => break,
            }
        }
    }

    /// Dispatch every frame waiting in this side's inbox.
    pub fn process_all_messages(&self) -> usize {
        let mut count = 0;
        loop {
            let next = self.inbox.lock().pop_front();
            match next {
                Some((id, payload)) => {
                    self.broker.dispatch(id, payload);
                    count += 1;
                }
                None => return count,
            }
        }
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbox.lock().len()
    }

    /// Number of frames sent under `id`.
    pub fn sent_count(&self, id: RdId) -> usize {
        self.sent.lock().iter().filter(|(i, _)| *i == id).count()
    }

    pub fn sent_log(&self) -> Vec<(RdId, usize)> {
        self.sent.lock().clone()
    }

    fn deliver(&self, id: RdId, payload: Vec<u8>) {
        let Some(other) = self.counterpart.lock().upgrade() else {
            log::debug!(target: "rdsync::send", "[{}] counterpart gone, frame for {} dropped", self.name, id);
            return;
        };
        if other.auto_flush.load(Ordering::Acquire) {
            other.broker.dispatch(id, payload);
        } else {
            other.inbox.lock().push_back((id, payload));
        }
    }
}

impl Wire for DirectWire {
    fn send(&self, id: RdId, writer: PayloadWriter<'_>) -> WireResult<()> {
        let payload = serialize_payload(writer)?;
        log::trace!(target: "rdsync::send", "[{}] {} byte(s) to {}", self.name, payload.len(), id);
        self.sent.lock().push((id, payload.len()));
        {
            let mut outbox = self.outbox.lock();
            let held = !self.connected.load(Ordering::Acquire)
                || outbox.flushing
                || !outbox.frames.is_empty();
            if held {
                outbox.frames.push_back((id, payload));
                return Ok(());
            }
        }
        self.deliver(id, payload);
        Ok(())
    }

    fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LifetimeDef, RdId};
    use crate::ser::WriteCursor;
    use crate::wire::{DispatchHelper, WireSubscriber};

    struct Sink {
        seen: Mutex<Vec<u8>>,
    }

    impl WireSubscriber for Sink {
        fn wire_id(&self) -> RdId {
            RdId::new(77)
        }

        fn on_wire_received(&self, payload: Vec<u8>, _helper: &DispatchHelper) {
            self.seen.lock().extend(payload);
        }
    }

    fn send_byte(wire: &DirectWire, b: u8) {
        wire.send(RdId::new(77), &mut |out: &mut WriteCursor| {
            out.write_u8(b);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_manual_pumping() {
        let (a, b) = DirectWire::pair();
        let def = LifetimeDef::new();
        let sink = Arc::new(Sink {
            seen: Mutex::new(Vec::new()),
        });
        b.advise(def.lifetime(), sink.clone());
        b.set_auto_flush(false);

        send_byte(&a, 1);
        send_byte(&a, 2);
        assert!(sink.seen.lock().is_empty());
        assert_eq!(b.pending_inbound(), 2);
        assert_eq!(b.process_all_messages(), 2);
        assert_eq!(*sink.seen.lock(), vec![1, 2]);
        assert_eq!(a.sent_count(RdId::new(77)), 2);
        def.terminate();
    }

    #[test]
    fn test_disconnected_sends_flush_in_order() {
        let (a, b) = DirectWire::pair();
        let def = LifetimeDef::new();
        let sink = Arc::new(Sink {
            seen: Mutex::new(Vec::new()),
        });
        b.advise(def.lifetime(), sink.clone());

        a.set_connected(false);
        for i in 1..=3 {
            send_byte(&a, i);
        }
        assert!(sink.seen.lock().is_empty());
        a.set_connected(true);
        assert_eq!(*sink.seen.lock(), vec![1, 2, 3]);
        def.terminate();
    }

    /// Answers byte 1 with byte 3, sent back through `reply`.
    struct Replier {
        reply: Mutex<Weak<DirectWire>>,
        seen: Mutex<Vec<u8>>,
    }

    impl WireSubscriber for Replier {
        fn wire_id(&self) -> RdId {
            RdId::new(77)
        }

        fn on_wire_received(&self, payload: Vec<u8>, _helper: &DispatchHelper) {
            self.seen.lock().extend(payload.iter().copied());
            if payload == [1] {
                let reply = self.reply.lock().upgrade();
                if let Some(wire) = reply {
                    send_byte(&wire, 3);
                }
            }
        }
    }

    #[test]
    fn test_send_during_reconnect_flush_stays_behind_held_frames() {
        let (a, b) = DirectWire::pair();
        let def = LifetimeDef::new();
        let replier = Arc::new(Replier {
            reply: Mutex::new(Arc::downgrade(&a)),
            seen: Mutex::new(Vec::new()),
        });
        b.advise(def.lifetime(), replier.clone());

        a.set_connected(false);
        send_byte(&a, 1);
        send_byte(&a, 2);
        a.set_connected(true);

        assert_eq!(*replier.seen.lock(), vec![1, 2, 3]);
        assert_eq!(a.sent_log().len(), 3);
        def.terminate();
    }
}
