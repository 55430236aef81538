// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Buffering proxy wire for extension sub-protocols.
//!
//! An extension talks through the parent protocol's wire, but only once its
//! counterpart has answered the handshake. Until then every send is
//! serialized into a private queue together with a snapshot of the protocol
//! contexts. On connect the queue is replayed in order, each frame inside its
//! own snapshot. A send made while the queue is non-empty also queues, so
//! replayed frames are never overtaken.

use super::{serialize_payload, MessageBroker, PayloadWriter, Wire, WireResult};
use crate::core::{ContextSnapshot, Lifetime, ProtocolContexts, RdId};
use crate::ser::WriteCursor;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct QueuedFrame {
    id: RdId,
    payload: Vec<u8>,
    context: ContextSnapshot,
}

#[derive(Default)]
struct Outbox {
    frames: VecDeque<QueuedFrame>,
    /// A replay is draining `frames`; new sends queue behind it
    replaying: bool,
}

pub struct ExtWire {
    real: Arc<dyn Wire>,
    contexts: Arc<ProtocolContexts>,
    connected: AtomicBool,
    // Never held across a send to `real` or a payload writer.
    outbox: Mutex<Outbox>,
}

impl ExtWire {
    pub fn new(real: Arc<dyn Wire>, contexts: Arc<ProtocolContexts>) -> Arc<Self> {
        Arc::new(Self {
            real,
            contexts,
            connected: AtomicBool::new(false),
            outbox: Mutex::new(Outbox::default()),
        })
    }

    /// Flip the handshake state; connecting replays queued frames.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        if connected {
            self.replay();
        }
    }

    pub fn queued(&self) -> usize {
        self.outbox.lock().frames.len()
    }

    /// Drain the queue in order. Frames queued meanwhile, including by
    /// reentrant sends, are drained by the same pass.
    fn replay(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.replaying {
                return;
            }
            outbox.replaying = true;
        }
        let mut replayed = 0usize;
        loop {
            let next = {
                let mut outbox = self.outbox.lock();
                let next = if self.connected.load(Ordering::Acquire) {
                    outbox.frames.pop_front()
                } else {
                    None
                };
                if next.is_none() {
                    outbox.replaying = false;
                }
                next
            };
            let Some(QueuedFrame {
                id,
                payload,
                context,
            }) = next
            else {
                break;
            };
            let result = self.contexts.with_snapshot(&context, || {
                self.real.send(id, &mut |out: &mut WriteCursor| {
                    out.write_bytes(&payload);
                    Ok(())
                })
            });
            if let Err(e) = result {
                log::warn!(target: "rdsync::send", "replay of queued frame for {} failed: {}", id, e);
            }
            replayed += 1;
        }
        if replayed > 0 {
            log::debug!(target: "rdsync::send", "ext wire replayed {} queued frame(s)", replayed);
        }
    }

    fn enqueue(&self, id: RdId, writer: PayloadWriter<'_>) -> WireResult<()> {
        let payload = serialize_payload(writer)?;
        log::trace!(target: "rdsync::send", "ext wire not ready, queued {} byte(s) for {}", payload.len(), id);
        let frame = QueuedFrame {
            id,
            payload,
            context: self.contexts.snapshot(),
        };
        let stranded = {
            let mut outbox = self.outbox.lock();
            outbox.frames.push_back(frame);
            self.connected.load(Ordering::Acquire) && !outbox.replaying
        };
        // Connected while the payload was being written: nobody else will
        // drain this frame.
        if stranded {
            self.replay();
        }
        Ok(())
    }
}

impl Wire for ExtWire {
    fn send(&self, id: RdId, writer: PayloadWriter<'_>) -> WireResult<()> {
        let must_queue = {
            let outbox = self.outbox.lock();
            !self.connected.load(Ordering::Acquire) || outbox.replaying || !outbox.frames.is_empty()
        };
        if must_queue {
            return self.enqueue(id, writer);
        }
        self.real.send(id, writer)
    }

    fn broker(&self) -> &Arc<MessageBroker> {
        self.real.broker()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn advise(&self, lifetime: Lifetime, subscriber: Arc<dyn super::WireSubscriber>) {
        self.real.advise(lifetime, subscriber);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::sync::{OnceLock, Weak};
    use std::thread;
    use std::time::Duration;

    /// Records every send together with the context current at that moment.
    struct RecordingWire {
        broker: Arc<MessageBroker>,
        contexts: Arc<ProtocolContexts>,
        frames: Mutex<Vec<(RdId, Vec<u8>, Option<String>)>>,
    }

    impl Wire for RecordingWire {
        fn send(&self, id: RdId, writer: PayloadWriter<'_>) -> WireResult<()> {
            let payload = serialize_payload(writer)?;
            self.frames
                .lock()
                .push((id, payload, self.contexts.get("origin")));
            Ok(())
        }

        fn broker(&self) -> &Arc<MessageBroker> {
            &self.broker
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn send_byte(wire: &ExtWire, id: i64, b: u8) {
        wire.send(RdId::new(id), &mut |out: &mut WriteCursor| {
            out.write_u8(b);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_queue_until_connected_then_replay_with_context() {
        let contexts = ProtocolContexts::new();
        let real = Arc::new(RecordingWire {
            broker: MessageBroker::new(),
            contexts: contexts.clone(),
            frames: Mutex::new(Vec::new()),
        });
        let ext = ExtWire::new(real.clone(), contexts.clone());

        contexts.set("origin", "first");
        send_byte(&ext, 1, 10);
        contexts.set("origin", "second");
        send_byte(&ext, 2, 20);
        send_byte(&ext, 1, 30);
        assert_eq!(ext.queued(), 3);
        assert!(real.frames.lock().is_empty());

        contexts.set("origin", "live");
        ext.set_connected(true);
        send_byte(&ext, 3, 40);

        let frames = real.frames.lock().clone();
        assert_eq!(
            frames,
            vec![
                (RdId::new(1), vec![10], Some("first".to_string())),
                (RdId::new(2), vec![20], Some("second".to_string())),
                (RdId::new(1), vec![30], Some("second".to_string())),
                (RdId::new(3), vec![40], Some("live".to_string())),
            ]
        );
        assert_eq!(contexts.get("origin").as_deref(), Some("live"));
    }

    #[test]
    fn test_disconnect_queues_again() {
        let contexts = ProtocolContexts::new();
        let real = Arc::new(RecordingWire {
            broker: MessageBroker::new(),
            contexts: contexts.clone(),
            frames: Mutex::new(Vec::new()),
        });
        let ext = ExtWire::new(real.clone(), contexts);
        ext.set_connected(true);
        send_byte(&ext, 1, 1);
        ext.set_connected(false);
        send_byte(&ext, 1, 2);
        assert_eq!(real.frames.lock().len(), 1);
        assert_eq!(ext.queued(), 1);
        ext.set_connected(true);
        assert_eq!(real.frames.lock().len(), 2);
        assert!(Arc::ptr_eq(ext.broker(), &real.broker));
    }

    /// Sends back through the ext wire when it sees `echo_on`.
    struct EchoingWire {
        broker: Arc<MessageBroker>,
        ext: OnceLock<Weak<ExtWire>>,
        echo_on: RdId,
        frames: Mutex<Vec<RdId>>,
    }

    impl Wire for EchoingWire {
        fn send(&self, id: RdId, writer: PayloadWriter<'_>) -> WireResult<()> {
            serialize_payload(writer)?;
            self.frames.lock().push(id);
            if id == self.echo_on {
                if let Some(ext) = self.ext.get().and_then(Weak::upgrade) {
                    send_byte(&ext, 3, 3);
                }
            }
            Ok(())
        }

        fn broker(&self) -> &Arc<MessageBroker> {
            &self.broker
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_send_during_replay_goes_after_queued_frames() {
        let real = Arc::new(EchoingWire {
            broker: MessageBroker::new(),
            ext: OnceLock::new(),
            echo_on: RdId::new(1),
            frames: Mutex::new(Vec::new()),
        });
        let ext = ExtWire::new(real.clone(), ProtocolContexts::new());
        let _ = real.ext.set(Arc::downgrade(&ext));

        send_byte(&ext, 1, 1);
        send_byte(&ext, 2, 2);
        ext.set_connected(true);

        assert_eq!(
            *real.frames.lock(),
            vec![RdId::new(1), RdId::new(2), RdId::new(3)]
        );
        assert_eq!(ext.queued(), 0);
    }

    /// Blocks sends to `gated` until released.
    struct GateWire {
        broker: Arc<MessageBroker>,
        gated: RdId,
        entered: channel::Sender<()>,
        release: channel::Receiver<()>,
        frames: Mutex<Vec<RdId>>,
    }

    impl Wire for GateWire {
        fn send(&self, id: RdId, writer: PayloadWriter<'_>) -> WireResult<()> {
            serialize_payload(writer)?;
            if id == self.gated {
                let _ = self.entered.send(());
                let _ = self.release.recv_timeout(Duration::from_secs(5));
            }
            self.frames.lock().push(id);
            Ok(())
        }

        fn broker(&self) -> &Arc<MessageBroker> {
            &self.broker
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_slow_send_does_not_block_other_senders() {
        let (entered_tx, entered_rx) = channel::bounded(1);
        let (release_tx, release_rx) = channel::bounded(1);
        let real = Arc::new(GateWire {
            broker: MessageBroker::new(),
            gated: RdId::new(1),
            entered: entered_tx,
            release: release_rx,
            frames: Mutex::new(Vec::new()),
        });
        let ext = ExtWire::new(real.clone(), ProtocolContexts::new());
        ext.set_connected(true);

        let slow = {
            let ext = ext.clone();
            thread::spawn(move || send_byte(&ext, 1, 1))
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        send_byte(&ext, 2, 2);
        assert_eq!(*real.frames.lock(), vec![RdId::new(2)]);

        release_tx.send(()).unwrap();
        slow.join().unwrap();
        assert_eq!(*real.frames.lock(), vec![RdId::new(2), RdId::new(1)]);
    }
}
