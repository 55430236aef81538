// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP wire, one peer per wire.
//!
//! # Threads
//!
//! - **connection** (`rdsync-<name>-rx`): establishes the peer (accept poll on
//!   the server, connect with retry on the client), then reads frames with a
//!   [`FrameCodec`] and hands them to the broker. When the peer goes away it
//!   loops back and waits for the next one.
//! - **writer** (`rdsync-<name>-tx`): drains the ordered outbound queue, only
//!   while a peer is present. Frames sent before the first connect, or between
//!   a loss and a reconnect, go out afterwards in send order.
//!
//! Terminating the wire lifetime shuts the stream down and stops both threads.

use super::{FrameCodec, MessageBroker, PayloadWriter, Wire, WireError, WireResult};
use crate::config::{SocketConfig, ACCEPT_POLL_INTERVAL, FRAME_HEADER_SIZE};
use crate::core::{Lifetime, RdId};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Which side of the connection this wire plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketRole {
    /// Listens and accepts one peer at a time
    Server,
    /// Connects out, reconnecting after loss
    Client,
}

pub struct SocketWire {
    name: String,
    role: SocketRole,
    config: SocketConfig,
    broker: Arc<MessageBroker>,
    lifetime: Lifetime,
    /// Listening address (server) or remote address (client)
    address: SocketAddr,
    peer: Mutex<Option<Arc<TcpStream>>>,
    peer_changed: Condvar,
    outbound: Mutex<Option<Sender<Vec<u8>>>>,
    shutdown: AtomicBool,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    connections: AtomicU64,
}

impl SocketWire {
    /// Listen on `addr` (port 0 picks a free port, see [`local_addr`](Self::local_addr)).
    pub fn server(
        name: &str,
        addr: SocketAddr,
        config: SocketConfig,
        broker: Arc<MessageBroker>,
        lifetime: Lifetime,
    ) -> WireResult<Arc<Self>> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        // SO_REUSEADDR allows rapid rebind after a restart.
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(16)?;

        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        log::info!(target: "rdsync::init", "[{}] listening on {}", name, local);

        Self::start(name, SocketRole::Server, local, Some(listener), config, broker, lifetime)
    }

    /// Connect to `addr`, retrying per `config` until a peer answers.
    pub fn client(
        name: &str,
        addr: SocketAddr,
        config: SocketConfig,
        broker: Arc<MessageBroker>,
        lifetime: Lifetime,
    ) -> WireResult<Arc<Self>> {
        Self::start(name, SocketRole::Client, addr, None, config, broker, lifetime)
    }

    fn start(
        name: &str,
        role: SocketRole,
        address: SocketAddr,
        listener: Option<TcpListener>,
        config: SocketConfig,
        broker: Arc<MessageBroker>,
        lifetime: Lifetime,
    ) -> WireResult<Arc<Self>> {
        if !lifetime.is_alive() {
            return Err(WireError::Terminated);
        }
        let (tx, rx) = channel::unbounded();
        let wire = Arc::new(Self {
            name: name.to_string(),
            role,
            config,
            broker,
            lifetime,
            address,
            peer: Mutex::new(None),
            peer_changed: Condvar::new(),
            outbound: Mutex::new(Some(tx)),
            shutdown: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            connections: AtomicU64::new(0),
        });

        let weak: Weak<SocketWire> = Arc::downgrade(&wire);
        if !lifetime.on_termination_if_alive(move || {
            if let Some(wire) = weak.upgrade() {
                wire.close();
            }
        }) {
            return Err(WireError::Terminated);
        }

        let writer = wire.clone();
        thread::Builder::new()
            .name(format!("rdsync-{}-tx", name))
            .spawn(move || writer.write_loop(rx))?;

        let reader = wire.clone();
        thread::Builder::new()
            .name(format!("rdsync-{}-rx", name))
            .spawn(move || reader.connection_loop(listener))?;

        Ok(wire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> SocketRole {
        self.role
    }

    /// Bound listening address (server) or configured remote (client).
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Number of peers established so far.
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Block until a peer is present or `timeout` elapses.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut peer = self.peer.lock();
        while peer.is_none() {
            if self.peer_changed.wait_until(&mut peer, deadline).timed_out() {
                return peer.is_some();
            }
        }
        true
    }

    /// Block until no peer is present or `timeout` elapses.
    pub fn wait_disconnected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut peer = self.peer.lock();
        while peer.is_some() {
            if self.peer_changed.wait_until(&mut peer, deadline).timed_out() {
                return peer.is_none();
            }
        }
        true
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!(target: "rdsync::init", "[{}] wire terminated", self.name);
        self.outbound.lock().take();
        let mut peer = self.peer.lock();
        if let Some(stream) = peer.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.peer_changed.notify_all();
    }

    // =======================================================================
    // Connection management
    // =======================================================================

    fn connection_loop(self: Arc<Self>, listener: Option<TcpListener>) {
        let mut codec = FrameCodec::new(self.config.max_frame_size);
        while !self.is_shutdown() {
            let stream = match &listener {
                Some(listener) => self.accept_peer(listener),
                None => self.connect_peer(),
            };
            let Some(stream) = stream else { break };
            let stream = Arc::new(stream);
            if !self.install_peer(&stream) {
                break;
            }
            self.read_until_closed(&stream, &mut codec);
            self.drop_peer(&stream);
            codec.reset();
        }
        log::debug!(target: "rdsync::init", "[{}] connection thread stopped", self.name);
    }

    fn accept_peer(&self, listener: &TcpListener) -> Option<TcpStream> {
        loop {
            if self.is_shutdown() {
                return None;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    log::debug!(target: "rdsync::init", "[{}] accepted {}", self.name, addr);
                    return Some(stream);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    log::warn!(target: "rdsync::init", "[{}] accept failed: {}", self.name, e);
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
    }

    fn connect_peer(&self) -> Option<TcpStream> {
        let mut failures = 0u32;
        loop {
            if self.is_shutdown() {
                return None;
            }
            match TcpStream::connect_timeout(&self.address, self.config.connect_timeout) {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    failures += 1;
                    let max = self.config.max_reconnect_attempts;
                    if max > 0 && failures >= max {
                        log::error!(
                            target: "rdsync::init",
                            "[{}] giving up on {} after {} attempt(s): {}",
                            self.name,
                            self.address,
                            failures,
                            e
                        );
                        return None;
                    }
                    log::trace!(
                        target: "rdsync::init",
                        "[{}] connect to {} failed ({}), retrying",
                        self.name,
                        self.address,
                        e
                    );
                    thread::sleep(self.config.reconnect_delay);
                }
            }
        }
    }

    fn install_peer(&self, stream: &Arc<TcpStream>) -> bool {
        if let Err(e) = stream.set_nonblocking(false) {
            log::warn!(target: "rdsync::init", "[{}] cannot switch stream to blocking: {}", self.name, e);
            return false;
        }
        if self.config.nodelay {
            let _ = stream.set_nodelay(true);
        }
        let mut peer = self.peer.lock();
        if self.is_shutdown() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return false;
        }
        *peer = Some(stream.clone());
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.peer_changed.notify_all();
        log::info!(
            target: "rdsync::init",
            "[{}] connected ({:?}, peer {})",
            self.name,
            self.role,
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string())
        );
        true
    }

    fn drop_peer(&self, stream: &Arc<TcpStream>) {
        let mut peer = self.peer.lock();
        if peer.as_ref().is_some_and(|p| Arc::ptr_eq(p, stream)) {
            *peer = None;
            log::info!(target: "rdsync::init", "[{}] disconnected", self.name);
        }
        let _ = stream.shutdown(std::net::Shutdown::Both);
        self.peer_changed.notify_all();
    }

    fn read_until_closed(&self, stream: &TcpStream, codec: &mut FrameCodec) {
        let mut reader = stream;
        loop {
            match codec.decode(&mut reader) {
                Ok(Some(frame)) => {
                    self.frames_received.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "trace-frames")]
                    log::trace!(
                        target: "rdsync::recv",
                        "[{}] frame for {} ({} byte(s))",
                        self.name,
                        frame.id,
                        frame.payload.len()
                    );
                    self.broker.dispatch(frame.id, frame.payload);
                }
                Ok(None) => continue,
                Err(e) => {
                    if self.is_shutdown() || e.kind() == io::ErrorKind::UnexpectedEof {
                        log::debug!(target: "rdsync::recv", "[{}] stream closed: {}", self.name, e);
                    } else {
                        log::warn!(target: "rdsync::recv", "[{}] read failed: {}", self.name, e);
                    }
                    return;
                }
            }
        }
    }

    // =======================================================================
    // Outbound
    // =======================================================================

    /// Current peer, waiting while there is none. `None` once shut down.
    fn wait_for_peer(&self) -> Option<Arc<TcpStream>> {
        let mut peer = self.peer.lock();
        loop {
            if self.is_shutdown() {
                return None;
            }
            if let Some(stream) = peer.as_ref() {
                return Some(stream.clone());
            }
            self.peer_changed
                .wait_for(&mut peer, ACCEPT_POLL_INTERVAL * 10);
        }
    }

    fn write_loop(self: Arc<Self>, rx: Receiver<Vec<u8>>) {
        while let Ok(frame) = rx.recv() {
            loop {
                let Some(stream) = self.wait_for_peer() else {
                    log::debug!(target: "rdsync::send", "[{}] writer stopped", self.name);
                    return;
                };
                match (&*stream).write_all(&frame) {
                    Ok(()) => {
                        self.frames_sent.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(e) => {
                        // Resent in full to the next peer.
                        log::debug!(target: "rdsync::send", "[{}] write failed: {}", self.name, e);
                        self.drop_peer(&stream);
                    }
                }
            }
        }
        log::debug!(target: "rdsync::send", "[{}] outbound queue closed", self.name);
    }
}

impl Wire for SocketWire {
    fn send(&self, id: RdId, writer: PayloadWriter<'_>) -> WireResult<()> {
        if self.is_shutdown() || !self.lifetime.is_alive() {
            return Err(WireError::Terminated);
        }
        let frame = FrameCodec::encode_with(id, writer)?;
        let size = frame.len() - FRAME_HEADER_SIZE;
        if size > self.config.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }
        #[cfg(feature = "trace-frames")]
        log::trace!(target: "rdsync::send", "[{}] {} byte(s) to {}", self.name, size, id);
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| WireError::Terminated),
            None => Err(WireError::Terminated),
        }
    }

    fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    fn is_connected(&self) -> bool {
        self.peer.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LifetimeDef;
    use crate::ser::WriteCursor;
    use crate::wire::{DispatchHelper, WireSubscriber};

    const WAIT: Duration = Duration::from_secs(5);

    struct ChannelSink {
        id: RdId,
        tx: Sender<Vec<u8>>,
    }

    impl WireSubscriber for ChannelSink {
        fn wire_id(&self) -> RdId {
            self.id
        }

        fn on_wire_received(&self, payload: Vec<u8>, _helper: &DispatchHelper) {
            let _ = self.tx.send(payload);
        }
    }

    fn sink(wire: &SocketWire, lifetime: Lifetime, id: i64) -> Receiver<Vec<u8>> {
        let (tx, rx) = channel::unbounded();
        wire.advise(
            lifetime,
            Arc::new(ChannelSink {
                id: RdId::new(id),
                tx,
            }),
        );
        rx
    }

    fn send_byte(wire: &SocketWire, id: i64, b: u8) -> WireResult<()> {
        wire.send(RdId::new(id), &mut |out: &mut WriteCursor| {
            out.write_u8(b);
            Ok(())
        })
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_client_to_server_delivery() {
        let def = LifetimeDef::new();
        let server = SocketWire::server(
            "srv",
            loopback(),
            SocketConfig::default(),
            MessageBroker::new(),
            def.lifetime(),
        )
        .unwrap();
        let client = SocketWire::client(
            "cli",
            server.local_addr(),
            SocketConfig::default(),
            MessageBroker::new(),
            def.lifetime(),
        )
        .unwrap();
        let rx = sink(&server, def.lifetime(), 42);

        send_byte(&client, 42, 7).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![7]);
        assert!(client.wait_connected(WAIT));
        assert_eq!(server.role(), SocketRole::Server);
        def.terminate();
    }

    #[test]
    fn test_sends_before_connect_arrive_in_order() {
        let server_def = LifetimeDef::new();
        let server = SocketWire::server(
            "srv",
            loopback(),
            SocketConfig::default(),
            MessageBroker::new(),
            server_def.lifetime(),
        )
        .unwrap();
        assert!(!server.is_connected());
        for b in 1..=3 {
            send_byte(&server, 9, b).unwrap();
        }

        let client_def = LifetimeDef::new();
        let client = SocketWire::client(
            "cli",
            server.local_addr(),
            SocketConfig::default(),
            MessageBroker::new(),
            client_def.lifetime(),
        )
        .unwrap();
        let rx = sink(&client, client_def.lifetime(), 9);

        let got: Vec<Vec<u8>> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(got, vec![vec![1], vec![2], vec![3]]);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        client_def.terminate();
        server_def.terminate();
    }

    #[test]
    fn test_server_accepts_next_peer_after_loss() {
        let server_def = LifetimeDef::new();
        let server = SocketWire::server(
            "srv",
            loopback(),
            SocketConfig::default(),
            MessageBroker::new(),
            server_def.lifetime(),
        )
        .unwrap();
        let rx = sink(&server, server_def.lifetime(), 5);

        let first = LifetimeDef::new();
        let client = SocketWire::client(
            "cli-1",
            server.local_addr(),
            SocketConfig::default(),
            MessageBroker::new(),
            first.lifetime(),
        )
        .unwrap();
        send_byte(&client, 5, 1).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![1]);
        first.terminate();
        assert!(server.wait_disconnected(WAIT));
        assert!(matches!(send_byte(&client, 5, 2), Err(WireError::Terminated)));

        let second = LifetimeDef::new();
        let client = SocketWire::client(
            "cli-2",
            server.local_addr(),
            SocketConfig::default(),
            MessageBroker::new(),
            second.lifetime(),
        )
        .unwrap();
        send_byte(&client, 5, 3).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![3]);
        assert_eq!(server.connection_count(), 2);

        second.terminate();
        server_def.terminate();
    }

    #[test]
    fn test_oversized_send_rejected() {
        let def = LifetimeDef::new();
        let config = SocketConfig {
            max_frame_size: 4,
            ..Default::default()
        };
        let server =
            SocketWire::server("srv", loopback(), config, MessageBroker::new(), def.lifetime())
                .unwrap();
        let err = server
            .send(RdId::new(1), &mut |out: &mut WriteCursor| {
                out.write_bytes(&[0; 8]);
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { size: 8, max: 4 }));
        def.terminate();
    }

    #[test]
    fn test_dead_lifetime_refused() {
        let result = SocketWire::client(
            "cli",
            "127.0.0.1:1".parse().unwrap(),
            SocketConfig::default(),
            MessageBroker::new(),
            Lifetime::terminated(),
        );
        assert!(matches!(result, Err(WireError::Terminated)));
    }
}
