// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Call-site / endpoint tests over an in-process wire pair.

use super::*;
use crate::bind::{BindParent, Bindable, RdSignal};
use crate::config::{ProtocolConfig, RpcTimeouts};
use crate::core::{
    Identities, Lifetime, LifetimeDef, RdId, Scheduler, SynchronousScheduler, TestScheduler,
};
use crate::protocol::Protocol;
use crate::ser::Serializers;
use crate::wire::{DirectWire, MessageBroker, PayloadWriter, Wire, WireError, WireResult};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Peers {
    client: Arc<Protocol>,
    server: Arc<Protocol>,
    client_wire: Arc<DirectWire>,
}

fn peers(lifetime: Lifetime, server_scheduler: Arc<dyn Scheduler>) -> Peers {
    peers_with(lifetime, Arc::new(SynchronousScheduler), server_scheduler)
}

fn peers_with(
    lifetime: Lifetime,
    client_scheduler: Arc<dyn Scheduler>,
    server_scheduler: Arc<dyn Scheduler>,
) -> Peers {
    let (left, right) = DirectWire::pair();
    let ser = Arc::new(Serializers::new());
    let client = Protocol::new(
        ProtocolConfig::client("p"),
        ser.clone(),
        client_scheduler,
        left.clone(),
        lifetime,
    );
    let server = Protocol::new(ProtocolConfig::server("p"), ser, server_scheduler, right, lifetime);
    Peers {
        client,
        server,
        client_wire: left,
    }
}

fn bound_calls<Req: RpcRequest, Res: RpcResponse>(
    peers: &Peers,
) -> (Arc<RdCall<Req, Res>>, Arc<RdCall<Req, Res>>) {
    let caller = RdCall::<Req, Res>::new();
    let endpoint = RdCall::<Req, Res>::new();
    peers.client.bind_top_level(caller.as_ref(), "call");
    peers.server.bind_top_level(endpoint.as_ref(), "call");
    (caller, endpoint)
}

/// Cancellation frames are the only empty ones a call site sends.
fn cancels_sent(wire: &DirectWire) -> usize {
    wire.sent_log().iter().filter(|(_, len)| *len == 0).count()
}

#[test]
fn test_sync_round_trip() {
    let def = LifetimeDef::new();
    let peers = peers(def.lifetime(), Arc::new(SynchronousScheduler));
    let (caller, endpoint) = bound_calls::<String, String>(&peers);
    endpoint.set_sync_handler(|_lt, req| Ok(format!("{}!", req)));
    assert!(endpoint.has_handler());
    assert!(!caller.has_handler());

    let answer = caller.sync("hi".to_string(), RpcTimeouts::DEFAULT).unwrap();
    assert_eq!(answer, "hi!");
    assert_eq!(cancels_sent(&peers.client_wire), 0);
    def.terminate();
}

#[test]
fn test_sync_keeps_bindable_result_bound() {
    let def = LifetimeDef::new();
    let peers = peers(def.lifetime(), Arc::new(SynchronousScheduler));
    let (caller, endpoint) = bound_calls::<i32, Arc<RdSignal<i32>>>(&peers);
    let served: Arc<Mutex<Option<Arc<RdSignal<i32>>>>> = Arc::new(Mutex::new(None));
    let s = served.clone();
    endpoint.set_sync_handler(move |_lt, _v| {
        let signal = RdSignal::<i32>::new();
        *s.lock() = Some(signal.clone());
        Ok(signal)
    });

    let received = caller.sync(0, RpcTimeouts::DEFAULT).unwrap();
    let served = served.lock().clone().expect("handler ran");
    assert!(received.is_bound());
    assert!(served.is_bound());
    assert_eq!(cancels_sent(&peers.client_wire), 0);

    let heard = Arc::new(Mutex::new(Vec::new()));
    let h = heard.clone();
    served.advise(def.lifetime(), move |v: &i32| h.lock().push(*v));
    received.fire(3).unwrap();
    assert_eq!(*heard.lock(), vec![3]);
    def.terminate();
}

#[test]
fn test_response_is_applied_on_the_caller_scheduler() {
    let def = LifetimeDef::new();
    let client_scheduler = TestScheduler::new("client");
    let peers = peers_with(def.lifetime(), client_scheduler.clone(), Arc::new(SynchronousScheduler));
    let (caller, endpoint) = bound_calls::<i32, i32>(&peers);
    endpoint.set_sync_handler(|_lt, v| Ok(v * 2));

    let task = caller.start(Lifetime::eternal(), 21).unwrap();
    assert!(!task.is_completed());
    assert_eq!(client_scheduler.pending(), 1);

    client_scheduler.flush();
    assert_eq!(task.result(), Some(RdTaskResult::Success(42)));

    let inline = caller
        .start_on(Lifetime::eternal(), 5, Arc::new(SynchronousScheduler))
        .unwrap();
    assert_eq!(inline.result(), Some(RdTaskResult::Success(10)));
    assert_eq!(client_scheduler.pending(), 0);
    def.terminate();
}

#[test]
fn test_both_sides_may_call() {
    let def = LifetimeDef::new();
    let peers = peers(def.lifetime(), Arc::new(SynchronousScheduler));
    let (a, b) = bound_calls::<i32, i32>(&peers);
    a.set_sync_handler(|_lt, v| Ok(v + 1));
    b.set_sync_handler(|_lt, v| Ok(v * 10));

    assert_eq!(a.sync(4, RpcTimeouts::DEFAULT).unwrap(), 40);
    assert_eq!(b.sync(4, RpcTimeouts::DEFAULT).unwrap(), 5);
    def.terminate();
}

#[test]
fn test_missing_handler_faults() {
    let def = LifetimeDef::new();
    let peers = peers(def.lifetime(), Arc::new(SynchronousScheduler));
    let (caller, _endpoint) = bound_calls::<String, String>(&peers);

    match caller.sync("hi".to_string(), RpcTimeouts::DEFAULT) {
        Err(RpcError::Fault(fault)) => {
            assert_eq!(fault.type_name, "MissingHandler");
            assert!(fault.message.contains("handler is not set for endpoint `p.call`"));
        }
        other => panic!("expected fault, got {:?}", other),
    }
    def.terminate();
}

#[test]
fn test_handler_fault_and_panic() {
    let def = LifetimeDef::new();
    let peers = peers(def.lifetime(), Arc::new(SynchronousScheduler));
    let (caller, endpoint) = bound_calls::<i32, i32>(&peers);
    endpoint.set_sync_handler(|_lt, v| {
        if v < 0 {
            panic!("negative input");
        }
        Err(RdFault::new("Refused", format!("{} is not welcome", v)))
    });

    match caller.sync(3, RpcTimeouts::DEFAULT) {
        Err(RpcError::Fault(fault)) => assert_eq!(fault.to_string(), "Refused: 3 is not welcome"),
        other => panic!("expected fault, got {:?}", other),
    }
    match caller.sync(-1, RpcTimeouts::DEFAULT) {
        Err(RpcError::Fault(fault)) => {
            assert_eq!(fault.type_name, "Panic");
            assert_eq!(fault.message, "negative input");
        }
        other => panic!("expected fault, got {:?}", other),
    }
    def.terminate();
}

#[test]
fn test_undecodable_request_faults() {
    let def = LifetimeDef::new();
    let peers = peers(def.lifetime(), Arc::new(SynchronousScheduler));
    let caller = RdCall::<u8, String>::new();
    let endpoint = RdCall::<i64, String>::new();
    peers.client.bind_top_level(caller.as_ref(), "call");
    peers.server.bind_top_level(endpoint.as_ref(), "call");
    endpoint.set_sync_handler(|_lt, v| Ok(v.to_string()));

    match caller.sync(1, RpcTimeouts::DEFAULT) {
        Err(RpcError::Fault(fault)) => assert_eq!(fault.type_name, "SerializationError"),
        other => panic!("expected fault, got {:?}", other),
    }
    def.terminate();
}

#[test]
fn test_unbound_call_is_rejected() {
    let call = RdCall::<i32, i32>::new();
    match call.start(Lifetime::eternal(), 1) {
        Err(RpcError::NotBound(location)) => assert_eq!(location, "<<not bound>>"),
        other => panic!("expected NotBound, got {:?}", other),
    }
}

#[test]
fn test_dead_caller_scope_cancels_without_sending() {
    let def = LifetimeDef::new();
    let peers = peers(def.lifetime(), Arc::new(SynchronousScheduler));
    let (caller, endpoint) = bound_calls::<i32, i32>(&peers);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    endpoint.set_sync_handler(move |_lt, v| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(v)
    });

    let sent_before = peers.client_wire.sent_log().len();
    let task = caller.start(Lifetime::terminated(), 5).unwrap();
    assert_eq!(task.result(), Some(RdTaskResult::Canceled));
    assert_eq!(peers.client_wire.sent_log().len(), sent_before);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    def.terminate();
}

#[test]
fn test_sync_timeout_cancels_remote_scope() {
    let def = LifetimeDef::new();
    let peers = peers(def.lifetime(), Arc::new(SynchronousScheduler));
    let (caller, endpoint) = bound_calls::<i32, i32>(&peers);
    let token: Arc<Mutex<Option<Lifetime>>> = Arc::new(Mutex::new(None));
    let t = token.clone();
    endpoint.set_handler(move |lt, _v| {
        *t.lock() = Some(lt);
        RdTask::new()
    });

    let timeouts = RpcTimeouts::new(Duration::from_millis(5), Duration::from_millis(30));
    assert!(matches!(caller.sync(1, timeouts), Err(RpcError::Timeout)));

    let handler_scope = token.lock().expect("handler ran");
    assert!(!handler_scope.is_alive());
    assert_eq!(cancels_sent(&peers.client_wire), 1);
    def.terminate();
}

#[test]
fn test_cancel_before_dispatch_skips_handler() {
    let def = LifetimeDef::new();
    let scheduler = TestScheduler::new("server");
    let peers = peers(def.lifetime(), scheduler.clone());
    let (caller, endpoint) = bound_calls::<i32, i32>(&peers);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    endpoint.set_sync_handler(move |_lt, v| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(v)
    });

    let scope = LifetimeDef::new();
    let task = caller.start(scope.lifetime(), 7).unwrap();
    assert!(!task.is_completed());
    assert_eq!(scheduler.pending(), 1);

    scope.terminate();
    assert_eq!(task.result(), Some(RdTaskResult::Canceled));
    scope.terminate();
    assert_eq!(cancels_sent(&peers.client_wire), 1);

    scheduler.flush();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(task.result(), Some(RdTaskResult::Canceled));
    def.terminate();
}

#[test]
fn test_response_after_completion_is_dropped() {
    let def = LifetimeDef::new();
    let scheduler = TestScheduler::new("server");
    let peers = peers(def.lifetime(), scheduler.clone());
    let (caller, endpoint) = bound_calls::<i32, i32>(&peers);
    let pending: Arc<Mutex<Option<Arc<RdTask<i32>>>>> = Arc::new(Mutex::new(None));
    let p = pending.clone();
    endpoint.set_handler(move |_lt, _v| {
        let task = RdTask::new();
        *p.lock() = Some(task.clone());
        task
    });

    let task = caller.start(Lifetime::eternal(), 1).unwrap();
    scheduler.flush();
    // Local completion wins over the response that follows.
    assert!(task.set(RdTaskResult::Success(100)));

    let remote = pending.lock().clone().expect("handler ran");
    remote.set(RdTaskResult::Success(2));
    assert_eq!(task.result(), Some(RdTaskResult::Success(100)));
    def.terminate();
}

#[test]
fn test_bindable_result_lives_until_either_side_cancels() {
    let def = LifetimeDef::new();
    let scheduler = TestScheduler::new("server");
    let peers = peers(def.lifetime(), scheduler.clone());
    let (caller, endpoint) = bound_calls::<String, Arc<RdSignal<String>>>(&peers);

    let served: Arc<Mutex<Option<Arc<RdSignal<String>>>>> = Arc::new(Mutex::new(None));
    let heard = Arc::new(Mutex::new(Vec::new()));
    let (s, h) = (served.clone(), heard.clone());
    endpoint.set_sync_handler(move |lt, topic| {
        let signal = RdSignal::<String>::new();
        let h = h.clone();
        signal.advise(lt, move |v: &String| h.lock().push(format!("{}:{}", topic, v)));
        *s.lock() = Some(signal.clone());
        Ok(signal)
    });

    let scope = LifetimeDef::new();
    let task = caller.start(scope.lifetime(), "news".to_string()).unwrap();
    scheduler.flush();

    let received = match task.result() {
        Some(RdTaskResult::Success(signal)) => signal,
        other => panic!("expected bindable result, got {:?}", other.map(|r| r.is_success())),
    };
    let served = served.lock().clone().expect("handler ran");
    assert!(received.is_bound());
    assert!(served.is_bound());
    assert_eq!(received.rd_id(), served.rd_id());
    assert_eq!(received.location(), served.location());

    received.fire("hello".to_string()).unwrap();
    scheduler.flush();
    assert_eq!(*heard.lock(), vec!["news:hello".to_string()]);

    scope.terminate();
    assert!(!received.is_bound());
    scheduler.flush();
    assert!(!served.is_bound());
    assert_eq!(cancels_sent(&peers.client_wire), 1);
    def.terminate();
}

#[test]
fn test_unbinding_the_endpoint_cancels_pending_calls() {
    let def = LifetimeDef::new();
    let peers = peers(def.lifetime(), Arc::new(SynchronousScheduler));
    let caller = RdCall::<i32, i32>::new();
    let endpoint = RdCall::<i32, i32>::new();
    peers.client.bind_top_level(caller.as_ref(), "call");
    let endpoint_scope = def.create_nested();
    endpoint.identify(peers.server.identities(), Identities::derive(RdId::NULL, "call"));
    endpoint.pre_bind(
        endpoint_scope.lifetime(),
        BindParent::Protocol(peers.server.clone()),
        "call",
    );
    endpoint.bind();

    let token: Arc<Mutex<Option<Lifetime>>> = Arc::new(Mutex::new(None));
    let t = token.clone();
    endpoint.set_handler(move |lt, _v| {
        *t.lock() = Some(lt);
        RdTask::new()
    });

    let task = caller.start(def.lifetime(), 1).unwrap();
    assert!(!task.is_completed());

    endpoint_scope.terminate();
    assert_eq!(task.result(), Some(RdTaskResult::Canceled));
    assert!(!token.lock().expect("handler ran").is_alive());
    // The caller learned it from the endpoint, nothing to echo.
    assert_eq!(cancels_sent(&peers.client_wire), 0);
    def.terminate();
}

/// Forwards to a direct wire; fails the next send once armed.
struct FlakyWire {
    inner: Arc<DirectWire>,
    fail_next: AtomicBool,
}

impl Wire for FlakyWire {
    fn send(&self, id: RdId, writer: PayloadWriter<'_>) -> WireResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(WireError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "link down")));
        }
        self.inner.send(id, writer)
    }

    fn broker(&self) -> &Arc<MessageBroker> {
        self.inner.broker()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

#[test]
fn test_unsent_bindable_result_is_not_bound() {
    let def = LifetimeDef::new();
    let (left, right) = DirectWire::pair();
    let flaky = Arc::new(FlakyWire {
        inner: right,
        fail_next: AtomicBool::new(false),
    });
    let ser = Arc::new(Serializers::new());
    let client = Protocol::new(
        ProtocolConfig::client("p"),
        ser.clone(),
        Arc::new(SynchronousScheduler),
        left.clone(),
        def.lifetime(),
    );
    let server = Protocol::new(
        ProtocolConfig::server("p"),
        ser,
        Arc::new(SynchronousScheduler),
        flaky.clone(),
        def.lifetime(),
    );
    let caller = RdCall::<i32, Arc<RdSignal<i32>>>::new();
    let endpoint = RdCall::<i32, Arc<RdSignal<i32>>>::new();
    client.bind_top_level(caller.as_ref(), "call");
    server.bind_top_level(endpoint.as_ref(), "call");

    let served: Arc<Mutex<Option<Arc<RdSignal<i32>>>>> = Arc::new(Mutex::new(None));
    let (s, f) = (served.clone(), flaky.clone());
    endpoint.set_sync_handler(move |_lt, _v| {
        let signal = RdSignal::<i32>::new();
        *s.lock() = Some(signal.clone());
        f.fail_next.store(true, Ordering::SeqCst);
        Ok(signal)
    });

    let task = caller.start(def.lifetime(), 1).unwrap();
    match task.result() {
        Some(RdTaskResult::Fault(fault)) => {
            assert_eq!(fault.type_name, "WireError");
            assert!(fault.message.contains("link down"), "{}", fault.message);
        }
        other => panic!("expected fault, got {:?}", other.map(|r| r.is_success())),
    }
    let served = served.lock().clone().expect("handler ran");
    assert!(!served.is_bound());
    assert_eq!(cancels_sent(&left), 0);
    def.terminate();
}

#[test]
#[should_panic(expected = "illegal scheduler")]
fn test_start_off_the_protocol_thread_panics() {
    let def = LifetimeDef::new();
    let foreign = thread::spawn(|| TestScheduler::new("elsewhere")).join().unwrap();
    let peers = peers_with(def.lifetime(), foreign, Arc::new(SynchronousScheduler));
    let (caller, _endpoint) = bound_calls::<i32, i32>(&peers);
    let _ = caller.start(Lifetime::eternal(), 1);
}

#[test]
fn test_free_threaded_call_syncs_from_any_thread() {
    let def = LifetimeDef::new();
    let foreign = thread::spawn(|| TestScheduler::new("elsewhere")).join().unwrap();
    let peers = peers_with(def.lifetime(), foreign, Arc::new(SynchronousScheduler));
    let caller = RdCall::<i32, i32>::free_threaded();
    let endpoint = RdCall::<i32, i32>::new();
    peers.client.bind_top_level(caller.as_ref(), "call");
    peers.server.bind_top_level(endpoint.as_ref(), "call");
    endpoint.set_sync_handler(|_lt, v| Ok(v + 1));

    assert_eq!(caller.sync(1, RpcTimeouts::DEFAULT).unwrap(), 2);
    def.terminate();
}
