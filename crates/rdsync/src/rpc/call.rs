// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote call entity.
//!
//! Both peers create the same [`RdCall`]; the side that sets a handler acts
//! as the endpoint, the other one calls [`RdCall::start`] or
//! [`RdCall::sync`]. Calls are started on the protocol scheduler's thread
//! unless the call is [free-threaded](RdCall::free_threaded).

use super::wired::{send_cancel, CallSiteWiredTask, EndpointWiredTask};
use super::{RdFault, RdTask, RdTaskResult, RpcError, RpcRequest, RpcResponse, RpcResult};
use crate::bind::{Bindable, BindableBase};
use crate::config::{RpcTimeouts, SYNC_PUMP_INTERVAL};
use crate::core::{Lifetime, LifetimeDef, RdId, Scheduler, SynchronousScheduler};
use crate::protocol::Protocol;
use crate::ser::{RdSerialize, ReadCursor, WriteCursor};
use crate::wire::{DispatchHelper, WireSubscriber};
use arc_swap::ArcSwapOption;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Instant;

type HandlerFn<Req, Res> = dyn Fn(Lifetime, Req) -> Arc<RdTask<Res>> + Send + Sync;

struct Handler<Req, Res>(Box<HandlerFn<Req, Res>>);

pub struct RdCall<Req, Res> {
    base: BindableBase,
    this: Weak<RdCall<Req, Res>>,
    /// Skip the scheduler thread check in `start`
    free_threaded: bool,
    handler: ArcSwapOption<Handler<Req, Res>>,
}

impl<Req: RpcRequest, Res: RpcResponse> RdCall<Req, Res> {
    pub fn new() -> Arc<Self> {
        Self::create(false)
    }

    /// Call that may be started from any thread.
    pub fn free_threaded() -> Arc<Self> {
        Self::create(true)
    }

    fn create(free_threaded: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<RdCall<Req, Res>>| {
            let owner: Weak<dyn Bindable> = weak.clone();
            RdCall {
                base: BindableBase::new(owner),
                this: weak.clone(),
                free_threaded,
                handler: ArcSwapOption::empty(),
            }
        })
    }

    /// Install the endpoint handler. It receives the per-request scope,
    /// terminated when the caller cancels.
    pub fn set_handler(
        &self,
        handler: impl Fn(Lifetime, Req) -> Arc<RdTask<Res>> + Send + Sync + 'static,
    ) {
        let previous = self.handler.swap(Some(Arc::new(Handler(Box::new(handler)))));
        if previous.is_some() {
            log::debug!(target: "rdsync::init", "handler of `{}` replaced", self.base.location());
        }
    }

    /// Handler answering synchronously.
    pub fn set_sync_handler(
        &self,
        handler: impl Fn(Lifetime, Req) -> Result<Res, RdFault> + Send + Sync + 'static,
    ) {
        self.set_handler(move |lifetime, request| match handler(lifetime, request) {
            Ok(value) => RdTask::success(value),
            Err(fault) => RdTask::faulted(fault),
        });
    }

    pub fn has_handler(&self) -> bool {
        self.handler.load().is_some()
    }

    // =======================================================================
    // Call site
    // =======================================================================

    /// Send `request` and return its task right away. The response is
    /// applied on the protocol scheduler.
    ///
    /// The call is canceled (and the endpoint told so, once) when `lifetime`
    /// or the call's bind scope terminates before the response.
    ///
    /// # Panics
    ///
    /// Off the protocol scheduler thread, unless the call is free-threaded.
    pub fn start(&self, lifetime: Lifetime, request: Req) -> RpcResult<Arc<RdTask<Res>>> {
        self.start_internal(lifetime, request, None)
    }

    /// Like [`start`](Self::start), applying the response on
    /// `response_scheduler` instead.
    pub fn start_on(
        &self,
        lifetime: Lifetime,
        request: Req,
        response_scheduler: Arc<dyn Scheduler>,
    ) -> RpcResult<Arc<RdTask<Res>>> {
        self.start_internal(lifetime, request, Some(response_scheduler))
    }

    fn start_internal(
        &self,
        lifetime: Lifetime,
        request: Req,
        response_scheduler: Option<Arc<dyn Scheduler>>,
    ) -> RpcResult<Arc<RdTask<Res>>> {
        let (Some(protocol), Some(this)) = (self.base.protocol(), self.this.upgrade()) else {
            return Err(RpcError::NotBound(self.base.location()));
        };
        if !self.free_threaded {
            protocol.scheduler().assert_thread(&self.base.location());
        }
        let call_id = self.base.rd_id();
        let task_id = protocol.identities().next(RdId::NULL);
        let task = RdTask::new();

        let outer = lifetime.intersect(&self.base.bind_lifetime());
        if !outer.is_alive() {
            task.set(RdTaskResult::Canceled);
            return Ok(task);
        }

        let wire = protocol.wire().clone();
        let subscription = outer.create_nested();
        let call: Arc<dyn Bindable> = this;
        let scheduler = response_scheduler.unwrap_or_else(|| protocol.scheduler().clone());
        let serializers = protocol.serializers().clone();
        let wired = Arc::new_cyclic(|weak| CallSiteWiredTask {
            this: weak.clone(),
            task_id,
            call,
            task: task.clone(),
            scope: subscription.clone(),
            serializers,
            scheduler,
            wire: wire.clone(),
            remote_ended: Arc::new(AtomicBool::new(false)),
        });
        wire.advise(subscription.lifetime(), wired);

        {
            let task = task.clone();
            let wire = wire.clone();
            outer.on_termination_if_alive(move || {
                if task.set(RdTaskResult::Canceled) {
                    log::debug!(target: "rdsync::send", "task {} canceled by caller", task_id);
                    send_cancel(wire.as_ref(), task_id);
                }
            });
        }
        {
            let outer = outer.clone();
            task.on_result(move |result| {
                // A bound result keeps its scope (nested in `outer`) alive.
                let bound = matches!(result, RdTaskResult::Success(v) if v.as_bindable().is_some());
                if !bound {
                    outer.terminate();
                }
            });
        }

        let serializers = protocol.serializers().clone();
        let sent = wire.send(call_id, &mut |out: &mut WriteCursor| {
            out.write_rd_id(task_id);
            request.write(&serializers, out)
        });
        if let Err(e) = sent {
            task.set(RdTaskResult::Fault(RdFault::new("WireError", e.to_string())));
            return Err(RpcError::Wire(e));
        }
        log::trace!(target: "rdsync::send", "`{}` started task {}", self.base.location(), task_id);
        Ok(task)
    }

    /// Start a call and block until it completes, pumping the protocol
    /// scheduler when called from its thread. The response is applied on
    /// the thread that receives it.
    ///
    /// Logs a warning once past `timeouts.warn_await_time`; past
    /// `timeouts.error_await_time` the call is canceled and
    /// [`RpcError::Timeout`] returned. A bindable result stays bound until
    /// either side ends it.
    pub fn sync(&self, request: Req, timeouts: RpcTimeouts) -> RpcResult<Res> {
        let def = LifetimeDef::new();
        let task = match self.start_internal(
            def.lifetime(),
            request,
            Some(Arc::new(SynchronousScheduler)),
        ) {
            Ok(task) => task,
            Err(e) => {
                def.terminate();
                return Err(e);
            }
        };
        let scheduler = self.base.protocol().map(|p| p.scheduler().clone());
        let started = Instant::now();
        let mut warned = false;
        loop {
            if let Some(scheduler) = &scheduler {
                if scheduler.is_active() {
                    scheduler.flush();
                }
            }
            if let Some(result) = task.wait(SYNC_PUMP_INTERVAL) {
                release_sync_scope(def, &result);
                return result.into_rpc_result();
            }
            let elapsed = started.elapsed();
            if !warned && elapsed >= timeouts.warn_await_time {
                warned = true;
                log::warn!(
                    target: "rdsync::send",
                    "sync call `{}` is taking longer than {:?}",
                    self.base.location(),
                    timeouts.warn_await_time
                );
            }
            if elapsed >= timeouts.error_await_time {
                log::error!(
                    target: "rdsync::send",
                    "sync call `{}` timed out after {:?}",
                    self.base.location(),
                    elapsed
                );
                def.terminate();
                return Err(RpcError::Timeout);
            }
        }
    }

    // =======================================================================
    // Endpoint
    // =======================================================================

    /// Runs on the protocol scheduler. The request scope (and its wired
    /// task) already exists, so a cancellation racing the dispatch is kept.
    fn on_request(self: Arc<Self>, wired: Arc<EndpointWiredTask<Res>>, request: Req) {
        let token = wired.def().lifetime();
        if !token.is_alive() {
            log::trace!(target: "rdsync::recv", "task {} canceled before dispatch", wired.task_id());
            return;
        }

        let handler_task = match self.handler.load_full() {
            None => {
                log::warn!(
                    target: "rdsync::recv",
                    "no handler for `{}`, task {} faulted",
                    self.base.location(),
                    wired.task_id()
                );
                RdTask::faulted(RdFault::new(
                    "MissingHandler",
                    format!("handler is not set for endpoint `{}`", self.base.location()),
                ))
            }
            Some(handler) => match catch_unwind(AssertUnwindSafe(|| (handler.0)(token, request))) {
                Ok(task) => task,
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "handler panicked".to_string());
                    log::error!(target: "rdsync::recv", "handler of `{}` panicked: {}", self.base.location(), message);
                    RdTask::faulted(RdFault::new("Panic", message))
                }
            },
        };

        let result = wired.result.clone();
        handler_task.on_result(move |r| {
            result.set(r.clone());
        });
    }
}

/// A bound result holds the scope of its `sync` call until it is unbound.
fn release_sync_scope<Res: RpcResponse>(def: LifetimeDef, result: &RdTaskResult<Res>) {
    if let RdTaskResult::Success(value) = result {
        if let Some(entity) = value.as_bindable() {
            if entity.is_bound() {
                entity.base().bind_lifetime().on_termination(move || {
                    def.terminate();
                });
                return;
            }
        }
    }
    def.terminate();
}

impl<Req: RpcRequest, Res: RpcResponse> Bindable for RdCall<Req, Res> {
    fn base(&self) -> &BindableBase {
        &self.base
    }

    fn pre_init(&self, lifetime: Lifetime, protocol: &Arc<Protocol>) {
        if let Some(this) = self.this.upgrade() {
            protocol.wire().advise(lifetime, this);
        }
    }
}

/// Inbound requests: `task_id:i64 | request`.
impl<Req: RpcRequest, Res: RpcResponse> WireSubscriber for RdCall<Req, Res> {
    fn wire_id(&self) -> RdId {
        self.base.rd_id()
    }

    fn on_wire_received(&self, payload: Vec<u8>, helper: &DispatchHelper) {
        let Some(protocol) = self.base.protocol() else {
            return;
        };
        let mut input = ReadCursor::new(&payload);
        let task_id = match input.read_rd_id() {
            Ok(id) if !id.is_null() => id,
            Ok(_) | Err(_) => {
                log::warn!(target: "rdsync::recv", "`{}`: request without task id dropped", self.base.location());
                return;
            }
        };
        let request = match Req::read(protocol.serializers(), &mut input) {
            Ok(request) => request,
            Err(e) => {
                log::warn!(target: "rdsync::recv", "`{}`: bad request for task {}: {}", self.base.location(), task_id, e);
                let fault: RdTaskResult<Res> =
                    RdTaskResult::Fault(RdFault::new("SerializationError", e.to_string()));
                let serializers = protocol.serializers().clone();
                let _ = protocol
                    .wire()
                    .send(task_id, &mut |out: &mut WriteCursor| fault.write(&serializers, out));
                return;
            }
        };
        log::trace!(target: "rdsync::recv", "`{}` request for task {}", self.base.location(), task_id);
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let def = self.base.bind_lifetime().create_nested();
        let call: Arc<dyn Bindable> = this.clone();
        let scheduler = protocol.scheduler().clone();
        let wired = EndpointWiredTask::start(task_id, def, protocol, call);
        helper.dispatch(scheduler.as_ref(), move || this.on_request(wired, request));
    }
}
