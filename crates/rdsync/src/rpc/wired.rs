// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-call wire subscriptions.
//!
//! Every in-flight call has one subscriber on each side, advised under the
//! call id allocated by the call site:
//!
//! - [`CallSiteWiredTask`] receives the response and completes the caller's
//!   task on the response scheduler. For a bindable result it stays advised,
//!   as the scope the result is bound in.
//! - [`EndpointWiredTask`] receives the cancellation and sends the response
//!   once the handler's task completes. Ending its scope before that
//!   completes the task as canceled.

use super::{RdFault, RdTask, RdTaskResult, RpcResponse};
use crate::bind::{BindParent, Bindable};
use crate::core::{LifetimeDef, RdId, Scheduler};
use crate::protocol::Protocol;
use crate::ser::{RdSerialize, ReadCursor, Serializers, WriteCursor};
use crate::wire::{DispatchHelper, Wire, WireError, WireResult, WireSubscriber};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Send the content-free cancellation frame for `task_id`.
pub(crate) fn send_cancel(wire: &dyn Wire, task_id: RdId) {
    match wire.send(task_id, &mut |_out: &mut WriteCursor| Ok(())) {
        Ok(()) => log::trace!(target: "rdsync::send", "cancellation sent for {}", task_id),
        Err(e) => log::debug!(target: "rdsync::send", "cancellation for {} not sent: {}", task_id, e),
    }
}

// ============================================================================
// Call site
// ============================================================================

pub(crate) struct CallSiteWiredTask<Res> {
    pub(crate) this: Weak<CallSiteWiredTask<Res>>,
    pub(crate) task_id: RdId,
    pub(crate) call: Arc<dyn Bindable>,
    pub(crate) task: Arc<RdTask<Res>>,
    /// Scope this subscriber is advised under; a bindable result lives in it
    pub(crate) scope: LifetimeDef,
    pub(crate) serializers: Arc<Serializers>,
    /// Where responses are applied
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) wire: Arc<dyn Wire>,
    /// Set when the endpoint ended the bound result
    pub(crate) remote_ended: Arc<AtomicBool>,
}

impl<Res: RpcResponse> CallSiteWiredTask<Res> {
    fn bind_result(&self, entity: Arc<dyn Bindable>) {
        let wire = self.wire.clone();
        let task_id = self.task_id;
        let remote_ended = self.remote_ended.clone();
        self.scope.on_termination_if_alive(move || {
            if !remote_ended.load(Ordering::Acquire) {
                send_cancel(wire.as_ref(), task_id);
            }
        });
        entity.pre_bind(
            self.scope.lifetime(),
            BindParent::Entity(self.call.clone()),
            &task_id.to_string(),
        );
        entity.bind();
    }

    fn receive(&self, payload: Vec<u8>) {
        if self.task.is_completed() {
            if payload.is_empty() {
                // Only reachable while a bound result is alive.
                log::debug!(target: "rdsync::recv", "endpoint ended the result of task {}", self.task_id);
                self.remote_ended.store(true, Ordering::Release);
                self.scope.terminate();
            } else {
                log::trace!(target: "rdsync::recv", "response for completed task {} dropped", self.task_id);
            }
            return;
        }
        let result = if payload.is_empty() {
            RdTaskResult::Canceled
        } else {
            let mut input = ReadCursor::new(&payload);
            RdTaskResult::<Res>::read(&self.serializers, &mut input).unwrap_or_else(|e| {
                RdTaskResult::Fault(RdFault::new("SerializationError", e.to_string()))
            })
        };

        if let RdTaskResult::Success(value) = &result {
            if let Some(entity) = value.as_bindable() {
                self.bind_result(entity);
            }
        }

        log::trace!(target: "rdsync::recv", "response for task {} received", self.task_id);
        self.task.set(result);
    }
}

impl<Res: RpcResponse> WireSubscriber for CallSiteWiredTask<Res> {
    fn wire_id(&self) -> RdId {
        self.task_id
    }

    fn on_wire_received(&self, payload: Vec<u8>, _helper: &DispatchHelper) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.scheduler.queue(Box::new(move || this.receive(payload)));
    }
}

// ============================================================================
// Endpoint
// ============================================================================

pub(crate) struct EndpointWiredTask<Res> {
    task_id: RdId,
    /// Per-request scope, the handler's cancellation token
    def: LifetimeDef,
    protocol: Arc<Protocol>,
    call: Arc<dyn Bindable>,
    pub(crate) result: Arc<RdTask<Res>>,
    /// Set when the call site canceled; no cancellation is echoed back
    remote_ended: Arc<AtomicBool>,
}

impl<Res: RpcResponse> EndpointWiredTask<Res> {
    /// Subscribe under `task_id` for the lifetime of `def` and send the
    /// response once `result` completes.
    pub(crate) fn start(
        task_id: RdId,
        def: LifetimeDef,
        protocol: Arc<Protocol>,
        call: Arc<dyn Bindable>,
    ) -> Arc<Self> {
        let wired = Arc::new(Self {
            task_id,
            def,
            protocol,
            call,
            result: RdTask::new(),
            remote_ended: Arc::new(AtomicBool::new(false)),
        });
        wired
            .protocol
            .wire()
            .advise(wired.def.lifetime(), wired.clone());
        let result = wired.result.clone();
        wired.def.on_termination_if_alive(move || {
            result.set(RdTaskResult::Canceled);
        });
        let weak: Weak<Self> = Arc::downgrade(&wired);
        wired.result.on_result(move |result| {
            if let Some(wired) = weak.upgrade() {
                wired.send_result(result);
            }
        });
        wired
    }

    pub(crate) fn task_id(&self) -> RdId {
        self.task_id
    }

    pub(crate) fn def(&self) -> &LifetimeDef {
        &self.def
    }

    fn send_result(&self, result: &RdTaskResult<Res>) {
        let bindable = match result {
            RdTaskResult::Success(value) => value.as_bindable(),
            _ => None,
        };
        match bindable {
            Some(entity) => {
                // Identified and pre-bound before the response, bound once it
                // is on the wire.
                let sent = self.def.execute_if_alive(|| {
                    let identities = self.protocol.identities();
                    entity.identify(identities, identities.next(self.task_id));
                    entity.pre_bind(
                        self.def.lifetime(),
                        BindParent::Entity(self.call.clone()),
                        &self.task_id.to_string(),
                    );
                    self.send(result)?;
                    entity.bind();
                    let wire = self.protocol.wire().clone();
                    let task_id = self.task_id;
                    let remote_ended = self.remote_ended.clone();
                    self.def.on_termination_if_alive(move || {
                        if !remote_ended.load(Ordering::Acquire) {
                            send_cancel(wire.as_ref(), task_id);
                        }
                    });
                    Ok::<(), WireError>(())
                });
                match sent {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        // Unbinds the pre-bound result.
                        self.def.terminate();
                        self.send_fault(&e);
                    }
                    None => log::debug!(
                        target: "rdsync::send",
                        "scope of task {} ended before its bindable result was sent",
                        self.task_id
                    ),
                }
            }
            None => {
                self.def.terminate();
                if let Err(e) = self.send(result) {
                    self.send_fault(&e);
                }
            }
        }
    }

    fn send(&self, result: &RdTaskResult<Res>) -> WireResult<()> {
        let serializers = self.protocol.serializers().clone();
        let sent = self
            .protocol
            .wire()
            .send(self.task_id, &mut |out: &mut WriteCursor| result.write(&serializers, out));
        match &sent {
            Ok(()) => log::trace!(target: "rdsync::send", "response for task {} sent", self.task_id),
            Err(e) => log::debug!(target: "rdsync::send", "response for task {} not sent: {}", self.task_id, e),
        }
        sent
    }

    /// Tell the caller the response could not be sent.
    fn send_fault(&self, error: &WireError) {
        let fault: RdTaskResult<Res> =
            RdTaskResult::Fault(RdFault::new("WireError", error.to_string()));
        if self.send(&fault).is_err() {
            log::warn!(target: "rdsync::send", "task {} left without a response", self.task_id);
        }
    }
}

impl<Res: RpcResponse> WireSubscriber for EndpointWiredTask<Res> {
    fn wire_id(&self) -> RdId {
        self.task_id
    }

    /// Only cancellations are addressed to the endpoint side of a task.
    fn on_wire_received(&self, payload: Vec<u8>, _helper: &DispatchHelper) {
        if !payload.is_empty() {
            log::warn!(
                target: "rdsync::recv",
                "unexpected {} byte(s) for task {}, treated as cancellation",
                payload.len(),
                self.task_id
            );
        }
        log::debug!(target: "rdsync::recv", "cancellation received for task {}", self.task_id);
        self.remote_ended.store(true, Ordering::Release);
        if !self.result.set(RdTaskResult::Canceled) {
            // Already answered: the cancellation ends the bindable result.
            let def = self.def.clone();
            self.protocol.scheduler().queue(Box::new(move || {
                def.terminate();
            }));
        }
    }
}
