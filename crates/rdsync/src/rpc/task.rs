// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Write-once task cell.
//!
//! A task completes exactly once: whichever of the response, a cancellation
//! or a local fault arrives first wins. Later writes are dropped with a trace
//! log, never a panic.

use super::{RpcError, RpcResult};
use crate::ser::{RdSerialize, ReadCursor, SerError, SerResult, Serializers, WriteCursor};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

const STATUS_SUCCESS: i32 = 0;
const STATUS_CANCELED: i32 = 1;
const STATUS_FAULT: i32 = 2;

/// Failure reported by a remote handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RdFault {
    pub type_name: String,
    pub message: String,
    pub trace: String,
}

impl RdFault {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            trace: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }
}

impl fmt::Display for RdFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for RdFault {}

/// Final state of a task.
#[derive(Clone, Debug, PartialEq)]
pub enum RdTaskResult<T> {
    Success(T),
    Canceled,
    Fault(RdFault),
}

impl<T> RdTaskResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RdTaskResult::Success(_))
    }

    pub fn into_rpc_result(self) -> RpcResult<T> {
        match self {
            RdTaskResult::Success(value) => Ok(value),
            RdTaskResult::Canceled => Err(RpcError::Canceled),
            RdTaskResult::Fault(fault) => Err(RpcError::Fault(fault)),
        }
    }
}

/// `status:i32 (0 success, 1 canceled, 2 fault) | [value | type, message, trace]`
impl<T: RdSerialize> RdSerialize for RdTaskResult<T> {
    fn write(&self, ser: &Serializers, out: &mut WriteCursor) -> SerResult<()> {
        match self {
            RdTaskResult::Success(value) => {
                out.write_i32(STATUS_SUCCESS);
                value.write(ser, out)
            }
            RdTaskResult::Canceled => {
                out.write_i32(STATUS_CANCELED);
                Ok(())
            }
            RdTaskResult::Fault(fault) => {
                out.write_i32(STATUS_FAULT);
                out.write_string(&fault.type_name);
                out.write_string(&fault.message);
                out.write_string(&fault.trace);
                Ok(())
            }
        }
    }

    fn read(ser: &Serializers, input: &mut ReadCursor<'_>) -> SerResult<Self> {
        match input.read_i32()? {
            STATUS_SUCCESS => Ok(RdTaskResult::Success(T::read(ser, input)?)),
            STATUS_CANCELED => Ok(RdTaskResult::Canceled),
            STATUS_FAULT => {
                let type_name = input.read_string()?;
                let message = input.read_string()?;
                let trace = input.read_string()?;
                Ok(RdTaskResult::Fault(RdFault {
                    type_name,
                    message,
                    trace,
                }))
            }
            other => Err(SerError::InvalidData {
                reason: format!("unknown task status {}", other),
            }),
        }
    }
}

type ResultListener<T> = Box<dyn FnOnce(&RdTaskResult<T>) + Send>;

struct TaskState<T> {
    result: Option<RdTaskResult<T>>,
    listeners: Vec<ResultListener<T>>,
}

/// Write-once result cell shared by the call site, the endpoint and user code.
pub struct RdTask<T> {
    state: Mutex<TaskState<T>>,
    completed: Condvar,
}

impl<T: Clone + Send + 'static> RdTask<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TaskState {
                result: None,
                listeners: Vec::new(),
            }),
            completed: Condvar::new(),
        })
    }

    fn completed_with(result: RdTaskResult<T>) -> Arc<Self> {
        let task = Self::new();
        task.set(result);
        task
    }

    pub fn success(value: T) -> Arc<Self> {
        Self::completed_with(RdTaskResult::Success(value))
    }

    pub fn faulted(fault: RdFault) -> Arc<Self> {
        Self::completed_with(RdTaskResult::Fault(fault))
    }

    pub fn canceled() -> Arc<Self> {
        Self::completed_with(RdTaskResult::Canceled)
    }

    /// Complete the task. Returns `false` (and drops `result`) when it was
    /// already completed.
    pub fn set(&self, result: RdTaskResult<T>) -> bool {
        let listeners = {
            let mut state = self.state.lock();
            if state.result.is_some() {
                log::trace!(
                    target: "rdsync::mq",
                    "task already completed, {} dropped",
                    describe(&result)
                );
                return false;
            }
            state.result = Some(result.clone());
            std::mem::take(&mut state.listeners)
        };
        self.completed.notify_all();
        for listener in listeners {
            listener(&result);
        }
        true
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().result.is_some()
    }

    pub fn result(&self) -> Option<RdTaskResult<T>> {
        self.state.lock().result.clone()
    }

    /// Block until completed or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<RdTaskResult<T>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while state.result.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.completed.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.completed.wait(&mut state),
            }
        }
        state.result.clone()
    }

    /// Run `listener` with the result; immediately if already completed.
    pub fn on_result(&self, listener: impl FnOnce(&RdTaskResult<T>) + Send + 'static) {
        let done = {
            let mut state = self.state.lock();
            match &state.result {
                Some(result) => Some(result.clone()),
                None => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        if let Some(result) = done {
            listener(&result);
        }
    }
}

fn describe<T>(result: &RdTaskResult<T>) -> &'static str {
    match result {
        RdTaskResult::Success(_) => "success",
        RdTaskResult::Canceled => "cancellation",
        RdTaskResult::Fault(_) => "fault",
    }
}

impl<T> fmt::Debug for RdTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state.lock().result {
            None => "pending",
            Some(result) => describe(result),
        };
        write!(f, "RdTask({})", state)
    }
}
