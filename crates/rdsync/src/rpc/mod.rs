// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote calls over bound entities.
//!
//! # Frames
//!
//! | Direction | Addressed to | Payload |
//! |-----------|--------------|---------|
//! | request | call entity id | `task_id:i64 \| request` |
//! | response | `task_id` | `status:i32 \| value` or `status \| type, message, trace` |
//! | cancellation | `task_id` | empty |
//!
//! `task_id` is allocated by the call site from its dynamic id counter, so
//! both peers can start calls on the same entity without clashing.
//!
//! # Cancellation
//!
//! - Caller scope ends before the response: the task completes as canceled
//!   and one cancellation frame is sent. The endpoint terminates the request
//!   scope the handler was given.
//! - A bindable result lives in a scope on each side; ending either one
//!   sends a cancellation that ends the other.
//!
//! # Bindable results
//!
//! The endpoint identifies and pre-binds a bindable result before sending the
//! response and binds it right after, so frames the counterpart sends to it
//! are already routed.

mod call;
mod error;
mod task;
mod wired;

pub use call::RdCall;
pub use error::{RpcError, RpcResult};
pub use task::{RdFault, RdTask, RdTaskResult};

use crate::bind::MaybeBindable;
use crate::ser::RdSerialize;

/// Values accepted as call requests.
pub trait RpcRequest: RdSerialize + Send + Sync + 'static {}

impl<T: RdSerialize + Send + Sync + 'static> RpcRequest for T {}

/// Values accepted as call results.
pub trait RpcResponse: RdSerialize + MaybeBindable + Clone + Send + Sync + 'static {}

impl<T: RdSerialize + MaybeBindable + Clone + Send + Sync + 'static> RpcResponse for T {}

#[cfg(test)]
mod tests;
