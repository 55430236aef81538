// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # rdsync - entity synchronization and RPC substrate
//!
//! Two peers (a client and a server) each build the same graph of entities.
//! Matching entities get matching ids on both sides, so a frame sent by one
//! peer's entity lands on its counterpart without any handshake.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rdsync::{
//!     LifetimeDef, Protocol, ProtocolConfig, RdCall, RpcTimeouts, Serializers,
//!     SocketConfig, SocketWire, SynchronousScheduler,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let def = LifetimeDef::new();
//!     let wire = SocketWire::client(
//!         "demo",
//!         "127.0.0.1:7400".parse()?,
//!         SocketConfig::default(),
//!         rdsync::MessageBroker::new(),
//!         def.lifetime(),
//!     )?;
//!     let protocol = Protocol::new(
//!         ProtocolConfig::client("demo"),
//!         Arc::new(Serializers::new()),
//!         Arc::new(SynchronousScheduler),
//!         wire,
//!         def.lifetime(),
//!     );
//!
//!     let echo = RdCall::<String, String>::new();
//!     protocol.bind_top_level(echo.as_ref(), "echo");
//!     let answer = echo.sync("hello".to_string(), RpcTimeouts::DEFAULT)?;
//!     println!("{}", answer);
//!
//!     def.terminate();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                           Entities                                  |
//! |   RdModel | RdSignal | RdCall | RdExt          (bind lifecycle)     |
//! +---------------------------------------------------------------------+
//! |                           Protocol                                  |
//! |   Identities | Serializers | Scheduler | Contexts                   |
//! +---------------------------------------------------------------------+
//! |                             Wire                                    |
//! |   MessageBroker | DirectWire | SocketWire | ExtWire                 |
//! +---------------------------------------------------------------------+
//! |                             Core                                    |
//! |   RdId | Lifetime | Scheduler                                       |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`core`] - ids, cancellation scopes, schedulers, contexts
//! - [`ser`] - byte cursors, marshallers, polymorphic registry
//! - [`wire`] - frame codec, broker, transports
//! - [`bind`] - binding lifecycle and the basic entities
//! - [`rpc`] - calls, tasks, cancellation across peers
//! - [`protocol`] - the per-connection root
//! - [`config`] - constants and tunables

pub mod bind;
pub mod config;
pub mod core;
pub mod protocol;
pub mod rpc;
pub mod ser;
pub mod wire;

pub use bind::{
    BindOutcome, BindParent, BindState, Bindable, BindableBase, ExtState, MaybeBindable, RdExt,
    RdModel, RdSignal,
};
pub use config::{ProtocolConfig, RpcTimeouts, SkewPolicy, SocketConfig};
pub use crate::core::{
    IdKind, Identities, Lifetime, LifetimeDef, LifetimeStatus, RdId, Scheduler,
    SequentialScheduler, SynchronousScheduler, TestScheduler,
};
pub use protocol::Protocol;
pub use rpc::{RdCall, RdFault, RdTask, RdTaskResult, RpcError, RpcResult};
pub use ser::{
    PolyValue, Polymorphic, RdSerialize, RdTyped, ReadCursor, SerError, SerResult, Serializers,
    UnknownInstance, WriteCursor,
};
pub use wire::{
    DirectWire, ExtWire, MessageBroker, SocketRole, SocketWire, Wire, WireError, WireResult,
    WireSubscriber,
};
