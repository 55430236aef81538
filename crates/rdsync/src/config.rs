// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rdsync configuration - single source of truth for protocol constants.
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time constants (identity scheme, framing, timeouts)
//! - **Level 2 (Runtime)**: [`ProtocolConfig`], [`SocketConfig`], [`RpcTimeouts`]
//!
//! Identity constants are part of the wire contract: both peers must agree on
//! them or derived identifiers diverge. **NEVER hardcode them elsewhere!**
//!
//! # Example
//!
//! ```
//! use rdsync::config::{ProtocolConfig, RpcTimeouts, SkewPolicy};
//!
//! let config = ProtocolConfig {
//!     schema_skew: SkewPolicy::Warn,
//!     ..ProtocolConfig::client("ide")
//! };
//! assert!(config.id_kind.is_client());
//! assert!(RpcTimeouts::LONG_RUNNING.error_await_time > RpcTimeouts::DEFAULT.error_await_time);
//! ```

use crate::core::IdKind;
use std::time::Duration;

// =======================================================================
// Identity scheme
// =======================================================================

/// Identifiers below this value are static (assigned by the schema).
///
/// Dynamic counters start here: client at `MAX_STATIC_ID`, server at
/// `MAX_STATIC_ID + 1`, both advancing by [`DYNAMIC_ID_STEP`].
pub const MAX_STATIC_ID: i64 = 1_000_000;

/// Stride of the per-role dynamic counter (keeps client/server parity disjoint).
pub const DYNAMIC_ID_STEP: i64 = 2;

/// Seed of the platform-independent hash when there is no parent id.
pub const HASH_SEED: i64 = 19;

/// Multiplier of the platform-independent polynomial hash.
pub const HASH_FACTOR: i64 = 31;

// =======================================================================
// Framing
// =======================================================================

/// Frame header: `identifier:i64 | payload_length:i32`.
pub const FRAME_HEADER_SIZE: usize = 8 + 4;

/// Polymorphic header: `type_tag:i64 | length:i32`.
pub const POLYMORPHIC_HEADER_SIZE: usize = 8 + 4;

/// Default maximum payload size accepted from a stream (anti-OOM).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Initial capacity of the per-thread serialization scratch buffer.
pub const SCRATCH_BUFFER_CAPACITY: usize = 4096;

// =======================================================================
// Lifetimes and RPC
// =======================================================================

/// How long `terminate` waits for in-flight executions on other threads.
pub const TERMINATION_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Granularity of scheduler pumping while a `sync` call waits.
pub const SYNC_PUMP_INTERVAL: Duration = Duration::from_millis(1);

/// Poll interval of the non-blocking socket accept loop.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

// =======================================================================
// Runtime configuration
// =======================================================================

/// What to do when an extension's counterpart reports a different
/// serialization hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SkewPolicy {
    /// Flag the extension out-of-sync and log a warning.
    #[default]
    Warn,
    /// Flag the extension out-of-sync and panic on the receiving thread.
    Assert,
}

/// Per-protocol settings.
#[derive(Clone, Debug)]
pub struct ProtocolConfig {
    /// Protocol name (root of every entity location)
    pub name: String,

    /// Which half of the dynamic id space this endpoint allocates from
    pub id_kind: IdKind,

    /// Reaction to extension schema skew
    pub schema_skew: SkewPolicy,

    /// Hold inbound frames until `start_delivering_messages` is called
    pub queue_messages_until_started: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            name: "protocol".to_string(),
            id_kind: IdKind::Client,
            schema_skew: SkewPolicy::Warn,
            queue_messages_until_started: false,
        }
    }
}

impl ProtocolConfig {
    /// Client-side protocol (even dynamic ids).
    pub fn client(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_kind: IdKind::Client,
            ..Default::default()
        }
    }

    /// Server-side protocol (odd dynamic ids).
    pub fn server(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_kind: IdKind::Server,
            ..Default::default()
        }
    }
}

/// Socket wire configuration.
#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Maximum payload size in bytes (frames above are rejected)
    pub max_frame_size: usize,

    /// Enable TCP_NODELAY
    pub nodelay: bool,

    /// Connection timeout for outbound connections
    pub connect_timeout: Duration,

    /// Delay before retry after connection failure or loss
    pub reconnect_delay: Duration,

    /// Maximum number of consecutive failed connection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            nodelay: true,
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_attempts: 0,
        }
    }
}

/// Warn/error thresholds for blocking `sync` calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcTimeouts {
    /// Past this, a warning is logged once
    pub warn_await_time: Duration,
    /// Past this, the call is canceled and `sync` returns a timeout
    pub error_await_time: Duration,
}

impl RpcTimeouts {
    pub const DEFAULT: RpcTimeouts = RpcTimeouts {
        warn_await_time: Duration::from_millis(200),
        error_await_time: Duration::from_millis(3000),
    };

    pub const LONG_RUNNING: RpcTimeouts = RpcTimeouts {
        warn_await_time: Duration::from_millis(10_000),
        error_await_time: Duration::from_millis(15_000),
    };

    pub const INFINITE: RpcTimeouts = RpcTimeouts {
        warn_await_time: Duration::MAX,
        error_await_time: Duration::MAX,
    };

    pub fn new(warn_await_time: Duration, error_await_time: Duration) -> Self {
        Self {
            warn_await_time,
            error_await_time,
        }
    }
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self::DEFAULT
    }
}
