// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire transports.
//!
//! A wire carries frames addressed by [`RdId`] between two peers:
//!
//! ```text
//! +---------------------+------------------------+-----------------+
//! | identifier (i64 LE) | payload length (i32 LE)| payload         |
//! +---------------------+------------------------+-----------------+
//! ```
//!
//! Outbound payloads are serialized into a per-thread scratch buffer and only
//! the finished bytes cross a lock. Inbound frames go through the wire's
//! [`MessageBroker`], which routes them to the entity advised under the id.
//!
//! | Wire | Use |
//! |------|-----|
//! | [`DirectWire`] | in-process pair, tests |
//! | [`SocketWire`] | TCP, one peer per wire |
//! | [`ExtWire`] | buffering proxy for extension sub-protocols |

pub mod broker;
pub mod direct;
pub mod ext_wire;
pub mod frame;
pub mod socket;

pub use broker::{DispatchHelper, MessageBroker};
pub use direct::DirectWire;
pub use ext_wire::ExtWire;
pub use frame::{FrameCodec, InboundFrame};
pub use socket::{SocketRole, SocketWire};

use crate::config::SCRATCH_BUFFER_CAPACITY;
use crate::core::{Lifetime, RdId};
use crate::ser::{SerError, WriteCursor};
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Payload writer passed to [`Wire::send`].
pub type PayloadWriter<'a> = &'a mut dyn FnMut(&mut WriteCursor) -> Result<(), SerError>;

/// Entity that receives frames addressed to its id.
pub trait WireSubscriber: Send + Sync {
    /// Id the subscriber is advised under.
    fn wire_id(&self) -> RdId;

    /// Handle one inbound payload. Called on the transport's thread; hop to a
    /// scheduler through `helper`.
    fn on_wire_received(&self, payload: Vec<u8>, helper: &DispatchHelper);
}

/// Transport seam between entities and the byte stream.
pub trait Wire: Send + Sync {
    /// Serialize a payload with `writer` and send it under `id`.
    fn send(&self, id: RdId, writer: PayloadWriter<'_>) -> WireResult<()>;

    /// Dispatch table frames are routed through.
    fn broker(&self) -> &Arc<MessageBroker>;

    fn is_connected(&self) -> bool;

    /// Register `subscriber` for the duration of `lifetime`.
    fn advise(&self, lifetime: Lifetime, subscriber: Arc<dyn WireSubscriber>) {
        self.broker().advise(lifetime, subscriber);
    }
}

/// Wire-level error.
#[derive(Debug)]
pub enum WireError {
    /// Wire lifetime is over
    Terminated,
    /// Payload could not be serialized
    Serialization(SerError),
    /// Frame above the configured maximum
    FrameTooLarge { size: usize, max: usize },
    Io(io::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Terminated => write!(f, "wire is terminated"),
            WireError::Serialization(e) => write!(f, "payload serialization failed: {}", e),
            WireError::FrameTooLarge { size, max } => {
                write!(f, "frame too large: {} bytes (max {})", size, max)
            }
            WireError::Io(e) => write!(f, "wire I/O error: {}", e),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Serialization(e) => Some(e),
            WireError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SerError> for WireError {
    fn from(e: SerError) -> Self {
        WireError::Serialization(e)
    }
}

impl From<io::Error> for WireError {
    fn from(e: io::Error) -> Self {
        WireError::Io(e)
    }
}

pub type WireResult<T> = Result<T, WireError>;

thread_local! {
    static SCRATCH: RefCell<WriteCursor> =
        RefCell::new(WriteCursor::with_capacity(SCRATCH_BUFFER_CAPACITY));
}

/// Run `fill` against the thread's scratch buffer (cleared first) and return
/// a copy of what it wrote. Reentrant calls fall back to a fresh buffer.
pub(crate) fn with_scratch(
    fill: impl FnOnce(&mut WriteCursor) -> Result<(), SerError>,
) -> WireResult<Vec<u8>> {
    SCRATCH.with(|cell| match cell.try_borrow_mut() {
        Ok(mut buffer) => {
            buffer.clear();
            fill(&mut buffer)?;
            Ok(buffer.as_slice().to_vec())
        }
        Err(_) => {
            let mut buffer = WriteCursor::new();
            fill(&mut buffer)?;
            Ok(buffer.into_vec())
        }
    })
}

/// Serialize a bare payload through the scratch buffer.
pub(crate) fn serialize_payload(writer: PayloadWriter<'_>) -> WireResult<Vec<u8>> {
    with_scratch(|out| writer(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_reentrancy_falls_back() {
        let outer = with_scratch(|out| {
            out.write_u8(1);
            let inner = with_scratch(|inner| {
                inner.write_u8(2);
                Ok(())
            })
            .unwrap();
            assert_eq!(inner, vec![2]);
            out.write_u8(3);
            Ok(())
        })
        .unwrap();
        assert_eq!(outer, vec![1, 3]);
    }

    #[test]
    fn test_scratch_is_cleared_between_uses() {
        with_scratch(|out| {
            out.write_bytes(&[9; 16]);
            Ok(())
        })
        .unwrap();
        let second = with_scratch(|out| {
            out.write_u8(7);
            Ok(())
        })
        .unwrap();
        assert_eq!(second, vec![7]);
    }

    #[test]
    fn test_serialization_error_propagates() {
        let err = serialize_payload(&mut |_out: &mut WriteCursor| Err(SerError::UnexpectedNull))
            .unwrap_err();
        assert!(matches!(err, WireError::Serialization(SerError::UnexpectedNull)));
    }
}
