// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload serialization: cursors, value marshalling, polymorphic registry.

pub mod buffer;
pub mod marshal;
pub mod registry;

pub use buffer::{ReadCursor, WriteCursor};
pub use marshal::RdSerialize;
pub use registry::{PolyValue, Polymorphic, RdTyped, Serializers, UnknownInstance};

use std::fmt;

/// Serialization error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerError {
    ReadFailed { offset: usize, reason: String },
    InvalidData { reason: String },
    /// Polymorphic tag with no registered reader and no unknown-instance fallback
    UnknownTag { tag: i64 },
    /// Polymorphic write of a type that was never registered
    UnregisteredType { type_name: &'static str },
    /// Null polymorphic value where a value is required
    UnexpectedNull,
}

impl fmt::Display for SerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerError::ReadFailed { offset, reason } => {
                write!(f, "read failed at offset {}: {}", offset, reason)
            }
            SerError::InvalidData { reason } => write!(f, "invalid data: {}", reason),
            SerError::UnknownTag { tag } => write!(f, "can't find reader by id: {}", tag),
            SerError::UnregisteredType { type_name } => {
                write!(f, "type `{}` is not registered", type_name)
            }
            SerError::UnexpectedNull => write!(f, "unexpected null polymorphic value"),
        }
    }
}

impl std::error::Error for SerError {}

pub type SerResult<T> = Result<T, SerError>;
