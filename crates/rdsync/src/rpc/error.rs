// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for remote calls.

use super::RdFault;
use crate::wire::WireError;
use std::fmt;

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors that can occur during RPC operations
#[derive(Debug)]
pub enum RpcError {
    /// `sync` waited past the error threshold; the call was canceled
    Timeout,

    /// The call was canceled by either side
    Canceled,

    /// The remote handler failed
    Fault(RdFault),

    /// The call entity is not bound (location given)
    NotBound(String),

    /// The request could not be sent
    Wire(WireError),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "RPC call timed out"),
            Self::Canceled => write!(f, "RPC call canceled"),
            Self::Fault(fault) => write!(f, "remote fault: {}", fault),
            Self::NotBound(location) => write!(f, "call `{}` is not bound", location),
            Self::Wire(e) => write!(f, "RPC send failed: {}", e),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fault(fault) => Some(fault),
            Self::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for RpcError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<RdFault> for RpcError {
    fn from(fault: RdFault) -> Self {
        Self::Fault(fault)
    }
}
