// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity identifiers and the platform-independent hash they are derived with.
//!
//! Both peers compute identifiers locally and never negotiate them, so the
//! hash must be bit-exact everywhere:
//!
//! ```text
//! string:  h = parent; for each UTF-16 unit c: h = h * 31 + c
//! integer: h = parent * 31 + (n + 1)
//! ```
//!
//! All arithmetic is wrapping 64-bit.

use crate::config::{HASH_FACTOR, HASH_SEED, MAX_STATIC_ID};
use std::fmt;

/// Platform-independent hash of a string, seeded with `initial`.
#[inline]
pub fn hash_str(initial: i64, value: &str) -> i64 {
    value.encode_utf16().fold(initial, |acc, unit| {
        acc.wrapping_mul(HASH_FACTOR).wrapping_add(i64::from(unit))
    })
}

/// Platform-independent hash of an integer, seeded with `initial`.
#[inline]
pub fn hash_i64(initial: i64, value: i64) -> i64 {
    initial
        .wrapping_mul(HASH_FACTOR)
        .wrapping_add(value.wrapping_add(1))
}

/// Unparented hash of a name (type tags, serialization hashes).
#[inline]
pub fn platform_independent_hash(value: &str) -> i64 {
    hash_str(HASH_SEED, value)
}

/// Opaque 64-bit entity identifier. `0` is the null id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RdId(i64);

impl RdId {
    pub const NULL: RdId = RdId(0);

    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True for schema-assigned identifiers.
    #[inline]
    pub fn is_static(self) -> bool {
        (0..MAX_STATIC_ID).contains(&self.0) && !self.is_null()
    }

    /// Child identifier for a string discriminant (usually `"." + name`).
    #[inline]
    pub fn mix_str(self, tail: &str) -> RdId {
        RdId(hash_str(self.0, tail))
    }

    /// Child identifier for an integer discriminant (indexes, counters).
    #[inline]
    pub fn mix_i64(self, tail: i64) -> RdId {
        RdId(hash_i64(self.0, tail))
    }

    #[inline]
    pub fn mix_i32(self, tail: i32) -> RdId {
        self.mix_i64(i64::from(tail))
    }
}

impl fmt::Debug for RdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RdId({})", self.0)
    }
}

impl fmt::Display for RdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RdId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}
