// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Little-endian read/write cursors for frame payloads.
//!
//! The write side grows on demand and supports length placeholders that are
//! patched once the body has been written; the read side is bounds-checked
//! and can hand out length-limited sub-cursors.

use super::{SerError, SerResult};
use crate::core::RdId;

/// Generate write methods for primitive types.
macro_rules! impl_write_le {
    ($name:ident, $type:ty) => {
        pub fn $name(&mut self, value: $type) {
            self.buffer.extend_from_slice(&value.to_le_bytes());
        }
    };
}

/// Generate read methods for primitive types.
///
/// Each generated method checks bounds (returns `SerError::ReadFailed` on
/// overflow), decodes little-endian bytes and advances the offset.
macro_rules! impl_read_le {
    ($name:ident, $type:ty, $size:expr) => {
        pub fn $name(&mut self) -> SerResult<$type> {
            let mut bytes = [0u8; $size];
            bytes.copy_from_slice(self.read_bytes($size)?);
            Ok(<$type>::from_le_bytes(bytes))
        }
    };
}

/// Growable output buffer.
#[derive(Debug, Default, Clone)]
pub struct WriteCursor {
    buffer: Vec<u8>,
}

impl WriteCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    impl_write_le!(write_u8, u8);
    impl_write_le!(write_i16, i16);
    impl_write_le!(write_u16, u16);
    impl_write_le!(write_i32, i32);
    impl_write_le!(write_u32, u32);
    impl_write_le!(write_i64, i64);
    impl_write_le!(write_u64, u64);

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// `len:i32` (UTF-16 units) followed by UTF-16LE units.
    pub fn write_string(&mut self, value: &str) {
        let at = self.buffer.len();
        self.write_i32(0);
        let mut units = 0i32;
        for unit in value.encode_utf16() {
            self.write_u16(unit);
            units += 1;
        }
        self.buffer[at..at + 4].copy_from_slice(&units.to_le_bytes());
    }

    pub fn write_rd_id(&mut self, id: RdId) {
        self.write_i64(id.raw());
    }

    /// Reserve an `i32` length slot; returns its position for [`patch_length`](Self::patch_length).
    pub fn write_length_placeholder(&mut self) -> usize {
        let at = self.buffer.len();
        self.write_i32(0);
        at
    }

    /// Fill the slot at `at` with the number of bytes written after it.
    pub fn patch_length(&mut self, at: usize) {
        let len = (self.buffer.len() - at - 4) as i32;
        self.buffer[at..at + 4].copy_from_slice(&len.to_le_bytes());
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Drop everything written after `len`.
    pub fn truncate(&mut self, len: usize) {
        self.buffer.truncate(len);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

/// Bounds-checked input cursor (zero-copy).
#[derive(Debug, Clone)]
pub struct ReadCursor<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> ReadCursor<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    impl_read_le!(read_u8, u8, 1);
    impl_read_le!(read_i16, i16, 2);
    impl_read_le!(read_u16, u16, 2);
    impl_read_le!(read_i32, i32, 4);
    impl_read_le!(read_u32, u32, 4);
    impl_read_le!(read_i64, i64, 8);
    impl_read_le!(read_u64, u64, 8);

    pub fn read_bool(&mut self) -> SerResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SerError::InvalidData {
                reason: format!("invalid bool byte {:#04x}", other),
            }),
        }
    }

    pub fn read_f64(&mut self) -> SerResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_rd_id(&mut self) -> SerResult<RdId> {
        Ok(RdId::new(self.read_i64()?))
    }

    /// Read a non-negative `i32` length and check that many bytes remain
    /// (with `unit` bytes per element).
    pub fn read_length(&mut self, unit: usize) -> SerResult<usize> {
        let at = self.offset;
        let len = self.read_i32()?;
        if len < 0 {
            return Err(SerError::InvalidData {
                reason: format!("negative length {} at offset {}", len, at),
            });
        }
        let len = len as usize;
        self.check_available(len.saturating_mul(unit))?;
        Ok(len)
    }

    pub fn read_string(&mut self) -> SerResult<String> {
        let len = self.read_length(2)?;
        let mut units = Vec::with_capacity(len);
        for _ in 0..len {
            units.push(self.read_u16()?);
        }
        String::from_utf16(&units).map_err(|e| SerError::InvalidData {
            reason: format!("invalid UTF-16 string: {}", e),
        })
    }

    pub fn read_bytes(&mut self, len: usize) -> SerResult<&'a [u8]> {
        self.check_available(len)?;
        let slice = &self.buffer[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Length-limited view of the next `len` bytes; the parent skips past
    /// them whatever the child reads.
    pub fn sub_cursor(&mut self, len: usize) -> SerResult<ReadCursor<'a>> {
        Ok(ReadCursor::new(self.read_bytes(len)?))
    }

    pub fn check_available(&self, len: usize) -> SerResult<()> {
        if len > self.remaining() {
            return Err(SerError::ReadFailed {
                offset: self.offset,
                reason: format!(
                    "unexpected end of buffer: need {} byte(s), {} available",
                    len,
                    self.remaining()
                ),
            });
        }
        Ok(())
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.offset)
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buffer[self.offset.min(self.buffer.len())..]
    }

    pub fn is_eof(&self) -> bool {
        self.offset >= self.buffer.len()
    }
}
