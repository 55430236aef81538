// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Statically dispatched value marshalling.

use super::{ReadCursor, SerResult, Serializers, WriteCursor};
use crate::core::RdId;

/// A value that can be written to and read from a frame payload.
///
/// `ser` gives access to the polymorphic registry for values that embed
/// polymorphic fields.
pub trait RdSerialize: Sized {
    fn write(&self, ser: &Serializers, out: &mut WriteCursor) -> SerResult<()>;
    fn read(ser: &Serializers, input: &mut ReadCursor<'_>) -> SerResult<Self>;
}

macro_rules! impl_rd_serialize_primitive {
    ($type:ty, $write:ident, $read:ident) => {
        impl RdSerialize for $type {
            fn write(&self, _ser: &Serializers, out: &mut WriteCursor) -> SerResult<()> {
                out.$write(*self);
                Ok(())
            }

            fn read(_ser: &Serializers, input: &mut ReadCursor<'_>) -> SerResult<Self> {
                input.$read()
            }
        }
    };
}

impl_rd_serialize_primitive!(u8, write_u8, read_u8);
impl_rd_serialize_primitive!(i16, write_i16, read_i16);
impl_rd_serialize_primitive!(u16, write_u16, read_u16);
impl_rd_serialize_primitive!(i32, write_i32, read_i32);
impl_rd_serialize_primitive!(u32, write_u32, read_u32);
impl_rd_serialize_primitive!(i64, write_i64, read_i64);
impl_rd_serialize_primitive!(u64, write_u64, read_u64);
impl_rd_serialize_primitive!(bool, write_bool, read_bool);
impl_rd_serialize_primitive!(f64, write_f64, read_f64);
impl_rd_serialize_primitive!(RdId, write_rd_id, read_rd_id);

impl RdSerialize for () {
    fn write(&self, _ser: &Serializers, _out: &mut WriteCursor) -> SerResult<()> {
        Ok(())
    }

    fn read(_ser: &Serializers, _input: &mut ReadCursor<'_>) -> SerResult<Self> {
        Ok(())
    }
}

impl RdSerialize for String {
    fn write(&self, _ser: &Serializers, out: &mut WriteCursor) -> SerResult<()> {
        out.write_string(self);
        Ok(())
    }

    fn read(_ser: &Serializers, input: &mut ReadCursor<'_>) -> SerResult<Self> {
        input.read_string()
    }
}

impl<T: RdSerialize> RdSerialize for Vec<T> {
    fn write(&self, ser: &Serializers, out: &mut WriteCursor) -> SerResult<()> {
        out.write_i32(self.len() as i32);
        for item in self {
            item.write(ser, out)?;
        }
        Ok(())
    }

    fn read(ser: &Serializers, input: &mut ReadCursor<'_>) -> SerResult<Self> {
        // Capacity is capped by the bytes left.
        let len = input.read_length(0)?;
        let mut items = Vec::with_capacity(len.min(input.remaining()));
        for _ in 0..len {
            items.push(T::read(ser, input)?);
        }
        Ok(items)
    }
}

impl<T: RdSerialize> RdSerialize for Option<T> {
    fn write(&self, ser: &Serializers, out: &mut WriteCursor) -> SerResult<()> {
        match self {
            Some(value) => {
                out.write_bool(true);
                value.write(ser, out)
            }
            None => {
                out.write_bool(false);
                Ok(())
            }
        }
    }

    fn read(ser: &Serializers, input: &mut ReadCursor<'_>) -> SerResult<Self> {
        if input.read_bool()? {
            Ok(Some(T::read(ser, input)?))
        } else {
            Ok(None)
        }
    }
}

impl<A: RdSerialize, B: RdSerialize> RdSerialize for (A, B) {
    fn write(&self, ser: &Serializers, out: &mut WriteCursor) -> SerResult<()> {
        self.0.write(ser, out)?;
        self.1.write(ser, out)
    }

    fn read(ser: &Serializers, input: &mut ReadCursor<'_>) -> SerResult<Self> {
        Ok((A::read(ser, input)?, B::read(ser, input)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: RdSerialize + PartialEq + std::fmt::Debug>(value: T) {
        let ser = Serializers::new();
        let mut out = WriteCursor::new();
        value.write(&ser, &mut out).unwrap();
        let mut input = ReadCursor::new(out.as_slice());
        assert_eq!(T::read(&ser, &mut input).unwrap(), value);
        assert!(input.is_eof());
    }

    #[test]
    fn test_composite_values() {
        roundtrip(vec![Some("a".to_string()), None, Some(String::new())]);
        roundtrip((RdId::new(-9), vec![1.5f64, -0.0]));
    }

    #[test]
    fn test_vec_length_guard() {
        let ser = Serializers::new();
        let mut out = WriteCursor::new();
        out.write_i32(-1);
        assert!(Vec::<i32>::read(&ser, &mut ReadCursor::new(out.as_slice())).is_err());
    }
}
