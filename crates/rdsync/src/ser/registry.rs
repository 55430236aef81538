// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Polymorphic serializer registry.
//!
//! Polymorphic payloads are self-describing:
//!
//! ```text
//! +--------------+--------------+------------------+
//! | tag (i64 LE) | len (i32 LE) | body (len bytes) |
//! +--------------+--------------+------------------+
//! ```
//!
//! A tag of `0` is a null value and carries no length. The tag is the
//! platform-independent hash of the registered type name, so both peers agree
//! without negotiation. The length lets a reader skip bodies it cannot
//! interpret; an unknown tag either fails the read or, when the caller asks
//! for it, yields an [`UnknownInstance`] that re-serializes byte-exact under
//! its original tag.

use super::{RdSerialize, ReadCursor, SerError, SerResult, WriteCursor};
use crate::core::platform_independent_hash;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A type that can travel as a polymorphic value.
pub trait RdTyped: RdSerialize + Any + Send + Sync {
    /// Stable, peer-agreed type name.
    const TYPE_NAME: &'static str;

    fn type_tag() -> i64 {
        platform_independent_hash(Self::TYPE_NAME)
    }
}

type ReadFn = fn(&Serializers, &mut ReadCursor<'_>) -> SerResult<Box<dyn Any + Send + Sync>>;
type WriteFn = fn(&Serializers, &mut WriteCursor, &(dyn Any + Send + Sync)) -> SerResult<()>;

#[derive(Clone, Copy)]
struct Marshaller {
    type_id: TypeId,
    type_name: &'static str,
    read: ReadFn,
    write: WriteFn,
}

fn read_erased<T: RdTyped>(
    ser: &Serializers,
    input: &mut ReadCursor<'_>,
) -> SerResult<Box<dyn Any + Send + Sync>> {
    Ok(Box::new(T::read(ser, input)?))
}

fn write_erased<T: RdTyped>(
    ser: &Serializers,
    out: &mut WriteCursor,
    value: &(dyn Any + Send + Sync),
) -> SerResult<()> {
    match value.downcast_ref::<T>() {
        Some(value) => value.write(ser, out),
        None => Err(SerError::InvalidData {
            reason: format!("value is not a `{}`", T::TYPE_NAME),
        }),
    }
}

/// Body of a polymorphic value whose tag this side does not know.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownInstance {
    pub tag: i64,
    pub bytes: Vec<u8>,
}

/// A decoded polymorphic value.
pub enum PolyValue {
    Known {
        tag: i64,
        value: Box<dyn Any + Send + Sync>,
    },
    Unknown(UnknownInstance),
}

impl PolyValue {
    pub fn tag(&self) -> i64 {
        match self {
            PolyValue::Known { tag, .. } => *tag,
            PolyValue::Unknown(unknown) => unknown.tag,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, PolyValue::Unknown(_))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            PolyValue::Known { value, .. } => value.downcast_ref::<T>(),
            PolyValue::Unknown(_) => None,
        }
    }

    /// Take the concrete value, or get `self` back on a type mismatch.
    pub fn downcast<T: Any>(self) -> Result<T, PolyValue> {
        match self {
            PolyValue::Known { tag, value } => match value.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(value) => Err(PolyValue::Known { tag, value }),
            },
            unknown => Err(unknown),
        }
    }
}

impl fmt::Debug for PolyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolyValue::Known { tag, .. } => write!(f, "PolyValue::Known(tag={})", tag),
            PolyValue::Unknown(u) => write!(
                f,
                "PolyValue::Unknown(tag={}, {} byte(s))",
                u.tag,
                u.bytes.len()
            ),
        }
    }
}

/// Polymorphic payload, usable as a signal value or call type.
///
/// Reads keep values of unknown type as [`PolyValue::Unknown`], so a peer can
/// relay types it was never told about.
#[derive(Clone, Debug, Default)]
pub struct Polymorphic(Option<Arc<PolyValue>>);

impl Polymorphic {
    pub fn new<T: RdTyped>(value: T) -> Self {
        Polymorphic(Some(Arc::new(PolyValue::Known {
            tag: T::type_tag(),
            value: Box::new(value),
        })))
    }

    pub fn null() -> Self {
        Polymorphic(None)
    }

    pub fn value(&self) -> Option<&PolyValue> {
        self.0.as_deref()
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub fn is_unknown(&self) -> bool {
        self.value().is_some_and(PolyValue::is_unknown)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value()?.downcast_ref::<T>()
    }
}

impl RdSerialize for Polymorphic {
    fn write(&self, ser: &Serializers, out: &mut WriteCursor) -> SerResult<()> {
        ser.write_poly_value(out, self.value())
    }

    fn read(ser: &Serializers, input: &mut ReadCursor<'_>) -> SerResult<Self> {
        Ok(Polymorphic(ser.read_polymorphic_or_unknown(input)?.map(Arc::new)))
    }
}

/// Tag -> marshaller registry, shared by every entity of a protocol.
#[derive(Default)]
pub struct Serializers {
    by_tag: DashMap<i64, Marshaller>,
    by_type: DashMap<TypeId, i64>,
}

impl Serializers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under the hash of its type name.
    ///
    /// Registering the same type again is a no-op.
    ///
    /// # Panics
    ///
    /// When a different type already owns the tag.
    pub fn register<T: RdTyped>(&self) {
        let tag = T::type_tag();
        let marshaller = Marshaller {
            type_id: TypeId::of::<T>(),
            type_name: T::TYPE_NAME,
            read: read_erased::<T>,
            write: write_erased::<T>,
        };
        match self.by_tag.entry(tag) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if existing.type_id != marshaller.type_id {
                    panic!(
                        "serializer tag collision: `{}` and `{}` both map to tag {}",
                        existing.type_name, marshaller.type_name, tag
                    );
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(marshaller);
                self.by_type.insert(marshaller.type_id, tag);
                log::trace!(target: "rdsync::init", "registered `{}` as tag {}", T::TYPE_NAME, tag);
            }
        }
    }

    pub fn is_registered(&self, tag: i64) -> bool {
        self.by_tag.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Write `value` as a polymorphic payload (`None` writes the null tag).
    pub fn write_polymorphic<T: RdTyped>(
        &self,
        out: &mut WriteCursor,
        value: Option<&T>,
    ) -> SerResult<()> {
        let Some(value) = value else {
            out.write_i64(0);
            return Ok(());
        };
        let tag = self
            .by_type
            .get(&TypeId::of::<T>())
            .map(|t| *t)
            .ok_or(SerError::UnregisteredType {
                type_name: T::TYPE_NAME,
            })?;
        out.write_i64(tag);
        let at = out.write_length_placeholder();
        value.write(self, out)?;
        out.patch_length(at);
        Ok(())
    }

    /// Write an already decoded polymorphic value; unknown instances keep
    /// their original tag and bytes.
    pub fn write_poly_value(&self, out: &mut WriteCursor, value: Option<&PolyValue>) -> SerResult<()> {
        match value {
            None => {
                out.write_i64(0);
                Ok(())
            }
            Some(PolyValue::Unknown(unknown)) => {
                out.write_i64(unknown.tag);
                out.write_i32(unknown.bytes.len() as i32);
                out.write_bytes(&unknown.bytes);
                Ok(())
            }
            Some(PolyValue::Known { tag, value }) => {
                let marshaller = self
                    .by_tag
                    .get(tag)
                    .map(|m| *m)
                    .ok_or(SerError::UnknownTag { tag: *tag })?;
                out.write_i64(*tag);
                let at = out.write_length_placeholder();
                (marshaller.write)(self, out, value.as_ref())?;
                out.patch_length(at);
                Ok(())
            }
        }
    }

    /// Read a polymorphic payload; an unknown tag is an error.
    pub fn read_polymorphic(&self, input: &mut ReadCursor<'_>) -> SerResult<Option<PolyValue>> {
        self.read_polymorphic_impl(input, false)
    }

    /// Read a polymorphic payload; an unknown tag yields [`PolyValue::Unknown`].
    pub fn read_polymorphic_or_unknown(
        &self,
        input: &mut ReadCursor<'_>,
    ) -> SerResult<Option<PolyValue>> {
        self.read_polymorphic_impl(input, true)
    }

    /// Read a polymorphic payload that must be a non-null `T`.
    pub fn read_polymorphic_as<T: RdTyped>(&self, input: &mut ReadCursor<'_>) -> SerResult<T> {
        match self.read_polymorphic(input)? {
            None => Err(SerError::UnexpectedNull),
            Some(value) => value.downcast::<T>().map_err(|other| SerError::InvalidData {
                reason: format!(
                    "expected `{}`, got tag {}",
                    T::TYPE_NAME,
                    other.tag()
                ),
            }),
        }
    }

    fn read_polymorphic_impl(
        &self,
        input: &mut ReadCursor<'_>,
        allow_unknown: bool,
    ) -> SerResult<Option<PolyValue>> {
        let tag = input.read_i64()?;
        if tag == 0 {
            return Ok(None);
        }
        let len = input.read_length(1)?;
        // The body is consumed from `input` up front: whatever the reader
        // does, the cursor ends right after this value.
        let mut body = input.sub_cursor(len)?;

        let marshaller = self.by_tag.get(&tag).map(|m| *m);
        match marshaller {
            Some(marshaller) => {
                let value = (marshaller.read)(self, &mut body)?;
                if !body.is_eof() {
                    log::trace!(
                        "polymorphic `{}` left {} unread byte(s), skipped",
                        marshaller.type_name,
                        body.remaining()
                    );
                }
                Ok(Some(PolyValue::Known { tag, value }))
            }
            None if allow_unknown => Ok(Some(PolyValue::Unknown(UnknownInstance {
                tag,
                bytes: body.rest().to_vec(),
            }))),
            None => Err(SerError::UnknownTag { tag }),
        }
    }
}

impl fmt::Debug for Serializers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializers")
            .field("registered", &self.by_tag.len())
            .finish()
    }
}
