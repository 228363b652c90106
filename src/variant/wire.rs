//! Pack/unpack of [`Variant`] to the pinned wire format described in the
//! transport's protocol notes: a 1-byte tag per node, `u32` length prefixes
//! (never the host's `size_t`), and little-endian fixed-width fields.
//!
//! The on-wire integer width is deliberately pinned to `u32` everywhere —
//! array/map counts, string lengths, object ids — rather than inherited from
//! the host platform, so two peers built for different word sizes still
//! agree on the format.

use std::sync::Arc;

use crate::{
    error::VariantError,
    object::LocalObjectHandle,
    variant::{Variant, VariantMap},
};

/// Tag byte for [`Variant::Null`].
pub const TAG_NULL: u8 = 0;
/// Tag byte for [`Variant::Int`].
pub const TAG_INT: u8 = 1;
/// Tag byte for [`Variant::Real`].
pub const TAG_REAL: u8 = 2;
/// Tag byte for [`Variant::String`].
pub const TAG_STRING: u8 = 3;
/// Tag byte for [`Variant::Array`].
pub const TAG_ARRAY: u8 = 4;
/// Tag byte for [`Variant::Map`].
pub const TAG_MAP: u8 = 5;
/// Tag byte for [`Variant::Exception`].
pub const TAG_EXCEPTION: u8 = 6;
/// Tag byte for [`Variant::Object`] (illegal on the wire).
pub const TAG_OBJECT: u8 = 7;
/// Tag byte for [`Variant::ObjectId`].
pub const TAG_OBJECT_ID: u8 = 8;
/// Tag byte for [`Variant::Future`] (illegal on the wire).
pub const TAG_FUTURE: u8 = 9;
/// Tag byte for [`Variant::Packed`] (illegal on the wire).
pub const TAG_PACKED: u8 = 10;

/// Maximum length accepted for any single length-prefixed field during
/// unpack, guarding against a hostile or corrupt peer claiming an absurd
/// size before any bytes back it up.
pub const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024;

/// Maximum length of a map key on the wire.
pub const MAX_KEY_LEN: usize = 255;

/// Hook invoked when packing encounters an [`Variant::Object`].
///
/// Implementations must register the object in the caller's object table
/// (scoped to the peer being written to) and return the id to encode in its
/// place. This is the only sanctioned way an `Object` becomes transportable.
pub trait ObjectReplacer {
    /// Register `obj` for the peer this replacer is scoped to and return the
    /// id to encode on the wire.
    fn replace(&mut self, obj: &LocalObjectHandle) -> u32;
}

impl<F: FnMut(&LocalObjectHandle) -> u32> ObjectReplacer for F {
    fn replace(&mut self, obj: &LocalObjectHandle) -> u32 { self(obj) }
}

/// Hook invoked when unpacking encounters an `ObjectId`.
///
/// Implementations resolve the id into a live remote-proxy handle bound to
/// the connection the bytes were received on.
pub trait IdReplacer {
    /// Resolve `id` into a live `Object` payload.
    fn replace(&mut self, id: u32) -> LocalObjectHandle;
}

impl<F: FnMut(u32) -> LocalObjectHandle> IdReplacer for F {
    fn replace(&mut self, id: u32) -> LocalObjectHandle { self(id) }
}

/// Pack `v` into its wire representation.
///
/// `replacer`, if present, is invoked for every `Object` payload encountered;
/// without one, packing an `Object` is an error (§4.1: "the hook must have
/// side-effect: registering that object in the caller's `ObjectTable`").
///
/// # Errors
/// Returns [`VariantError::NoReplacer`] if an `Object` is encountered with no
/// replacer installed, or [`VariantError::IllegalOnWire`] for `Future`/`Packed`.
pub fn pack(v: &Variant, replacer: Option<&mut dyn ObjectReplacer>) -> Result<Vec<u8>, VariantError> {
    let mut buf = Vec::new();
    let mut replacer = replacer;
    pack_into(v, &mut buf, &mut replacer)?;
    Ok(buf)
}

fn pack_into(
    v: &Variant,
    buf: &mut Vec<u8>,
    replacer: &mut Option<&mut dyn ObjectReplacer>,
) -> Result<(), VariantError> {
    match v {
        Variant::Null => buf.push(TAG_NULL),
        Variant::Int(n) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Variant::Real(f) => {
            buf.push(TAG_REAL);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        Variant::String(s) => write_tagged_bytes(buf, TAG_STRING, s)?,
        Variant::Exception(s) => write_tagged_bytes(buf, TAG_EXCEPTION, s)?,
        Variant::Array(items) => {
            buf.push(TAG_ARRAY);
            let count = u32::try_from(items.len())
                .map_err(|_| VariantError::LengthExceeded(u32::MAX, MAX_FIELD_LEN))?;
            buf.extend_from_slice(&count.to_le_bytes());
            for item in items {
                pack_into(item, buf, replacer)?;
            }
        }
        Variant::Map(map) => {
            buf.push(TAG_MAP);
            let count = u32::try_from(map.len())
                .map_err(|_| VariantError::LengthExceeded(u32::MAX, MAX_FIELD_LEN))?;
            buf.extend_from_slice(&count.to_le_bytes());
            for (key, value) in map {
                if key.len() > MAX_KEY_LEN {
                    return Err(VariantError::KeyTooLong(key.len()));
                }
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "length checked against MAX_KEY_LEN above"
                )]
                buf.push(key.len() as u8);
                buf.extend_from_slice(key.as_bytes());
                pack_into(value, buf, replacer)?;
            }
        }
        Variant::ObjectId(id) => {
            buf.push(TAG_OBJECT_ID);
            buf.extend_from_slice(&id.to_le_bytes());
        }
        Variant::Object(obj) => {
            let id = match replacer {
                Some(r) => r.replace(obj),
                None => return Err(VariantError::NoReplacer),
            };
            buf.push(TAG_OBJECT_ID);
            buf.extend_from_slice(&id.to_le_bytes());
        }
        Variant::Future(_) => return Err(VariantError::IllegalOnWire("Future")),
        Variant::Packed(bytes) => {
            // Packed is never legal as a wire *tag*, but a caller may embed
            // pre-encoded bytes verbatim (e.g. a cached serialised value);
            // splice them in directly rather than re-wrapping them.
            buf.extend_from_slice(bytes);
        }
    }
    Ok(())
}

fn write_tagged_bytes(buf: &mut Vec<u8>, tag: u8, bytes: &[u8]) -> Result<(), VariantError> {
    buf.push(tag);
    let len = u32::try_from(bytes.len())
        .map_err(|_| VariantError::LengthExceeded(u32::MAX, MAX_FIELD_LEN))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Cursor over an immutable byte slice with bounds-checked reads.
///
/// Mirrors the style of the teacher's `transaction::frame::read_u32`/`read_u16`
/// helpers: every read validates remaining length before indexing, returning
/// a typed error instead of panicking on a short or hostile buffer.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(buf: &'a [u8]) -> Self { Self { buf, pos: 0 } }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], VariantError> {
        let end = self.pos.checked_add(n).ok_or(VariantError::Truncated(what))?;
        let slice = self.buf.get(self.pos..end).ok_or(VariantError::Truncated(what))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, VariantError> { Ok(self.take(1, "u8")?[0]) }

    fn u32(&mut self) -> Result<u32, VariantError> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, VariantError> {
        let b = self.take(8, "i64")?;
        Ok(i64::from_le_bytes(b.try_into().expect("length checked above")))
    }

    fn f64(&mut self) -> Result<f64, VariantError> {
        let b = self.take(8, "f64")?;
        Ok(f64::from_le_bytes(b.try_into().expect("length checked above")))
    }

    fn bytes(&mut self, len: u32, what: &'static str) -> Result<Vec<u8>, VariantError> {
        if len > MAX_FIELD_LEN {
            return Err(VariantError::LengthExceeded(len, MAX_FIELD_LEN));
        }
        #[expect(clippy::cast_possible_truncation, reason = "usize is at least 32-bit")]
        Ok(self.take(len as usize, what)?.to_vec())
    }
}

/// Unpack a single [`Variant`] from the front of `buf`.
///
/// `replacer`, if present, is invoked for every `ObjectId` encountered and
/// immediately rewrites it into a live `Object` payload bound to the
/// receiving connection — the only point where a wire id becomes a handle.
/// Without one, `ObjectId`s are returned as-is.
///
/// Returns the decoded value and the number of bytes consumed.
///
/// # Errors
/// Returns a [`VariantError`] if the tag is unknown, a length prefix exceeds
/// [`MAX_FIELD_LEN`], or the buffer is truncated.
pub fn unpack(
    buf: &[u8],
    replacer: Option<&mut dyn IdReplacer>,
) -> Result<(Variant, usize), VariantError> {
    let mut cur = Cursor::new(buf);
    let mut replacer = replacer;
    let value = unpack_from(&mut cur, &mut replacer)?;
    Ok((value, cur.pos))
}

fn unpack_from(
    cur: &mut Cursor<'_>,
    replacer: &mut Option<&mut dyn IdReplacer>,
) -> Result<Variant, VariantError> {
    let tag = cur.u8()?;
    match tag {
        TAG_NULL => Ok(Variant::Null),
        TAG_INT => Ok(Variant::Int(cur.i64()?)),
        TAG_REAL => Ok(Variant::Real(cur.f64()?)),
        TAG_STRING => Ok(Variant::String(read_len_bytes(cur, "string")?)),
        TAG_EXCEPTION => Ok(Variant::Exception(read_len_bytes(cur, "exception")?)),
        TAG_ARRAY => {
            let count = cur.u32()?;
            if count > MAX_FIELD_LEN {
                return Err(VariantError::LengthExceeded(count, MAX_FIELD_LEN));
            }
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                items.push(unpack_from(cur, replacer)?);
            }
            Ok(Variant::Array(items))
        }
        TAG_MAP => {
            let count = cur.u32()?;
            if count > MAX_FIELD_LEN {
                return Err(VariantError::LengthExceeded(count, MAX_FIELD_LEN));
            }
            let mut map = VariantMap::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                let key_len = cur.u8()?;
                let key_bytes = cur.take(key_len as usize, "map key")?;
                let key = String::from_utf8_lossy(key_bytes).into_owned();
                let value = unpack_from(cur, replacer)?;
                map.insert(key, value);
            }
            Ok(Variant::Map(map))
        }
        TAG_OBJECT => Err(VariantError::IllegalOnWire("Object")),
        TAG_OBJECT_ID => {
            let id = cur.u32()?;
            match replacer {
                Some(r) => Ok(Variant::Object(r.replace(id))),
                None => Ok(Variant::ObjectId(id)),
            }
        }
        TAG_FUTURE => Err(VariantError::IllegalOnWire("Future")),
        TAG_PACKED => Err(VariantError::IllegalOnWire("Packed")),
        other => Err(VariantError::UnknownTag(other)),
    }
}

fn read_len_bytes(cur: &mut Cursor<'_>, what: &'static str) -> Result<Vec<u8>, VariantError> {
    let len = cur.u32()?;
    cur.bytes(len, what)
}

/// Pre-encode `v` with no replacer installed, for embedding verbatim via
/// [`Variant::Packed`]. Fails if `v` (or a descendant) contains an `Object`.
///
/// # Errors
/// Propagates any [`VariantError`] from [`pack`].
pub fn precompute_packed(v: &Variant) -> Result<Arc<[u8]>, VariantError> {
    Ok(Arc::from(pack(v, None)?.into_boxed_slice()))
}
