//! The [`Variant`] dynamic value tree and its wire format.
//!
//! `Variant` is the single value type carried by every call, return, and
//! exception in the transport. Most of its variants pack and unpack
//! losslessly; `Object`, `Future`, and `Packed` are local-process-only and
//! are never legal on the wire in their own right — see [`wire`] for the
//! object↔id replacement that makes `Object` values transportable.

pub mod wire;

use std::{collections::HashMap, sync::Arc};

use crate::{future::Future, object::LocalObjectHandle};

pub use wire::{unpack, pack, IdReplacer, ObjectReplacer};

/// A map of string keys to [`Variant`] values.
///
/// Keys are unique and, per the protocol, insertion order is not preserved
/// across the wire — a `HashMap` models that directly and makes the
/// round-trip equality property (map equality ignoring order) free.
pub type VariantMap = HashMap<String, Variant>;

/// Tagged-union value carried by calls, returns, and exceptions.
///
/// See the module documentation for the wire-legality rules around
/// `Object`, `Future`, and `Packed`.
#[derive(Clone)]
pub enum Variant {
    /// The default value; also used for absent/void results.
    Null,
    /// A signed 64-bit integer.
    Int(i64),
    /// An IEEE-754 64-bit float.
    Real(f64),
    /// An opaque byte string; no encoding is enforced.
    String(Vec<u8>),
    /// An ordered sequence of values.
    Array(Vec<Variant>),
    /// A key→value map. Keys are unique; iteration order is not meaningful.
    Map(VariantMap),
    /// A byte-string message marking a failed result.
    ///
    /// Packs identically to `String` but is routed down a `Future`'s error
    /// path rather than its success path.
    Exception(Vec<u8>),
    /// An owning handle to a local method-dispatcher.
    ///
    /// Never legal on the wire; packing one requires a registered
    /// [`ObjectReplacer`], which rewrites it into an `ObjectId`.
    Object(LocalObjectHandle),
    /// The on-wire projection of `Object`: an integer handle to a remote
    /// object. Id 0 is reserved for the global object.
    ObjectId(u32),
    /// A handle to a deferred result. Never legal on the wire.
    Future(Future),
    /// Raw pre-encoded bytes, used as an intermediate form. Never legal on
    /// the wire in its own right.
    Packed(Arc<[u8]>),
}

impl Variant {
    /// Return the tag byte this value would be (or was) encoded with.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Null => wire::TAG_NULL,
            Self::Int(_) => wire::TAG_INT,
            Self::Real(_) => wire::TAG_REAL,
            Self::String(_) => wire::TAG_STRING,
            Self::Array(_) => wire::TAG_ARRAY,
            Self::Map(_) => wire::TAG_MAP,
            Self::Exception(_) => wire::TAG_EXCEPTION,
            Self::Object(_) => wire::TAG_OBJECT,
            Self::ObjectId(_) => wire::TAG_OBJECT_ID,
            Self::Future(_) => wire::TAG_FUTURE,
            Self::Packed(_) => wire::TAG_PACKED,
        }
    }

    /// Returns `true` if this value is an [`Variant::Exception`].
    #[must_use]
    pub const fn is_exception(&self) -> bool { matches!(self, Self::Exception(_)) }

    /// Build a string-valued variant from anything convertible to `Vec<u8>`.
    #[must_use]
    pub fn string(s: impl Into<Vec<u8>>) -> Self { Self::String(s.into()) }

    /// Build an exception-valued variant carrying `msg` as its text.
    #[must_use]
    pub fn exception(msg: impl Into<Vec<u8>>) -> Self { Self::Exception(msg.into()) }

    /// Borrow this value's bytes if it is a `String` or `Exception`.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::String(b) | Self::Exception(b) => Some(b),
            _ => None,
        }
    }
}

impl Default for Variant {
    fn default() -> Self { Self::Null }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Real(a), Self::Real(b)) => a == b,
            (Self::String(a), Self::String(b)) | (Self::Exception(a), Self::Exception(b)) => {
                a == b
            }
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::ObjectId(a), Self::ObjectId(b)) => a == b,
            (Self::Packed(a), Self::Packed(b)) => a == b,
            // Object and Future are local handles; equality is identity,
            // not structural, and is never exercised by the wire round-trip
            // property (which excludes these payloads by definition).
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            (Self::Future(a), Self::Future(b)) => a.is_same(b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Int(v) => write!(f, "Int({v})"),
            Self::Real(v) => write!(f, "Real({v})"),
            Self::String(v) => write!(f, "String({:?})", String::from_utf8_lossy(v)),
            Self::Array(v) => write!(f, "Array({v:?})"),
            Self::Map(v) => write!(f, "Map({v:?})"),
            Self::Exception(v) => write!(f, "Exception({:?})", String::from_utf8_lossy(v)),
            Self::Object(_) => write!(f, "Object(..)"),
            Self::ObjectId(id) => write!(f, "ObjectId({id})"),
            Self::Future(_) => write!(f, "Future(..)"),
            Self::Packed(b) => write!(f, "Packed({} bytes)", b.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_equality_ignores_insertion_order() {
        let mut a = VariantMap::new();
        a.insert("x".to_owned(), Variant::Int(1));
        a.insert("y".to_owned(), Variant::Int(2));
        let mut b = VariantMap::new();
        b.insert("y".to_owned(), Variant::Int(2));
        b.insert("x".to_owned(), Variant::Int(1));
        assert_eq!(Variant::Map(a), Variant::Map(b));
    }

    #[test]
    fn default_is_null() { assert_eq!(Variant::default(), Variant::Null); }
}
