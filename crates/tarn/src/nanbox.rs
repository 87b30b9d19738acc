//! Packed 64-bit encoding of [`Value`].
//!
//! The interpreter works on the [`Value`] enum everywhere. This module is the one place
//! that knows how a value fits into a single machine word, and it is used for
//! identity comparison and for hashing immediates by their raw bit pattern.
//!
//! Layout: the high 16 bits are a tag. A word is one of the seven reserved tags below
//! when those 16 bits match exactly; every other pattern is an IEEE-754 double.
//!
//! | tag | meaning | payload |
//! |-----|---------|---------|
//! | `0xFFFC` | boolean | bit 0 |
//! | `0xFFFD` | integer | 48-bit two's complement, sign-extended on decode |
//! | `0xFFFE` | handler | kind in bits 32..48, jump target in bits 0..32 |
//! | `0xFFFF` | `None` | - |
//! | `0x7FFC` | kwargs sentinel | 32-bit count or marker |
//! | `0x7FFD` | heap reference | arena index |
//! | `0x7FFE` | `NotImplemented` | - |
//!
//! Doubles whose bit pattern would land on a reserved tag are NaNs; encoding
//! canonicalizes every NaN to the quiet NaN `0x7FF8_0000_0000_0000`, which is not a tag.

use crate::{
    heap::HeapId,
    value::{Handler, HandlerKind, Value},
};

/// Bits that are all set for every reserved tag.
pub const MASK_NAN: u64 = 0x7FFC_0000_0000_0000;
/// The 16-bit tag region.
pub const MASK_TAG: u64 = 0xFFFF_0000_0000_0000;
/// The 48-bit payload region.
pub const MASK_LOW: u64 = 0x0000_FFFF_FFFF_FFFF;

pub const TAG_BOOLEAN: u64 = 0xFFFC_0000_0000_0000;
pub const TAG_INTEGER: u64 = 0xFFFD_0000_0000_0000;
pub const TAG_HANDLER: u64 = 0xFFFE_0000_0000_0000;
pub const TAG_NONE: u64 = 0xFFFF_0000_0000_0000;
pub const TAG_KWARGS: u64 = 0x7FFC_0000_0000_0000;
pub const TAG_OBJECT: u64 = 0x7FFD_0000_0000_0000;
pub const TAG_NOTIMPL: u64 = 0x7FFE_0000_0000_0000;

const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

/// Packs a value into its 64-bit form.
#[must_use]
pub fn encode(value: Value) -> u64 {
    match value {
        Value::Bool(b) => TAG_BOOLEAN | u64::from(b),
        Value::Int(i) => TAG_INTEGER | (i as u64 & MASK_LOW),
        Value::Handler(h) => TAG_HANDLER | (u64::from(h.kind as u16) << 32) | u64::from(h.target),
        Value::None => TAG_NONE,
        Value::Kwargs(n) => TAG_KWARGS | u64::from(n),
        Value::Ref(id) => TAG_OBJECT | (id.index() as u64 & MASK_LOW),
        Value::NotImplemented => TAG_NOTIMPL,
        Value::Float(f) if f.is_nan() => CANONICAL_NAN,
        Value::Float(f) => f.to_bits(),
    }
}

/// Unpacks a 64-bit word.
///
/// Total over all bit patterns: anything that is not one of the reserved tags decodes
/// as a double. Handler words with a kind outside [`HandlerKind`] decode as
/// `HandlerKind::Done`.
#[must_use]
pub fn decode(bits: u64) -> Value {
    match bits & MASK_TAG {
        TAG_BOOLEAN => Value::Bool(bits & 1 == 1),
        TAG_INTEGER => Value::Int(sign_extend(bits)),
        TAG_HANDLER => {
            let kind = HandlerKind::from_repr(((bits >> 32) & 0xFFFF) as u16).unwrap_or(HandlerKind::Done);
            Value::Handler(Handler {
                kind,
                target: (bits & 0xFFFF_FFFF) as u32,
            })
        }
        TAG_NONE => Value::None,
        TAG_KWARGS => Value::Kwargs((bits & 0xFFFF_FFFF) as u32),
        TAG_OBJECT => Value::Ref(HeapId::from_index((bits & MASK_LOW) as usize)),
        TAG_NOTIMPL => Value::NotImplemented,
        _ => Value::Float(f64::from_bits(bits)),
    }
}

/// Returns true when the word is a genuine double rather than a tagged value.
#[inline]
#[must_use]
pub fn is_float(bits: u64) -> bool {
    !matches!(
        bits & MASK_TAG,
        TAG_BOOLEAN | TAG_INTEGER | TAG_HANDLER | TAG_NONE | TAG_KWARGS | TAG_OBJECT | TAG_NOTIMPL
    )
}

/// Sign-extends the low 48 bits of `bits` into an `i64`.
#[inline]
#[must_use]
pub fn sign_extend(bits: u64) -> i64 {
    ((bits << 16) as i64) >> 16
}
