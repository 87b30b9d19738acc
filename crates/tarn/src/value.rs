use std::{
    fmt,
    hash::{Hash, Hasher},
};

use strum::{FromRepr, IntoStaticStr};

use crate::{heap::HeapId, nanbox};

/// Smallest integer a value can hold (48-bit payload).
pub const INT_MIN: i64 = -(1 << 47);
/// Largest integer a value can hold (48-bit payload).
pub const INT_MAX: i64 = (1 << 47) - 1;

/// Marker pushed before a single positional argument that follows a `*args` expansion.
pub const KWARGS_SINGLE: u32 = u32::MAX;
/// Marker preceding an iterable whose items expand into positional arguments.
pub const KWARGS_LIST: u32 = u32::MAX - 1;
/// Marker preceding a mapping whose entries expand into keyword arguments.
pub const KWARGS_DICT: u32 = u32::MAX - 2;
/// Marker for an argument slot that was not supplied by the caller.
pub const KWARGS_UNSET: u32 = 0;

/// Primary value type of the interpreter.
///
/// Immediates (numbers, booleans and sentinels) live directly in the enum; everything
/// else is a [`HeapId`] into the heap arena. The enum always fits the packed 64-bit
/// form defined in [`crate::nanbox`].
///
/// `==` on `Value` is identity ("same"): two values are equal when their packed words
/// are equal. Language-level equality, which promotes integers to floats and may call
/// user `__eq__`, is implemented by the VM.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    None,
    NotImplemented,
    Bool(bool),
    /// A 48-bit signed integer. Construct with [`Value::int`] to truncate.
    Int(i64),
    Float(f64),
    /// Exception and `with` bookkeeping record; never visible to user code.
    Handler(Handler),
    /// Argument-passing sentinel: keyword counts, expansion markers, absent
    /// arguments and deleted table entries.
    Kwargs(u32),
    Ref(HeapId),
}

/// State of an exception handler record on the value stack.
///
/// Armed records (`Try`, `Finally`, `With`) intercept exceptions; `Finally` and `With`
/// also intercept returns. The remaining kinds describe what the handler code found
/// when it was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr)]
#[repr(u16)]
pub enum HandlerKind {
    /// Armed `try` with `except` clauses.
    Try,
    /// Armed `try` with a `finally` clause.
    Finally,
    /// Armed `with` block.
    With,
    /// An exception was caught and is waiting to be matched or re-raised.
    Raise,
    /// An `except` clause matched and its body is running.
    Except,
    /// The protected region completed; nothing is pending.
    Done,
    /// A `return` is pending until the cleanup code finishes.
    Return,
}

impl HandlerKind {
    /// Whether an exception unwinding past this record stops here.
    #[must_use]
    pub fn catches_exceptions(self) -> bool {
        matches!(self, Self::Try | Self::Finally | Self::With)
    }

    /// Whether a `return` leaving the protected region must run this record's cleanup.
    #[must_use]
    pub fn intercepts_return(self) -> bool {
        matches!(self, Self::Finally | Self::With)
    }
}

/// A handler record: its state and the absolute bytecode offset of its cleanup code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handler {
    pub kind: HandlerKind,
    pub target: u32,
}

impl Value {
    /// Builds an integer value, truncating to the 48-bit payload width.
    #[inline]
    #[must_use]
    pub fn int(i: i64) -> Self {
        Self::Int(nanbox::sign_extend(i as u64))
    }

    /// Packed representation, see [`crate::nanbox`].
    #[inline]
    #[must_use]
    pub fn to_bits(self) -> u64 {
        nanbox::encode(self)
    }

    #[inline]
    #[must_use]
    pub fn from_bits(bits: u64) -> Self {
        nanbox::decode(bits)
    }

    #[inline]
    #[must_use]
    pub fn is_none(self) -> bool {
        matches!(self, Self::None)
    }

    #[inline]
    #[must_use]
    pub fn as_heap_id(self) -> Option<HeapId> {
        match self {
            Self::Ref(id) => Some(id),
            _ => None,
        }
    }

    /// Integer view, treating booleans as 0 and 1.
    #[inline]
    #[must_use]
    pub fn as_int(self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i),
            Self::Bool(b) => Some(i64::from(b)),
            _ => None,
        }
    }

    /// Numeric view with integer-to-float promotion.
    #[inline]
    #[must_use]
    pub fn as_number(self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(f),
            other => other.as_int().map(|i| i as f64),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_number(self) -> bool {
        matches!(self, Self::Int(_) | Self::Bool(_) | Self::Float(_))
    }

    /// True for the `Kwargs(0)` marker left in argument slots the caller did not fill.
    #[inline]
    #[must_use]
    pub fn is_unset(self) -> bool {
        matches!(self, Self::Kwargs(KWARGS_UNSET))
    }

    /// Hash of a value that does not live on the heap.
    ///
    /// Integers, booleans, `None` and the internal sentinels hash to the low 32 bits of
    /// their packed form; floats hash as their truncated integer part so that `3.0`
    /// and `3` land in the same bucket. Returns `None` for heap references.
    #[must_use]
    pub fn immediate_hash(self) -> Option<u32> {
        match self {
            Self::Ref(_) => None,
            Self::Float(f) => Some(Self::int(f as i64).to_bits() as u32),
            other => Some(other.to_bits() as u32),
        }
    }

    /// Equality for two numeric values after promotion; `None` if either is not a number.
    #[must_use]
    pub fn numeric_eq(self, other: Self) -> Option<bool> {
        match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => Some(a == b),
            _ => Some(self.as_number()? == other.as_number()?),
        }
    }

    /// Name of the built-in type of an immediate, for error messages.
    #[must_use]
    pub fn immediate_type_name(self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::NotImplemented => "NotImplementedType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Handler(_) => "handler",
            Self::Kwargs(_) => "kwargs",
            Self::Ref(_) => "object",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.to_bits() == other.to_bits()
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bits().hash(state);
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<HeapId> for Value {
    fn from(id: HeapId) -> Self {
        Self::Ref(id)
    }
}

impl fmt::Display for Value {
    /// Formats immediates the way `repr()` does; heap values print as a handle.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::NotImplemented => f.write_str("NotImplemented"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{}", format_float(*x)),
            Self::Handler(h) => write!(f, "<handler {:?} -> {}>", h.kind, h.target),
            Self::Kwargs(n) => write!(f, "<kwargs {n}>"),
            Self::Ref(id) => write!(f, "<object #{}>", id.index()),
        }
    }
}

/// Formats a float so that integral values keep a trailing `.0`.
#[must_use]
pub fn format_float(x: f64) -> String {
    if x.is_nan() {
        "nan".to_owned()
    } else if x.is_infinite() {
        if x > 0.0 { "inf".to_owned() } else { "-inf".to_owned() }
    } else if x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{x:.1}")
    } else {
        format!("{x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_truncates_to_payload_width() {
        assert_eq!(Value::int(INT_MAX + 1), Value::Int(INT_MIN));
        assert_eq!(Value::int(-1), Value::Int(-1));
    }

    #[test]
    fn numeric_equality_promotes() {
        assert_eq!(Value::Int(3).numeric_eq(Value::Float(3.0)), Some(true));
        assert_eq!(Value::Bool(true).numeric_eq(Value::Int(1)), Some(true));
        assert_eq!(Value::Int(3).numeric_eq(Value::Float(3.5)), Some(false));
        assert_eq!(Value::Int(3).numeric_eq(Value::None), None);
    }

    #[test]
    fn float_hash_matches_truncated_int() {
        assert_eq!(Value::Float(3.0).immediate_hash(), Value::Int(3).immediate_hash());
        assert_eq!(Value::Float(-7.9).immediate_hash(), Value::Int(-7).immediate_hash());
        assert_eq!(Value::Bool(true).immediate_hash(), Value::Int(1).immediate_hash());
    }

    #[test]
    fn identity_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Int(1), Value::Bool(true));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }
}
