use std::{
    borrow::Cow,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter, EnumString, IntoStaticStr};

use crate::value::Value;

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Built-in exception classes.
///
/// Each variant is backed by a class object created when the VM starts, so user code can
/// subclass and catch them like any other class. The string form matches the class name.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    IntoStaticStr,
    EnumCount,
    EnumIter,
    Serialize,
    Deserialize,
)]
pub enum ExcType {
    /// Root of the hierarchy; `except BaseException` catches everything.
    BaseException,
    Exception,

    TypeError,
    AttributeError,
    NameError,
    ValueError,
    AssertionError,
    ImportError,
    SyntaxError,
    ThreadError,

    // --- LookupError hierarchy ---
    LookupError,
    KeyError,
    IndexError,

    // --- ArithmeticError hierarchy ---
    ArithmeticError,
    ZeroDivisionError,

    // --- RuntimeError hierarchy ---
    RuntimeError,
    NotImplementedError,
    /// Raised when the frame stack is full. Catchable.
    RecursionError,

    // --- OSError hierarchy ---
    OSError,
    IOError,

    // --- resource limits ---
    MemoryError,
    TimeoutError,
}

impl ExcType {
    /// Direct base class, `None` only for `BaseException`.
    #[must_use]
    pub fn base(self) -> Option<Self> {
        match self {
            Self::BaseException => None,
            Self::Exception => Some(Self::BaseException),
            Self::KeyError | Self::IndexError => Some(Self::LookupError),
            Self::ZeroDivisionError => Some(Self::ArithmeticError),
            Self::NotImplementedError | Self::RecursionError => Some(Self::RuntimeError),
            Self::IOError => Some(Self::OSError),
            _ => Some(Self::Exception),
        }
    }

    /// Whether `self` is `handler_type` or derives from it.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        let mut current = Some(self);
        while let Some(exc_type) = current {
            if exc_type == handler_type {
                return true;
            }
            current = exc_type.base();
        }
        false
    }

    /// Creates a TypeError with the given message.
    #[must_use]
    pub(crate) fn type_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::TypeError, msg).into()
    }

    /// Creates a ValueError with the given message.
    #[must_use]
    pub(crate) fn value_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::ValueError, msg).into()
    }

    /// Creates a MemoryError with the given message.
    #[must_use]
    pub(crate) fn memory_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::MemoryError, msg).into()
    }

    /// Creates an AttributeError for a missing attribute.
    ///
    /// Format: `'{type_name}' object has no attribute '{attr}'`
    #[must_use]
    pub(crate) fn attribute_error(type_name: impl Display, attr: &str) -> RunError {
        SimpleException::new_msg(
            Self::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
        .into()
    }

    /// Creates a NameError for an undefined global.
    #[must_use]
    pub(crate) fn name_error(name: &str) -> RunError {
        SimpleException::new_msg(Self::NameError, format!("name '{name}' is not defined")).into()
    }

    /// Creates a ZeroDivisionError with the given message.
    #[must_use]
    pub(crate) fn zero_division(msg: &'static str) -> RunError {
        SimpleException::new_msg(Self::ZeroDivisionError, msg).into()
    }

    /// Creates an IndexError for an out-of-range subscript of `type_name`.
    #[must_use]
    pub(crate) fn index_error(type_name: &str) -> RunError {
        SimpleException::new_msg(Self::IndexError, format!("{type_name} index out of range")).into()
    }

    /// Creates a KeyError carrying the repr of the missing key.
    #[must_use]
    pub(crate) fn key_error(key_repr: impl Display) -> RunError {
        SimpleException::new_msg(Self::KeyError, key_repr).into()
    }

    /// Creates a TypeError for hashing a value whose type has no hash.
    ///
    /// Format: `unhashable type: '{type_name}'`
    #[must_use]
    pub(crate) fn unhashable(type_name: impl Display) -> RunError {
        SimpleException::new_msg(Self::TypeError, format!("unhashable type: '{type_name}'")).into()
    }

    /// Creates a TypeError for an unsupported binary operator.
    #[must_use]
    pub(crate) fn binary_type_error(op: &str, lhs: &str, rhs: &str) -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            format!("unsupported operand type(s) for {op}: '{lhs}' and '{rhs}'"),
        )
        .into()
    }

    /// Creates a TypeError for calling something that is not callable.
    #[must_use]
    pub(crate) fn not_callable(type_name: &str) -> RunError {
        SimpleException::new_msg(Self::TypeError, format!("'{type_name}' object is not callable")).into()
    }

    /// `len() takes exactly one argument (2 given)` / `insert expected 2 arguments, got 1`
    #[must_use]
    pub(crate) fn type_error_arg_count(name: &str, expected: usize, actual: usize) -> RunError {
        let msg = if expected == 1 {
            format!("{name}() takes exactly one argument ({actual} given)")
        } else {
            format!("{name} expected {expected} arguments, got {actual}")
        };
        SimpleException::new_msg(Self::TypeError, msg).into()
    }

    #[must_use]
    pub(crate) fn type_error_no_args(name: &str, actual: usize) -> RunError {
        SimpleException::new_msg(Self::TypeError, format!("{name}() takes no arguments ({actual} given)")).into()
    }

    #[must_use]
    pub(crate) fn type_error_at_least(name: &str, min: usize, actual: usize) -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            format!("{name} expected at least {min} argument, got {actual}"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn type_error_at_most(name: &str, max: usize, actual: usize) -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            format!("{name} expected at most {max} arguments, got {actual}"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn type_error_no_kwargs(name: &str) -> RunError {
        SimpleException::new_msg(Self::TypeError, format!("{name}() takes no keyword arguments")).into()
    }
}

/// Exception that has not been materialized as a heap instance yet.
///
/// Native code and the VM raise these; they become instances of the matching built-in
/// class when a handler catches them or when they escape to the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimpleException {
    exc_type: ExcType,
    arg: Option<String>,
}

impl SimpleException {
    /// Creates a new exception with the given type and optional argument message.
    #[must_use]
    pub fn new(exc_type: ExcType, arg: Option<String>) -> Self {
        Self { exc_type, arg }
    }

    /// Creates a new exception with a message.
    #[must_use]
    pub fn new_msg(exc_type: ExcType, msg: impl Display) -> Self {
        Self {
            exc_type,
            arg: Some(msg.to_string()),
        }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn arg(&self) -> Option<&str> {
        self.arg.as_deref()
    }

    #[must_use]
    pub fn into_arg(self) -> Option<String> {
        self.arg
    }
}

impl fmt::Display for SimpleException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arg {
            Some(arg) => write!(f, "{}: {arg}", self.exc_type),
            None => write!(f, "{}", self.exc_type),
        }
    }
}

/// Runtime error signalled by any fallible VM, heap or native operation.
///
/// Four variants:
/// - `Exc`: catchable exception described by type and message
/// - `Raised`: catchable exception that already is a heap instance (user `raise`, re-raise)
/// - `Uncatchable`: resource-limit exception that handlers never see
/// - `Internal`: bug in the interpreter or malformed bytecode
#[derive(Debug, Clone)]
pub enum RunError {
    Internal(Cow<'static, str>),
    Exc(Box<SimpleException>),
    Raised(Value),
    Uncatchable(Box<SimpleException>),
}

impl From<SimpleException> for RunError {
    fn from(exc: SimpleException) -> Self {
        Self::Exc(Box::new(exc))
    }
}

impl RunError {
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether `try` handlers may intercept this error.
    #[must_use]
    pub fn is_catchable(&self) -> bool {
        matches!(self, Self::Exc(_) | Self::Raised(_))
    }

    /// Returns true if this error is a not-yet-materialized exception of exactly `exc_type`.
    #[must_use]
    pub fn is_exception_type(&self, exc_type: ExcType) -> bool {
        match self {
            Self::Exc(exc) | Self::Uncatchable(exc) => exc.exc_type() == exc_type,
            _ => false,
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::Exc(exc) | Self::Uncatchable(exc) => write!(f, "{exc}"),
            Self::Raised(value) => write!(f, "exception {value}"),
        }
    }
}

impl std::error::Error for RunError {}

/// Formats a list of parameter names for error messages.
///
/// Examples:
/// - `["a"]` -> `'a'`
/// - `["a", "b"]` -> `'a' and 'b'`
/// - `["a", "b", "c"]` -> `'a', 'b' and 'c'`
pub(crate) fn format_param_names(names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [only] => format!("'{only}'"),
        [first, second] => format!("'{first}' and '{second}'"),
        [rest @ .., last] => {
            let rest: Vec<_> = rest.iter().map(|n| format!("'{n}'")).collect();
            format!("{} and '{last}'", rest.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_walks_bases() {
        assert!(ExcType::KeyError.is_subclass_of(ExcType::LookupError));
        assert!(ExcType::KeyError.is_subclass_of(ExcType::BaseException));
        assert!(ExcType::RecursionError.is_subclass_of(ExcType::RuntimeError));
        assert!(!ExcType::ValueError.is_subclass_of(ExcType::LookupError));
        assert!(!ExcType::Exception.is_subclass_of(ExcType::TypeError));
    }

    #[test]
    fn param_names_join() {
        assert_eq!(format_param_names(&["a"]), "'a'");
        assert_eq!(format_param_names(&["a", "b", "c"]), "'a', 'b' and 'c'");
    }
}
