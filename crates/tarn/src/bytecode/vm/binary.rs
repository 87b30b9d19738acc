//! Arithmetic operators.
//!
//! Numbers take a fast path with Python semantics for division and modulo. Strings,
//! tuples and lists support concatenation and repetition. Everything else goes through
//! the operator's special method on the left operand, then its reflected form on the
//! right; `NotImplemented` from either defers to the next step.

use strum::IntoStaticStr;

use super::Vm;
use crate::{
    exception_private::{ExcType, RunError, RunResult},
    heap::HeapData,
    resource::{LARGE_RESULT_THRESHOLD, ResourceTracker},
    tracer::VmTracer,
    types::SpecialMethod,
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::TrueDiv => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
        }
    }

    pub fn special(self) -> SpecialMethod {
        match self {
            Self::Add => SpecialMethod::Add,
            Self::Sub => SpecialMethod::Sub,
            Self::Mul => SpecialMethod::Mul,
            Self::TrueDiv => SpecialMethod::TrueDiv,
            Self::FloorDiv => SpecialMethod::FloorDiv,
            Self::Mod => SpecialMethod::Mod,
        }
    }
}

fn repeat_too_large() -> RunError {
    ExcType::memory_error("repeated sequence is too large")
}

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// `lhs <op> rhs`.
    pub(crate) fn binary_op(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Value> {
        if let Some(result) = numeric_op(op, lhs, rhs)? {
            return Ok(result);
        }
        if let Some(result) = self.sequence_op(op, lhs, rhs)? {
            return Ok(result);
        }

        if let Some(result) = self.call_special(lhs, op.special(), &[rhs])?
            && result != Value::NotImplemented
        {
            return Ok(result);
        }
        if let Some(reflected) = op.special().reflected()
            && let Some(result) = self.call_special(rhs, reflected, &[lhs])?
            && result != Value::NotImplemented
        {
            return Ok(result);
        }
        Err(ExcType::binary_type_error(
            op.symbol(),
            &self.heap.type_name(lhs),
            &self.heap.type_name(rhs),
        ))
    }

    /// Concatenation and repetition of strings, tuples and lists.
    fn sequence_op(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Option<Value>> {
        match op {
            BinaryOp::Add => {
                if let (Some(a), Some(b)) = (self.heap.as_str(lhs), self.heap.as_str(rhs)) {
                    let joined = format!("{a}{b}");
                    return self.new_str(&joined).map(Some);
                }
                if self.is_tuple(lhs) && self.is_tuple(rhs) {
                    let items = [self.sequence_items(lhs), self.sequence_items(rhs)].concat();
                    return self.new_tuple(items).map(Some);
                }
                if let (Some(a), Some(b)) = (self.list_items(lhs), self.list_items(rhs)) {
                    let items = [a, b].concat();
                    return self.new_list(items).map(Some);
                }
                Ok(None)
            }
            BinaryOp::Mul => {
                let (sequence, count) = match (lhs.as_int(), rhs.as_int()) {
                    (None, Some(n)) => (lhs, n),
                    (Some(n), None) => (rhs, n),
                    _ => return Ok(None),
                };
                let count = usize::try_from(count).unwrap_or(0);
                if let Some(text) = self.heap.as_str(sequence) {
                    let size = self.repeat_len(text.len(), 1, count)?;
                    let mut repeated = String::new();
                    repeated.try_reserve_exact(size).map_err(|_| repeat_too_large())?;
                    for _ in 0..count {
                        repeated.push_str(text);
                    }
                    return self.new_str(&repeated).map(Some);
                }
                if self.is_tuple(sequence) {
                    let items = self.repeat_items(self.sequence_items(sequence), count)?;
                    return self.new_tuple(items).map(Some);
                }
                if let Some(items) = self.list_items(sequence) {
                    let items = self.repeat_items(items, count)?;
                    return self.new_list(items).map(Some);
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Element count of `len` items repeated `count` times.
    ///
    /// Results above [`LARGE_RESULT_THRESHOLD`] bytes are cleared with the tracker first.
    fn repeat_len(&self, len: usize, item_size: usize, count: usize) -> RunResult<usize> {
        let total = len.checked_mul(count).ok_or_else(repeat_too_large)?;
        let bytes = total.checked_mul(item_size).ok_or_else(repeat_too_large)?;
        if bytes > LARGE_RESULT_THRESHOLD {
            self.heap.tracker.check_large_result(bytes)?;
        }
        Ok(total)
    }

    fn repeat_items(&self, items: &[Value], count: usize) -> RunResult<Vec<Value>> {
        let size = self.repeat_len(items.len(), size_of::<Value>(), count)?;
        let mut repeated = Vec::new();
        repeated.try_reserve_exact(size).map_err(|_| repeat_too_large())?;
        for _ in 0..count {
            repeated.extend_from_slice(items);
        }
        Ok(repeated)
    }

    pub(super) fn is_tuple(&self, value: Value) -> bool {
        matches!(value, Value::Ref(id) if matches!(self.heap.get(id), HeapData::Tuple(_)))
    }

    /// `-value`.
    pub(crate) fn negate(&mut self, value: Value) -> RunResult<Value> {
        match value {
            Value::Int(i) => return Ok(Value::int(i.wrapping_neg())),
            Value::Bool(b) => return Ok(Value::Int(-i64::from(b))),
            Value::Float(x) => return Ok(Value::Float(-x)),
            _ => {}
        }
        match self.call_special(value, SpecialMethod::Neg, &[])? {
            Some(result) => Ok(result),
            None => Err(ExcType::type_error(format!(
                "bad operand type for unary -: '{}'",
                self.heap.type_name(value)
            ))),
        }
    }
}

/// Arithmetic on two numbers; `None` when either operand is not a number.
fn numeric_op(op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Option<Value>> {
    if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
        return int_op(op, a, b).map(Some);
    }
    let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) else {
        return Ok(None);
    };
    float_op(op, a, b).map(Some)
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> RunResult<Value> {
    Ok(match op {
        BinaryOp::Add => Value::int(a.wrapping_add(b)),
        BinaryOp::Sub => Value::int(a.wrapping_sub(b)),
        BinaryOp::Mul => Value::int(a.wrapping_mul(b)),
        BinaryOp::TrueDiv => {
            if b == 0 {
                return Err(ExcType::zero_division("division by zero"));
            }
            Value::Float(a as f64 / b as f64)
        }
        BinaryOp::FloorDiv => {
            if b == 0 {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            Value::int(floor_div(a, b))
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(ExcType::zero_division("integer modulo by zero"));
            }
            Value::int(floor_mod(a, b))
        }
    })
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> RunResult<Value> {
    Ok(Value::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::TrueDiv => {
            if b == 0.0 {
                return Err(ExcType::zero_division("float division by zero"));
            }
            a / b
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Err(ExcType::zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(ExcType::zero_division("float modulo"));
            }
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }
        }
    }))
}

/// Integer division rounding towards negative infinity.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q }
}

/// Remainder taking the sign of the divisor.
fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_division_rounds_down() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(floor_div(7, -2), -4);
        assert_eq!(floor_div(-8, 2), -4);
    }

    #[test]
    fn modulo_follows_divisor_sign() {
        assert_eq!(floor_mod(7, 3), 1);
        assert_eq!(floor_mod(-7, 3), 2);
        assert_eq!(floor_mod(7, -3), -2);
    }

    #[test]
    fn integer_overflow_wraps_to_payload() {
        let max = crate::value::INT_MAX;
        assert_eq!(int_op(BinaryOp::Add, max, 1).unwrap(), Value::Int(crate::value::INT_MIN));
    }

    #[test]
    fn mixed_operands_promote() {
        assert_eq!(
            numeric_op(BinaryOp::Add, Value::Int(1), Value::Float(0.5)).unwrap(),
            Some(Value::Float(1.5))
        );
        assert_eq!(numeric_op(BinaryOp::Add, Value::Int(1), Value::None).unwrap(), None);
    }

    #[test]
    fn division_by_zero_messages() {
        let err = int_op(BinaryOp::FloorDiv, 1, 0).unwrap_err();
        assert_eq!(err.to_string(), "ZeroDivisionError: integer division or modulo by zero");
        let err = float_op(BinaryOp::Mod, 1.0, 0.0).unwrap_err();
        assert_eq!(err.to_string(), "ZeroDivisionError: float modulo");
    }
}
