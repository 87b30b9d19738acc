//! Equality, ordering and membership.

use std::cmp::Ordering;

use super::Vm;
use crate::{
    exception_private::{ExcType, RunResult},
    heap::{HeapData, TableSlot},
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Payload, SpecialMethod},
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
        }
    }

    fn special(self) -> SpecialMethod {
        match self {
            Self::Lt => SpecialMethod::Lt,
            Self::Gt => SpecialMethod::Gt,
            Self::Le => SpecialMethod::Le,
            Self::Ge => SpecialMethod::Ge,
        }
    }

    /// The operator that gives the same answer with the operands swapped.
    fn swapped(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Gt => Self::Lt,
            Self::Le => Self::Ge,
            Self::Ge => Self::Le,
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Lt => ordering.is_lt(),
            Self::Gt => ordering.is_gt(),
            Self::Le => ordering.is_le(),
            Self::Ge => ordering.is_ge(),
        }
    }
}

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// Language equality: numeric promotion, then identity, then `__eq__`, then
    /// structural comparison of built-in containers.
    pub fn values_equal(&mut self, a: Value, b: Value) -> RunResult<bool> {
        if let Some(equal) = a.numeric_eq(b) {
            return Ok(equal);
        }
        if a == b {
            return Ok(true);
        }
        for (receiver, other) in [(a, b), (b, a)] {
            if let Some(result) = self.call_special(receiver, SpecialMethod::Eq, &[other])?
                && result != Value::NotImplemented
            {
                return self.is_truthy(result);
            }
        }
        self.structural_eq(a, b)
    }

    fn structural_eq(&mut self, a: Value, b: Value) -> RunResult<bool> {
        let (Value::Ref(x), Value::Ref(y)) = (a, b) else {
            return Ok(false);
        };
        match (self.heap.get(x), self.heap.get(y)) {
            (HeapData::Str(_) | HeapData::Bytes(_), _) => Ok(self.heap.keys().values_equal(a, b)),
            (HeapData::Tuple(_), HeapData::Tuple(_)) => self.elements_equal(a, b),
            (HeapData::Instance(p), HeapData::Instance(q)) => match (&p.payload, &q.payload) {
                (Payload::List(_), Payload::List(_)) => self.elements_equal(a, b),
                (Payload::Dict(s), Payload::Dict(t)) | (Payload::Set(s), Payload::Set(t)) => {
                    if s.len() != t.len() {
                        return Ok(false);
                    }
                    let entries: Vec<(Value, Value)> = s.iter().collect();
                    let is_dict = matches!(p.payload, Payload::Dict(_));
                    for (key, value) in entries {
                        let Some(other) = self.table_lookup(b, key)? else {
                            return Ok(false);
                        };
                        if is_dict && !self.values_equal(value, other)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                _ => Ok(false),
            },
            _ => Ok(false),
        }
    }

    fn elements_equal(&mut self, a: Value, b: Value) -> RunResult<bool> {
        let left = self.sequence_items(a).to_vec();
        let right = self.sequence_items(b).to_vec();
        if left.len() != right.len() {
            return Ok(false);
        }
        for (x, y) in left.into_iter().zip(right) {
            if !self.values_equal(x, y)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// `a <op> b`.
    pub(crate) fn compare(&mut self, op: CompareOp, a: Value, b: Value) -> RunResult<bool> {
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            return Ok(op.holds(x.cmp(&y)));
        }
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            // NaN orders with nothing
            return Ok(x.partial_cmp(&y).is_some_and(|ordering| op.holds(ordering)));
        }
        if let (Some(x), Some(y)) = (self.heap.as_str(a), self.heap.as_str(b)) {
            return Ok(op.holds(x.cmp(y)));
        }
        if (self.is_tuple(a) && self.is_tuple(b)) || (self.list_items(a).is_some() && self.list_items(b).is_some()) {
            return self.compare_sequences(op, a, b);
        }

        if let Some(result) = self.call_special(a, op.special(), &[b])?
            && result != Value::NotImplemented
        {
            return self.is_truthy(result);
        }
        if let Some(result) = self.call_special(b, op.swapped().special(), &[a])?
            && result != Value::NotImplemented
        {
            return self.is_truthy(result);
        }
        Err(ExcType::type_error(format!(
            "'{}' not supported between instances of '{}' and '{}'",
            op.symbol(),
            self.heap.type_name(a),
            self.heap.type_name(b)
        )))
    }

    /// Lexicographic ordering: the first unequal pair decides, else the lengths do.
    fn compare_sequences(&mut self, op: CompareOp, a: Value, b: Value) -> RunResult<bool> {
        let left = self.sequence_items(a).to_vec();
        let right = self.sequence_items(b).to_vec();
        for (&x, &y) in left.iter().zip(&right) {
            if !self.values_equal(x, y)? {
                return self.compare(op, x, y);
            }
        }
        Ok(op.holds(left.len().cmp(&right.len())))
    }

    /// `item in container`.
    pub(crate) fn contains(&mut self, container: Value, item: Value) -> RunResult<bool> {
        if let Value::Ref(id) = container {
            match self.heap.get(id) {
                HeapData::Str(haystack) => {
                    let Some(needle) = self.heap.as_str(item) else {
                        return Err(ExcType::type_error(format!(
                            "'in <string>' requires string as left operand, not {}",
                            self.heap.type_name(item)
                        )));
                    };
                    return Ok(haystack.as_str().contains(needle));
                }
                HeapData::Tuple(_) => return self.sequence_contains(container, item),
                HeapData::Instance(instance) => match instance.payload {
                    Payload::List(_) => return self.sequence_contains(container, item),
                    Payload::Dict(_) | Payload::Set(_) => return Ok(self.table_lookup(container, item)?.is_some()),
                    _ => {}
                },
                _ => {}
            }
        }
        match self.call_special(container, SpecialMethod::Contains, &[item])? {
            Some(result) => self.is_truthy(result),
            None => Err(ExcType::type_error(format!(
                "argument of type '{}' is not iterable",
                self.heap.type_name(container)
            ))),
        }
    }

    fn sequence_contains(&mut self, container: Value, item: Value) -> RunResult<bool> {
        let items = self.sequence_items(container).to_vec();
        for candidate in items {
            if self.values_equal(candidate, item)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Looks `key` up in the dict or set `owner`.
    pub(crate) fn table_lookup(&mut self, owner: Value, key: Value) -> RunResult<Option<Value>> {
        let Some(id) = owner.as_heap_id() else {
            return Ok(None);
        };
        let (key, hash) = self.table_key(id, key)?;
        self.heap
            .with_table(id, TableSlot::Payload, |table, keys| table.get_hashed(keys, key, hash))
    }
}
