//! Built-in containers: construction, hashing, subscripts, length, truth and iteration.
//!
//! Dicts and sets are instances whose payload is a [`Table`]. The table itself only
//! knows structural key equality, so keys whose class defines `__eq__` or `__hash__`
//! are resolved here first: the user hash is computed and cached in the key's header,
//! and an equal key already present is substituted for the probe key.

use super::Vm;
use crate::{
    exception_private::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId, TableSlot},
    resource::ResourceTracker,
    table::Table,
    tracer::VmTracer,
    types::{Bytes, Instance, IterState, Payload, SpecialMethod, Tuple},
    value::Value,
};

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Returns the interned string for `text`.
    pub fn new_str(&mut self, text: &str) -> RunResult<Value> {
        Ok(Value::Ref(self.intern(text)?))
    }

    pub fn new_bytes(&mut self, bytes: &[u8]) -> RunResult<Value> {
        Ok(Value::Ref(self.allocate(HeapData::Bytes(Bytes::new(bytes)))?))
    }

    /// Allocates a tuple. The caller keeps `items` reachable until this returns.
    pub fn new_tuple(&mut self, items: Vec<Value>) -> RunResult<Value> {
        Ok(Value::Ref(self.allocate(HeapData::Tuple(Tuple::new(items)))?))
    }

    /// Allocates a list. The caller keeps `items` reachable until this returns.
    pub fn new_list(&mut self, items: Vec<Value>) -> RunResult<Value> {
        let id = self.allocate(HeapData::Instance(Instance {
            class: self.classes.list,
            fields: Table::new(),
            payload: Payload::List(items),
        }))?;
        Ok(Value::Ref(id))
    }

    pub fn new_dict(&mut self) -> RunResult<Value> {
        Ok(Value::Ref(self.new_instance(self.classes.dict)?))
    }

    pub fn new_set(&mut self) -> RunResult<Value> {
        Ok(Value::Ref(self.new_instance(self.classes.set)?))
    }

    /// `[k1, v1, .., kn, vn] -> dict`, reading the pairs from the stack top.
    pub(super) fn build_dict(&mut self, pairs: usize) -> RunResult<Value> {
        let items = self.top_values(pairs * 2).to_vec();
        let dict = self.new_dict()?;
        self.push(dict);
        for pair in items.chunks_exact(2) {
            self.dict_set(dict, pair[0], pair[1])?;
        }
        Ok(self.pop())
    }

    pub(super) fn build_set(&mut self, count: usize) -> RunResult<Value> {
        let items = self.top_values(count).to_vec();
        let set = self.new_set()?;
        self.push(set);
        for item in items {
            self.set_add(set, item)?;
        }
        Ok(self.pop())
    }

    /// `[start, stop] -> slice` or `[start, stop, step] -> slice`.
    pub(super) fn build_slice(&mut self, count: usize) -> RunResult<Value> {
        let (start, stop, step) = match *self.top_values(count) {
            [start, stop] => (start, stop, Value::None),
            [start, stop, step] => (start, stop, step),
            _ => return Err(RunError::internal("slice takes two or three operands")),
        };
        let id = self.allocate(HeapData::Instance(Instance {
            class: self.classes.slice,
            fields: Table::new(),
            payload: Payload::Slice { start, stop, step },
        }))?;
        Ok(Value::Ref(id))
    }

    /// Replaces the iterable on top of the stack with exactly `count` of its items.
    pub(super) fn unpack(&mut self, count: usize) -> RunResult<()> {
        let items = self.collect_iterable(self.peek(0))?;
        if items.len() > count {
            return Err(ExcType::value_error(format!("too many values to unpack (expected {count})")));
        }
        if items.len() < count {
            return Err(ExcType::value_error(format!(
                "not enough values to unpack (expected {count}, got {})",
                items.len()
            )));
        }
        self.pop();
        self.thread.stack.extend(items);
        Ok(())
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// Elements of a list instance.
    pub(crate) fn list_items(&self, value: Value) -> Option<&[Value]> {
        match &self.heap.instance(value.as_heap_id()?)?.payload {
            Payload::List(items) => Some(items),
            _ => None,
        }
    }

    pub(crate) fn list_items_mut(&mut self, value: Value) -> Option<&mut Vec<Value>> {
        match &mut self.heap.instance_mut(value.as_heap_id()?)?.payload {
            Payload::List(items) => Some(items),
            _ => None,
        }
    }

    /// Elements of a tuple or list; empty for anything else.
    pub(crate) fn sequence_items(&self, value: Value) -> &[Value] {
        let Some(id) = value.as_heap_id() else {
            return &[];
        };
        match self.heap.get(id) {
            HeapData::Tuple(tuple) => tuple.as_slice(),
            HeapData::Instance(Instance {
                payload: Payload::List(items),
                ..
            }) => items,
            _ => &[],
        }
    }

    fn is_table_instance(&self, value: Value) -> bool {
        value
            .as_heap_id()
            .and_then(|id| self.heap.instance(id))
            .is_some_and(|i| matches!(i.payload, Payload::Dict(_) | Payload::Set(_)))
    }

    // ========================================================================
    // Hashing and table access
    // ========================================================================

    /// Hash of `value`, calling a user `__hash__` where the class defines one.
    pub fn hash(&mut self, value: Value) -> RunResult<u32> {
        self.prepare_hash(value)?;
        self.heap.hash_value(value)
    }

    /// Installs user hashes for `value` and, for tuples, every element.
    fn prepare_hash(&mut self, value: Value) -> RunResult<()> {
        let Value::Ref(id) = value else {
            return Ok(());
        };
        match self.heap.get(id) {
            HeapData::Tuple(tuple) => {
                for item in tuple.as_slice().to_vec() {
                    self.prepare_hash(item)?;
                }
            }
            HeapData::Instance(instance) => {
                let class = self.heap.class(instance.class);
                if class.is_unhashable() {
                    return Ok(());
                }
                if let Some(method) = class.special(SpecialMethod::Hash) {
                    let result = self.call_direct(method, &[value])?;
                    let Some(hash) = result.as_int() else {
                        return Err(ExcType::type_error("__hash__ method should return an integer"));
                    };
                    // truncation is the hash
                    self.heap.set_cached_hash(id, hash as u32);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn has_user_eq(&self, value: Value) -> bool {
        self.heap
            .instance_class(value)
            .is_some_and(|class| self.heap.class(class).special(SpecialMethod::Eq).is_some())
    }

    /// Hash of `key` and the key to use when probing the table of `owner`.
    ///
    /// When either side of a same-hash candidate defines `__eq__`, equality is decided
    /// by calling it and the stored key is returned on a match.
    pub(crate) fn table_key(&mut self, owner: HeapId, key: Value) -> RunResult<(Value, u32)> {
        let hash = self.hash(key)?;
        let candidates = self
            .heap
            .table(owner, TableSlot::Payload)
            .map(|table| table.keys_with_hash(hash))
            .unwrap_or_default();
        for candidate in candidates {
            if candidate == key {
                break;
            }
            if (self.has_user_eq(key) || self.has_user_eq(candidate)) && self.values_equal(candidate, key)? {
                return Ok((candidate, hash));
            }
        }
        Ok((key, hash))
    }

    fn expect_table(&self, value: Value) -> RunResult<HeapId> {
        match value {
            Value::Ref(id) if self.is_table_instance(value) => Ok(id),
            _ => Err(RunError::internal("expected a dict or set")),
        }
    }

    pub(crate) fn dict_get(&mut self, dict: Value, key: Value) -> RunResult<Option<Value>> {
        self.expect_table(dict)?;
        self.table_lookup(dict, key)
    }

    /// `dict[key] = value`. The caller keeps all three reachable.
    pub(crate) fn dict_set(&mut self, dict: Value, key: Value, value: Value) -> RunResult<()> {
        let id = self.expect_table(dict)?;
        let (key, hash) = self.table_key(id, key)?;
        let added = self
            .heap
            .with_table(id, TableSlot::Payload, |table, keys| table.set_hashed(keys, key, hash, value))?;
        if added {
            self.heap.tracker_mut().on_container_insert()?;
        }
        Ok(())
    }

    pub(crate) fn dict_delete(&mut self, dict: Value, key: Value) -> RunResult<bool> {
        let id = self.expect_table(dict)?;
        let (key, _) = self.table_key(id, key)?;
        self.heap
            .with_table(id, TableSlot::Payload, |table, keys| table.delete(keys, key))
    }

    pub(crate) fn set_add(&mut self, set: Value, item: Value) -> RunResult<()> {
        self.dict_set(set, item, Value::Bool(true))
    }

    // ========================================================================
    // Subscripts
    // ========================================================================

    /// `container[key]`.
    pub fn get_item(&mut self, container: Value, key: Value) -> RunResult<Value> {
        if let Some(slice) = self.slice_bounds(key) {
            if let Some(result) = self.get_slice(container, slice)? {
                return Ok(result);
            }
        } else if let Value::Ref(id) = container {
            match self.heap.get(id) {
                HeapData::Tuple(tuple) => {
                    let index = sequence_index("tuple", tuple.len(), key, &self.heap.type_name(key), "tuple")?;
                    return Ok(tuple.as_slice()[index]);
                }
                HeapData::Str(text) => {
                    let index = sequence_index("string", text.len(), key, &self.heap.type_name(key), "string")?;
                    let ch = text.codepoint_at(index).unwrap_or_default();
                    return self.new_str(ch.encode_utf8(&mut [0; 4]));
                }
                HeapData::Bytes(bytes) => {
                    let index = sequence_index("byte", bytes.len(), key, &self.heap.type_name(key), "bytes")?;
                    return Ok(Value::Int(i64::from(bytes.as_slice()[index])));
                }
                HeapData::Instance(instance) => match &instance.payload {
                    Payload::List(items) => {
                        let index = sequence_index("list", items.len(), key, &self.heap.type_name(key), "list")?;
                        return Ok(items[index]);
                    }
                    Payload::Dict(_) => {
                        if let Some(value) = self.table_lookup(container, key)? {
                            return Ok(value);
                        }
                        if let Some(missing) = self.call_special(container, SpecialMethod::GetItem, &[key])? {
                            return Ok(missing);
                        }
                        let repr = self.repr(key)?;
                        return Err(ExcType::key_error(repr));
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        match self.call_special(container, SpecialMethod::GetItem, &[key])? {
            Some(value) => Ok(value),
            None => Err(ExcType::type_error(format!(
                "'{}' object is not subscriptable",
                self.heap.type_name(container)
            ))),
        }
    }

    /// `container[key] = value`.
    pub fn set_item(&mut self, container: Value, key: Value, value: Value) -> RunResult<()> {
        if let Value::Ref(id) = container
            && let Some(instance) = self.heap.instance(id)
        {
            match &instance.payload {
                Payload::List(items) if self.slice_bounds(key).is_none() => {
                    let index = sequence_index("list", items.len(), key, &self.heap.type_name(key), "list assignment")?;
                    if let Some(items) = self.list_items_mut(container) {
                        items[index] = value;
                    }
                    return Ok(());
                }
                Payload::Dict(_) => return self.dict_set(container, key, value),
                _ => {}
            }
        }
        match self.call_special(container, SpecialMethod::SetItem, &[key, value])? {
            Some(_) => Ok(()),
            None => Err(ExcType::type_error(format!(
                "'{}' object does not support item assignment",
                self.heap.type_name(container)
            ))),
        }
    }

    /// `del container[key]`.
    pub fn delete_item(&mut self, container: Value, key: Value) -> RunResult<()> {
        if let Value::Ref(id) = container
            && let Some(instance) = self.heap.instance(id)
        {
            match &instance.payload {
                Payload::List(items) if self.slice_bounds(key).is_none() => {
                    let index = sequence_index("list", items.len(), key, &self.heap.type_name(key), "list assignment")?;
                    if let Some(items) = self.list_items_mut(container) {
                        items.remove(index);
                    }
                    return Ok(());
                }
                Payload::Dict(_) => {
                    if self.dict_delete(container, key)? {
                        return Ok(());
                    }
                    let repr = self.repr(key)?;
                    return Err(ExcType::key_error(repr));
                }
                _ => {}
            }
        }
        match self.call_special(container, SpecialMethod::DelItem, &[key])? {
            Some(_) => Ok(()),
            None => Err(ExcType::type_error(format!(
                "'{}' object doesn't support item deletion",
                self.heap.type_name(container)
            ))),
        }
    }

    /// The `(start, stop, step)` of a slice object.
    fn slice_bounds(&self, key: Value) -> Option<(Value, Value, Value)> {
        match self.heap.instance(key.as_heap_id()?)?.payload {
            Payload::Slice { start, stop, step } => Some((start, stop, step)),
            _ => None,
        }
    }

    /// Slices a str, tuple or list; `None` for other containers.
    fn get_slice(&mut self, container: Value, (start, stop, step): (Value, Value, Value)) -> RunResult<Option<Value>> {
        let Value::Ref(id) = container else {
            return Ok(None);
        };
        if let HeapData::Str(text) = self.heap.get(id) {
            let indices = slice_indices(text.len(), start, stop, step)?;
            let chars: Vec<char> = text.as_str().chars().collect();
            let sliced: String = indices.into_iter().map(|i| chars[i]).collect();
            return self.new_str(&sliced).map(Some);
        }
        let is_tuple = matches!(self.heap.get(id), HeapData::Tuple(_));
        if !is_tuple && self.list_items(container).is_none() {
            return Ok(None);
        }
        let items = self.sequence_items(container);
        let indices = slice_indices(items.len(), start, stop, step)?;
        let sliced: Vec<Value> = indices.into_iter().map(|i| items[i]).collect();
        if is_tuple {
            self.new_tuple(sliced).map(Some)
        } else {
            self.new_list(sliced).map(Some)
        }
    }

    // ========================================================================
    // Length and truth
    // ========================================================================

    /// `len(value)`.
    pub fn len_of(&mut self, value: Value) -> RunResult<usize> {
        if let Value::Ref(id) = value {
            match self.heap.get(id) {
                HeapData::Str(text) => return Ok(text.len()),
                HeapData::Bytes(bytes) => return Ok(bytes.len()),
                HeapData::Tuple(tuple) => return Ok(tuple.len()),
                HeapData::Instance(instance) => match &instance.payload {
                    Payload::List(items) => return Ok(items.len()),
                    Payload::Dict(table) | Payload::Set(table) => return Ok(table.len()),
                    _ => {}
                },
                _ => {}
            }
        }
        match self.call_special(value, SpecialMethod::Len, &[])? {
            Some(result) => match result.as_int() {
                Some(n) if n >= 0 => Ok(usize::try_from(n).unwrap_or_default()),
                Some(_) => Err(ExcType::value_error("__len__() should return >= 0")),
                None => Err(ExcType::type_error(format!(
                    "'{}' object cannot be interpreted as an integer",
                    self.heap.type_name(result)
                ))),
            },
            None => Err(ExcType::type_error(format!(
                "object of type '{}' has no len()",
                self.heap.type_name(value)
            ))),
        }
    }

    /// Truth value: `__bool__`, then `__len__`, else true.
    pub fn is_truthy(&mut self, value: Value) -> RunResult<bool> {
        match value {
            Value::None => return Ok(false),
            Value::Bool(b) => return Ok(b),
            Value::Int(i) => return Ok(i != 0),
            Value::Float(x) => return Ok(x != 0.0),
            Value::NotImplemented | Value::Handler(_) | Value::Kwargs(_) => return Ok(true),
            Value::Ref(_) => {}
        }
        if let Some(result) = self.call_special(value, SpecialMethod::Bool, &[])? {
            return self.is_truthy(result);
        }
        let class = self.class_of(value);
        let has_len = self.heap.class(class).special(SpecialMethod::Len).is_some();
        let builtin_len = matches!(
            value.as_heap_id().map(|id| self.heap.get(id)),
            Some(HeapData::Str(_) | HeapData::Bytes(_) | HeapData::Tuple(_))
        ) || self.list_items(value).is_some()
            || self.is_table_instance(value);
        if has_len || builtin_len {
            return Ok(self.len_of(value)? != 0);
        }
        Ok(true)
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// `iter(value)`.
    ///
    /// `__iter__` wins; built-in sequences and tables get a native iterator.
    pub fn get_iter(&mut self, value: Value) -> RunResult<Value> {
        if let Some(iterator) = self.call_special(value, SpecialMethod::Iter, &[])? {
            return Ok(iterator);
        }
        let iterable = match value.as_heap_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Str(_) | HeapData::Bytes(_) | HeapData::Tuple(_)) => true,
            Some(HeapData::Instance(instance)) => {
                matches!(instance.payload, Payload::List(_) | Payload::Dict(_) | Payload::Set(_))
            }
            _ => false,
        };
        if !iterable {
            return Err(ExcType::type_error(format!(
                "'{}' object is not iterable",
                self.heap.type_name(value)
            )));
        }
        let id = self.allocate(HeapData::Instance(Instance {
            class: self.classes.iterator,
            fields: Table::new(),
            payload: Payload::Iterator(IterState {
                source: value,
                position: 0,
            }),
        }))?;
        Ok(Value::Ref(id))
    }

    /// Next item of `iterator`, or `None` once it is exhausted.
    ///
    /// Anything other than a native iterator is called with no arguments and is
    /// exhausted when the call returns the iterator itself.
    pub fn iterator_next(&mut self, iterator: Value) -> RunResult<Option<Value>> {
        if let Some(state) = self.native_iter_state(iterator) {
            return self.advance_native(iterator, state);
        }
        let item = self.call_direct(iterator, &[])?;
        Ok((item != iterator).then_some(item))
    }

    fn native_iter_state(&self, iterator: Value) -> Option<IterState> {
        match self.heap.instance(iterator.as_heap_id()?)?.payload {
            Payload::Iterator(state) => Some(state),
            _ => None,
        }
    }

    fn advance_native(&mut self, iterator: Value, state: IterState) -> RunResult<Option<Value>> {
        let IterState { source, position } = state;
        let Value::Ref(id) = source else {
            return Ok(None);
        };
        let (item, next) = match self.heap.get(id) {
            HeapData::Tuple(tuple) => match tuple.get(position) {
                Some(item) => (item, position + 1),
                None => return Ok(None),
            },
            HeapData::Bytes(bytes) => match bytes.as_slice().get(position) {
                Some(&b) => (Value::Int(i64::from(b)), position + 1),
                None => return Ok(None),
            },
            HeapData::Str(text) => match text.codepoint_at(position) {
                Some(ch) => (self.new_str(ch.encode_utf8(&mut [0; 4]))?, position + 1),
                None => return Ok(None),
            },
            HeapData::Instance(instance) => match &instance.payload {
                Payload::List(items) => match items.get(position) {
                    Some(&item) => (item, position + 1),
                    None => return Ok(None),
                },
                Payload::Dict(table) | Payload::Set(table) => match table.next_entry(position) {
                    Some((at, key, _)) => (key, at + 1),
                    None => return Ok(None),
                },
                _ => return Ok(None),
            },
            _ => return Ok(None),
        };
        if let Some(instance) = iterator.as_heap_id().and_then(|it| self.heap.instance_mut(it))
            && let Payload::Iterator(state) = &mut instance.payload
        {
            state.position = next;
        }
        Ok(Some(item))
    }

    /// Every item `value` yields, in order.
    ///
    /// Items are kept on the stack while user iterators run; the returned vector is not
    /// rooted.
    pub fn collect_iterable(&mut self, value: Value) -> RunResult<Vec<Value>> {
        if self.is_tuple(value) || self.list_items(value).is_some() {
            return Ok(self.sequence_items(value).to_vec());
        }
        let base = self.thread.stack.len();
        self.push(value);
        let result = self.collect_onto_stack(value);
        let items = self.thread.stack.split_off(base + 1);
        self.thread.stack.truncate(base);
        result.map(|()| items.into_iter().skip(1).collect())
    }

    fn collect_onto_stack(&mut self, value: Value) -> RunResult<()> {
        let iterator = self.get_iter(value)?;
        self.push(iterator);
        while let Some(item) = self.iterator_next(iterator)? {
            self.push(item);
        }
        Ok(())
    }
}

/// Resolves a possibly negative index against `len`.
///
/// `what` names the sequence in the `IndexError` message.
fn sequence_index(type_name: &str, len: usize, key: Value, key_type: &str, what: &str) -> RunResult<usize> {
    let Some(index) = key.as_int() else {
        return Err(ExcType::type_error(format!(
            "{type_name} indices must be integers or slices, not {key_type}"
        )));
    };
    let len = len as i64;
    let resolved = if index < 0 { index + len } else { index };
    if (0..len).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(ExcType::index_error(what))
    }
}

/// Indices selected by `[start:stop:step]` over a sequence of length `len`.
pub(crate) fn slice_indices(len: usize, start: Value, stop: Value, step: Value) -> RunResult<Vec<usize>> {
    let bound = |value: Value, what: &str| -> RunResult<Option<i64>> {
        match value {
            Value::None => Ok(None),
            other => other
                .as_int()
                .map(Some)
                .ok_or_else(|| ExcType::type_error(format!("slice {what} must be an integer or None"))),
        }
    };
    let len = len as i64;
    let step = bound(step, "step")?.unwrap_or(1);
    if step == 0 {
        return Err(ExcType::value_error("slice step cannot be zero"));
    }
    let adjust = |index: i64, low: i64, high: i64| {
        let index = if index < 0 { index + len } else { index };
        index.clamp(low, high)
    };
    let (start, stop) = if step > 0 {
        (
            bound(start, "start")?.map_or(0, |i| adjust(i, 0, len)),
            bound(stop, "stop")?.map_or(len, |i| adjust(i, 0, len)),
        )
    } else {
        (
            bound(start, "start")?.map_or(len - 1, |i| adjust(i, -1, len - 1)),
            bound(stop, "stop")?.map_or(-1, |i| adjust(i, -1, len - 1)),
        )
    };

    let mut indices = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        indices.push(i as usize);
        i += step;
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_follow_python_rules() {
        let none = Value::None;
        assert_eq!(slice_indices(5, none, none, none).unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(slice_indices(5, Value::Int(1), Value::Int(-1), none).unwrap(), vec![1, 2, 3]);
        assert_eq!(slice_indices(5, none, none, Value::Int(-2)).unwrap(), vec![4, 2, 0]);
        assert_eq!(slice_indices(5, Value::Int(10), none, none).unwrap(), Vec::<usize>::new());
        assert_eq!(slice_indices(3, Value::Int(-10), Value::Int(10), none).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn zero_step_is_rejected() {
        let err = slice_indices(3, Value::None, Value::None, Value::Int(0)).unwrap_err();
        assert_eq!(err.to_string(), "ValueError: slice step cannot be zero");
    }

    #[test]
    fn negative_indices_wrap_once() {
        assert_eq!(sequence_index("list", 3, Value::Int(-1), "int", "list").unwrap(), 2);
        let err = sequence_index("list", 3, Value::Int(-4), "int", "list").unwrap_err();
        assert_eq!(err.to_string(), "IndexError: list index out of range");
    }
}
