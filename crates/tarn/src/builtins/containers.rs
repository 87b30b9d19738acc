//! Methods of `list`, `dict`, `set` and `str`.

use crate::{
    args::ArgValues,
    bytecode::Vm,
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::HeapData,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

fn expect_list<T: ResourceTracker, Tr: VmTracer>(vm: &Vm<T, Tr>, value: Value, method: &str) -> RunResult<()> {
    match vm.list_items(value) {
        Some(_) => Ok(()),
        None => Err(ExcType::type_error(format!(
            "descriptor '{method}' requires a 'list' object but received a '{}'",
            vm.heap().type_name(value)
        ))),
    }
}

fn list_mut<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, list: Value) -> RunResult<&mut Vec<Value>> {
    vm.list_items_mut(list)
        .ok_or_else(|| RunError::internal("list payload vanished"))
}

/// `list.__init__(self[, iterable])` replaces the contents.
pub(super) fn list_init<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (list, args) = args.receiver("__init__")?;
    expect_list(vm, list, "__init__")?;
    let items = match args.get_zero_one_arg("list")? {
        Some(iterable) => vm.collect_iterable(iterable)?,
        None => Vec::new(),
    };
    *list_mut(vm, list)? = items;
    Ok(Value::None)
}

pub(super) fn list_append<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (list, args) = args.receiver("append")?;
    expect_list(vm, list, "append")?;
    let item = args.get_one_arg("list.append")?;
    vm.heap_mut().tracker_mut().on_container_insert()?;
    list_mut(vm, list)?.push(item);
    Ok(Value::None)
}

/// `list.pop(self[, index])`, the last item by default.
pub(super) fn list_pop<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (list, args) = args.receiver("pop")?;
    expect_list(vm, list, "pop")?;
    let index = args.get_zero_one_arg("pop")?;
    let items = list_mut(vm, list)?;
    if items.is_empty() {
        return Err(SimpleException::new_msg(ExcType::IndexError, "pop from empty list").into());
    }
    let len = items.len() as i64;
    let index = match index {
        None => len - 1,
        Some(value) => match value.as_int() {
            Some(i) if i < 0 => i + len,
            Some(i) => i,
            None => return Err(ExcType::type_error("list indices must be integers")),
        },
    };
    if !(0..len).contains(&index) {
        return Err(SimpleException::new_msg(ExcType::IndexError, "pop index out of range").into());
    }
    Ok(items.remove(index as usize))
}

pub(super) fn list_extend<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (list, args) = args.receiver("extend")?;
    expect_list(vm, list, "extend")?;
    let iterable = args.get_one_arg("list.extend")?;
    // the list itself stays reachable through the caller's arguments
    let items = vm.collect_iterable(iterable)?;
    for _ in &items {
        vm.heap_mut().tracker_mut().on_container_insert()?;
    }
    list_mut(vm, list)?.extend(items);
    Ok(Value::None)
}

/// `dict.__init__(self[, mapping_or_pairs], **kwargs)`.
pub(super) fn dict_init<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (dict, rest) = args.receiver("__init__")?;
    let source = match *rest.positional_any() {
        [] => None,
        [source] => Some(source),
        ref several => return Err(ExcType::type_error_at_most("dict", 1, several.len())),
    };
    if let Some(source) = source {
        let pairs = match vm.dict_entries(source) {
            Some(pairs) => pairs,
            None => {
                let items = vm.collect_iterable(source)?;
                pairs_of(vm, &items)?
            }
        };
        // pairs taken from a collected iterable are only held here
        vm.with_gc_paused(|vm| {
            for (key, value) in pairs {
                vm.dict_set(dict, key, value)?;
            }
            Ok::<_, RunError>(())
        })?;
    }
    if let Some(kwargs) = rest.kwargs()
        && let Some(pairs) = vm.dict_entries(kwargs)
    {
        for (key, value) in pairs {
            vm.dict_set(dict, key, value)?;
        }
    }
    Ok(Value::None)
}

/// Splits each item of a `dict()` source into its key and value.
fn pairs_of<T: ResourceTracker, Tr: VmTracer>(vm: &Vm<T, Tr>, items: &[Value]) -> RunResult<Vec<(Value, Value)>> {
    items
        .iter()
        .enumerate()
        .map(|(index, &item)| {
            let is_sequence = vm.list_items(item).is_some()
                || matches!(item.as_heap_id().map(|id| vm.heap().get(id)), Some(HeapData::Tuple(_)));
            if !is_sequence {
                return Err(ExcType::type_error(format!(
                    "cannot convert dictionary update sequence element #{index} to a sequence"
                )));
            }
            match *vm.sequence_items(item) {
                [key, value] => Ok((key, value)),
                ref other => Err(ExcType::value_error(format!(
                    "dictionary update sequence element #{index} has length {}; 2 is required",
                    other.len()
                ))),
            }
        })
        .collect()
}

/// `dict.get(self, key[, default])`.
pub(super) fn dict_get<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (dict, args) = args.receiver("get")?;
    let (key, default) = args.get_one_two_args("get")?;
    Ok(vm.dict_get(dict, key)?.unwrap_or(default.unwrap_or(Value::None)))
}

fn entries<T: ResourceTracker, Tr: VmTracer>(vm: &Vm<T, Tr>, dict: Value, method: &str) -> RunResult<Vec<(Value, Value)>> {
    vm.dict_entries(dict).ok_or_else(|| {
        ExcType::type_error(format!(
            "descriptor '{method}' requires a 'dict' object but received a '{}'",
            vm.heap().type_name(dict)
        ))
    })
}

pub(super) fn dict_keys<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (dict, args) = args.receiver("keys")?;
    args.check_zero_args("keys")?;
    let keys = entries(vm, dict, "keys")?.into_iter().map(|(key, _)| key).collect();
    vm.new_list(keys)
}

pub(super) fn dict_values<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (dict, args) = args.receiver("values")?;
    args.check_zero_args("values")?;
    let values = entries(vm, dict, "values")?.into_iter().map(|(_, value)| value).collect();
    vm.new_list(values)
}

/// `dict.items(self)`: a list of `(key, value)` tuples.
pub(super) fn dict_items<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (dict, args) = args.receiver("items")?;
    args.check_zero_args("items")?;
    let pairs = entries(vm, dict, "items")?;
    vm.with_gc_paused(|vm| {
        let mut items = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            items.push(vm.new_tuple(vec![key, value])?);
        }
        vm.new_list(items)
    })
}

/// `set.__init__(self[, iterable])`.
pub(super) fn set_init<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (set, args) = args.receiver("__init__")?;
    let Some(iterable) = args.get_zero_one_arg("set")? else {
        return Ok(Value::None);
    };
    let items = vm.collect_iterable(iterable)?;
    vm.with_gc_paused(|vm| {
        for item in items {
            vm.set_add(set, item)?;
        }
        Ok(Value::None)
    })
}

pub(super) fn set_add<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (set, args) = args.receiver("add")?;
    let item = args.get_one_arg("set.add")?;
    vm.set_add(set, item)?;
    Ok(Value::None)
}

pub(super) fn set_remove<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (set, args) = args.receiver("remove")?;
    let item = args.get_one_arg("set.remove")?;
    if vm.dict_delete(set, item)? {
        Ok(Value::None)
    } else {
        Err(ExcType::key_error(vm.repr(item)?))
    }
}

/// `str.join(self, iterable)`.
pub(super) fn str_join<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (separator, args) = args.receiver("join")?;
    let iterable = args.get_one_arg("str.join")?;
    let items = vm.collect_iterable(iterable)?;
    let mut parts = Vec::with_capacity(items.len());
    for (index, &item) in items.iter().enumerate() {
        match vm.heap().as_str(item) {
            Some(text) => parts.push(text),
            None => {
                return Err(ExcType::type_error(format!(
                    "sequence item {index}: expected str instance, {} found",
                    vm.heap().type_name(item)
                )));
            }
        }
    }
    let Some(separator) = vm.heap().as_str(separator) else {
        return Err(ExcType::type_error("descriptor 'join' requires a 'str' object"));
    };
    let joined = parts.join(separator);
    vm.new_str(&joined)
}
