//! Functions bound in the builtins module.

use super::expect_str;
use crate::{
    args::ArgValues,
    bytecode::Vm,
    exception_private::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    resource::ResourceTracker,
    tracer::VmTracer,
    types::Protocol,
    value::Value,
};

pub(super) fn builtin_len<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let value = args.get_one_arg("len")?;
    let len = vm.len_of(value)?;
    Ok(Value::int(i64::try_from(len).unwrap_or(i64::MAX)))
}

pub(super) fn builtin_repr<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let value = args.get_one_arg("repr")?;
    let text = vm.repr(value)?;
    vm.new_str(&text)
}

pub(super) fn builtin_hash<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let value = args.get_one_arg("hash")?;
    Ok(Value::Int(i64::from(vm.hash(value)?)))
}

pub(super) fn builtin_iter<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let value = args.get_one_arg("iter")?;
    vm.get_iter(value)
}

/// `isinstance(obj, classinfo)`, where `classinfo` is a class or a (nested) tuple of
/// classes.
pub(super) fn builtin_isinstance<T: ResourceTracker, Tr: VmTracer>(
    vm: &mut Vm<T, Tr>,
    args: ArgValues<'_>,
) -> RunResult<Value> {
    let (obj, classinfo) = args.get_two_args("isinstance")?;
    let class = vm.class_of(obj);
    match subclass_check(vm, class, classinfo) {
        Some(result) => Ok(Value::Bool(result)),
        None => Err(ExcType::type_error("isinstance() arg 2 must be a type or tuple of types")),
    }
}

pub(super) fn builtin_issubclass<T: ResourceTracker, Tr: VmTracer>(
    vm: &mut Vm<T, Tr>,
    args: ArgValues<'_>,
) -> RunResult<Value> {
    let (class, classinfo) = args.get_two_args("issubclass")?;
    let Some(class) = as_class(vm, class) else {
        return Err(ExcType::type_error("issubclass() arg 1 must be a class"));
    };
    match subclass_check(vm, class, classinfo) {
        Some(result) => Ok(Value::Bool(result)),
        None => Err(ExcType::type_error("issubclass() arg 2 must be a class or tuple of classes")),
    }
}

/// `None` when `classinfo` is neither a class nor a tuple of them.
fn subclass_check<T: ResourceTracker, Tr: VmTracer>(vm: &Vm<T, Tr>, class: HeapId, classinfo: Value) -> Option<bool> {
    if let Some(target) = as_class(vm, classinfo) {
        return Some(vm.is_subclass(class, target));
    }
    let Value::Ref(id) = classinfo else {
        return None;
    };
    let HeapData::Tuple(tuple) = vm.heap().get(id) else {
        return None;
    };
    let mut found = false;
    for &item in tuple.as_slice() {
        found |= subclass_check(vm, class, item)?;
    }
    Some(found)
}

fn as_class<T: ResourceTracker, Tr: VmTracer>(vm: &Vm<T, Tr>, value: Value) -> Option<HeapId> {
    value
        .as_heap_id()
        .filter(|&id| matches!(vm.heap().get(id), HeapData::Class(_)))
}

/// `getattr(obj, name[, default])`.
pub(super) fn builtin_getattr<T: ResourceTracker, Tr: VmTracer>(
    vm: &mut Vm<T, Tr>,
    args: ArgValues<'_>,
) -> RunResult<Value> {
    let positional = args.positional("getattr")?;
    let (obj, name, default) = match *positional {
        [obj, name] => (obj, name, None),
        [obj, name, default] => (obj, name, Some(default)),
        [] | [_] => return Err(ExcType::type_error_at_least("getattr", 2, positional.len())),
        _ => return Err(ExcType::type_error_at_most("getattr", 3, positional.len())),
    };
    let name = expect_str(vm, name, "attribute name")?;
    match (vm.get_attribute(obj, name), default) {
        (Err(err), Some(default)) if is_attribute_error(vm, &err) => Ok(default),
        (result, _) => result,
    }
}

pub(super) fn builtin_setattr<T: ResourceTracker, Tr: VmTracer>(
    vm: &mut Vm<T, Tr>,
    args: ArgValues<'_>,
) -> RunResult<Value> {
    let (obj, name, value) = args.get_three_args("setattr")?;
    let name = expect_str(vm, name, "attribute name")?;
    vm.set_attribute(obj, name, value)?;
    Ok(Value::None)
}

pub(super) fn builtin_hasattr<T: ResourceTracker, Tr: VmTracer>(
    vm: &mut Vm<T, Tr>,
    args: ArgValues<'_>,
) -> RunResult<Value> {
    let (obj, name) = args.get_two_args("hasattr")?;
    let name = expect_str(vm, name, "attribute name")?;
    match vm.get_attribute(obj, name) {
        Ok(_) => Ok(Value::Bool(true)),
        Err(err) if is_attribute_error(vm, &err) => Ok(Value::Bool(false)),
        Err(err) => Err(err),
    }
}

/// Whether an error is an `AttributeError`, materialized or not.
fn is_attribute_error<T: ResourceTracker, Tr: VmTracer>(vm: &Vm<T, Tr>, err: &RunError) -> bool {
    match err {
        RunError::Exc(exc) => exc.exc_type().is_subclass_of(ExcType::AttributeError),
        RunError::Raised(exc) => vm.is_instance(*exc, vm.exception_class(ExcType::AttributeError)),
        _ => false,
    }
}

/// `callable(obj)`: functions, methods, classes and instances whose class defines
/// `__call__`.
pub(super) fn builtin_callable<T: ResourceTracker, Tr: VmTracer>(
    vm: &mut Vm<T, Tr>,
    args: ArgValues<'_>,
) -> RunResult<Value> {
    let value = args.get_one_arg("callable")?;
    let callable = match value.as_heap_id().map(|id| vm.heap().get(id)) {
        Some(HeapData::Closure(_) | HeapData::Native(_) | HeapData::BoundMethod(_) | HeapData::Class(_)) => true,
        Some(HeapData::Instance(instance)) => vm.heap().class(instance.class).supports(Protocol::Callable),
        _ => false,
    };
    Ok(Value::Bool(callable))
}
