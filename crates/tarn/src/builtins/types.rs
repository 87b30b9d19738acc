//! Constructors of the built-in value types.
//!
//! Each one is installed as the class's `__new__`, so it receives the class being
//! instantiated as its first argument. Subclasses of these types construct the base
//! value; they do not get instances of their own.

use super::expect_str;
use crate::{
    args::ArgValues,
    bytecode::Vm,
    exception_private::{ExcType, RunResult},
    heap::HeapData,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

/// `type(obj)` returns the class of `obj`; `type(name, bases, namespace)` creates a
/// class.
pub(super) fn type_new<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (_, args) = args.receiver("type")?;
    match *args.positional("type")? {
        [obj] => Ok(Value::Ref(vm.class_of(obj))),
        [name, bases, namespace] => {
            let name = expect_str(vm, name, "type.__new__() argument 1")?;
            let base = match bases.as_heap_id().map(|id| vm.heap().get(id)) {
                Some(HeapData::Tuple(tuple)) => match *tuple.as_slice() {
                    [] => Value::None,
                    [base] => base,
                    _ => return Err(ExcType::type_error("multiple bases are not supported")),
                },
                _ => bases,
            };
            let Some(members) = vm.dict_entries(namespace) else {
                return Err(ExcType::type_error(format!(
                    "type.__new__() argument 3 must be dict, not {}",
                    vm.heap().type_name(namespace)
                )));
            };
            let class = vm.make_class(name, base)?;
            for (key, value) in members {
                let key = expect_str(vm, key, "attribute name")?;
                vm.define_method(Value::Ref(class), key, value)?;
            }
            vm.finalize_class(class);
            Ok(Value::Ref(class))
        }
        ref other => Err(ExcType::type_error(format!(
            "type() takes 1 or 3 arguments, got {}",
            other.len()
        ))),
    }
}

pub(super) fn str_new<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (_, args) = args.receiver("str")?;
    match args.get_zero_one_arg("str")? {
        None => vm.new_str(""),
        Some(value) if vm.heap().as_str(value).is_some() => Ok(value),
        Some(value) => {
            let text = vm.to_str(value)?;
            vm.new_str(&text)
        }
    }
}

pub(super) fn int_new<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (_, args) = args.receiver("int")?;
    let Some(value) = args.get_zero_one_arg("int")? else {
        return Ok(Value::Int(0));
    };
    if let Some(i) = value.as_int() {
        return Ok(Value::Int(i));
    }
    if let Value::Float(x) = value {
        if x.is_nan() {
            return Err(ExcType::value_error("cannot convert float NaN to integer"));
        }
        if x.is_infinite() {
            return Err(ExcType::value_error("cannot convert float infinity to integer"));
        }
        return Ok(Value::int(x.trunc() as i64));
    }
    if let Some(text) = vm.heap().as_str(value) {
        return match text.trim().replace('_', "").parse::<i64>() {
            Ok(i) => Ok(Value::int(i)),
            Err(_) => {
                let shown = vm.repr(value)?;
                Err(ExcType::value_error(format!("invalid literal for int() with base 10: {shown}")))
            }
        };
    }
    Err(ExcType::type_error(format!(
        "int() argument must be a string or a number, not '{}'",
        vm.heap().type_name(value)
    )))
}

pub(super) fn float_new<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (_, args) = args.receiver("float")?;
    let Some(value) = args.get_zero_one_arg("float")? else {
        return Ok(Value::Float(0.0));
    };
    if let Some(x) = value.as_number() {
        return Ok(Value::Float(x));
    }
    if let Some(text) = vm.heap().as_str(value) {
        return match text.trim().parse::<f64>() {
            Ok(x) => Ok(Value::Float(x)),
            Err(_) => {
                let shown = vm.repr(value)?;
                Err(ExcType::value_error(format!("could not convert string to float: {shown}")))
            }
        };
    }
    Err(ExcType::type_error(format!(
        "float() argument must be a string or a number, not '{}'",
        vm.heap().type_name(value)
    )))
}

pub(super) fn bool_new<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (_, args) = args.receiver("bool")?;
    match args.get_zero_one_arg("bool")? {
        None => Ok(Value::Bool(false)),
        Some(value) => Ok(Value::Bool(vm.is_truthy(value)?)),
    }
}

pub(super) fn tuple_new<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (_, args) = args.receiver("tuple")?;
    let Some(iterable) = args.get_zero_one_arg("tuple")? else {
        return vm.new_tuple(Vec::new());
    };
    if matches!(iterable.as_heap_id().map(|id| vm.heap().get(id)), Some(HeapData::Tuple(_))) {
        return Ok(iterable);
    }
    let items = vm.collect_iterable(iterable)?;
    vm.with_gc_paused(|vm| vm.new_tuple(items))
}

/// `BaseException.__init__(self, *args)`: stores the argument (a tuple when there
/// are several) as the `arg` field.
pub(super) fn exception_init<T: ResourceTracker, Tr: VmTracer>(
    vm: &mut Vm<T, Tr>,
    args: ArgValues<'_>,
) -> RunResult<Value> {
    let (receiver, args) = args.receiver("__init__")?;
    let Some(exc) = receiver.as_heap_id() else {
        return Err(ExcType::type_error("__init__ requires an exception instance"));
    };
    let arg = match *args.positional("BaseException")? {
        [] => Value::None,
        [arg] => arg,
        ref several => {
            let items = several.to_vec();
            vm.new_tuple(items)?
        }
    };
    vm.push(arg);
    let key = vm.intern("arg");
    vm.pop();
    vm.set_field(exc, Value::Ref(key?), arg)?;
    Ok(Value::None)
}
