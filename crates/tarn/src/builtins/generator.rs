//! Methods of generator objects and native iterators.
//!
//! Calling a generator resumes it. Once the body finishes, every call returns the
//! generator itself, which is the exhaustion signal `for` loops watch for.

use crate::{
    args::ArgValues,
    bytecode::Vm,
    exception_private::{ExcType, RunResult},
    heap::HeapId,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

fn expect_generator<T: ResourceTracker, Tr: VmTracer>(vm: &Vm<T, Tr>, value: Value) -> RunResult<HeapId> {
    match value.as_heap_id() {
        Some(id) if vm.generator_state(id).is_ok() => Ok(id),
        _ => Err(ExcType::type_error(format!(
            "expected a generator, not '{}'",
            vm.heap().type_name(value)
        ))),
    }
}

/// `gen()`: resumes with `None`.
pub(super) fn gen_call<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (generator, args) = args.receiver("__call__")?;
    args.check_zero_args("generator")?;
    let id = expect_generator(vm, generator)?;
    vm.resume_generator(id, Value::None)
}

/// `gen.send(value)`: resumes with `value` as the result of the pending `yield`.
pub(super) fn gen_send<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (generator, args) = args.receiver("send")?;
    let sent = args.get_one_arg("send")?;
    let id = expect_generator(vm, generator)?;
    vm.resume_generator(id, sent)
}

/// `gen.__finish__()`: the value the body returned.
pub(super) fn gen_finish<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (generator, args) = args.receiver("__finish__")?;
    args.check_zero_args("__finish__")?;
    let id = expect_generator(vm, generator)?;
    vm.generator_result(id)
}

pub(super) fn gen_running<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (generator, args) = args.receiver("gi_running")?;
    args.check_zero_args("gi_running")?;
    let id = expect_generator(vm, generator)?;
    Ok(Value::Bool(vm.generator_state(id)?.running))
}

/// `__iter__` of generators and iterators.
pub(super) fn self_iter(args: ArgValues<'_>) -> RunResult<Value> {
    let (receiver, args) = args.receiver("__iter__")?;
    args.check_zero_args("__iter__")?;
    Ok(receiver)
}

/// Calling a native iterator advances it.
pub(super) fn iter_next<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, args: ArgValues<'_>) -> RunResult<Value> {
    let (iterator, args) = args.receiver("__call__")?;
    args.check_zero_args("iterator")?;
    Ok(vm.iterator_next(iterator)?.unwrap_or(iterator))
}
