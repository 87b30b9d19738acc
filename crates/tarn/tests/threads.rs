//! Tests for running callables on OS threads over a shared VM.

use pretty_assertions::assert_eq;
use tarn::{CodeBuilder, ExcType, GcConfig, NoLimitTracker, Object, Opcode, SharedVm, Value, Vm};

type TestVm = Vm<NoLimitTracker>;

/// Defines in module `workers`:
///
/// ```text
/// results = []
/// def square(x): results.append(x); return [x * x]
/// def fail(): raise ValueError("worker failed")
/// ```
fn workers(vm: &mut TestVm) {
    let mut square = CodeBuilder::new(vm, "square").unwrap();
    square.params(vm, &["x"], 1).unwrap();
    square.emit_named(vm, Opcode::LoadGlobal, "results").unwrap();
    square.emit_named(vm, Opcode::GetAttr, "append").unwrap();
    square.emit_u16(Opcode::LoadLocal, 0);
    square.emit_u8(Opcode::Call, 1);
    square.emit(Opcode::Pop);
    square.emit_u16(Opcode::LoadLocal, 0);
    square.emit_u16(Opcode::LoadLocal, 0);
    square.emit(Opcode::Mul);
    square.emit_u16(Opcode::BuildList, 1);
    square.emit(Opcode::Return);
    let square = square.build(vm).unwrap();

    let mut fail = CodeBuilder::new(vm, "fail").unwrap();
    fail.emit_named(vm, Opcode::LoadGlobal, "ValueError").unwrap();
    let message = fail.name(vm, "worker failed").unwrap();
    fail.emit_u16(Opcode::LoadConst, message);
    fail.emit_u8(Opcode::Call, 1);
    fail.emit(Opcode::Raise);
    let fail = fail.build(vm).unwrap();

    let mut module = CodeBuilder::new(vm, "<module>").unwrap();
    module.emit_u16(Opcode::BuildList, 0);
    module.emit_named(vm, Opcode::StoreGlobal, "results").unwrap();
    for (name, code) in [("square", square), ("fail", fail)] {
        let index = module.add_const(vm, Value::Ref(code));
        module.emit_closure(index, &[]);
        module.emit_named(vm, Opcode::StoreGlobal, name).unwrap();
    }
    module.emit(Opcode::LoadNone);
    module.emit(Opcode::Return);
    let module = module.build(vm).unwrap();
    vm.run_module("workers", module).unwrap();
}

fn global(vm: &TestVm, name: &str) -> Value {
    let module = vm.module("workers").unwrap();
    vm.get_global(module, name).unwrap()
}

fn shared_workers() -> SharedVm<NoLimitTracker> {
    let mut vm = Vm::new(NoLimitTracker);
    workers(&mut vm);
    SharedVm::new(vm)
}

#[test]
fn joined_thread_returns_its_result() {
    let shared = shared_workers();
    let square = global(&shared.lock(), "square");
    let handle = shared.spawn(square, &[Value::Int(7)]);
    assert_eq!(handle.join().unwrap(), Object::List(vec![Object::Int(49)]));
}

#[test]
fn every_thread_sees_the_shared_heap() {
    let shared = shared_workers();
    let square = global(&shared.lock(), "square");
    let handles: Vec<_> = (1..=4).map(|n| shared.spawn(square, &[Value::Int(n)])).collect();
    let mut ids: Vec<usize> = handles.iter().map(tarn::ThreadHandle::id).collect();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    for handle in handles {
        handle.join().unwrap();
    }

    let mut vm = shared.lock();
    let results = global(&vm, "results");
    let Object::List(mut items) = vm.to_object(results) else {
        panic!("results is a list");
    };
    items.sort_by_key(|item| match item {
        Object::Int(n) => *n,
        _ => i64::MAX,
    });
    assert_eq!(items, (1..=4).map(Object::Int).collect::<Vec<_>>());
}

#[test]
fn exception_in_a_thread_is_returned_by_join() {
    let shared = shared_workers();
    let fail = global(&shared.lock(), "fail");
    let err = shared.spawn(fail, &[]).join().unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ValueError);
    assert_eq!(err.message(), Some("worker failed"));
    assert_eq!(err.traceback().len(), 1);
}

#[test]
fn thread_count_drops_after_join() {
    let shared = shared_workers();
    let square = global(&shared.lock(), "square");
    assert_eq!(shared.lock().thread_count(), 0);
    let first = shared.spawn(square, &[Value::Int(1)]);
    let second = shared.spawn(square, &[Value::Int(2)]);
    assert_eq!(shared.lock().thread_count(), 2);
    first.join().unwrap();
    assert_eq!(shared.lock().thread_count(), 1);
    second.join().unwrap();
    assert_eq!(shared.lock().thread_count(), 0);
}

#[test]
fn unjoined_thread_results_survive_collection() {
    let mut vm = Vm::with_config(NoLimitTracker, GcConfig::new().generations(1));
    workers(&mut vm);
    let shared = SharedVm::new(vm);
    let square = global(&shared.lock(), "square");
    let handle = shared.spawn(square, &[Value::Int(5)]);
    for _ in 0..3 {
        shared.lock().collect_garbage();
    }
    assert_eq!(handle.join().unwrap(), Object::List(vec![Object::Int(25)]));
}

#[test]
fn arguments_are_rooted_by_the_new_thread() {
    let mut vm = Vm::with_config(NoLimitTracker, GcConfig::new().generations(1));
    workers(&mut vm);
    let len = vm.get_global(vm.builtins(), "len").unwrap();
    let list = vm.new_list(vec![Value::Int(1), Value::Int(2)]).unwrap();
    let shared = SharedVm::new(vm);
    let handle = shared.spawn(len, &[list]);
    shared.lock().collect_garbage();
    assert_eq!(handle.join().unwrap(), Object::Int(2));
}
