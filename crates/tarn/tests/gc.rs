//! Tests for the mark-sweep collector: reachability, aging and statistics.

use pretty_assertions::assert_eq;
use tarn::{Capture, CodeBuilder, GcConfig, HeapId, NoLimitTracker, Object, Opcode, Value, Vm};

type TestVm = Vm<NoLimitTracker>;

fn vm_with_generations(generations: u8) -> TestVm {
    Vm::with_config(NoLimitTracker, GcConfig::new().generations(generations))
}

fn id(value: Value) -> HeapId {
    value.as_heap_id().expect("heap value")
}

// =============================================================================
// 1. Reachability
// =============================================================================

#[test]
fn unreachable_list_is_freed() {
    let mut vm = vm_with_generations(1);
    let list = id(vm.new_list(vec![Value::Int(1)]).unwrap());
    assert!(vm.heap().is_live(list));
    assert!(vm.collect_garbage() >= 1);
    assert!(!vm.heap().is_live(list));
}

#[test]
fn stack_values_and_their_children_survive() {
    let mut vm = vm_with_generations(1);
    let text = vm.new_str("kept alive by the list").unwrap();
    vm.push(text);
    let list = vm.new_list(vec![text]).unwrap();
    vm.pop();
    vm.push(list);
    for _ in 0..3 {
        vm.collect_garbage();
    }
    assert!(vm.heap().is_live(id(list)));
    assert!(vm.heap().is_live(id(text)));
    assert_eq!(
        vm.to_object(list),
        Object::List(vec![Object::String("kept alive by the list".to_owned())])
    );
}

#[test]
fn reference_cycle_is_collected() {
    // a = []; b = [a]; a.append(b)
    let mut vm = vm_with_generations(1);
    let a = vm.new_list(vec![]).unwrap();
    vm.push(a);
    let b = vm.new_list(vec![a]).unwrap();
    vm.push(b);
    let append = vm.get_attr(a, "append").unwrap();
    vm.call_direct(append, &[b]).unwrap();
    assert_eq!(vm.to_object(a).to_string(), "[[[...]]]");
    vm.pop();
    vm.pop();

    vm.collect_garbage();
    assert!(!vm.heap().is_live(id(a)));
    assert!(!vm.heap().is_live(id(b)));
}

#[test]
fn module_globals_are_roots() {
    let mut vm = vm_with_generations(1);
    let mut builder = CodeBuilder::new(&mut vm, "<module>").unwrap();
    builder.emit_constant(&mut vm, Value::Int(7));
    builder.emit_u16(Opcode::BuildList, 1);
    builder.emit_named(&mut vm, Opcode::StoreGlobal, "kept").unwrap();
    builder.emit(Opcode::LoadNone);
    builder.emit(Opcode::Return);
    let code = builder.build(&mut vm).unwrap();
    vm.run_module("__main__", code).unwrap();

    vm.collect_garbage();
    let module = vm.module("__main__").unwrap();
    let kept = vm.get_global(module, "kept").unwrap();
    assert_eq!(vm.to_object(kept), Object::List(vec![Object::Int(7)]));
}

#[test]
fn built_code_is_rooted_only_by_its_user() {
    let mut vm = vm_with_generations(1);
    let mut builder = CodeBuilder::new(&mut vm, "orphan").unwrap();
    builder.emit(Opcode::LoadNone);
    builder.emit(Opcode::Return);
    let code = builder.build(&mut vm).unwrap();
    vm.collect_garbage();
    assert!(!vm.heap().is_live(code));
}

// =============================================================================
// 2. Aging
// =============================================================================

#[test]
fn garbage_survives_until_it_has_aged() {
    let mut vm = vm_with_generations(3);
    let list = id(vm.new_list(vec![]).unwrap());
    vm.collect_garbage();
    assert!(vm.heap().is_live(list));
    vm.collect_garbage();
    assert!(vm.heap().is_live(list));
    vm.collect_garbage();
    assert!(!vm.heap().is_live(list));
}

#[test]
fn becoming_reachable_resets_the_age() {
    let mut vm = vm_with_generations(2);
    let list = vm.new_list(vec![]).unwrap();
    vm.collect_garbage();
    assert!(vm.heap().is_live(id(list)));

    // rooted for one cycle, then dropped again: two more sweeps are needed
    vm.push(list);
    vm.collect_garbage();
    vm.pop();
    vm.collect_garbage();
    assert!(vm.heap().is_live(id(list)));
    vm.collect_garbage();
    assert!(!vm.heap().is_live(id(list)));
}

#[test]
fn zero_generations_behaves_like_one() {
    let mut vm = vm_with_generations(0);
    let list = id(vm.new_list(vec![]).unwrap());
    vm.collect_garbage();
    assert!(!vm.heap().is_live(list));
}

/// Runs as many collections as the default aging window.
fn collect_thrice(vm: &mut TestVm, _args: &[Value], _has_kw: bool) -> tarn::RunResult<Value> {
    for _ in 0..3 {
        vm.collect_garbage();
    }
    Ok(Value::None)
}

#[test]
fn captured_variable_lives_through_its_upvalue_then_ages_out() {
    // def outer():
    //     box = [42]
    //     def peek(): return box
    //     collect()
    //     return peek
    let mut vm = vm_with_generations(3);
    vm.define_builtin("collect", collect_thrice).unwrap();

    let mut peek = CodeBuilder::new(&mut vm, "peek").unwrap();
    peek.upvalues(1);
    peek.emit_u16(Opcode::LoadUpvalue, 0);
    peek.emit(Opcode::Return);
    let peek = peek.build(&mut vm).unwrap();

    let mut outer = CodeBuilder::new(&mut vm, "outer").unwrap();
    outer.emit_constant(&mut vm, Value::Int(42));
    outer.emit_u16(Opcode::BuildList, 1);
    let peek_const = outer.add_const(&mut vm, Value::Ref(peek));
    outer.emit_closure(peek_const, &[Capture::Local(0)]);
    outer.emit_named(&mut vm, Opcode::LoadGlobal, "collect").unwrap();
    outer.emit_u8(Opcode::Call, 0);
    outer.emit(Opcode::Pop);
    outer.emit_u16(Opcode::LoadLocal, 1);
    outer.emit(Opcode::Return);
    let outer = outer.build(&mut vm).unwrap();

    let mut m = CodeBuilder::new(&mut vm, "<module>").unwrap();
    let outer_const = m.add_const(&mut vm, Value::Ref(outer));
    m.emit_closure(outer_const, &[]);
    m.emit_named(&mut vm, Opcode::StoreGlobal, "outer").unwrap();
    m.emit(Opcode::LoadNone);
    m.emit(Opcode::Return);
    let code = m.build(&mut vm).unwrap();
    vm.run_module("__main__", code).unwrap();

    let module = vm.module("__main__").unwrap();
    let outer = vm.get_global(module, "outer").unwrap();
    // three collections ran while `box` was held by the open upvalue
    let peek = vm.call_direct(outer, &[]).unwrap();
    let boxed = vm.call_direct(peek, &[]).unwrap();
    assert_eq!(vm.to_object(boxed), Object::List(vec![Object::Int(42)]));

    // the call is over and nothing refers to `peek` any more
    vm.collect_garbage();
    assert!(vm.heap().is_live(id(boxed)), "first collection ages the list");
    vm.collect_garbage();
    assert!(vm.heap().is_live(id(boxed)), "second collection ages the list");
    vm.collect_garbage();
    assert!(!vm.heap().is_live(id(boxed)), "third collection frees the list");
    assert!(!vm.heap().is_live(id(peek)));
}

// =============================================================================
// 3. Statistics and slot reuse
// =============================================================================

#[test]
fn collector_statistics_accumulate() {
    let mut vm = vm_with_generations(1);
    let before = vm.gc_stats();
    vm.new_list(vec![]).unwrap();
    vm.new_list(vec![]).unwrap();
    let freed = vm.collect_garbage();
    let stats = vm.gc_stats();

    assert_eq!(stats.collections, before.collections + 1);
    assert_eq!(stats.last_freed, freed);
    assert_eq!(stats.objects_freed, before.objects_freed + freed);
    assert_eq!(stats.live_bytes, vm.heap_stats().bytes_allocated);
    assert!(stats.next_threshold >= tarn::DEFAULT_GC_THRESHOLD);
}

#[test]
fn heap_stats_count_objects_by_type() {
    let mut vm = vm_with_generations(1);
    vm.collect_garbage();
    let before = vm.heap_stats();
    let tuple = vm.new_tuple(vec![Value::Int(1), Value::Int(2)]).unwrap();
    vm.push(tuple);
    let after = vm.heap_stats();

    let diff = before.diff(&after);
    assert_eq!(diff.live_objects_delta, 1);
    assert_eq!(diff.objects_by_type_delta.get("Tuple"), Some(&1));
    assert!(diff.bytes_allocated_delta > 0);
    assert_eq!(after.tracker_allocations, None);
}

#[test]
fn freed_slots_are_reused() {
    let mut vm = vm_with_generations(1);
    vm.collect_garbage();
    let list = id(vm.new_list(vec![]).unwrap());
    vm.collect_garbage();
    let stats = vm.heap_stats();
    assert!(stats.free_slots >= 1);

    let again = id(vm.new_list(vec![]).unwrap());
    assert_eq!(vm.heap_stats().total_slots, stats.total_slots);
    assert!(vm.heap().is_live(again));
    assert!(again == list || stats.free_slots > 1);
}

#[test]
fn freed_string_leaves_the_intern_pool() {
    let mut vm = vm_with_generations(1);
    vm.collect_garbage();
    let before = vm.heap_stats().interned_strings;
    let first = vm.intern("a string nobody keeps").unwrap();
    assert_eq!(vm.heap_stats().interned_strings, before + 1);
    assert_eq!(vm.intern("a string nobody keeps").unwrap(), first);

    vm.collect_garbage();
    assert_eq!(vm.heap_stats().interned_strings, before);
    let second = vm.intern("a string nobody keeps").unwrap();
    assert!(vm.heap().is_live(second));
    assert_eq!(vm.heap().str(second), "a string nobody keeps");
}

// =============================================================================
// 4. Stress mode
// =============================================================================

#[test]
fn stress_mode_collects_on_every_allocation() {
    // acc = []; i = 0
    // while i < 20: acc.append((i, [i])); i = i + 1
    // return acc[19]
    let mut vm = Vm::with_config(NoLimitTracker, GcConfig::new().stress(true));
    let mut b = CodeBuilder::new(&mut vm, "<module>").unwrap();
    b.emit_u16(Opcode::BuildList, 0);
    b.emit_constant(&mut vm, Value::Int(0));
    let head = b.current_offset();
    b.emit_u16(Opcode::LoadLocal, 1);
    b.emit_constant(&mut vm, Value::Int(20));
    b.emit(Opcode::Less);
    let done = b.emit_jump(Opcode::JumpIfFalse);
    b.emit_u16(Opcode::LoadLocal, 0);
    b.emit_named(&mut vm, Opcode::GetAttr, "append").unwrap();
    b.emit_u16(Opcode::LoadLocal, 1);
    b.emit_u16(Opcode::LoadLocal, 1);
    b.emit_u16(Opcode::BuildList, 1);
    b.emit_u16(Opcode::BuildTuple, 2);
    b.emit_u8(Opcode::Call, 1);
    b.emit(Opcode::Pop);
    b.emit_u16(Opcode::LoadLocal, 1);
    b.emit_constant(&mut vm, Value::Int(1));
    b.emit(Opcode::Add);
    b.emit_u16(Opcode::StoreLocal, 1);
    b.emit_jump_to(Opcode::Jump, head);
    b.patch_jump(done);
    b.emit_u16(Opcode::LoadLocal, 0);
    b.emit_constant(&mut vm, Value::Int(19));
    b.emit(Opcode::GetItem);
    b.emit(Opcode::Return);
    let code = b.build(&mut vm).unwrap();

    let before = vm.gc_stats().collections;
    let result = vm.run_module("__main__", code).unwrap();
    assert_eq!(
        result,
        Object::Tuple(vec![Object::Int(19), Object::List(vec![Object::Int(19)])])
    );
    assert!(vm.gc_stats().collections > before + 40);
}
