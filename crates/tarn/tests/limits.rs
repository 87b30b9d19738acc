//! Tests for resource limits and execution tracers.

use std::time::Duration;

use pretty_assertions::assert_eq;
use tarn::{
    CodeBuilder, CoverageTracer, ExcType, GcConfig, HeapId, LimitedTracker, NoLimitTracker, Object, Opcode,
    ProfilingTracer, RecordingTracer, ResourceLimits, ResourceTracker, TraceEvent, Value, Vm, VmTracer,
};

fn limited(limits: ResourceLimits) -> Vm<LimitedTracker> {
    Vm::new(LimitedTracker::new(limits))
}

fn build<T: ResourceTracker, Tr: VmTracer>(
    vm: &mut Vm<T, Tr>,
    name: &str,
    body: impl FnOnce(&mut Vm<T, Tr>, &mut CodeBuilder),
) -> HeapId {
    let mut builder = CodeBuilder::new(vm, name).unwrap();
    body(vm, &mut builder);
    builder.build(vm).unwrap()
}

/// `while True: pass`, inside `try: ... except: return None`.
fn spin_module<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>) -> HeapId {
    build(vm, "<module>", |_, b| {
        let handler = b.emit_jump(Opcode::PushTry);
        let head = b.current_offset();
        b.emit_jump_to(Opcode::Jump, head);
        b.patch_jump(handler);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::Return);
    })
}

/// `acc = []; while True: acc.append([len])`
fn hoard_module<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>) -> HeapId {
    build(vm, "<module>", |vm, b| {
        b.emit_u16(Opcode::BuildList, 0);
        let head = b.current_offset();
        b.emit_u16(Opcode::LoadLocal, 0);
        b.emit_named(vm, Opcode::GetAttr, "append").unwrap();
        b.emit_named(vm, Opcode::LoadGlobal, "len").unwrap();
        b.emit_u16(Opcode::BuildList, 1);
        b.emit_u8(Opcode::Call, 1);
        b.emit(Opcode::Pop);
        b.emit_jump_to(Opcode::Jump, head);
    })
}

/// ```text
/// def f(): return f()
/// try: f()
/// except RecursionError: return "caught"
/// ```
fn recursion_module<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>) -> HeapId {
    let f = build(vm, "f", |vm, b| {
        b.emit_named(vm, Opcode::LoadGlobal, "f").unwrap();
        b.emit_u8(Opcode::Call, 0);
        b.emit(Opcode::Return);
    });
    build(vm, "<module>", |vm, b| {
        let index = b.add_const(vm, Value::Ref(f));
        b.emit_closure(index, &[]);
        b.emit_named(vm, Opcode::StoreGlobal, "f").unwrap();

        let handler = b.emit_jump(Opcode::PushTry);
        b.emit_named(vm, Opcode::LoadGlobal, "f").unwrap();
        b.emit_u8(Opcode::Call, 0);
        b.emit(Opcode::Pop);
        b.emit(Opcode::PopHandler);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::Return);

        b.patch_jump(handler);
        b.emit_named(vm, Opcode::LoadGlobal, "RecursionError").unwrap();
        b.emit(Opcode::FilterExcept);
        let reraise = b.emit_jump(Opcode::JumpIfFalse);
        let caught = b.name(vm, "caught").unwrap();
        b.emit_u16(Opcode::LoadConst, caught);
        b.emit(Opcode::Return);
        b.patch_jump(reraise);
        b.emit(Opcode::EndFinally);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::Return);
    })
}

// =============================================================================
// 1. Limits
// =============================================================================

#[test]
fn operation_limit_cannot_be_caught() {
    let mut vm = limited(ResourceLimits::new().max_operations(1_000));
    let code = spin_module(&mut vm);
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TimeoutError);
    assert_eq!(err.message(), Some("operation limit exceeded: 1001 > 1000"));
    assert_eq!(vm.frame_depth(), 0);
    assert_eq!(vm.stack_len(), 0);
}

#[test]
fn time_limit_stops_a_spinning_loop() {
    let mut vm = limited(ResourceLimits::new().max_duration(Duration::from_millis(20)));
    let code = spin_module(&mut vm);
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TimeoutError);
    assert!(err.message().is_some_and(|m| m.starts_with("time limit exceeded")));
}

#[test]
fn allocation_limit_raises_memory_error() {
    let mut vm = limited(ResourceLimits::new().max_allocations(500));
    let code = hoard_module(&mut vm);
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::MemoryError);
    assert!(err.message().is_some_and(|m| m.starts_with("allocation limit exceeded")));
    assert_eq!(vm.heap_stats().tracker_allocations, Some(500));
}

#[test]
fn memory_limit_raises_memory_error() {
    let mut vm = limited(ResourceLimits::new().max_memory(64 * 1024));
    let code = hoard_module(&mut vm);
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::MemoryError);
    let used = vm.heap_stats().tracker_memory_bytes.unwrap();
    assert!(used <= 64 * 1024, "tracker stayed within the limit: {used}");
}

/// `"ab" * (1 << 45)` is refused before the string is built.
#[test]
fn oversized_repeat_is_refused_up_front() {
    let mut vm = limited(ResourceLimits::new().max_memory(1 << 20));
    let code = build(&mut vm, "<module>", |vm, b| {
        b.emit_named(vm, Opcode::LoadConst, "ab").unwrap();
        b.emit_constant(vm, Value::Int(1 << 45));
        b.emit(Opcode::Mul);
        b.emit(Opcode::Return);
    });
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::MemoryError);
    assert!(
        err.message().is_some_and(|m| m.starts_with("memory limit exceeded")),
        "message = {:?}",
        err.message()
    );
    let used = vm.heap_stats().tracker_memory_bytes.unwrap();
    assert!(used <= 1 << 20, "nothing was charged for the refused result: {used}");
}

/// Repeats under the large-result threshold never consult the memory limit.
#[test]
fn small_repeat_within_memory_limit() {
    let mut vm = limited(ResourceLimits::new().max_memory(1 << 20));
    let code = build(&mut vm, "<module>", |vm, b| {
        b.emit_constant(vm, Value::Int(3));
        b.emit_constant(vm, Value::Int(4));
        b.emit_u16(Opcode::BuildTuple, 1);
        b.emit(Opcode::Mul);
        b.emit(Opcode::Return);
    });
    assert_eq!(
        vm.run_module("__main__", code).unwrap(),
        Object::Tuple(vec![Object::Int(4); 3])
    );
}

#[test]
fn recursion_error_is_catchable() {
    let mut vm = limited(ResourceLimits::new().max_recursion_depth(Some(20)));
    let code = recursion_module(&mut vm);
    assert_eq!(
        vm.run_module("__main__", code).unwrap(),
        Object::String("caught".to_owned())
    );
    assert_eq!(vm.frame_depth(), 0);
}

#[test]
fn default_tracker_limits_recursion() {
    let mut vm = Vm::new(NoLimitTracker);
    let f = build(&mut vm, "f", |vm, b| {
        b.emit_named(vm, Opcode::LoadGlobal, "f").unwrap();
        b.emit_u8(Opcode::Call, 0);
        b.emit(Opcode::Return);
    });
    let code = build(&mut vm, "<module>", |vm, b| {
        let index = b.add_const(vm, Value::Ref(f));
        b.emit_closure(index, &[]);
        b.emit_named(vm, Opcode::StoreGlobal, "f").unwrap();
        b.emit_named(vm, Opcode::LoadGlobal, "f").unwrap();
        b.emit_u8(Opcode::Call, 0);
        b.emit(Opcode::Return);
    });
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(err.summary(), "RecursionError: maximum recursion depth exceeded");
    assert_eq!(err.traceback().len(), tarn::DEFAULT_MAX_RECURSION_DEPTH);
    assert_eq!(vm.stack_len(), 0);
}

#[test]
fn freed_objects_return_their_memory_to_the_tracker() {
    let mut vm = Vm::with_config(
        LimitedTracker::new(ResourceLimits::new()),
        GcConfig::new().generations(1),
    );
    vm.collect_garbage();
    let before = vm.heap_stats().tracker_memory_bytes.unwrap();
    vm.new_list(vec![Value::Int(1); 32]).unwrap();
    assert!(vm.heap_stats().tracker_memory_bytes.unwrap() > before);
    vm.collect_garbage();
    assert_eq!(vm.heap_stats().tracker_memory_bytes.unwrap(), before);
}

// =============================================================================
// 2. Tracers
// =============================================================================

/// `def add(a, b): return a + b` and a module returning `add(1, 2)`.
fn add_module<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>) -> HeapId {
    let add = build(vm, "add", |vm, b| {
        b.params(vm, &["a", "b"], 2).unwrap();
        b.emit_u16(Opcode::LoadLocal, 0);
        b.emit_u16(Opcode::LoadLocal, 1);
        b.emit(Opcode::Add);
        b.emit(Opcode::Return);
    });
    build(vm, "<module>", |vm, b| {
        let index = b.add_const(vm, Value::Ref(add));
        b.emit_closure(index, &[]);
        b.emit_constant(vm, Value::Int(1));
        b.emit_constant(vm, Value::Int(2));
        b.emit_u8(Opcode::Call, 2);
        b.emit(Opcode::Return);
    })
}

#[test]
fn recording_tracer_sees_calls_and_returns() {
    let mut vm = Vm::with_tracer(NoLimitTracker, GcConfig::new(), RecordingTracer::new());
    let code = add_module(&mut vm);
    assert_eq!(vm.run_module("__main__", code).unwrap(), Object::Int(3));

    let events = vm.tracer().events();
    assert_eq!(
        events.first(),
        Some(&TraceEvent::Call {
            func_name: Some("<module>".to_owned()),
            depth: 1
        })
    );
    assert!(events.contains(&TraceEvent::Call {
        func_name: Some("add".to_owned()),
        depth: 2
    }));
    assert!(events.contains(&TraceEvent::Instruction {
        ip: 0,
        opcode: Opcode::LoadLocal,
        stack_depth: 2
    }));
    let returns: Vec<&TraceEvent> = events
        .iter()
        .filter(|event| matches!(event, TraceEvent::Return { .. }))
        .collect();
    assert_eq!(returns, [&TraceEvent::Return { depth: 1 }, &TraceEvent::Return { depth: 0 }]);
}

#[test]
fn recording_tracer_respects_its_limit() {
    let mut vm = Vm::with_tracer(NoLimitTracker, GcConfig::new(), RecordingTracer::with_limit(3));
    let code = add_module(&mut vm);
    vm.run_module("__main__", code).unwrap();
    assert_eq!(vm.tracer().events().len(), 3);
}

#[test]
fn exceptions_and_collections_are_traced() {
    let mut vm = Vm::with_tracer(NoLimitTracker, GcConfig::new(), RecordingTracer::new());
    let code = build(&mut vm, "<module>", |vm, b| {
        b.emit_named(vm, Opcode::LoadGlobal, "KeyError").unwrap();
        b.emit(Opcode::Raise);
    });
    vm.run_module("__main__", code).unwrap_err();
    vm.collect_garbage();

    let events = std::mem::take(vm.tracer_mut()).into_events();
    assert!(events.contains(&TraceEvent::Exception {
        type_name: "KeyError".to_owned(),
        depth: 1
    }));
    assert!(matches!(events.last(), Some(TraceEvent::Gc { .. })));
}

#[test]
fn generator_resumes_are_traced() {
    // def g(): yield 1
    // x = g(); x(); x()
    let mut vm = Vm::with_tracer(NoLimitTracker, GcConfig::new(), RecordingTracer::new());
    let g = build(&mut vm, "g", |vm, b| {
        b.generator();
        b.emit_constant(vm, Value::Int(1));
        b.emit(Opcode::Yield);
        b.emit(Opcode::Return);
    });
    let code = build(&mut vm, "<module>", |vm, b| {
        let index = b.add_const(vm, Value::Ref(g));
        b.emit_closure(index, &[]);
        b.emit_u8(Opcode::Call, 0);
        for _ in 0..2 {
            b.emit_u16(Opcode::LoadLocal, 0);
            b.emit_u8(Opcode::Call, 0);
            b.emit(Opcode::Pop);
        }
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::Return);
    });
    vm.run_module("__main__", code).unwrap();

    let events = vm.tracer().events();
    let resumes = events
        .iter()
        .filter(|event| matches!(event, TraceEvent::GeneratorResume { .. }))
        .count();
    assert_eq!(resumes, 2);
    assert!(events.contains(&TraceEvent::GeneratorSuspend { saved: 0 }));
}

#[test]
fn profiling_tracer_summarizes_a_run() {
    let mut vm = Vm::with_tracer(NoLimitTracker, GcConfig::new(), ProfilingTracer::new());
    let code = add_module(&mut vm);
    vm.run_module("__main__", code).unwrap();

    let report = vm.tracer().report();
    assert_eq!(report.total_calls, 2);
    assert_eq!(report.max_depth, 2);
    assert_eq!(report.total_exceptions, 0);
    assert!(report.opcode_counts.contains(&(Opcode::Add, 1)));
    let counted: u64 = report.opcode_counts.iter().map(|(_, n)| n).sum();
    assert_eq!(counted, report.total_instructions);
}

#[test]
fn coverage_tracer_records_executed_offsets() {
    let mut vm = Vm::with_tracer(NoLimitTracker, GcConfig::new(), CoverageTracer::new());
    let code = add_module(&mut vm);
    vm.run_module("__main__", code).unwrap();
    assert!(vm.tracer().covered_ips().contains(&0));
    assert_eq!(vm.tracer().coverage_count(), vm.tracer().covered_ips().len());
}
