//! Tests for raising, catching and reporting exceptions.
//!
//! Covers `try`/`except` matching, `finally` on both the raise and return paths,
//! `with` blocks, user exception classes and the tracebacks handed to the host.

use pretty_assertions::assert_eq;
use tarn::{CodeBuilder, ExcType, HeapId, NoLimitTracker, Object, Opcode, StackFrame, Value, Vm};

type TestVm = Vm<NoLimitTracker>;

/// Builds a function code object named `name` over `params`.
fn function(
    vm: &mut TestVm,
    name: &str,
    params: &[&str],
    body: impl FnOnce(&mut TestVm, &mut CodeBuilder),
) -> HeapId {
    let mut builder = CodeBuilder::new(vm, name).unwrap();
    builder.params(vm, params, params.len()).unwrap();
    builder.filename(vm, "test.tn").unwrap();
    body(vm, &mut builder);
    builder.build(vm).unwrap()
}

/// Emits `Closure` for `code` and binds the closure to global `name`.
fn define(vm: &mut TestVm, builder: &mut CodeBuilder, name: &str, code: HeapId) {
    let index = builder.add_const(vm, Value::Ref(code));
    builder.emit_closure(index, &[]);
    builder.emit_named(vm, Opcode::StoreGlobal, name).unwrap();
}

/// Emits `log.append(<top of stack>)`, leaving nothing behind.
fn emit_log_top(vm: &mut TestVm, builder: &mut CodeBuilder) {
    builder.emit_named(vm, Opcode::LoadGlobal, "log").unwrap();
    builder.emit_named(vm, Opcode::GetAttr, "append").unwrap();
    builder.emit(Opcode::Swap);
    builder.emit_u8(Opcode::Call, 1);
    builder.emit(Opcode::Pop);
}

fn emit_str(vm: &mut TestVm, builder: &mut CodeBuilder, text: &str) {
    let index = builder.name(vm, text).unwrap();
    builder.emit_u16(Opcode::LoadConst, index);
}

/// Emits `raise <exc_name>(message)`.
fn emit_raise(vm: &mut TestVm, builder: &mut CodeBuilder, exc_name: &str, message: &str) {
    builder.emit_named(vm, Opcode::LoadGlobal, exc_name).unwrap();
    emit_str(vm, builder, message);
    builder.emit_u8(Opcode::Call, 1);
    builder.emit(Opcode::Raise);
}

fn module(vm: &mut TestVm, body: impl FnOnce(&mut TestVm, &mut CodeBuilder)) -> HeapId {
    let mut builder = CodeBuilder::new(vm, "<module>").unwrap();
    builder.filename(vm, "test.tn").unwrap();
    builder.emit_u16(Opcode::BuildList, 0);
    builder.emit_named(vm, Opcode::StoreGlobal, "log").unwrap();
    body(vm, &mut builder);
    builder.build(vm).unwrap()
}

fn log_of(vm: &mut TestVm, module_name: &str) -> Object {
    let module = vm.module(module_name).unwrap();
    let log = vm.get_global(module, "log").unwrap();
    vm.to_object(log)
}

// =============================================================================
// 1. try / except
// =============================================================================

/// try: raise ValueError('bad') / except <filter>: return str(exc)
fn try_except_module(vm: &mut TestVm, filter: &str) -> HeapId {
    module(vm, |vm, b| {
        let handler = b.emit_jump(Opcode::PushTry);
        emit_raise(vm, b, "ValueError", "bad");
        b.emit(Opcode::PopHandler);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::Return);

        b.patch_jump(handler);
        b.emit_named(vm, Opcode::LoadGlobal, filter).unwrap();
        b.emit(Opcode::FilterExcept);
        let reraise = b.emit_jump(Opcode::JumpIfFalse);
        b.emit_named(vm, Opcode::LoadGlobal, "str").unwrap();
        b.emit_u16(Opcode::LoadLocal, 0);
        b.emit_u8(Opcode::Call, 1);
        b.emit(Opcode::Return);

        b.patch_jump(reraise);
        b.emit(Opcode::EndFinally);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::Return);
    })
}

#[test]
fn matching_except_clause_handles_the_exception() {
    let mut vm = Vm::new(NoLimitTracker);
    let code = try_except_module(&mut vm, "ValueError");
    assert_eq!(vm.run_module("__main__", code).unwrap(), Object::String("bad".to_owned()));
}

#[test]
fn base_class_filter_matches_subclass() {
    let mut vm = Vm::new(NoLimitTracker);
    let code = try_except_module(&mut vm, "Exception");
    assert_eq!(vm.run_module("__main__", code).unwrap(), Object::String("bad".to_owned()));
}

#[test]
fn unmatched_exception_is_reraised() {
    let mut vm = Vm::new(NoLimitTracker);
    let code = try_except_module(&mut vm, "KeyError");
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ValueError);
    assert_eq!(err.summary(), "ValueError: bad");
    assert_eq!(err.traceback().len(), 1, "a re-raised exception lists its frame once");
    assert_eq!(vm.stack_len(), 0, "unwinding must restore the stack");
}

#[test]
fn filter_that_is_not_an_exception_class() {
    let mut vm = Vm::new(NoLimitTracker);
    let code = try_except_module(&mut vm, "len");
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(
        err.summary(),
        "TypeError: catching classes that do not inherit from BaseException is not allowed"
    );
}

#[test]
fn exception_from_a_callee_is_caught_by_the_caller() {
    let mut vm = Vm::new(NoLimitTracker);
    let fail = function(&mut vm, "fail", &[], |vm, b| emit_raise(vm, b, "KeyError", "k"));
    let code = module(&mut vm, |vm, b| {
        define(vm, b, "fail", fail);
        let handler = b.emit_jump(Opcode::PushTry);
        b.emit_named(vm, Opcode::LoadGlobal, "fail").unwrap();
        b.emit_u8(Opcode::Call, 0);
        b.emit(Opcode::Pop);
        b.emit(Opcode::PopHandler);
        let done = b.emit_jump(Opcode::Jump);

        b.patch_jump(handler);
        b.emit_named(vm, Opcode::LoadGlobal, "LookupError").unwrap();
        b.emit(Opcode::FilterExcept);
        let reraise = b.emit_jump(Opcode::JumpIfFalse);
        emit_str(vm, b, "caught");
        emit_log_top(vm, b);
        b.emit(Opcode::PopHandler);
        let after = b.emit_jump(Opcode::Jump);
        b.patch_jump(reraise);
        b.emit(Opcode::EndFinally);

        b.patch_jump(done);
        b.patch_jump(after);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::Return);
    });
    vm.run_module("__main__", code).unwrap();
    assert_eq!(
        log_of(&mut vm, "__main__"),
        Object::List(vec![Object::String("caught".to_owned())])
    );
    assert_eq!(vm.frame_depth(), 0);
}

#[test]
fn raising_a_non_exception_is_type_error() {
    let mut vm = Vm::new(NoLimitTracker);
    let code = module(&mut vm, |vm, b| {
        b.emit_constant(vm, Value::Int(3));
        b.emit(Opcode::Raise);
    });
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(err.summary(), "TypeError: exceptions must derive from BaseException");
}

// =============================================================================
// 2. finally
// =============================================================================

#[test]
fn finally_runs_before_a_return_completes() {
    // def f():
    //     try: return 1
    //     finally: log.append('cleanup')
    let mut vm = Vm::new(NoLimitTracker);
    let f = function(&mut vm, "f", &[], |vm, b| {
        let cleanup = b.emit_jump(Opcode::PushFinally);
        b.emit_constant(vm, Value::Int(1));
        b.emit(Opcode::Return);
        b.emit(Opcode::BeginFinally);
        b.patch_jump(cleanup);
        emit_str(vm, b, "cleanup");
        emit_log_top(vm, b);
        b.emit(Opcode::EndFinally);
        b.emit(Opcode::PopHandler);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::Return);
    });
    let code = module(&mut vm, |vm, b| {
        define(vm, b, "f", f);
        b.emit_named(vm, Opcode::LoadGlobal, "f").unwrap();
        b.emit_u8(Opcode::Call, 0);
        b.emit_named(vm, Opcode::LoadGlobal, "log").unwrap();
        b.emit_u16(Opcode::BuildTuple, 2);
        b.emit(Opcode::Return);
    });
    assert_eq!(
        vm.run_module("__main__", code).unwrap(),
        Object::Tuple(vec![
            Object::Int(1),
            Object::List(vec![Object::String("cleanup".to_owned())])
        ])
    );
}

#[test]
fn finally_runs_and_the_exception_continues() {
    let mut vm = Vm::new(NoLimitTracker);
    let code = module(&mut vm, |vm, b| {
        let cleanup = b.emit_jump(Opcode::PushFinally);
        emit_raise(vm, b, "KeyError", "k");
        b.emit(Opcode::BeginFinally);
        b.patch_jump(cleanup);
        emit_str(vm, b, "cleanup");
        emit_log_top(vm, b);
        b.emit(Opcode::EndFinally);
        b.emit(Opcode::PopHandler);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::Return);
    });
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::KeyError);
    assert_eq!(
        log_of(&mut vm, "__main__"),
        Object::List(vec![Object::String("cleanup".to_owned())])
    );
}

#[test]
fn finally_on_the_normal_path() {
    let mut vm = Vm::new(NoLimitTracker);
    let code = module(&mut vm, |vm, b| {
        let cleanup = b.emit_jump(Opcode::PushFinally);
        emit_str(vm, b, "body");
        emit_log_top(vm, b);
        b.emit(Opcode::BeginFinally);
        b.patch_jump(cleanup);
        emit_str(vm, b, "cleanup");
        emit_log_top(vm, b);
        b.emit(Opcode::EndFinally);
        b.emit(Opcode::PopHandler);
        b.emit_named(vm, Opcode::LoadGlobal, "log").unwrap();
        b.emit(Opcode::Return);
    });
    assert_eq!(
        vm.run_module("__main__", code).unwrap(),
        Object::List(vec![
            Object::String("body".to_owned()),
            Object::String("cleanup".to_owned())
        ])
    );
}

// =============================================================================
// 3. with
// =============================================================================

/// class CM:
///     def __enter__(self): return 10
///     def __exit__(self, t, e, tb): log.append(e); return <suppress>
fn define_manager(vm: &mut TestVm, builder: &mut CodeBuilder, suppress: bool) {
    let enter = function(vm, "__enter__", &["self"], |vm, b| {
        b.emit_constant(vm, Value::Int(10));
        b.emit(Opcode::Return);
    });
    let exit = function(vm, "__exit__", &["self", "t", "e", "tb"], |vm, b| {
        b.emit_u16(Opcode::LoadLocal, 2);
        emit_log_top(vm, b);
        b.emit(if suppress { Opcode::LoadTrue } else { Opcode::LoadNone });
        b.emit(Opcode::Return);
    });
    builder.emit(Opcode::LoadNone);
    builder.emit_named(vm, Opcode::MakeClass, "CM").unwrap();
    for (name, code) in [("__enter__", enter), ("__exit__", exit)] {
        let index = builder.add_const(vm, Value::Ref(code));
        builder.emit_closure(index, &[]);
        builder.emit_named(vm, Opcode::DefineMethod, name).unwrap();
    }
    builder.emit(Opcode::FinalizeClass);
    builder.emit_named(vm, Opcode::StoreGlobal, "CM").unwrap();
}

/// with CM() as entered: <raise KeyError if `raising`>
fn with_module(vm: &mut TestVm, suppress: bool, raising: bool) -> HeapId {
    module(vm, |vm, b| {
        define_manager(vm, b, suppress);
        b.emit_named(vm, Opcode::LoadGlobal, "CM").unwrap();
        b.emit_u8(Opcode::Call, 0);
        let cleanup = b.emit_jump(Opcode::PushWith);
        b.emit_named(vm, Opcode::StoreGlobal, "entered").unwrap();
        if raising {
            b.emit_named(vm, Opcode::LoadGlobal, "KeyError").unwrap();
            b.emit(Opcode::Raise);
        }
        b.emit(Opcode::BeginFinally);
        b.patch_jump(cleanup);
        b.emit(Opcode::CleanupWith);
        b.emit(Opcode::EndFinally);
        b.emit(Opcode::PopHandler);
        b.emit(Opcode::Pop);
        b.emit_named(vm, Opcode::LoadGlobal, "entered").unwrap();
        b.emit_named(vm, Opcode::LoadGlobal, "log").unwrap();
        b.emit_u16(Opcode::BuildTuple, 2);
        b.emit(Opcode::Return);
    })
}

#[test]
fn with_block_exits_normally() {
    let mut vm = Vm::new(NoLimitTracker);
    let code = with_module(&mut vm, false, false);
    assert_eq!(
        vm.run_module("__main__", code).unwrap(),
        Object::Tuple(vec![Object::Int(10), Object::List(vec![Object::None])])
    );
}

#[test]
fn truthy_exit_suppresses_the_exception() {
    let mut vm = Vm::new(NoLimitTracker);
    let code = with_module(&mut vm, true, true);
    let key_error = Object::Exception {
        exc_type: ExcType::KeyError,
        arg: None,
    };
    assert_eq!(
        vm.run_module("__main__", code).unwrap(),
        Object::Tuple(vec![Object::Int(10), Object::List(vec![key_error])])
    );
}

#[test]
fn falsy_exit_lets_the_exception_through() {
    let mut vm = Vm::new(NoLimitTracker);
    let code = with_module(&mut vm, false, true);
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::KeyError);
    assert_eq!(
        log_of(&mut vm, "__main__"),
        Object::List(vec![Object::Exception {
            exc_type: ExcType::KeyError,
            arg: None
        }])
    );
}

#[test]
fn with_requires_the_manager_protocol() {
    let mut vm = Vm::new(NoLimitTracker);
    let code = module(&mut vm, |vm, b| {
        b.emit_constant(vm, Value::Int(1));
        let cleanup = b.emit_jump(Opcode::PushWith);
        b.patch_jump(cleanup);
        b.emit(Opcode::Return);
    });
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(
        err.summary(),
        "TypeError: 'int' object does not support the context manager protocol"
    );
}

// =============================================================================
// 4. User exception classes
// =============================================================================

#[test]
fn user_exception_reports_nearest_builtin_type() {
    // class MyError(ValueError): pass
    // raise MyError('boom')
    let mut vm = Vm::new(NoLimitTracker);
    let code = module(&mut vm, |vm, b| {
        b.emit_named(vm, Opcode::LoadGlobal, "ValueError").unwrap();
        b.emit_named(vm, Opcode::MakeClass, "MyError").unwrap();
        b.emit(Opcode::FinalizeClass);
        b.emit_named(vm, Opcode::StoreGlobal, "MyError").unwrap();
        emit_raise(vm, b, "MyError", "boom");
    });
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(err.type_name(), "MyError");
    assert_eq!(err.exc_type(), ExcType::ValueError);
    assert_eq!(err.message(), Some("boom"));
    assert_eq!(err.summary(), "MyError: boom");
}

#[test]
fn exception_without_message() {
    let mut vm = Vm::new(NoLimitTracker);
    let code = module(&mut vm, |vm, b| {
        b.emit_named(vm, Opcode::LoadGlobal, "IndexError").unwrap();
        b.emit(Opcode::Raise);
    });
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(err.message(), None);
    assert_eq!(err.summary(), "IndexError");
}

// =============================================================================
// 5. Tracebacks
// =============================================================================

#[test]
fn traceback_lists_outermost_frame_first() {
    // line 3 (in divide): return 1 / 0
    // line 10 (module):   divide()
    let mut vm = Vm::new(NoLimitTracker);
    let divide = function(&mut vm, "divide", &[], |vm, b| {
        b.set_line(3);
        b.emit_constant(vm, Value::Int(1));
        b.emit_constant(vm, Value::Int(0));
        b.emit(Opcode::TrueDiv);
        b.emit(Opcode::Return);
    });
    let code = module(&mut vm, |vm, b| {
        define(vm, b, "divide", divide);
        b.set_line(10);
        b.emit_named(vm, Opcode::LoadGlobal, "divide").unwrap();
        b.emit_u8(Opcode::Call, 0);
        b.emit(Opcode::Return);
    });
    let err = vm.run_module("__main__", code).unwrap_err();
    assert_eq!(
        err.traceback(),
        [
            StackFrame {
                filename: "test.tn".to_owned(),
                line: 10,
                name: "<module>".to_owned(),
            },
            StackFrame {
                filename: "test.tn".to_owned(),
                line: 3,
                name: "divide".to_owned(),
            },
        ]
    );
    assert_eq!(
        err.to_string(),
        "Traceback (most recent call last):\n  \
         File \"test.tn\", line 10, in <module>\n  \
         File \"test.tn\", line 3, in divide\n\
         ZeroDivisionError: division by zero"
    );
}

#[test]
fn host_call_error_has_no_traceback_for_natives() {
    let mut vm = Vm::new(NoLimitTracker);
    let len = vm.get_global(vm.builtins(), "len").unwrap();
    let err = vm.call(len, &[Value::Int(1)]).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert!(err.traceback().is_empty());
    assert_eq!(err.to_string(), err.summary());
}
