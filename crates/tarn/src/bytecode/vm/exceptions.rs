//! Exception raising, unwinding and the handler instructions.
//!
//! Handlers live on the value stack as a value slot followed by a `Value::Handler`
//! record. Unwinding searches the stack downwards for an armed record, but never below
//! the first frame of the current nested run: whatever is not handled there leaves the
//! run as `Err` and continues unwinding in the Rust caller.

use super::Vm;
use crate::{
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::HeapData,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Payload, SpecialMethod, TraceEntry},
    value::{Handler, HandlerKind, Value},
};

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// Builds a catchable error of a built-in exception type.
    pub fn runtime_error(exc_type: ExcType, message: impl std::fmt::Display) -> RunError {
        SimpleException::new_msg(exc_type, message).into()
    }

    /// Routes `err` to the nearest handler at or above frame `exit_depth`.
    ///
    /// On success the handler's frame is current and its ip is the handler target.
    /// Otherwise the frames of this run are unwound and the error is returned, with a
    /// materialized exception in place of a simple one.
    pub(super) fn handle_exception(&mut self, err: RunError, exit_depth: usize) -> RunResult<()> {
        if !err.is_catchable() || self.thread.frames.len() <= exit_depth {
            self.unwind_to(exit_depth);
            return Err(err);
        }
        let exc = match self.materialize(err) {
            Ok(exc) => exc,
            Err(err) => {
                self.unwind_to(exit_depth);
                return Err(err);
            }
        };
        self.thread.current_exception = exc;
        let type_name = self.heap.type_name(exc).into_owned();
        self.tracer.on_exception(&type_name, self.thread.frames.len());

        let boundary = self.thread.frames[exit_depth].slots;
        let mut found = None;
        let mut index = self.thread.stack.len();
        while index > boundary {
            index -= 1;
            if let Value::Handler(handler) = self.thread.stack[index]
                && handler.kind.catches_exceptions()
            {
                found = Some((index, handler));
                break;
            }
        }

        let Some((index, handler)) = found else {
            self.record_traceback(exc, exit_depth);
            self.unwind_to(exit_depth);
            return Err(RunError::Raised(exc));
        };

        let owner = self
            .thread
            .frames
            .iter()
            .rposition(|frame| frame.slots <= index)
            .unwrap_or(exit_depth)
            .max(exit_depth);
        // the owner frame is recorded if the exception later leaves it
        self.record_traceback(exc, owner + 1);
        while self.thread.frames.len() > owner + 1 {
            self.pop_frame();
        }
        self.close_upvalues(index + 1);
        self.thread.stack.truncate(index + 1);
        self.thread.stack[index - 1] = exc;
        self.thread.stack[index] = Value::Handler(Handler {
            kind: HandlerKind::Raise,
            target: handler.target,
        });
        self.current_frame_mut().ip = handler.target as usize;
        // the handler slot holds it from here
        self.thread.current_exception = Value::None;
        Ok(())
    }

    /// Pops every frame at or above `depth`.
    fn unwind_to(&mut self, depth: usize) {
        while self.thread.frames.len() > depth {
            self.pop_frame();
        }
    }

    /// Appends a traceback entry for each frame from the top down to `depth`.
    fn record_traceback(&mut self, exc: Value, depth: usize) {
        let entries: Vec<TraceEntry> = self.thread.frames[depth.min(self.thread.frames.len())..]
            .iter()
            .rev()
            .map(|frame| TraceEntry {
                closure: frame.closure,
                ip: frame.ip.saturating_sub(1),
            })
            .collect();
        if let Some(instance) = exc.as_heap_id().and_then(|id| self.heap.instance_mut(id))
            && let Payload::Exception { traceback } = &mut instance.payload
        {
            traceback.extend(entries);
        }
    }

    /// Turns a catchable error into an exception instance.
    pub(crate) fn materialize(&mut self, err: RunError) -> RunResult<Value> {
        match err {
            RunError::Raised(exc) => Ok(exc),
            RunError::Exc(simple) => self.new_exception(simple.exc_type(), simple.arg()),
            other => Err(other),
        }
    }

    /// Allocates an instance of built-in exception `exc_type` with `message` as its
    /// argument.
    pub fn new_exception(&mut self, exc_type: ExcType, message: Option<&str>) -> RunResult<Value> {
        let class = self.exception_class(exc_type);
        self.with_gc_paused(|vm| {
            let instance = vm.new_instance(class)?;
            let arg = match message {
                Some(text) => vm.new_str(text)?,
                None => Value::None,
            };
            let key = vm.intern("arg")?;
            vm.set_field(instance, Value::Ref(key), arg)?;
            Ok(Value::Ref(instance))
        })
    }

    /// Whether `value` is an exception instance.
    pub(crate) fn is_exception(&self, value: Value) -> bool {
        self.is_instance(value, self.exception_class(ExcType::BaseException))
    }

    /// Error raised by `raise value`.
    ///
    /// Raising an exception class instantiates it with no arguments.
    pub(super) fn raise_value(&mut self, value: Value) -> RunError {
        if self.is_exception(value) {
            return RunError::Raised(value);
        }
        if let Value::Ref(id) = value
            && matches!(self.heap.get(id), HeapData::Class(_))
            && self.is_subclass(id, self.exception_class(ExcType::BaseException))
        {
            return match self.call_direct(value, &[]) {
                Ok(exc) => RunError::Raised(exc),
                Err(err) => err,
            };
        }
        ExcType::type_error("exceptions must derive from BaseException")
    }

    fn top_handler(&self) -> RunResult<Handler> {
        match self.peek(0) {
            Value::Handler(handler) => Ok(handler),
            _ => Err(RunError::internal("expected a handler record on top of the stack")),
        }
    }

    fn set_top_handler(&mut self, kind: HandlerKind) -> RunResult<()> {
        let handler = self.top_handler()?;
        let top = self.thread.stack.len() - 1;
        self.thread.stack[top] = Value::Handler(Handler { kind, ..handler });
        Ok(())
    }

    /// `[exc, handler, class] -> [exc, handler, matched]`
    ///
    /// A match moves the handler to `Except`, so a later `EndFinally` does not re-raise.
    pub(super) fn op_filter_except(&mut self) -> RunResult<()> {
        let filter = self.pop();
        let handler = self.top_handler()?;
        if handler.kind != HandlerKind::Raise {
            self.push(Value::Bool(false));
            return Ok(());
        }
        let exc = self.peek(1);
        let matched = self.exception_matches(exc, filter)?;
        if matched {
            self.set_top_handler(HandlerKind::Except)?;
        }
        self.push(Value::Bool(matched));
        Ok(())
    }

    fn exception_matches(&self, exc: Value, filter: Value) -> RunResult<bool> {
        let base = self.exception_class(ExcType::BaseException);
        let Value::Ref(id) = filter else {
            return Err(ExcType::type_error(
                "catching classes that do not inherit from BaseException is not allowed",
            ));
        };
        match self.heap.get(id) {
            HeapData::Tuple(classes) => {
                for &class in classes.as_slice() {
                    if self.exception_matches(exc, class)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            HeapData::Class(_) if self.is_subclass(id, base) => Ok(self.is_instance(exc, id)),
            _ => Err(ExcType::type_error(
                "catching classes that do not inherit from BaseException is not allowed",
            )),
        }
    }

    pub(super) fn op_begin_finally(&mut self) -> RunResult<()> {
        self.set_top_handler(HandlerKind::Done)
    }

    /// Completes a handler region: re-raises a pending exception or finishes a pending
    /// return. Returns the exit when that return ends the run's frame.
    pub(super) fn op_end_finally(&mut self, exit_depth: usize) -> RunResult<Option<super::FrameExit>> {
        let handler = self.top_handler()?;
        match handler.kind {
            HandlerKind::Raise => Err(RunError::Raised(self.peek(1))),
            HandlerKind::Return => {
                let value = self.peek(1);
                self.pop_n(2);
                Ok(self.return_value(value, exit_depth))
            }
            _ => Ok(None),
        }
    }

    /// `[cm, None, handler] -> [cm, None, handler]` after entering `cm`.
    ///
    /// Calls `__enter__`, then pushes the handler record and the entered value.
    pub(super) fn op_push_with(&mut self, target: usize) -> RunResult<()> {
        let manager = self.peek(0);
        let class = self.class_of(manager);
        let (Some(enter), Some(_)) = (
            self.heap.class(class).special(SpecialMethod::Enter),
            self.heap.class(class).special(SpecialMethod::Exit),
        ) else {
            return Err(ExcType::type_error(format!(
                "'{}' object does not support the context manager protocol",
                self.heap.type_name(manager)
            )));
        };
        let entered = self.call_direct(enter, &[manager])?;
        self.push(Value::None);
        self.push(super::handler_value(HandlerKind::With, target)?);
        self.push(entered);
        Ok(())
    }

    /// Calls `__exit__` for the `with` record on top of the stack.
    ///
    /// With a pending exception, a truthy result from `__exit__` suppresses it.
    pub(super) fn op_cleanup_with(&mut self) -> RunResult<()> {
        let handler = self.top_handler()?;
        let pending = self.peek(1);
        let manager = self.peek(2);
        let class = self.class_of(manager);
        let Some(exit) = self.heap.class(class).special(SpecialMethod::Exit) else {
            return Err(RunError::internal("context manager lost its __exit__"));
        };
        if handler.kind == HandlerKind::Raise {
            let exc_class = Value::Ref(self.class_of(pending));
            let suppress = self.call_direct(exit, &[manager, exc_class, pending, Value::None])?;
            if self.is_truthy(suppress)? {
                let top = self.thread.stack.len() - 1;
                self.thread.stack[top - 1] = Value::None;
                self.set_top_handler(HandlerKind::Done)?;
            }
        } else {
            self.call_direct(exit, &[manager, Value::None, Value::None, Value::None])?;
        }
        Ok(())
    }
}
