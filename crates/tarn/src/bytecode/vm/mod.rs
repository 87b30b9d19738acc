//! Bytecode virtual machine.
//!
//! The VM is stack based: every thread owns a value stack and a frame stack, and each
//! frame owns its instruction pointer. Natives and the host re-enter the interpreter
//! through [`Vm::call_stack`], which runs a nested loop that stops when the frame it
//! pushed returns. Exceptions unwind only down to the boundary of the innermost
//! nested run; from there they leave as `Err` and continue in the caller.

mod attr;
mod binary;
mod call;
mod collections;
mod compare;
mod exceptions;
mod format;
mod generator;
mod upvalue;

pub(crate) use attr::install_specials;
pub(crate) use binary::BinaryOp;
pub(crate) use call::CallResult;
pub(crate) use compare::CompareOp;

use crate::{
    builtins,
    exception_private::{ExcType, RunError, RunResult},
    exception_public::Exception,
    gc::GcStats,
    heap::{Heap, HeapData, HeapId, HeapStats, TableSlot},
    object::Object,
    resource::{GcConfig, ResourceTracker},
    table::Table,
    tracer::{NoopTracer, VmTracer},
    types::{Closure, InstanceKind, NativeFunction, NativeTarget},
    value::{Handler, HandlerKind, KWARGS_DICT, KWARGS_LIST, KWARGS_SINGLE, Value},
};

use super::op::Opcode;

/// Signature shared by every function implemented in Rust.
///
/// `args` holds the positional arguments; when `has_kw` is set the last element is a
/// `dict` of keyword arguments.
pub type NativeFn<T, Tr> = fn(&mut Vm<T, Tr>, &[Value], bool) -> RunResult<Value>;

/// How a run of the interpreter loop ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameExit {
    /// The frame the run was started for returned this value.
    Return(Value),
    /// The generator frame the run was started for suspended with this value.
    Yield(Value),
}

/// One activation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    pub closure: HeapId,
    pub code: HeapId,
    /// Offset of the next instruction.
    pub ip: usize,
    /// Stack index of the first argument; locals are addressed relative to it.
    pub slots: usize,
    /// Stack length to restore on return (the callee's own slot).
    pub out_slots: usize,
    /// Module instance holding this frame's globals.
    pub globals: HeapId,
}

/// Execution state of one thread: stacks, open upvalues and exception state.
#[derive(Debug)]
pub(crate) struct ThreadState {
    pub id: usize,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Open upvalues ordered by stack slot, highest slot last.
    pub open_upvalues: Vec<HeapId>,
    /// Exception being propagated, kept reachable until a handler takes it.
    pub current_exception: Value,
    /// Temporaries natives keep alive across allocations.
    pub scratch: [Value; 3],
    /// Result of a finished spawned thread, held until it is joined.
    pub result: Value,
    /// Error a spawned thread finished with; a raised exception also sits in `result`.
    pub failure: Option<RunError>,
    /// Only the main thread triggers collections.
    pub main: bool,
}

impl ThreadState {
    pub fn new(id: usize, main: bool) -> Self {
        Self {
            id,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            current_exception: Value::None,
            scratch: [Value::None; 3],
            result: Value::None,
            failure: None,
            main,
        }
    }
}

/// Classes backing the built-in value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinClasses {
    pub object: HeapId,
    pub type_class: HeapId,
    pub module: HeapId,
    pub none: HeapId,
    pub bool: HeapId,
    pub int: HeapId,
    pub float: HeapId,
    pub str: HeapId,
    pub bytes: HeapId,
    pub tuple: HeapId,
    pub list: HeapId,
    pub dict: HeapId,
    pub set: HeapId,
    pub function: HeapId,
    pub native: HeapId,
    pub method: HeapId,
    pub code: HeapId,
    pub generator: HeapId,
    pub iterator: HeapId,
    pub slice: HeapId,
}

impl BuiltinClasses {
    pub fn iter(&self) -> impl Iterator<Item = HeapId> {
        [
            self.object,
            self.type_class,
            self.module,
            self.none,
            self.bool,
            self.int,
            self.float,
            self.str,
            self.bytes,
            self.tuple,
            self.list,
            self.dict,
            self.set,
            self.function,
            self.native,
            self.method,
            self.code,
            self.generator,
            self.iterator,
            self.slice,
        ]
        .into_iter()
    }
}

/// The virtual machine: heap, module registry, built-in classes and thread states.
///
/// Generic over the resource tracker and the tracer; both default to no-op
/// implementations that compile away.
#[derive(Debug)]
pub struct Vm<T: ResourceTracker, Tr: VmTracer = NoopTracer> {
    pub(crate) heap: Heap<T>,
    /// State of the thread currently holding the VM.
    pub(crate) thread: ThreadState,
    /// States of registered threads not currently running. `None` marks a free slot.
    pub(crate) threads: Vec<Option<ThreadState>>,
    /// Module instance whose fields are the built-in names.
    pub(crate) builtins: HeapId,
    /// Module name -> module instance.
    pub(crate) modules: Table,
    pub(crate) classes: BuiltinClasses,
    /// Built-in exception classes, indexed by `ExcType as usize`.
    pub(crate) exc_classes: Vec<HeapId>,
    /// Interned names of the special methods, indexed by `SpecialMethod as usize`.
    pub(crate) special_names: Vec<HeapId>,
    /// Values a compiler is still assembling into code objects.
    pub(crate) compiler_roots: Vec<Value>,
    pub(crate) host_functions: Vec<NativeFn<T, Tr>>,
    pub(crate) tracer: Tr,
    pub(crate) next_thread_id: usize,
}

impl<T: ResourceTracker> Vm<T, NoopTracer> {
    /// Creates a VM with the default collector configuration.
    pub fn new(tracker: T) -> Self {
        Self::with_config(tracker, GcConfig::default())
    }

    pub fn with_config(tracker: T, config: GcConfig) -> Self {
        Self::with_tracer(tracker, config, NoopTracer)
    }
}

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// Creates a VM reporting execution events to `tracer`.
    ///
    /// Built-in classes, functions and special-method names are allocated immortal and
    /// outside the tracker's budget.
    pub fn with_tracer(tracker: T, config: GcConfig, tracer: Tr) -> Self {
        let mut heap = Heap::new(tracker, config);
        let boot = builtins::bootstrap(&mut heap);
        Self {
            heap,
            thread: ThreadState::new(0, true),
            threads: Vec::new(),
            builtins: boot.builtins,
            modules: Table::new(),
            classes: boot.classes,
            exc_classes: boot.exc_classes,
            special_names: boot.special_names,
            compiler_roots: Vec::new(),
            host_functions: Vec::new(),
            tracer,
            next_thread_id: 1,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[must_use]
    pub fn heap(&self) -> &Heap<T> {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap<T> {
        &mut self.heap
    }

    #[must_use]
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut Tr {
        &mut self.tracer
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.heap_stats()
    }

    #[must_use]
    pub fn gc_stats(&self) -> GcStats {
        self.heap.gc_stats()
    }

    #[must_use]
    pub fn classes(&self) -> &BuiltinClasses {
        &self.classes
    }

    /// The class backing built-in exception type `exc_type`.
    #[must_use]
    pub fn exception_class(&self, exc_type: ExcType) -> HeapId {
        self.exc_classes[exc_type as usize]
    }

    /// The module holding the built-in names.
    #[must_use]
    pub fn builtins(&self) -> HeapId {
        self.builtins
    }

    /// Number of frames on the current thread.
    #[must_use]
    pub fn frame_depth(&self) -> usize {
        self.thread.frames.len()
    }

    // ========================================================================
    // Stack
    // ========================================================================

    pub fn push(&mut self, value: Value) {
        self.thread.stack.push(value);
    }

    /// Removes the top of the stack.
    ///
    /// # Panics
    ///
    /// Panics if the stack is empty. Instructions check their operands before popping,
    /// so only a native function popping more than it pushed can hit this.
    pub fn pop(&mut self) -> Value {
        self.thread.stack.pop().expect("stack underflow")
    }

    /// Value `distance` slots below the top of the stack.
    ///
    /// # Panics
    ///
    /// Panics if the stack holds `distance` values or fewer.
    #[must_use]
    pub fn peek(&self, distance: usize) -> Value {
        let len = self.thread.stack.len();
        self.thread.stack[len.checked_sub(distance + 1).expect("stack underflow")]
    }

    #[must_use]
    pub fn stack_len(&self) -> usize {
        self.thread.stack.len()
    }

    /// Stores `value` in scratch slot `index`, keeping it reachable across allocations.
    pub fn set_scratch(&mut self, index: usize, value: Value) {
        self.thread.scratch[index] = value;
    }

    fn pop_n(&mut self, count: usize) {
        let len = self.thread.stack.len();
        self.thread.stack.truncate(len - count);
    }

    /// Replaces the top `count` values with `value`.
    fn replace_top(&mut self, count: usize, value: Value) {
        self.pop_n(count);
        self.push(value);
    }

    pub(crate) fn current_frame(&self) -> &CallFrame {
        self.thread.frames.last().expect("no active frame")
    }

    pub(crate) fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.thread.frames.last_mut().expect("no active frame")
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocates a heap object, collecting first if the allocation counter asks for it.
    ///
    /// Anything the caller holds only in Rust locals must be rooted (on the stack or
    /// in a scratch slot) before calling this.
    pub fn allocate(&mut self, data: HeapData) -> RunResult<HeapId> {
        self.maybe_collect();
        Ok(self.heap.allocate(data)?)
    }

    /// Returns the interned string for `text`, allocating it on first use.
    pub fn intern(&mut self, text: &str) -> RunResult<HeapId> {
        self.maybe_collect();
        Ok(self.heap.intern(text)?)
    }

    fn maybe_collect(&mut self) {
        if self.thread.main && self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Runs `f` with collection suspended.
    pub fn with_gc_paused<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.heap.pause_gc();
        let result = f(self);
        self.heap.resume_gc();
        result
    }

    /// Allocates a fresh instance of `class`, with the payload its kind calls for.
    pub fn new_instance(&mut self, class: HeapId) -> RunResult<HeapId> {
        let kind = self.heap.class(class).kind;
        self.allocate(HeapData::Instance(crate::types::Instance::new(class, kind)))
    }

    /// Wraps `code` in a closure with no captured variables.
    pub fn make_closure(&mut self, code: HeapId, globals: HeapId) -> RunResult<HeapId> {
        if self.heap.code(code).upvalue_count != 0 {
            return Err(RunError::internal(
                "code object captures variables; it must be instantiated by the Closure instruction",
            ));
        }
        self.allocate(HeapData::Closure(Closure {
            code,
            upvalues: Vec::new(),
            fields: Table::new(),
            annotations: Value::None,
            globals,
        }))
    }

    // ========================================================================
    // Modules, globals and native registration
    // ========================================================================

    /// Creates a module instance named `name` and registers it.
    pub fn new_module(&mut self, name: &str) -> RunResult<HeapId> {
        self.with_gc_paused(|vm| {
            let name_id = vm.intern(name)?;
            let module = vm.new_instance(vm.classes.module)?;
            let key = vm.intern("__name__")?;
            vm.set_field(module, Value::Ref(key), Value::Ref(name_id))?;
            let keys = vm.heap.keys();
            vm.modules.set(&keys, Value::Ref(name_id), Value::Ref(module))?;
            Ok(module)
        })
    }

    /// Registered module called `name`.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<HeapId> {
        let id = self.heap.find_interned(name)?;
        self.modules
            .get_by_str(Value::Ref(id), self.heap.str_hash(id))
            .and_then(Value::as_heap_id)
    }

    #[must_use]
    pub fn get_global(&self, module: HeapId, name: &str) -> Option<Value> {
        let id = self.heap.find_interned(name)?;
        self.heap
            .table(module, TableSlot::Fields)?
            .get_by_str(Value::Ref(id), self.heap.str_hash(id))
    }

    pub fn set_global(&mut self, module: HeapId, name: &str, value: Value) -> RunResult<()> {
        self.push(value);
        let key = self.intern(name);
        self.pop();
        self.set_field(module, Value::Ref(key?), value)
    }

    /// Registers `function` as a native callable and returns it.
    pub fn define_native(&mut self, name: &str, function: NativeFn<T, Tr>) -> RunResult<Value> {
        self.host_functions.push(function);
        let id = self.allocate(HeapData::Native(NativeFunction {
            name: name.to_owned().into(),
            target: NativeTarget::Host(self.host_functions.len() - 1),
            is_property: false,
        }))?;
        Ok(Value::Ref(id))
    }

    /// Registers `function` and binds it to `name` in the builtins module.
    pub fn define_builtin(&mut self, name: &str, function: NativeFn<T, Tr>) -> RunResult<Value> {
        let native = self.define_native(name, function)?;
        self.set_global(self.builtins, name, native)?;
        Ok(native)
    }

    /// Sets `key` in the attribute table of `owner`.
    pub(crate) fn set_field(&mut self, owner: HeapId, key: Value, value: Value) -> RunResult<()> {
        self.heap
            .with_table(owner, TableSlot::Fields, |table, keys| table.set(keys, key, value))?;
        Ok(())
    }

    // ========================================================================
    // Host entry points
    // ========================================================================

    /// Runs the top-level code object `code` as module `name`.
    ///
    /// Returns the value the module body returned.
    pub fn run_module(&mut self, name: &str, code: HeapId) -> Result<Object, Exception> {
        match self.run_module_value(name, code) {
            Ok(value) => Ok(self.to_object(value)),
            Err(err) => Err(self.to_exception(&err)),
        }
    }

    /// Like [`Vm::run_module`], but returns the raw value.
    pub fn run_module_value(&mut self, name: &str, code: HeapId) -> RunResult<Value> {
        self.push(Value::Ref(code));
        let closure = self
            .new_module(name)
            .and_then(|module| self.make_closure(code, module));
        self.pop();
        self.call_direct(Value::Ref(closure?), &[])
    }

    /// Calls `callee` with positional `args` and converts the outcome for the host.
    pub fn call(&mut self, callee: Value, args: &[Value]) -> Result<Object, Exception> {
        match self.call_direct(callee, args) {
            Ok(value) => Ok(self.to_object(value)),
            Err(err) => Err(self.to_exception(&err)),
        }
    }

    // ========================================================================
    // Interpreter loop
    // ========================================================================

    /// Runs until the frame at index `exit_depth` returns or yields.
    ///
    /// Catchable exceptions are routed to handlers belonging to frames at or above
    /// `exit_depth`; anything else unwinds those frames and is returned.
    pub(crate) fn run(&mut self, exit_depth: usize) -> RunResult<FrameExit> {
        loop {
            match self.execute(exit_depth) {
                Ok(exit) => return Ok(exit),
                Err(err) => self.handle_exception(err, exit_depth)?,
            }
        }
    }

    fn fetch_u8(&mut self) -> RunResult<u8> {
        let frame = self.thread.frames.last_mut().expect("no active frame");
        let byte = *self
            .heap
            .code(frame.code)
            .chunk
            .code
            .get(frame.ip)
            .ok_or_else(|| RunError::internal("instruction pointer ran past the end of the bytecode"))?;
        frame.ip += 1;
        Ok(byte)
    }

    fn fetch_u16(&mut self) -> RunResult<u16> {
        let lo = self.fetch_u8()?;
        let hi = self.fetch_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn fetch_i16(&mut self) -> RunResult<i16> {
        let lo = self.fetch_u8()?;
        let hi = self.fetch_u8()?;
        Ok(i16::from_le_bytes([lo, hi]))
    }

    /// Absolute target of a jump whose operand was just read.
    fn jump_target(&self, offset: i16) -> RunResult<usize> {
        self.current_frame()
            .ip
            .checked_add_signed(isize::from(offset))
            .ok_or_else(|| RunError::internal("jump before the start of the bytecode"))
    }

    fn jump(&mut self, offset: i16) -> RunResult<()> {
        let target = self.jump_target(offset)?;
        self.current_frame_mut().ip = target;
        Ok(())
    }

    fn read_constant(&self, index: u16) -> RunResult<Value> {
        let frame = self.current_frame();
        self.heap
            .code(frame.code)
            .chunk
            .constants
            .get(usize::from(index))
            .copied()
            .ok_or_else(|| RunError::internal("constant index out of range"))
    }

    /// Reads a u16 operand naming a string constant.
    fn read_name(&mut self) -> RunResult<HeapId> {
        let index = self.fetch_u16()?;
        match self.read_constant(index)? {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Str(_)) => Ok(id),
            _ => Err(RunError::internal("name operand is not a string constant")),
        }
    }

    /// Fails unless the running frame has at least `count` values at or above its
    /// first slot.
    fn require_operands(&self, count: usize) -> RunResult<()> {
        if self.thread.stack.len() >= self.current_frame().slots + count {
            Ok(())
        } else {
            Err(RunError::internal("stack underflow"))
        }
    }

    fn local_index(&self, slot: u16) -> RunResult<usize> {
        let index = self.current_frame().slots + usize::from(slot);
        if index < self.thread.stack.len() {
            Ok(index)
        } else {
            Err(RunError::internal("local slot beyond the top of the stack"))
        }
    }

    fn load_global(&self, globals: HeapId, name: HeapId) -> RunResult<Value> {
        let hash = self.heap.str_hash(name);
        for owner in [globals, self.builtins] {
            if let Some(value) = self
                .heap
                .table(owner, TableSlot::Fields)
                .and_then(|table| table.get_by_str(Value::Ref(name), hash))
            {
                return Ok(value);
            }
        }
        Err(ExcType::name_error(self.heap.str(name)))
    }

    /// Executes instructions until the run's frame exits or an error escapes.
    fn execute(&mut self, exit_depth: usize) -> RunResult<FrameExit> {
        loop {
            self.heap.tracker_mut().check_time()?;

            let ip = self.current_frame().ip;
            let byte = self.fetch_u8()?;
            let opcode =
                Opcode::try_from(byte).map_err(|byte| RunError::internal(format!("invalid opcode {byte:#04x}")))?;
            self.tracer.on_instruction(
                ip,
                opcode,
                self.thread.stack.len().saturating_sub(self.current_frame().slots),
                self.thread.frames.len(),
            );
            self.require_operands(opcode.stack_inputs())?;

            match opcode {
                // ============================================================
                // Stack
                // ============================================================
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::Dup => self.push(self.peek(0)),
                Opcode::Swap => {
                    let len = self.thread.stack.len();
                    self.thread.stack.swap(len - 1, len - 2);
                }

                // ============================================================
                // Constants
                // ============================================================
                Opcode::LoadConst => {
                    let index = self.fetch_u16()?;
                    let value = self.read_constant(index)?;
                    self.push(value);
                }
                Opcode::LoadNone => self.push(Value::None),
                Opcode::LoadTrue => self.push(Value::Bool(true)),
                Opcode::LoadFalse => self.push(Value::Bool(false)),
                Opcode::LoadKwargs => {
                    let count = self.fetch_u16()?;
                    self.push(Value::Kwargs(u32::from(count)));
                }
                Opcode::ExpandArgs => {
                    let marker = match self.fetch_u8()? {
                        0 => KWARGS_SINGLE,
                        1 => KWARGS_LIST,
                        2 => KWARGS_DICT,
                        other => return Err(RunError::internal(format!("invalid expansion kind {other}"))),
                    };
                    self.push(Value::Kwargs(marker));
                }

                // ============================================================
                // Variables
                // ============================================================
                Opcode::LoadLocal => {
                    let slot = self.fetch_u16()?;
                    let index = self.local_index(slot)?;
                    self.push(self.thread.stack[index]);
                }
                Opcode::StoreLocal => {
                    let slot = self.fetch_u16()?;
                    let value = self.pop();
                    let index = self.local_index(slot)?;
                    self.thread.stack[index] = value;
                }
                Opcode::LoadGlobal => {
                    let name = self.read_name()?;
                    let value = self.load_global(self.current_frame().globals, name)?;
                    self.push(value);
                }
                Opcode::StoreGlobal => {
                    let name = self.read_name()?;
                    let globals = self.current_frame().globals;
                    self.set_field(globals, Value::Ref(name), self.peek(0))?;
                    self.pop();
                }
                Opcode::DeleteGlobal => {
                    let name = self.read_name()?;
                    let globals = self.current_frame().globals;
                    let removed = self
                        .heap
                        .with_table(globals, TableSlot::Fields, |table, keys| table.delete(keys, Value::Ref(name)))?;
                    if !removed {
                        return Err(ExcType::name_error(self.heap.str(name)));
                    }
                }
                Opcode::LoadUpvalue => {
                    let index = self.fetch_u16()?;
                    let value = self.load_upvalue(usize::from(index))?;
                    self.push(value);
                }
                Opcode::StoreUpvalue => {
                    let index = self.fetch_u16()?;
                    self.store_upvalue(usize::from(index), self.peek(0))?;
                    self.pop();
                }
                Opcode::CloseUpvalue => {
                    self.close_upvalues(self.thread.stack.len() - 1);
                    self.pop();
                }
                Opcode::TestArg => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_unset()));
                }

                // ============================================================
                // Attributes and items
                // ============================================================
                Opcode::GetAttr => {
                    let name = self.read_name()?;
                    let value = self.get_attribute(self.peek(0), name)?;
                    self.replace_top(1, value);
                }
                Opcode::SetAttr => {
                    let name = self.read_name()?;
                    self.set_attribute(self.peek(1), name, self.peek(0))?;
                    self.pop_n(2);
                }
                Opcode::DeleteAttr => {
                    let name = self.read_name()?;
                    self.delete_attribute(self.peek(0), name)?;
                    self.pop();
                }
                Opcode::GetItem => {
                    let value = self.get_item(self.peek(1), self.peek(0))?;
                    self.replace_top(2, value);
                }
                Opcode::SetItem => {
                    self.set_item(self.peek(2), self.peek(1), self.peek(0))?;
                    self.pop_n(3);
                }
                Opcode::DeleteItem => {
                    self.delete_item(self.peek(1), self.peek(0))?;
                    self.pop_n(2);
                }

                // ============================================================
                // Operators
                // ============================================================
                Opcode::Add => self.binary_instruction(BinaryOp::Add)?,
                Opcode::Sub => self.binary_instruction(BinaryOp::Sub)?,
                Opcode::Mul => self.binary_instruction(BinaryOp::Mul)?,
                Opcode::TrueDiv => self.binary_instruction(BinaryOp::TrueDiv)?,
                Opcode::FloorDiv => self.binary_instruction(BinaryOp::FloorDiv)?,
                Opcode::Mod => self.binary_instruction(BinaryOp::Mod)?,
                Opcode::Negate => {
                    let value = self.negate(self.peek(0))?;
                    self.replace_top(1, value);
                }
                Opcode::Not => {
                    let truthy = self.is_truthy(self.peek(0))?;
                    self.replace_top(1, Value::Bool(!truthy));
                }
                Opcode::Equal => {
                    let equal = self.values_equal(self.peek(1), self.peek(0))?;
                    self.replace_top(2, Value::Bool(equal));
                }
                Opcode::NotEqual => {
                    let equal = self.values_equal(self.peek(1), self.peek(0))?;
                    self.replace_top(2, Value::Bool(!equal));
                }
                Opcode::Less => self.compare_instruction(CompareOp::Lt)?,
                Opcode::Greater => self.compare_instruction(CompareOp::Gt)?,
                Opcode::LessEqual => self.compare_instruction(CompareOp::Le)?,
                Opcode::GreaterEqual => self.compare_instruction(CompareOp::Ge)?,
                Opcode::Is => {
                    let same = self.peek(1) == self.peek(0);
                    self.replace_top(2, Value::Bool(same));
                }
                Opcode::In => {
                    let found = self.contains(self.peek(0), self.peek(1))?;
                    self.replace_top(2, Value::Bool(found));
                }

                // ============================================================
                // Control flow
                // ============================================================
                Opcode::Jump => {
                    let offset = self.fetch_i16()?;
                    self.jump(offset)?;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.fetch_i16()?;
                    let truthy = self.is_truthy(self.peek(0))?;
                    self.pop();
                    if !truthy {
                        self.jump(offset)?;
                    }
                }
                Opcode::JumpIfTrue => {
                    let offset = self.fetch_i16()?;
                    let truthy = self.is_truthy(self.peek(0))?;
                    self.pop();
                    if truthy {
                        self.jump(offset)?;
                    }
                }

                // ============================================================
                // Collections
                // ============================================================
                Opcode::BuildTuple => {
                    let count = usize::from(self.fetch_u16()?);
                    self.require_operands(count)?;
                    let items = self.top_values(count).to_vec();
                    let tuple = self.new_tuple(items)?;
                    self.replace_top(count, tuple);
                }
                Opcode::BuildList => {
                    let count = usize::from(self.fetch_u16()?);
                    self.require_operands(count)?;
                    let items = self.top_values(count).to_vec();
                    let list = self.new_list(items)?;
                    self.replace_top(count, list);
                }
                Opcode::BuildDict => {
                    let pairs = usize::from(self.fetch_u16()?);
                    self.require_operands(pairs * 2)?;
                    let dict = self.build_dict(pairs)?;
                    self.replace_top(pairs * 2, dict);
                }
                Opcode::BuildSet => {
                    let count = usize::from(self.fetch_u16()?);
                    self.require_operands(count)?;
                    let set = self.build_set(count)?;
                    self.replace_top(count, set);
                }
                Opcode::BuildSlice => {
                    let count = usize::from(self.fetch_u8()?);
                    self.require_operands(count)?;
                    let slice = self.build_slice(count)?;
                    self.replace_top(count, slice);
                }
                Opcode::Unpack => {
                    let count = usize::from(self.fetch_u8()?);
                    self.unpack(count)?;
                }

                // ============================================================
                // Functions
                // ============================================================
                Opcode::Call => {
                    let argc = usize::from(self.fetch_u8()?);
                    self.require_operands(argc + 1)?;
                    match self.call_value(argc)? {
                        CallResult::Push(value) => self.push(value),
                        CallResult::FramePushed => {}
                    }
                }
                Opcode::Closure => {
                    let index = self.fetch_u16()?;
                    self.op_closure(index)?;
                }
                Opcode::Return => {
                    let value = self.pop();
                    if let Some(exit) = self.return_value(value, exit_depth) {
                        return Ok(exit);
                    }
                }
                Opcode::Yield => {
                    let value = self.pop();
                    let code = self.current_frame().code;
                    if self.thread.frames.len() != exit_depth + 1 || !self.heap.code(code).is_generator() {
                        return Err(RunError::internal("yield outside of a running generator"));
                    }
                    return Ok(FrameExit::Yield(value));
                }

                // ============================================================
                // Classes
                // ============================================================
                Opcode::MakeClass => {
                    let name = self.read_name()?;
                    let class = self.make_class(name, self.peek(0))?;
                    self.replace_top(1, Value::Ref(class));
                }
                Opcode::DefineMethod => {
                    let name = self.read_name()?;
                    self.define_method(self.peek(1), name, self.peek(0))?;
                    self.pop();
                }
                Opcode::FinalizeClass => {
                    let class = self.expect_class(self.peek(0))?;
                    self.finalize_class(class);
                }

                // ============================================================
                // Iteration
                // ============================================================
                Opcode::GetIter => {
                    let iterator = self.get_iter(self.peek(0))?;
                    self.replace_top(1, iterator);
                }
                Opcode::ForIter => {
                    let offset = self.fetch_i16()?;
                    match self.iterator_next(self.peek(0))? {
                        Some(item) => self.push(item),
                        None => {
                            self.pop();
                            self.jump(offset)?;
                        }
                    }
                }

                // ============================================================
                // Exceptions
                // ============================================================
                Opcode::Raise => {
                    let exc = self.peek(0);
                    return Err(self.raise_value(exc));
                }
                Opcode::PushTry | Opcode::PushFinally => {
                    let offset = self.fetch_i16()?;
                    let target = self.jump_target(offset)?;
                    let kind = if opcode == Opcode::PushTry {
                        HandlerKind::Try
                    } else {
                        HandlerKind::Finally
                    };
                    self.push(Value::None);
                    self.push(handler_value(kind, target)?);
                }
                Opcode::PushWith => {
                    let offset = self.fetch_i16()?;
                    let target = self.jump_target(offset)?;
                    self.op_push_with(target)?;
                }
                Opcode::PopHandler => self.pop_n(2),
                Opcode::FilterExcept => self.op_filter_except()?,
                Opcode::BeginFinally => self.op_begin_finally()?,
                Opcode::EndFinally => {
                    if let Some(exit) = self.op_end_finally(exit_depth)? {
                        return Ok(exit);
                    }
                }
                Opcode::CleanupWith => self.op_cleanup_with()?,
            }
        }
    }

    fn top_values(&self, count: usize) -> &[Value] {
        let len = self.thread.stack.len();
        &self.thread.stack[len - count..]
    }

    fn binary_instruction(&mut self, op: BinaryOp) -> RunResult<()> {
        let result = self.binary_op(op, self.peek(1), self.peek(0))?;
        self.replace_top(2, result);
        Ok(())
    }

    fn compare_instruction(&mut self, op: CompareOp) -> RunResult<()> {
        let result = self.compare(op, self.peek(1), self.peek(0))?;
        self.replace_top(2, Value::Bool(result));
        Ok(())
    }

    /// Completes a `return` from the current frame.
    ///
    /// A `finally` or `with` handler still armed in the frame intercepts the return:
    /// the value is parked in the handler's slot and the cleanup code runs first.
    /// Returns the exit when the frame that ended is the run's own frame.
    pub(crate) fn return_value(&mut self, value: Value, exit_depth: usize) -> Option<FrameExit> {
        let base = self.current_frame().slots;
        let mut index = self.thread.stack.len();
        while index > base {
            index -= 1;
            if let Value::Handler(handler) = self.thread.stack[index]
                && handler.kind.intercepts_return()
            {
                self.close_upvalues(index + 1);
                self.thread.stack.truncate(index + 1);
                self.thread.stack[index - 1] = value;
                self.thread.stack[index] = Value::Handler(Handler {
                    kind: HandlerKind::Return,
                    target: handler.target,
                });
                self.current_frame_mut().ip = handler.target as usize;
                return None;
            }
        }

        self.pop_frame();
        if self.thread.frames.len() == exit_depth {
            Some(FrameExit::Return(value))
        } else {
            self.push(value);
            None
        }
    }

    /// Pops the current frame, closing its upvalues and dropping its stack region.
    pub(crate) fn pop_frame(&mut self) -> CallFrame {
        let frame = self.thread.frames.pop().expect("no active frame");
        self.close_upvalues(frame.slots);
        self.thread.stack.truncate(frame.out_slots);
        self.tracer.on_return(self.thread.frames.len());
        frame
    }

    fn expect_class(&self, value: Value) -> RunResult<HeapId> {
        match value {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Class(_)) => Ok(id),
            _ => Err(RunError::internal("expected a class on the stack")),
        }
    }

    /// Class whose instances the given kind of native payload belongs to.
    pub(crate) fn class_for_kind(&self, kind: InstanceKind) -> HeapId {
        match kind {
            InstanceKind::Plain => self.classes.object,
            InstanceKind::List => self.classes.list,
            InstanceKind::Dict => self.classes.dict,
            InstanceKind::Set => self.classes.set,
            InstanceKind::Generator => self.classes.generator,
            InstanceKind::Exception => self.exception_class(ExcType::BaseException),
            InstanceKind::Iterator => self.classes.iterator,
            InstanceKind::Slice => self.classes.slice,
        }
    }
}

/// Builds a handler record for the absolute offset `target`.
fn handler_value(kind: HandlerKind, target: usize) -> RunResult<Value> {
    let target = u32::try_from(target).map_err(|_| RunError::internal("handler target exceeds u32"))?;
    Ok(Value::Handler(Handler { kind, target }))
}
