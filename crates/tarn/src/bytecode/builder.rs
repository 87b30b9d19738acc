//! Builder for emitting bytecode.
//!
//! `CodeBuilder` is the compiler-facing way to produce code objects: it encodes opcodes
//! and operands, patches forward jumps, records the line table and argument metadata,
//! and keeps every heap value it references registered as a compiler root until
//! [`CodeBuilder::build`] hands the finished code object to the heap.
//!
//! The lower-level primitives a compiler may use instead (`new_code_object`,
//! `write_byte`, `add_constant`, `line_for_offset`) live on [`Vm`] at the bottom of
//! this file.

use super::{op::Opcode, vm::Vm};
use crate::{
    exception_private::{RunError, RunResult},
    heap::{HeapData, HeapId},
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{CodeFlags, CodeObject, KeywordOnly, LocalEntry},
    value::Value,
};

/// Position of a forward jump whose offset is patched later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpLabel(usize);

/// Where a closure finds one of its captured variables at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// A local slot of the frame creating the closure.
    Local(u16),
    /// An upvalue of the closure creating the closure.
    Upvalue(u16),
}

/// Builder for one code object.
///
/// # Usage
///
/// ```ignore
/// let mut builder = CodeBuilder::new(&mut vm, "add")?;
/// builder.params(&mut vm, &["a", "b"], 2)?;
/// builder.emit_u16(Opcode::LoadLocal, 0);
/// builder.emit_u16(Opcode::LoadLocal, 1);
/// builder.emit(Opcode::Add);
/// builder.emit(Opcode::Return);
/// let code = builder.build(&mut vm)?;
/// ```
///
/// Builders must be finished in the reverse order they were created: an inner
/// function's builder is built before its enclosing one continues.
#[derive(Debug)]
pub struct CodeBuilder {
    code: CodeObject,
    /// Line attributed to the next emitted byte.
    line: usize,
    /// Length of the VM's compiler-root list when this builder started.
    roots_mark: usize,
}

impl CodeBuilder {
    /// Starts a code object called `name`.
    pub fn new<T: ResourceTracker, Tr: VmTracer>(vm: &mut Vm<T, Tr>, name: &str) -> RunResult<Self> {
        let roots_mark = vm.compiler_roots.len();
        let name = vm.intern(name)?;
        vm.compiler_roots.push(Value::Ref(name));
        Ok(Self {
            code: CodeObject {
                name: Some(name),
                ..CodeObject::default()
            },
            line: 1,
            roots_mark,
        })
    }

    /// Sets the source line for subsequently emitted instructions.
    pub fn set_line(&mut self, line: usize) {
        self.line = line;
    }

    pub fn emit(&mut self, op: Opcode) {
        self.write(op as u8);
    }

    pub fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.write(op as u8);
        self.write(operand);
    }

    /// Emits an instruction with a u16 operand (little-endian).
    pub fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.write(op as u8);
        for byte in operand.to_le_bytes() {
            self.write(byte);
        }
    }

    /// Emits a forward jump instruction, returning a label to patch later.
    ///
    /// The offset is initially 0 and must be patched with [`CodeBuilder::patch_jump`]
    /// once the target is known.
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        debug_assert!(op.is_jump(), "{op:?} takes no jump offset");
        let label = JumpLabel(self.current_offset());
        self.emit_u16(op, 0);
        label
    }

    /// Patches a forward jump to land on the current offset.
    ///
    /// # Panics
    ///
    /// Panics if the offset does not fit an `i16`; the function is too large.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let offset = jump_offset(label.0, self.current_offset());
        let bytes = offset.to_le_bytes();
        self.code.chunk.code[label.0 + 1] = bytes[0];
        self.code.chunk.code[label.0 + 2] = bytes[1];
    }

    /// Emits a jump to an already known offset, typically a loop head.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        let offset = jump_offset(self.current_offset(), target);
        self.emit_u16(op, u16::from_le_bytes(offset.to_le_bytes()));
    }

    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.code.chunk.code.len()
    }

    /// Emits `Closure` for the code object at constant `code_const`.
    pub fn emit_closure(&mut self, code_const: u16, captures: &[Capture]) {
        self.emit_u16(Opcode::Closure, code_const);
        for capture in captures {
            let (is_local, index) = match *capture {
                Capture::Local(slot) => (1, slot),
                Capture::Upvalue(index) => (0, index),
            };
            self.write(is_local);
            for byte in index.to_le_bytes() {
                self.write(byte);
            }
        }
    }

    /// Adds a constant to the pool, returning its index.
    ///
    /// Heap constants stay registered as compiler roots until the build.
    ///
    /// # Panics
    ///
    /// Panics if the pool exceeds 65535 entries.
    pub fn add_const<T: ResourceTracker, Tr: VmTracer>(&mut self, vm: &mut Vm<T, Tr>, value: Value) -> u16 {
        if value.as_heap_id().is_some() {
            if let Some(index) = self.code.chunk.constants.iter().position(|&c| c == value) {
                return index as u16;
            }
            vm.compiler_roots.push(value);
        }
        let index = self.code.chunk.add_constant(value);
        u16::try_from(index).expect("constant pool exceeds u16 range (65535); too many constants")
    }

    /// Interns `text` and adds it as a constant.
    pub fn name<T: ResourceTracker, Tr: VmTracer>(&mut self, vm: &mut Vm<T, Tr>, text: &str) -> RunResult<u16> {
        let id = vm.intern(text)?;
        Ok(self.add_const(vm, Value::Ref(id)))
    }

    /// Emits `LoadConst` for `value`.
    pub fn emit_constant<T: ResourceTracker, Tr: VmTracer>(&mut self, vm: &mut Vm<T, Tr>, value: Value) {
        let index = self.add_const(vm, value);
        self.emit_u16(Opcode::LoadConst, index);
    }

    /// Emits an instruction whose u16 operand is the constant index of name `text`.
    pub fn emit_named<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        vm: &mut Vm<T, Tr>,
        op: Opcode,
        text: &str,
    ) -> RunResult<()> {
        let index = self.name(vm, text)?;
        self.emit_u16(op, index);
        Ok(())
    }

    /// Declares the positional parameters; the first `required` have no default.
    pub fn params<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        vm: &mut Vm<T, Tr>,
        names: &[&str],
        required: usize,
    ) -> RunResult<()> {
        if required > names.len() {
            return Err(RunError::internal("more required arguments than parameters"));
        }
        self.code.positional_names = self.root_names(vm, names)?;
        self.code.required_args = required;
        Ok(())
    }

    /// Adds a keyword-only parameter.
    pub fn keyword_only<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        vm: &mut Vm<T, Tr>,
        name: &str,
        required: bool,
    ) -> RunResult<()> {
        let name = self.root_names(vm, &[name])?[0];
        self.code.keyword_only.push(KeywordOnly { name, required });
        Ok(())
    }

    /// Collects surplus positional arguments into a `*args` tuple.
    pub fn collect_args(&mut self) {
        self.code.flags |= CodeFlags::COLLECTS_ARGS;
    }

    /// Collects unknown keyword arguments into a `**kwargs` dict.
    pub fn collect_kwargs(&mut self) {
        self.code.flags |= CodeFlags::COLLECTS_KWARGS;
    }

    /// Marks the body as a generator.
    pub fn generator(&mut self) {
        self.code.flags |= CodeFlags::GENERATOR;
    }

    /// Marks the body as a coroutine.
    pub fn coroutine(&mut self) {
        self.code.flags |= CodeFlags::COROUTINE;
    }

    /// Number of upvalues closures over this code capture.
    pub fn upvalues(&mut self, count: usize) {
        self.code.upvalue_count = count;
    }

    pub fn doc<T: ResourceTracker, Tr: VmTracer>(&mut self, vm: &mut Vm<T, Tr>, text: &str) -> RunResult<()> {
        self.code.doc = Some(self.root_names(vm, &[text])?[0]);
        Ok(())
    }

    pub fn filename<T: ResourceTracker, Tr: VmTracer>(&mut self, vm: &mut Vm<T, Tr>, name: &str) -> RunResult<()> {
        self.code.chunk.filename = Some(self.root_names(vm, &[name])?[0]);
        Ok(())
    }

    /// Records that local `name` lives in `slot` from offset `birthday` to `deathday`.
    pub fn local<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        vm: &mut Vm<T, Tr>,
        name: &str,
        slot: usize,
        birthday: usize,
        deathday: usize,
    ) -> RunResult<()> {
        let name = self.root_names(vm, &[name])?[0];
        self.code.locals.push(LocalEntry {
            slot,
            birthday,
            deathday,
            name,
        });
        Ok(())
    }

    /// Moves the finished code object onto the heap and releases the compiler roots
    /// this builder registered.
    pub fn build<T: ResourceTracker, Tr: VmTracer>(self, vm: &mut Vm<T, Tr>) -> RunResult<HeapId> {
        let id = vm.allocate(HeapData::Code(Box::new(self.code)))?;
        vm.compiler_roots.truncate(self.roots_mark);
        Ok(id)
    }

    fn write(&mut self, byte: u8) {
        self.code.chunk.write(byte, self.line);
    }

    fn root_names<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        vm: &mut Vm<T, Tr>,
        names: &[&str],
    ) -> RunResult<Vec<HeapId>> {
        names
            .iter()
            .map(|name| {
                let id = vm.intern(name)?;
                vm.compiler_roots.push(Value::Ref(id));
                Ok(id)
            })
            .collect()
    }
}

/// Offset from the end of a 3-byte jump at `at` to `target`.
fn jump_offset(at: usize, target: usize) -> i16 {
    let target = i64::try_from(target).expect("bytecode target exceeds i64");
    let after = i64::try_from(at + 3).expect("bytecode offset exceeds i64");
    i16::try_from(target - after).expect("jump offset exceeds i16 range (-32768..32767); function too large")
}

// ============================================================================
// Incremental code-object primitives
// ============================================================================

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// Allocates an empty code object and registers it as a compiler root.
    ///
    /// Release it with [`Vm::finish_code_object`] once a closure or constant pool
    /// refers to it.
    pub fn new_code_object(&mut self) -> RunResult<HeapId> {
        let id = self.allocate(HeapData::Code(Box::default()))?;
        self.compiler_roots.push(Value::Ref(id));
        Ok(id)
    }

    /// Drops `code` from the compiler roots.
    pub fn finish_code_object(&mut self, code: HeapId) {
        if let Some(pos) = self.compiler_roots.iter().rposition(|&v| v == Value::Ref(code)) {
            self.compiler_roots.remove(pos);
        }
    }

    /// Appends one byte attributed to `line`.
    pub fn write_byte(&mut self, code: HeapId, byte: u8, line: usize) {
        self.heap.code_mut(code).chunk.write(byte, line);
    }

    /// Appends a constant and returns its index.
    pub fn add_constant(&mut self, code: HeapId, value: Value) -> usize {
        self.heap.code_mut(code).chunk.add_constant(value)
    }

    /// Source line of the instruction at `offset`.
    #[must_use]
    pub fn line_for_offset(&self, code: HeapId, offset: usize) -> usize {
        self.heap.code(code).chunk.line_for_offset(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn forward_jump_is_relative_to_operand_end() {
        let mut vm = Vm::new(NoLimitTracker);
        let mut builder = CodeBuilder::new(&mut vm, "f").unwrap();
        let jump = builder.emit_jump(Opcode::Jump);
        builder.emit(Opcode::LoadNone);
        builder.emit(Opcode::Pop);
        builder.patch_jump(jump);
        let code = builder.build(&mut vm).unwrap();
        let bytes = &vm.heap().code(code).chunk.code;
        assert_eq!(bytes[..3], [Opcode::Jump as u8, 2, 0]);
    }

    #[test]
    fn backward_jump_is_negative() {
        let mut vm = Vm::new(NoLimitTracker);
        let mut builder = CodeBuilder::new(&mut vm, "f").unwrap();
        let head = builder.current_offset();
        builder.emit(Opcode::LoadNone);
        builder.emit_jump_to(Opcode::Jump, head);
        let code = builder.build(&mut vm).unwrap();
        let bytes = &vm.heap().code(code).chunk.code;
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -4);
    }

    #[test]
    fn string_constants_are_deduplicated() {
        let mut vm = Vm::new(NoLimitTracker);
        let mut builder = CodeBuilder::new(&mut vm, "f").unwrap();
        let a = builder.name(&mut vm, "x").unwrap();
        let b = builder.name(&mut vm, "x").unwrap();
        assert_eq!(a, b);
        let roots_before_build = vm.compiler_roots.len();
        assert!(roots_before_build >= 2, "name and constant are rooted");
        builder.build(&mut vm).unwrap();
        assert!(vm.compiler_roots.is_empty());
    }

    #[test]
    fn lines_follow_set_line() {
        let mut vm = Vm::new(NoLimitTracker);
        let mut builder = CodeBuilder::new(&mut vm, "f").unwrap();
        builder.emit(Opcode::LoadNone);
        builder.set_line(7);
        builder.emit(Opcode::Return);
        let code = builder.build(&mut vm).unwrap();
        assert_eq!(vm.line_for_offset(code, 0), 1);
        assert_eq!(vm.line_for_offset(code, 1), 7);
    }
}
