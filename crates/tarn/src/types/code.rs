use bitflags::bitflags;

use crate::{heap::HeapId, value::Value};

bitflags! {
    /// Static properties of a function body.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
    pub struct CodeFlags: u8 {
        /// Calling the function builds a generator instead of running the body.
        const GENERATOR = 1 << 0;
        /// Body of an `async def`; built like a generator.
        const COROUTINE = 1 << 1;
        /// Extra positional arguments are collected into a `*args` tuple.
        const COLLECTS_ARGS = 1 << 2;
        /// Unknown keyword arguments are collected into a `**kwargs` dict.
        const COLLECTS_KWARGS = 1 << 3;
    }
}

/// First bytecode offset that belongs to a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub start_offset: usize,
    pub line: usize,
}

/// Bytecode, constant pool and line map of one function body.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub lines: Vec<LineEntry>,
    /// Interned source file name.
    pub filename: Option<HeapId>,
}

impl Chunk {
    /// Appends one byte attributed to `line`.
    pub fn write(&mut self, byte: u8, line: usize) {
        if self.lines.last().is_none_or(|entry| entry.line != line) {
            self.lines.push(LineEntry {
                start_offset: self.code.len(),
                line,
            });
        }
        self.code.push(byte);
    }

    /// Appends a constant and returns its index.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Source line of the instruction at `offset`; 0 if the chunk has no line info.
    #[must_use]
    pub fn line_for_offset(&self, offset: usize) -> usize {
        let after = self.lines.partition_point(|entry| entry.start_offset <= offset);
        after.checked_sub(1).map_or(0, |i| self.lines[i].line)
    }
}

/// Debug record for a local variable: its slot and the instruction range where it is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalEntry {
    pub slot: usize,
    pub birthday: usize,
    pub deathday: usize,
    pub name: HeapId,
}

/// Keyword-only parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeywordOnly {
    pub name: HeapId,
    /// No default: the caller must supply it by name.
    pub required: bool,
}

/// Static, shareable description of a function body.
#[derive(Debug, Clone, Default)]
pub struct CodeObject {
    pub chunk: Chunk,
    pub name: Option<HeapId>,
    pub doc: Option<HeapId>,
    /// Positional parameter names, required ones first.
    pub positional_names: Vec<HeapId>,
    /// How many of `positional_names` have no default.
    pub required_args: usize,
    pub keyword_only: Vec<KeywordOnly>,
    pub upvalue_count: usize,
    pub flags: CodeFlags,
    pub locals: Vec<LocalEntry>,
}

impl CodeObject {
    /// Number of stack slots taken by bound arguments, including `*args`/`**kwargs`.
    #[must_use]
    pub fn argument_slots(&self) -> usize {
        self.positional_names.len()
            + usize::from(self.flags.contains(CodeFlags::COLLECTS_ARGS))
            + self.keyword_only.len()
            + usize::from(self.flags.contains(CodeFlags::COLLECTS_KWARGS))
    }

    /// Slot of the `*args` tuple, if collected.
    #[must_use]
    pub fn args_slot(&self) -> Option<usize> {
        self.flags
            .contains(CodeFlags::COLLECTS_ARGS)
            .then_some(self.positional_names.len())
    }

    /// Slot of the first keyword-only parameter.
    #[must_use]
    pub fn keyword_only_start(&self) -> usize {
        self.positional_names.len() + usize::from(self.flags.contains(CodeFlags::COLLECTS_ARGS))
    }

    /// Slot of the `**kwargs` dict, if collected.
    #[must_use]
    pub fn kwargs_slot(&self) -> Option<usize> {
        self.flags
            .contains(CodeFlags::COLLECTS_KWARGS)
            .then(|| self.keyword_only_start() + self.keyword_only.len())
    }

    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.flags.intersects(CodeFlags::GENERATOR | CodeFlags::COROUTINE)
    }

    /// Locals live at `offset`, as `(slot, name)` pairs.
    pub fn locals_at(&self, offset: usize) -> impl Iterator<Item = (usize, HeapId)> + '_ {
        self.locals
            .iter()
            .filter(move |l| l.birthday <= offset && offset <= l.deathday)
            .map(|l| (l.slot, l.name))
    }

    /// Approximate bytes owned by the code object.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        self.chunk.code.len()
            + self.chunk.constants.len() * size_of::<Value>()
            + self.chunk.lines.len() * size_of::<LineEntry>()
            + self.locals.len() * size_of::<LocalEntry>()
            + (self.positional_names.len() + self.keyword_only.len()) * size_of::<HeapId>()
    }
}
