//! Instruction set.
//!
//! Every instruction is one opcode byte followed by zero or more operand bytes.
//! Multi-byte operands are little-endian. Jump operands are `i16` offsets relative to
//! the first byte after the operand.

use strum::{FromRepr, IntoStaticStr};

/// Bytecode opcodes.
///
/// Operand layout and stack effect are noted per variant; `[a, b] -> [c]` describes the
/// top of the stack before and after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub enum Opcode {
    // === Stack ===
    /// `[a] -> []`
    Pop,
    /// `[a] -> [a, a]`
    Dup,
    /// `[a, b] -> [b, a]`
    Swap,

    // === Constants ===
    /// u16 constant index. `[] -> [c]`
    LoadConst,
    LoadNone,
    LoadTrue,
    LoadFalse,
    /// u16 count. Pushes the keyword-argument count marker that ends a call's argument
    /// list.
    LoadKwargs,
    /// u8 kind: 0 single positional, 1 iterable, 2 mapping. Pushes the marker that
    /// precedes an expanded argument.
    ExpandArgs,

    // === Variables ===
    /// u16 slot relative to the frame base.
    LoadLocal,
    /// u16 slot. `[v] -> []`
    StoreLocal,
    /// u16 constant index of the name.
    LoadGlobal,
    /// u16 constant index of the name. `[v] -> []`
    StoreGlobal,
    /// u16 constant index of the name.
    DeleteGlobal,
    /// u16 upvalue index.
    LoadUpvalue,
    /// u16 upvalue index. `[v] -> []`
    StoreUpvalue,
    /// Closes any upvalue open on the top slot, then pops it.
    CloseUpvalue,
    /// `[v] -> [bool]`: whether `v` is the marker of an argument the caller left out.
    TestArg,

    // === Attributes and items ===
    /// u16 constant index of the name. `[obj] -> [value]`
    GetAttr,
    /// u16 constant index of the name. `[obj, value] -> []`
    SetAttr,
    /// u16 constant index of the name. `[obj] -> []`
    DeleteAttr,
    /// `[obj, key] -> [value]`
    GetItem,
    /// `[obj, key, value] -> []`
    SetItem,
    /// `[obj, key] -> []`
    DeleteItem,

    // === Operators ===
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Negate,
    Not,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    Is,
    /// `[item, container] -> [bool]`
    In,

    // === Control flow ===
    /// i16 offset.
    Jump,
    /// i16 offset. Pops the condition.
    JumpIfFalse,
    /// i16 offset. Pops the condition.
    JumpIfTrue,

    // === Collections ===
    /// u16 count.
    BuildTuple,
    /// u16 count.
    BuildList,
    /// u16 number of key/value pairs.
    BuildDict,
    /// u16 count.
    BuildSet,
    /// u8 count, 2 or 3: `[start, stop(, step)] -> [slice]`
    BuildSlice,
    /// u8 count. `[seq] -> [item0, ..., itemN-1]` with `item0` deepest.
    Unpack,

    // === Functions ===
    /// u8 argument count, counting every value above the callee.
    Call,
    /// u16 constant index of a code object, then per upvalue a u8 flag (1 = local slot
    /// of the current frame, 0 = upvalue of the current closure) and a u16 index.
    Closure,
    Return,
    /// `[v] -> []` on suspension; the value sent on resumption is pushed in its place.
    Yield,

    // === Classes ===
    /// u16 constant index of the name. `[base] -> [class]`; `None` means `object`.
    MakeClass,
    /// u16 constant index of the name. `[class, value] -> [class]`
    DefineMethod,
    /// Fills the special-method table of the class on top of the stack.
    FinalizeClass,

    // === Iteration ===
    /// `[iterable] -> [iterator]`
    GetIter,
    /// i16 offset. `[it] -> [it, item]`, or pops `it` and jumps when exhausted.
    ForIter,

    // === Exceptions ===
    /// `[exc] -> raises`
    Raise,
    /// i16 offset to the `except` clauses. `[] -> [None, handler]`
    PushTry,
    /// i16 offset to the `finally` clause. `[] -> [None, handler]`
    PushFinally,
    /// i16 offset to the exit code. `[cm] -> [cm, None, handler, entered]`
    PushWith,
    /// `[slot, handler] -> []`
    PopHandler,
    /// `[exc, handler, class] -> [exc, handler, matched]`
    FilterExcept,
    /// Disarms the handler on top: the protected region completed normally.
    BeginFinally,
    /// Re-raises or completes a pending return recorded in the handler on top.
    EndFinally,
    /// Calls `__exit__` for the `with` handler on top.
    CleanupWith,
}

impl Opcode {
    /// Number of fixed operand bytes following the opcode.
    ///
    /// `Closure` is followed by three more bytes per captured upvalue.
    #[must_use]
    pub fn operand_len(self) -> usize {
        match self {
            Self::LoadConst
            | Self::LoadKwargs
            | Self::LoadLocal
            | Self::StoreLocal
            | Self::LoadGlobal
            | Self::StoreGlobal
            | Self::DeleteGlobal
            | Self::LoadUpvalue
            | Self::StoreUpvalue
            | Self::GetAttr
            | Self::SetAttr
            | Self::DeleteAttr
            | Self::Jump
            | Self::JumpIfFalse
            | Self::JumpIfTrue
            | Self::BuildTuple
            | Self::BuildList
            | Self::BuildDict
            | Self::BuildSet
            | Self::Closure
            | Self::MakeClass
            | Self::DefineMethod
            | Self::ForIter
            | Self::PushTry
            | Self::PushFinally
            | Self::PushWith => 2,
            Self::ExpandArgs | Self::BuildSlice | Self::Unpack | Self::Call => 1,
            _ => 0,
        }
    }

    /// Values the instruction reads from the stack regardless of its operand.
    ///
    /// Collection builders and `Call` read more, depending on their count operand.
    #[must_use]
    pub fn stack_inputs(self) -> usize {
        match self {
            Self::SetItem | Self::FilterExcept | Self::CleanupWith => 3,
            Self::Swap
            | Self::SetAttr
            | Self::GetItem
            | Self::DeleteItem
            | Self::Add
            | Self::Sub
            | Self::Mul
            | Self::TrueDiv
            | Self::FloorDiv
            | Self::Mod
            | Self::Equal
            | Self::NotEqual
            | Self::Less
            | Self::Greater
            | Self::LessEqual
            | Self::GreaterEqual
            | Self::Is
            | Self::In
            | Self::DefineMethod
            | Self::PopHandler
            | Self::EndFinally => 2,
            Self::Pop
            | Self::Dup
            | Self::StoreLocal
            | Self::StoreGlobal
            | Self::StoreUpvalue
            | Self::CloseUpvalue
            | Self::TestArg
            | Self::GetAttr
            | Self::DeleteAttr
            | Self::Negate
            | Self::Not
            | Self::JumpIfFalse
            | Self::JumpIfTrue
            | Self::Unpack
            | Self::Call
            | Self::Return
            | Self::Yield
            | Self::MakeClass
            | Self::FinalizeClass
            | Self::GetIter
            | Self::ForIter
            | Self::Raise
            | Self::PushWith
            | Self::BeginFinally => 1,
            _ => 0,
        }
    }

    /// Whether the operand is an `i16` jump offset.
    #[must_use]
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Self::Jump
                | Self::JumpIfFalse
                | Self::JumpIfTrue
                | Self::ForIter
                | Self::PushTry
                | Self::PushFinally
                | Self::PushWith
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Self::from_repr(byte).ok_or(byte)
    }
}
