use std::borrow::Cow;

use crate::{builtins::Builtin, heap::HeapId, table::Table, value::Value};

/// Runtime instantiation of a code object.
#[derive(Debug, Clone)]
pub struct Closure {
    pub code: HeapId,
    /// One upvalue object per captured variable; length equals the code's upvalue count.
    pub upvalues: Vec<HeapId>,
    /// Arbitrary attributes set on the function object.
    pub fields: Table,
    pub annotations: Value,
    /// Module instance whose fields are this function's globals.
    pub globals: HeapId,
}

/// What a native function dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeTarget {
    Builtin(Builtin),
    /// Index into the VM's table of host-registered functions.
    Host(usize),
}

/// Function implemented in Rust, callable exactly like a closure.
#[derive(Debug, Clone)]
pub struct NativeFunction {
    pub name: Cow<'static, str>,
    pub target: NativeTarget,
    /// Attribute lookup on an instance calls it with the receiver instead of binding it.
    pub is_property: bool,
}

/// A callable paired with the receiver it was looked up on.
#[derive(Debug, Clone, Copy)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Value,
}
