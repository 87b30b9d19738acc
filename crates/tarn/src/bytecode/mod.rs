//! Bytecode representation, construction and execution.
//!
//! # Module Structure
//!
//! - `op` - Opcode enum definitions
//! - `builder` - CodeBuilder for emitting bytecode, plus the incremental code-object primitives
//! - `vm` - Virtual machine: run loop, calls, closures, generators and exception unwinding

pub use builder::{Capture, CodeBuilder, JumpLabel};
pub use op::Opcode;
pub use vm::{BuiltinClasses, CallFrame, FrameExit, NativeFn, Vm};

mod builder;
mod op;
pub(crate) mod vm;
