#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "NaN-box payloads and table indexes are range checked")]
#![expect(clippy::cast_sign_loss, reason = "resolved indexes are non-negative")]
#![expect(clippy::cast_possible_wrap, reason = "lengths stay far below i64::MAX")]

mod args;
mod builtins;
mod bytecode;
mod exception_private;
mod exception_public;
mod gc;
mod heap;
mod nanbox;
mod object;
mod resource;
mod table;
mod threads;
pub mod tracer;
mod types;
mod value;

pub use crate::{
    builtins::Builtin,
    bytecode::{BuiltinClasses, Capture, CodeBuilder, FrameExit, JumpLabel, NativeFn, Opcode, Vm},
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    exception_public::{Exception, StackFrame},
    gc::GcStats,
    heap::{Heap, HeapData, HeapDiff, HeapId, HeapStats},
    nanbox::{decode as nanbox_decode, encode as nanbox_encode},
    object::{DictPairs, Object},
    resource::{
        DEFAULT_GC_GENERATIONS, DEFAULT_GC_THRESHOLD, DEFAULT_MAX_RECURSION_DEPTH, GcConfig, LimitedTracker,
        NoLimitTracker, ResourceError, ResourceLimits, ResourceTracker,
    },
    table::{ImmediateKeys, KeyContext, KeyPolicy, Table},
    threads::{SharedVm, ThreadHandle},
    tracer::{
        CoverageTracer, NoopTracer, ProfilingReport, ProfilingTracer, RecordingTracer, StderrTracer, TraceEvent,
        VmTracer,
    },
    types::{CodeFlags, InstanceKind, Protocol, SpecialMethod},
    value::{INT_MAX, INT_MIN, Value},
};
