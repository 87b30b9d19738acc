pub mod bytes;
pub mod class;
pub mod code;
pub mod function;
pub mod generator;
pub mod instance;
pub mod str;
pub mod tuple;
pub mod upvalue;

pub use bytes::Bytes;
pub use class::{Class, InstanceKind, Protocol, SpecialMethod};
pub use code::{CodeFlags, CodeObject, KeywordOnly, LocalEntry};
pub use function::{BoundMethod, Closure, NativeFunction, NativeTarget};
pub use generator::GeneratorState;
pub use instance::{Instance, IterState, Payload, TraceEntry};
pub use str::Str;
pub use tuple::Tuple;
pub use upvalue::{Upvalue, UpvalueLocation};
