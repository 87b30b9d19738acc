//! Exceptions as the host sees them.
//!
//! An [`Exception`] owns all of its data: the class name, the nearest built-in
//! exception type, the message and a traceback resolved to file names and line
//! numbers. It outlives the VM that produced it and serializes with serde.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{
    bytecode::Vm,
    exception_private::{ExcType, RunError},
    heap::HeapId,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Payload, TraceEntry},
    value::Value,
};

/// One line of a traceback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub filename: String,
    pub line: usize,
    /// Function name; `<module>` for top-level code.
    pub name: String,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  File \"{}\", line {}, in {}", self.filename, self.line, self.name)
    }
}

/// An exception that escaped to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    exc_type: ExcType,
    type_name: String,
    message: Option<String>,
    /// Outermost call first.
    traceback: Vec<StackFrame>,
}

impl Exception {
    #[must_use]
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        Self {
            exc_type,
            type_name: exc_type.to_string(),
            message,
            traceback: Vec::new(),
        }
    }

    /// The built-in exception type, or the nearest built-in base of a user class.
    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    /// Name of the exception's class.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn traceback(&self) -> &[StackFrame] {
        &self.traceback
    }

    /// `Type: message`, without the traceback.
    #[must_use]
    pub fn summary(&self) -> String {
        match &self.message {
            Some(message) => format!("{}: {message}", self.type_name),
            None => self.type_name.clone(),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.traceback.is_empty() {
            writeln!(f, "Traceback (most recent call last):")?;
            for frame in &self.traceback {
                writeln!(f, "{frame}")?;
            }
        }
        f.write_str(&self.summary())
    }
}

impl std::error::Error for Exception {}

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// Converts an error that left the interpreter into a host exception.
    ///
    /// Materialized exceptions keep their class name, message and traceback; internal
    /// errors surface as `RuntimeError`.
    pub fn to_exception(&mut self, err: &RunError) -> Exception {
        match err {
            RunError::Exc(simple) | RunError::Uncatchable(simple) => {
                Exception::new(simple.exc_type(), simple.arg().map(str::to_owned))
            }
            RunError::Internal(message) => {
                Exception::new(ExcType::RuntimeError, Some(format!("internal error: {message}")))
            }
            RunError::Raised(exc) => self.raised_to_exception(*exc),
        }
    }

    fn raised_to_exception(&mut self, exc: Value) -> Exception {
        let class = self.class_of(exc);
        let type_name = self.heap.str(self.heap.class(class).name).to_owned();
        self.push(exc);
        let message = match self.to_str(exc) {
            Ok(text) if text.is_empty() => None,
            Ok(text) => Some(text),
            Err(_) => Some("<exception str() failed>".to_owned()),
        };
        self.pop();
        let entries = match exc.as_heap_id().and_then(|id| self.heap.instance(id)) {
            Some(instance) => match &instance.payload {
                Payload::Exception { traceback } => traceback.clone(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        };
        Exception {
            exc_type: self.builtin_exc_type(class),
            type_name,
            message,
            traceback: entries.iter().rev().map(|entry| self.stack_frame(*entry)).collect(),
        }
    }

    fn stack_frame(&self, entry: TraceEntry) -> StackFrame {
        let code = self.heap.code(self.heap.closure(entry.closure).code);
        StackFrame {
            filename: code
                .chunk
                .filename
                .map_or_else(|| "<unknown>".to_owned(), |id| self.heap.str(id).to_owned()),
            line: code.chunk.line_for_offset(entry.ip),
            name: code
                .name
                .map_or_else(|| "<module>".to_owned(), |id| self.heap.str(id).to_owned()),
        }
    }

    /// Most derived built-in exception type `class` inherits from.
    pub(crate) fn builtin_exc_type(&self, class: HeapId) -> ExcType {
        ExcType::iter()
            .filter(|&exc_type| self.is_subclass(class, self.exception_class(exc_type)))
            .max_by_key(|&exc_type| exc_type.depth())
            .unwrap_or(ExcType::BaseException)
    }
}

impl ExcType {
    /// Number of bases between this type and `BaseException`.
    fn depth(self) -> usize {
        std::iter::successors(self.base(), |base| base.base()).count()
    }
}
