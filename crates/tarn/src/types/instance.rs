use crate::{
    heap::HeapId,
    table::Table,
    types::{class::InstanceKind, generator::GeneratorState},
    value::Value,
};

/// One traceback line: the function that was running and the instruction it was at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    pub closure: HeapId,
    pub ip: usize,
}

/// Position of a built-in iterator.
#[derive(Debug, Clone, Copy)]
pub struct IterState {
    /// The tuple, list, dict, set or str being walked.
    pub source: Value,
    /// Element index, or raw entry position for tables.
    pub position: usize,
}

/// Native data behind an instance of a built-in class or one of its subclasses.
#[derive(Debug)]
pub enum Payload {
    None,
    List(Vec<Value>),
    Dict(Table),
    Set(Table),
    Generator(Box<GeneratorState>),
    Exception { traceback: Vec<TraceEntry> },
    Iterator(IterState),
    Slice { start: Value, stop: Value, step: Value },
}

impl Payload {
    /// Empty payload for a fresh instance of a class with `kind`.
    #[must_use]
    pub fn for_kind(kind: InstanceKind) -> Self {
        match kind {
            InstanceKind::Plain | InstanceKind::Generator => Self::None,
            InstanceKind::List => Self::List(Vec::new()),
            InstanceKind::Dict => Self::Dict(Table::new()),
            InstanceKind::Set => Self::Set(Table::new()),
            InstanceKind::Exception => Self::Exception { traceback: Vec::new() },
            InstanceKind::Iterator => Self::Iterator(IterState {
                source: Value::None,
                position: 0,
            }),
            InstanceKind::Slice => Self::Slice {
                start: Value::None,
                stop: Value::None,
                step: Value::None,
            },
        }
    }

    /// Heap references held by the payload, for tracing.
    pub fn for_each_child(&self, mut visit: impl FnMut(Value)) {
        match self {
            Self::None => {}
            Self::Exception { traceback } => {
                for entry in traceback {
                    visit(Value::Ref(entry.closure));
                }
            }
            Self::List(items) => items.iter().copied().for_each(visit),
            Self::Dict(table) | Self::Set(table) => {
                for (k, v) in table.iter() {
                    visit(k);
                    visit(v);
                }
            }
            Self::Generator(state) => state.for_each_child(visit),
            Self::Iterator(state) => visit(state.source),
            Self::Slice { start, stop, step } => {
                visit(*start);
                visit(*stop);
                visit(*step);
            }
        }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        match self {
            Self::List(items) => items.capacity() * size_of::<Value>(),
            Self::Dict(table) | Self::Set(table) => table.capacity() * size_of::<(Value, Value)>(),
            Self::Generator(state) => state.saved.capacity() * size_of::<Value>(),
            Self::Exception { traceback } => traceback.len() * size_of::<TraceEntry>(),
            _ => 0,
        }
    }
}

#[derive(Debug)]
pub struct Instance {
    pub class: HeapId,
    pub fields: Table,
    pub payload: Payload,
}

impl Instance {
    #[must_use]
    pub fn new(class: HeapId, kind: InstanceKind) -> Self {
        Self {
            class,
            fields: Table::new(),
            payload: Payload::for_kind(kind),
        }
    }
}
