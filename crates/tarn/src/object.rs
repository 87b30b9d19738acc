//! Values as the host sees them.

use std::fmt::{self, Write};

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::{
    bytecode::Vm,
    exception_private::{ExcType, RunResult},
    heap::{HeapData, HeapId},
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Bytes, Payload, str::string_repr},
    value::{Value, format_float},
};

/// An owned snapshot of a VM value.
///
/// Unlike [`Value`], an `Object` does not refer to the heap; it can be cloned,
/// compared, serialized and kept after the VM is dropped.
///
/// `Repr` and `Cycle` are output-only: they stand for values with no structural
/// mapping and for back-references inside cyclic containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Object {
    #[serde(alias = "none")]
    None,
    #[serde(alias = "bool")]
    Bool(bool),
    #[serde(alias = "int")]
    Int(i64),
    #[serde(alias = "float")]
    Float(f64),
    #[serde(alias = "str")]
    String(String),
    #[serde(alias = "bytes")]
    Bytes(Vec<u8>),
    #[serde(alias = "list")]
    List(Vec<Self>),
    #[serde(alias = "tuple")]
    Tuple(Vec<Self>),
    /// Insertion-ordered pairs.
    #[serde(alias = "dict")]
    Dict(DictPairs),
    #[serde(alias = "set")]
    Set(Vec<Self>),
    /// An exception instance, described by its nearest built-in type.
    Exception { exc_type: ExcType, arg: Option<String> },
    /// `repr()` of a value with no other mapping.
    Repr(String),
    /// A container met again while it was being converted; holds its placeholder.
    Cycle(String),
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Cycle(placeholder) | Self::Repr(placeholder) => f.write_str(placeholder),
            _ => self.repr_fmt(f),
        }
    }
}

impl Object {
    /// Creates a new `Object` from something that can be converted into `DictPairs`.
    pub fn dict(dict: impl Into<DictPairs>) -> Self {
        Self::Dict(dict.into())
    }

    /// Source-like representation, as `repr()` prints it.
    #[must_use]
    pub fn repr(&self) -> String {
        let mut out = String::new();
        // writing to a String cannot fail
        let _ = self.repr_fmt(&mut out);
        out
    }

    fn repr_fmt(&self, f: &mut impl Write) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => f.write_str(&format_float(*v)),
            Self::String(s) => f.write_str(&string_repr(s)),
            Self::Bytes(b) => f.write_str(&Bytes::new(b).repr()),
            Self::List(items) => {
                f.write_char('[')?;
                write_joined(f, items)?;
                f.write_char(']')
            }
            Self::Tuple(items) => {
                f.write_char('(')?;
                write_joined(f, items)?;
                if items.len() == 1 {
                    f.write_char(',')?;
                }
                f.write_char(')')
            }
            Self::Dict(pairs) => {
                f.write_char('{')?;
                for (index, (key, value)) in pairs.into_iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    key.repr_fmt(f)?;
                    f.write_str(": ")?;
                    value.repr_fmt(f)?;
                }
                f.write_char('}')
            }
            Self::Set(items) if items.is_empty() => f.write_str("set()"),
            Self::Set(items) => {
                f.write_char('{')?;
                write_joined(f, items)?;
                f.write_char('}')
            }
            Self::Exception { exc_type, arg } => match arg {
                Some(arg) => write!(f, "{exc_type}({})", string_repr(arg)),
                None => write!(f, "{exc_type}()"),
            },
            Self::Repr(text) | Self::Cycle(text) => f.write_str(text),
        }
    }
}

fn write_joined(f: &mut impl Write, items: &[Object]) -> fmt::Result {
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        item.repr_fmt(f)?;
    }
    Ok(())
}

/// Key/value pairs of a dict in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DictPairs(Vec<(Object, Object)>);

impl DictPairs {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value stored under the first key equal to `key`.
    #[must_use]
    pub fn get(&self, key: &Object) -> Option<&Object> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl From<Vec<(Object, Object)>> for DictPairs {
    fn from(pairs: Vec<(Object, Object)>) -> Self {
        Self(pairs)
    }
}

impl IntoIterator for DictPairs {
    type Item = (Object, Object);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a DictPairs {
    type Item = &'a (Object, Object);
    type IntoIter = std::slice::Iter<'a, (Object, Object)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<(Object, Object)> for DictPairs {
    fn from_iter<I: IntoIterator<Item = (Object, Object)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// Snapshots `value` as an [`Object`].
    ///
    /// Containers are converted recursively; a container reached again while it is
    /// being converted becomes [`Object::Cycle`]. Values with no structural mapping
    /// fall back to their `repr()`, which may run user `__repr__` methods.
    pub fn to_object(&mut self, value: Value) -> Object {
        let mut visited = AHashSet::new();
        self.push(value);
        let object = self.object_inner(value, &mut visited);
        self.pop();
        object
    }

    fn object_inner(&mut self, value: Value, visited: &mut AHashSet<HeapId>) -> Object {
        let id = match value {
            Value::None => return Object::None,
            Value::Bool(b) => return Object::Bool(b),
            Value::Int(i) => return Object::Int(i),
            Value::Float(x) => return Object::Float(x),
            Value::Ref(id) => id,
            other => return Object::Repr(other.to_string()),
        };
        if !visited.insert(id) {
            return Object::Cycle(self.cycle_placeholder(id).to_owned());
        }
        let object = match self.heap.get(id) {
            HeapData::Str(text) => Object::String(text.as_str().to_owned()),
            HeapData::Bytes(bytes) => Object::Bytes(bytes.as_slice().to_vec()),
            HeapData::Tuple(tuple) => {
                let items = tuple.as_slice().to_vec();
                Object::Tuple(self.objects(&items, visited))
            }
            HeapData::Instance(instance) => {
                let class = instance.class;
                match &instance.payload {
                    Payload::List(items) => {
                        let items = items.clone();
                        Object::List(self.objects(&items, visited))
                    }
                    Payload::Dict(table) => {
                        let entries: Vec<(Value, Value)> = table.iter().collect();
                        Object::Dict(
                            entries
                                .into_iter()
                                .map(|(k, v)| (self.object_inner(k, visited), self.object_inner(v, visited)))
                                .collect(),
                        )
                    }
                    Payload::Set(table) => {
                        let keys: Vec<Value> = table.keys().collect();
                        Object::Set(self.objects(&keys, visited))
                    }
                    Payload::Exception { .. } => {
                        let arg = match self.exception_arg(value) {
                            Value::None => None,
                            arg => self.to_str(arg).ok(),
                        };
                        Object::Exception {
                            exc_type: self.builtin_exc_type(class),
                            arg,
                        }
                    }
                    _ => self.repr_placeholder(value),
                }
            }
            _ => self.repr_placeholder(value),
        };
        visited.remove(&id);
        object
    }

    fn objects(&mut self, items: &[Value], visited: &mut AHashSet<HeapId>) -> Vec<Object> {
        items.iter().map(|&item| self.object_inner(item, visited)).collect()
    }

    fn repr_placeholder(&mut self, value: Value) -> Object {
        match self.repr(value) {
            Ok(text) => Object::Repr(text),
            Err(_) => Object::Repr(format!("<{} object>", self.heap.type_name(value))),
        }
    }

    fn cycle_placeholder(&self, id: HeapId) -> &'static str {
        match self.heap.get(id) {
            HeapData::Tuple(_) => "(...)",
            HeapData::Instance(instance) => match instance.payload {
                Payload::List(_) => "[...]",
                Payload::Dict(_) | Payload::Set(_) => "{...}",
                _ => "...",
            },
            _ => "...",
        }
    }

    /// Allocates the value an [`Object`] describes.
    ///
    /// `Repr` and `Cycle` have no value to rebuild and are rejected.
    pub fn from_object(&mut self, object: &Object) -> RunResult<Value> {
        self.with_gc_paused(|vm| vm.value_of(object))
    }

    fn value_of(&mut self, object: &Object) -> RunResult<Value> {
        Ok(match object {
            Object::None => Value::None,
            Object::Bool(b) => Value::Bool(*b),
            Object::Int(i) => Value::int(*i),
            Object::Float(x) => Value::Float(*x),
            Object::String(text) => self.new_str(text)?,
            Object::Bytes(bytes) => self.new_bytes(bytes)?,
            Object::List(items) => {
                let items = items.iter().map(|item| self.value_of(item)).collect::<RunResult<_>>()?;
                self.new_list(items)?
            }
            Object::Tuple(items) => {
                let items = items.iter().map(|item| self.value_of(item)).collect::<RunResult<_>>()?;
                self.new_tuple(items)?
            }
            Object::Dict(pairs) => {
                let dict = self.new_dict()?;
                for (key, value) in pairs {
                    let key = self.value_of(key)?;
                    let value = self.value_of(value)?;
                    self.dict_set(dict, key, value)?;
                }
                dict
            }
            Object::Set(items) => {
                let set = self.new_set()?;
                for item in items {
                    let item = self.value_of(item)?;
                    self.set_add(set, item)?;
                }
                set
            }
            Object::Exception { exc_type, arg } => self.new_exception(*exc_type, arg.as_deref())?,
            Object::Repr(_) | Object::Cycle(_) => {
                return Err(ExcType::type_error(
                    "repr and cycle objects are output-only and cannot be converted to values",
                ));
            }
        })
    }
}
