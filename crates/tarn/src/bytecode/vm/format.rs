//! `repr()` and `str()`.
//!
//! Containers guard against cycles with the object's `IN_REPR` flag: a container met
//! again while its own repr is being built prints as a placeholder.

use super::Vm;
use crate::{
    exception_private::{ExcType, RunResult},
    heap::{HeapData, HeapId, TableSlot},
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Payload, SpecialMethod, str::string_repr},
    value::Value,
};

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// `repr(value)`.
    pub fn repr(&mut self, value: Value) -> RunResult<String> {
        let Value::Ref(id) = value else {
            return Ok(value.to_string());
        };
        if let Some(method) = self.special_method(value, SpecialMethod::Repr) {
            let result = self.call_direct(method, &[value])?;
            return match self.heap.as_str(result) {
                Some(text) => Ok(text.to_owned()),
                None => Err(ExcType::type_error(format!(
                    "__repr__ returned non-string (type {})",
                    self.heap.type_name(result)
                ))),
            };
        }

        if !self.heap.enter_repr(id) {
            return Ok(self.placeholder(id).to_owned());
        }
        let result = self.repr_object(value, id);
        self.heap.exit_repr(id);
        result
    }

    fn placeholder(&self, id: HeapId) -> &'static str {
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

    fn repr_object(&mut self, value: Value, id: HeapId) -> RunResult<String> {
        let text = match self.heap.get(id) {
            HeapData::Str(text) => string_repr(text.as_str()),
            HeapData::Bytes(bytes) => bytes.repr(),
            HeapData::Tuple(tuple) => {
                let items = tuple.as_slice().to_vec();
                let parts = self.repr_all(&items)?;
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            HeapData::Code(code) => format!("<codeobject {}>", self.optional_name(code.name)),
            HeapData::Closure(closure) => {
                format!("<function {}>", self.code_name(closure.code))
            }
            HeapData::Native(native) => format!("<built-in function {}>", native.name),
            HeapData::BoundMethod(bound) => {
                let name = self.callable_name(bound.method);
                format!("<bound method {name}>")
            }
            HeapData::Class(class) => format!("<class '{}'>", self.heap.str(class.name)),
            HeapData::Upvalue(_) => "<upvalue>".to_owned(),
            HeapData::Instance(instance) => {
                let class = instance.class;
                match &instance.payload {
                    Payload::List(items) => {
                        let items = items.clone();
                        format!("[{}]", self.repr_all(&items)?.join(", "))
                    }
                    Payload::Dict(table) => {
                        let entries: Vec<(Value, Value)> = table.iter().collect();
                        let mut parts = Vec::with_capacity(entries.len());
                        for (key, item) in entries {
                            parts.push(format!("{}: {}", self.repr(key)?, self.repr(item)?));
                        }
                        format!("{{{}}}", parts.join(", "))
                    }
                    Payload::Set(table) => {
                        let keys: Vec<Value> = table.keys().collect();
                        if keys.is_empty() {
                            "set()".to_owned()
                        } else {
                            format!("{{{}}}", self.repr_all(&keys)?.join(", "))
                        }
                    }
                    Payload::Slice { start, stop, step } => {
                        let bounds = [*start, *stop, *step];
                        let parts = self.repr_all(&bounds)?;
                        format!("slice({})", parts.join(", "))
                    }
                    Payload::Exception { .. } => {
                        let arg = self.exception_arg(value);
                        let arg = match arg {
                            Value::None => String::new(),
                            other => self.repr(other)?,
                        };
                        format!("{}({arg})", self.heap.str(self.heap.class(class).name))
                    }
                    Payload::Generator(state) => {
                        let code = self.heap.closure(state.closure).code;
                        format!("<generator object {}>", self.code_name(code))
                    }
                    Payload::Iterator(_) => "<iterator object>".to_owned(),
                    Payload::None if class == self.classes.module => {
                        let name = self.module_name(id);
                        format!("<module '{name}'>")
                    }
                    Payload::None => format!("<{} object>", self.heap.str(self.heap.class(class).name)),
                }
            }
        };
        Ok(text)
    }

    fn repr_all(&mut self, items: &[Value]) -> RunResult<Vec<String>> {
        items.iter().map(|&item| self.repr(item)).collect()
    }

    fn optional_name(&self, name: Option<HeapId>) -> &str {
        name.map_or("<unnamed>", |id| self.heap.str(id))
    }

    fn callable_name(&self, callable: Value) -> String {
        match callable.as_heap_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Closure(closure)) => self.code_name(closure.code),
            Some(HeapData::Native(native)) => native.name.to_string(),
            _ => self.heap.type_name(callable).into_owned(),
        }
    }

    fn module_name(&self, module: HeapId) -> String {
        let name = self.heap.find_interned("__name__").and_then(|key| {
            self.heap
                .table(module, TableSlot::Fields)?
                .get_by_str(Value::Ref(key), self.heap.str_hash(key))
        });
        name.and_then(|n| self.heap.as_str(n)).unwrap_or("?").to_owned()
    }

    /// The `arg` field of an exception instance, `None` if it has none.
    pub(crate) fn exception_arg(&self, exc: Value) -> Value {
        let Some(id) = exc.as_heap_id() else {
            return Value::None;
        };
        self.heap
            .find_interned("arg")
            .and_then(|key| {
                self.heap
                    .table(id, TableSlot::Fields)?
                    .get_by_str(Value::Ref(key), self.heap.str_hash(key))
            })
            .unwrap_or(Value::None)
    }

    /// `str(value)`.
    ///
    /// Strings are themselves, `__str__` wins next, exceptions print their argument and
    /// everything else falls back to `repr`.
    pub fn to_str(&mut self, value: Value) -> RunResult<String> {
        if let Some(text) = self.heap.as_str(value) {
            return Ok(text.to_owned());
        }
        if let Some(method) = self.special_method(value, SpecialMethod::Str) {
            let result = self.call_direct(method, &[value])?;
            return match self.heap.as_str(result) {
                Some(text) => Ok(text.to_owned()),
                None => Err(ExcType::type_error(format!(
                    "__str__ returned non-string (type {})",
                    self.heap.type_name(result)
                ))),
            };
        }
        if self.is_exception(value) {
            return match self.exception_arg(value) {
                Value::None => Ok(String::new()),
                arg => self.to_str(arg),
            };
        }
        self.repr(value)
    }
}
