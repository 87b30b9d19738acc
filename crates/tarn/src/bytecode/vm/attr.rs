//! Attribute access, method binding and class construction.

use smallvec::SmallVec;
use strum::{EnumCount, IntoEnumIterator};

use super::Vm;
use crate::{
    exception_private::{ExcType, RunResult},
    heap::{Heap, HeapData, HeapId, TableSlot},
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{BoundMethod, Class, SpecialMethod, class::SpecialTable},
    value::Value,
};

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// Class of any value, including immediates.
    pub fn class_of(&self, value: Value) -> HeapId {
        let classes = &self.classes;
        match value {
            Value::None => classes.none,
            Value::Bool(_) => classes.bool,
            Value::Int(_) => classes.int,
            Value::Float(_) => classes.float,
            Value::NotImplemented | Value::Handler(_) | Value::Kwargs(_) => classes.object,
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(_) => classes.str,
                HeapData::Bytes(_) => classes.bytes,
                HeapData::Tuple(_) => classes.tuple,
                HeapData::Code(_) => classes.code,
                HeapData::Closure(_) => classes.function,
                HeapData::Native(_) => classes.native,
                HeapData::BoundMethod(_) => classes.method,
                HeapData::Class(_) => classes.type_class,
                HeapData::Instance(instance) => instance.class,
                HeapData::Upvalue(_) => classes.object,
            },
        }
    }

    /// Whether `class` is `base` or inherits from it.
    pub fn is_subclass(&self, class: HeapId, base: HeapId) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == base {
                return true;
            }
            current = self.heap.class(id).base;
        }
        false
    }

    pub fn is_instance(&self, value: Value, class: HeapId) -> bool {
        self.is_subclass(self.class_of(value), class)
    }

    /// Finds `name` in the method tables of `class` and its bases.
    pub(crate) fn lookup_method(&self, class: HeapId, name: HeapId) -> Option<Value> {
        let hash = self.heap.str_hash(name);
        let mut current = Some(class);
        while let Some(id) = current {
            let class = self.heap.class(id);
            if let Some(value) = class.methods.get_by_str(Value::Ref(name), hash) {
                return Some(value);
            }
            current = class.base;
        }
        None
    }

    pub(crate) fn special_method(&self, value: Value, method: SpecialMethod) -> Option<Value> {
        self.heap.class(self.class_of(value)).special(method)
    }

    /// Calls special method `method` of `value`'s class with `value` as the receiver.
    ///
    /// Returns `None` when the class does not implement it.
    pub(crate) fn call_special(&mut self, value: Value, method: SpecialMethod, args: &[Value]) -> RunResult<Option<Value>> {
        let Some(function) = self.special_method(value, method) else {
            return Ok(None);
        };
        let mut full: SmallVec<[Value; 4]> = SmallVec::with_capacity(args.len() + 1);
        full.push(value);
        full.extend_from_slice(args);
        self.call_direct(function, &full).map(Some)
    }

    fn field(&self, owner: HeapId, name: HeapId) -> Option<Value> {
        self.heap
            .table(owner, TableSlot::Fields)?
            .get_by_str(Value::Ref(name), self.heap.str_hash(name))
    }

    /// `obj.name`, raising `AttributeError` when nothing provides it.
    pub fn get_attribute(&mut self, obj: Value, name: HeapId) -> RunResult<Value> {
        match self.try_get_attribute(obj, name)? {
            Some(value) => Ok(value),
            None => Err(ExcType::attribute_error(self.heap.type_name(obj), self.heap.str(name))),
        }
    }

    /// `obj.name` for a name given as text.
    pub fn get_attr(&mut self, obj: Value, name: &str) -> RunResult<Value> {
        self.push(obj);
        let name = self.intern(name);
        self.pop();
        self.get_attribute(obj, name?)
    }

    /// Looks up `obj.name`: own fields first, then the class chain, then `__getattr__`.
    pub(crate) fn try_get_attribute(&mut self, obj: Value, name: HeapId) -> RunResult<Option<Value>> {
        if let Value::Ref(id) = obj {
            match self.heap.get(id) {
                HeapData::Instance(_) => {
                    if let Some(value) = self.field(id, name) {
                        return Ok(Some(value));
                    }
                }
                HeapData::Class(_) => {
                    if let Some(value) = self.lookup_method(id, name) {
                        return Ok(Some(value));
                    }
                    if let Some(value) = self.class_attribute(id, name) {
                        return Ok(Some(value));
                    }
                }
                HeapData::Closure(_) => {
                    if let Some(value) = self.field(id, name) {
                        return Ok(Some(value));
                    }
                    if let Some(value) = self.function_attribute(id, name)? {
                        return Ok(Some(value));
                    }
                }
                HeapData::BoundMethod(bound) => match self.heap.str(name) {
                    "__self__" => return Ok(Some(bound.receiver)),
                    "__func__" => return Ok(Some(bound.method)),
                    _ => {}
                },
                _ => {}
            }
        }

        let class = self.class_of(obj);
        if self.heap.str(name) == "__class__" {
            return Ok(Some(Value::Ref(class)));
        }
        if let Some(member) = self.lookup_method(class, name) {
            return self.bind_attribute(obj, member).map(Some);
        }

        if let Some(fallback) = self.heap.class(class).special(SpecialMethod::GetAttr) {
            return self.call_direct(fallback, &[obj, Value::Ref(name)]).map(Some);
        }
        Ok(None)
    }

    /// Attributes every class answers for itself.
    fn class_attribute(&self, class: HeapId, name: HeapId) -> Option<Value> {
        let class = self.heap.class(class);
        match self.heap.str(name) {
            "__name__" => Some(Value::Ref(class.name)),
            "__doc__" => Some(class.doc.map_or(Value::None, Value::Ref)),
            "__base__" => Some(class.base.map_or(Value::None, Value::Ref)),
            "__file__" => Some(class.filename.map_or(Value::None, Value::Ref)),
            _ => None,
        }
    }

    fn function_attribute(&mut self, closure: HeapId, name: HeapId) -> RunResult<Option<Value>> {
        let code = self.heap.closure(closure).code;
        let value = match self.heap.str(name) {
            "__name__" => self.heap.code(code).name.map_or(Value::None, Value::Ref),
            "__doc__" => self.heap.code(code).doc.map_or(Value::None, Value::Ref),
            "__code__" => Value::Ref(code),
            "__annotations__" => self.heap.closure(closure).annotations,
            "__qualname__" => {
                let text = self.code_name(code);
                self.new_str(&text)?
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    /// Turns a member found on the class chain into the value `obj.name` yields.
    ///
    /// Functions bind to the receiver, properties are called with it and descriptor
    /// instances delegate to their `__get__`.
    fn bind_attribute(&mut self, obj: Value, member: Value) -> RunResult<Value> {
        let Value::Ref(id) = member else {
            return Ok(member);
        };
        match self.heap.get(id) {
            HeapData::Closure(_) => self.bind_method(obj, member),
            HeapData::Native(native) if native.is_property => self.call_direct(member, &[obj]),
            HeapData::Native(_) => self.bind_method(obj, member),
            HeapData::Instance(instance) => match self.heap.class(instance.class).special(SpecialMethod::Get) {
                Some(get) => self.call_direct(get, &[member, obj]),
                None => Ok(member),
            },
            _ => Ok(member),
        }
    }

    fn bind_method(&mut self, receiver: Value, method: Value) -> RunResult<Value> {
        let id = self.allocate(HeapData::BoundMethod(BoundMethod { receiver, method }))?;
        Ok(Value::Ref(id))
    }

    /// `obj.name = value`.
    ///
    /// Assigning a special-method name on a class refreshes the dispatch tables of the
    /// class and every live subclass.
    pub fn set_attribute(&mut self, obj: Value, name: HeapId, value: Value) -> RunResult<()> {
        let Value::Ref(id) = obj else {
            return Err(ExcType::attribute_error(self.heap.type_name(obj), self.heap.str(name)));
        };
        match self.heap.get(id) {
            HeapData::Instance(instance) => {
                let class = instance.class;
                if let Some(Value::Ref(descriptor)) = self.lookup_method(class, name)
                    && let Some(instance) = self.heap.instance(descriptor)
                    && let Some(set) = self.heap.class(instance.class).special(SpecialMethod::Set)
                {
                    self.call_direct(set, &[Value::Ref(descriptor), obj, value])?;
                    return Ok(());
                }
                self.set_field(id, Value::Ref(name), value)
            }
            HeapData::Class(_) => {
                self.set_field(id, Value::Ref(name), value)?;
                if self.special_names.contains(&name) {
                    self.refinalize(id);
                }
                Ok(())
            }
            HeapData::Closure(_) => self.set_field(id, Value::Ref(name), value),
            _ => Err(ExcType::attribute_error(self.heap.type_name(obj), self.heap.str(name))),
        }
    }

    /// `obj.name = value` for a name given as text.
    pub fn set_attr(&mut self, obj: Value, name: &str, value: Value) -> RunResult<()> {
        self.push(obj);
        self.push(value);
        let name = self.intern(name);
        self.pop_n(2);
        self.set_attribute(obj, name?, value)
    }

    /// `del obj.name` for a name given as text.
    pub fn delete_attr(&mut self, obj: Value, name: &str) -> RunResult<()> {
        self.push(obj);
        let name = self.intern(name);
        self.pop();
        self.delete_attribute(obj, name?)
    }

    /// `del obj.name`.
    pub fn delete_attribute(&mut self, obj: Value, name: HeapId) -> RunResult<()> {
        let removed = match obj {
            Value::Ref(id)
                if matches!(
                    self.heap.get(id),
                    HeapData::Instance(_) | HeapData::Class(_) | HeapData::Closure(_)
                ) =>
            {
                self.heap
                    .with_table(id, TableSlot::Fields, |table, keys| table.delete(keys, Value::Ref(name)))?
            }
            _ => false,
        };
        if !removed {
            return Err(ExcType::attribute_error(self.heap.type_name(obj), self.heap.str(name)));
        }
        if let Value::Ref(id) = obj
            && matches!(self.heap.get(id), HeapData::Class(_))
            && self.special_names.contains(&name)
        {
            self.refinalize(id);
        }
        Ok(())
    }

    // ========================================================================
    // Classes
    // ========================================================================

    /// Creates class `name` deriving from `base` (`None` means `object`).
    ///
    /// The class inherits its base's native payload kind; its special-method table is
    /// filled when it is finalized.
    pub(crate) fn make_class(&mut self, name: HeapId, base: Value) -> RunResult<HeapId> {
        let base = match base {
            Value::None => self.classes.object,
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Class(_)) => id,
            other => {
                return Err(ExcType::type_error(format!(
                    "base class must be a class, not '{}'",
                    self.heap.type_name(other)
                )));
            }
        };
        let kind = self.heap.class(base).kind;
        let mut class = Class::new(name, Some(base), kind);
        class.filename = self
            .thread
            .frames
            .last()
            .and_then(|frame| self.heap.code(frame.code).chunk.filename);
        let id = self.allocate(HeapData::Class(Box::new(class)))?;
        self.heap.class_mut(base).subclasses.push(id);
        self.finalize_class(id);
        Ok(id)
    }

    /// Creates a class for the host. The class is not bound to any module.
    pub fn new_class(&mut self, name: &str, base: Option<HeapId>) -> RunResult<HeapId> {
        self.with_gc_paused(|vm| {
            let name = vm.intern(name)?;
            vm.make_class(name, base.map_or(Value::None, Value::Ref))
        })
    }

    /// Adds a member to the class body being executed.
    pub(crate) fn define_method(&mut self, class: Value, name: HeapId, value: Value) -> RunResult<()> {
        let class = self.expect_class(class)?;
        if self.heap.str(name) == "__doc__" {
            let doc = value
                .as_heap_id()
                .filter(|&id| matches!(self.heap.get(id), HeapData::Str(_)));
            self.heap.class_mut(class).doc = doc;
            return Ok(());
        }
        self.set_field(class, Value::Ref(name), value)
    }

    /// Recomputes the special-method table of `class`.
    pub(crate) fn finalize_class(&mut self, class: HeapId) {
        install_specials(&mut self.heap, &self.special_names, class);
    }

    /// Refinalizes `class` and, transitively, its live subclasses.
    fn refinalize(&mut self, class: HeapId) {
        let mut pending = vec![class];
        while let Some(id) = pending.pop() {
            self.finalize_class(id);
            pending.extend(
                self.heap
                    .class(id)
                    .subclasses
                    .iter()
                    .copied()
                    .filter(|&sub| matches!(self.heap.get_if_live(sub), Some(HeapData::Class(c)) if c.base == Some(id))),
            );
        }
    }
}

/// Fills the special-method table of `class` from its method chain.
///
/// A class is unhashable when it sets `__hash__` to `None`, or when its nearest
/// `__eq__` is closer than its nearest `__hash__`.
pub(crate) fn install_specials<T: ResourceTracker>(heap: &mut Heap<T>, special_names: &[HeapId], class: HeapId) {
    let mut specials: SpecialTable = [None; SpecialMethod::COUNT];
    let mut hash_depth = None;
    let mut eq_depth = None;
    let mut hash_cleared = false;

    for method in SpecialMethod::iter() {
        let name = special_names[method as usize];
        let hash = heap.str_hash(name);
        let mut current = Some(class);
        let mut depth = 0usize;
        while let Some(id) = current {
            let owner = heap.class(id);
            if let Some(value) = owner.methods.get_by_str(Value::Ref(name), hash) {
                match method {
                    SpecialMethod::Hash => {
                        hash_depth = Some(depth);
                        hash_cleared = value.is_none();
                    }
                    SpecialMethod::Eq => eq_depth = Some(depth),
                    _ => {}
                }
                if !value.is_none() {
                    specials[method as usize] = Some(value);
                }
                break;
            }
            current = owner.base;
            depth += 1;
        }
    }

    let unhashable = hash_cleared
        || match (eq_depth, hash_depth) {
            (Some(eq), Some(hash)) => eq < hash,
            (Some(_), None) => true,
            _ => false,
        };
    heap.class_mut(class).set_specials(specials, unhashable);
}
