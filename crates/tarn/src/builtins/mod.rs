//! Built-in functions, classes and methods.
//!
//! Every built-in callable is a [`NativeFunction`] whose target is a [`Builtin`]
//! variant; calls land in [`call_builtin`], which dispatches to one submodule per
//! area. The objects themselves are allocated once by [`bootstrap`], immortal and
//! outside the resource budget, before the VM runs any code.

mod containers;
mod functions;
mod generator;
mod types;

use strum::{Display, EnumCount, EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::{
    args::ArgValues,
    bytecode::{BuiltinClasses, Vm, vm::install_specials},
    exception_private::{ExcType, RunResult},
    heap::{Heap, HeapData, HeapId, TableSlot},
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Class, Instance, InstanceKind, NativeFunction, NativeTarget, SpecialMethod},
    value::Value,
};

/// Every function and method implemented by the runtime itself.
///
/// The string form is the name the function reports in reprs and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, EnumIter)]
pub enum Builtin {
    // --- functions in the builtins module ---
    #[strum(serialize = "len")]
    Len,
    #[strum(serialize = "repr")]
    Repr,
    #[strum(serialize = "isinstance")]
    Isinstance,
    #[strum(serialize = "issubclass")]
    Issubclass,
    #[strum(serialize = "hash")]
    Hash,
    #[strum(serialize = "iter")]
    Iter,
    #[strum(serialize = "getattr")]
    GetAttr,
    #[strum(serialize = "setattr")]
    SetAttr,
    #[strum(serialize = "hasattr")]
    HasAttr,
    #[strum(serialize = "callable")]
    Callable,

    // --- constructors ---
    #[strum(serialize = "type")]
    TypeNew,
    #[strum(serialize = "str")]
    StrNew,
    #[strum(serialize = "int")]
    IntNew,
    #[strum(serialize = "float")]
    FloatNew,
    #[strum(serialize = "bool")]
    BoolNew,
    #[strum(serialize = "tuple")]
    TupleNew,
    #[strum(serialize = "__init__")]
    ListInit,
    #[strum(serialize = "__init__")]
    DictInit,
    #[strum(serialize = "__init__")]
    SetInit,
    #[strum(serialize = "__init__")]
    ExceptionInit,

    // --- container methods ---
    #[strum(serialize = "append")]
    ListAppend,
    #[strum(serialize = "pop")]
    ListPop,
    #[strum(serialize = "extend")]
    ListExtend,
    #[strum(serialize = "get")]
    DictGet,
    #[strum(serialize = "keys")]
    DictKeys,
    #[strum(serialize = "values")]
    DictValues,
    #[strum(serialize = "items")]
    DictItems,
    #[strum(serialize = "add")]
    SetAdd,
    #[strum(serialize = "remove")]
    SetRemove,
    #[strum(serialize = "join")]
    StrJoin,

    // --- generators and iterators ---
    #[strum(serialize = "__call__")]
    GenCall,
    #[strum(serialize = "send")]
    GenSend,
    #[strum(serialize = "__finish__")]
    GenFinish,
    #[strum(serialize = "gi_running")]
    GenRunning,
    #[strum(serialize = "__iter__")]
    SelfIter,
    #[strum(serialize = "__call__")]
    IterNext,
}

/// Where bootstrap installs a built-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Home {
    /// A name in the builtins module.
    Module,
    /// A member of a built-in class, under the builtin's own name.
    Member(ClassSlot),
    /// Like `Member`, but read as a property.
    Property(ClassSlot),
}

/// Built-in class a member is installed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClassSlot {
    Type,
    Str,
    Int,
    Float,
    Bool,
    Tuple,
    List,
    Dict,
    Set,
    BaseException,
    Generator,
    Iterator,
}

impl Builtin {
    fn home(self) -> &'static [Home] {
        use ClassSlot as C;
        match self {
            Self::Len
            | Self::Repr
            | Self::Isinstance
            | Self::Issubclass
            | Self::Hash
            | Self::Iter
            | Self::GetAttr
            | Self::SetAttr
            | Self::HasAttr
            | Self::Callable => &[Home::Module],
            Self::TypeNew => &[Home::Member(C::Type)],
            Self::StrNew => &[Home::Member(C::Str)],
            Self::IntNew => &[Home::Member(C::Int)],
            Self::FloatNew => &[Home::Member(C::Float)],
            Self::BoolNew => &[Home::Member(C::Bool)],
            Self::TupleNew => &[Home::Member(C::Tuple)],
            Self::ListInit | Self::ListAppend | Self::ListPop | Self::ListExtend => &[Home::Member(C::List)],
            Self::DictInit | Self::DictGet | Self::DictKeys | Self::DictValues | Self::DictItems => {
                &[Home::Member(C::Dict)]
            }
            Self::SetInit | Self::SetAdd | Self::SetRemove => &[Home::Member(C::Set)],
            Self::StrJoin => &[Home::Member(C::Str)],
            Self::ExceptionInit => &[Home::Member(C::BaseException)],
            Self::GenCall | Self::GenSend | Self::GenFinish => &[Home::Member(C::Generator)],
            Self::GenRunning => &[Home::Property(C::Generator)],
            Self::SelfIter => &[Home::Member(C::Generator), Home::Member(C::Iterator)],
            Self::IterNext => &[Home::Member(C::Iterator)],
        }
    }

    /// Name the builtin is installed under. Constructors install as `__new__`.
    fn member_name(self) -> &'static str {
        match self {
            Self::TypeNew | Self::StrNew | Self::IntNew | Self::FloatNew | Self::BoolNew | Self::TupleNew => {
                SpecialMethod::New.name()
            }
            other => other.into(),
        }
    }
}

/// Dispatches a call to a built-in.
///
/// Methods receive their receiver as the first positional argument. When `has_kw` is
/// set the last element of `args` is a dict of keyword arguments.
pub(crate) fn call_builtin<T: ResourceTracker, Tr: VmTracer>(
    vm: &mut Vm<T, Tr>,
    builtin: Builtin,
    args: &[Value],
    has_kw: bool,
) -> RunResult<Value> {
    let args = ArgValues::new(args, has_kw);
    match builtin {
        Builtin::Len => functions::builtin_len(vm, args),
        Builtin::Repr => functions::builtin_repr(vm, args),
        Builtin::Isinstance => functions::builtin_isinstance(vm, args),
        Builtin::Issubclass => functions::builtin_issubclass(vm, args),
        Builtin::Hash => functions::builtin_hash(vm, args),
        Builtin::Iter => functions::builtin_iter(vm, args),
        Builtin::GetAttr => functions::builtin_getattr(vm, args),
        Builtin::SetAttr => functions::builtin_setattr(vm, args),
        Builtin::HasAttr => functions::builtin_hasattr(vm, args),
        Builtin::Callable => functions::builtin_callable(vm, args),
        Builtin::TypeNew => types::type_new(vm, args),
        Builtin::StrNew => types::str_new(vm, args),
        Builtin::IntNew => types::int_new(vm, args),
        Builtin::FloatNew => types::float_new(vm, args),
        Builtin::BoolNew => types::bool_new(vm, args),
        Builtin::TupleNew => types::tuple_new(vm, args),
        Builtin::ExceptionInit => types::exception_init(vm, args),
        Builtin::ListInit => containers::list_init(vm, args),
        Builtin::ListAppend => containers::list_append(vm, args),
        Builtin::ListPop => containers::list_pop(vm, args),
        Builtin::ListExtend => containers::list_extend(vm, args),
        Builtin::DictInit => containers::dict_init(vm, args),
        Builtin::DictGet => containers::dict_get(vm, args),
        Builtin::DictKeys => containers::dict_keys(vm, args),
        Builtin::DictValues => containers::dict_values(vm, args),
        Builtin::DictItems => containers::dict_items(vm, args),
        Builtin::SetInit => containers::set_init(vm, args),
        Builtin::SetAdd => containers::set_add(vm, args),
        Builtin::SetRemove => containers::set_remove(vm, args),
        Builtin::StrJoin => containers::str_join(vm, args),
        Builtin::GenCall => generator::gen_call(vm, args),
        Builtin::GenSend => generator::gen_send(vm, args),
        Builtin::GenFinish => generator::gen_finish(vm, args),
        Builtin::GenRunning => generator::gen_running(vm, args),
        Builtin::SelfIter => generator::self_iter(args),
        Builtin::IterNext => generator::iter_next(vm, args),
    }
}

/// The heap id of a `str` argument, or a `TypeError` naming `what`.
fn expect_str<T: ResourceTracker, Tr: VmTracer>(vm: &Vm<T, Tr>, value: Value, what: &str) -> RunResult<HeapId> {
    match value {
        Value::Ref(id) if matches!(vm.heap().get(id), HeapData::Str(_)) => Ok(id),
        other => Err(ExcType::type_error(format!(
            "{what} must be str, not {}",
            vm.heap().type_name(other)
        ))),
    }
}

// ============================================================================
// Bootstrap
// ============================================================================

/// Objects created at VM start.
#[derive(Debug)]
pub(crate) struct Bootstrap {
    pub builtins: HeapId,
    pub classes: BuiltinClasses,
    pub exc_classes: Vec<HeapId>,
    pub special_names: Vec<HeapId>,
}

/// Allocates the special-method names, the built-in classes and exception classes,
/// the builtins module and every built-in function.
pub(crate) fn bootstrap<T: ResourceTracker>(heap: &mut Heap<T>) -> Bootstrap {
    let special_names: Vec<HeapId> = SpecialMethod::iter().map(|m| heap.intern_permanent(m.name())).collect();

    let mut boot = Booter { heap };
    let object = boot.class("object", None, InstanceKind::Plain);
    let int = boot.class("int", Some(object), InstanceKind::Plain);
    let classes = BuiltinClasses {
        object,
        type_class: boot.class("type", Some(object), InstanceKind::Plain),
        module: boot.class("module", Some(object), InstanceKind::Plain),
        none: boot.class("NoneType", Some(object), InstanceKind::Plain),
        bool: boot.class("bool", Some(int), InstanceKind::Plain),
        int,
        float: boot.class("float", Some(object), InstanceKind::Plain),
        str: boot.class("str", Some(object), InstanceKind::Plain),
        bytes: boot.class("bytes", Some(object), InstanceKind::Plain),
        tuple: boot.class("tuple", Some(object), InstanceKind::Plain),
        list: boot.class("list", Some(object), InstanceKind::List),
        dict: boot.class("dict", Some(object), InstanceKind::Dict),
        set: boot.class("set", Some(object), InstanceKind::Set),
        function: boot.class("function", Some(object), InstanceKind::Plain),
        native: boot.class("builtin_function_or_method", Some(object), InstanceKind::Plain),
        method: boot.class("method", Some(object), InstanceKind::Plain),
        code: boot.class("codeobject", Some(object), InstanceKind::Plain),
        generator: boot.class("generator", Some(object), InstanceKind::Generator),
        iterator: boot.class("iterator", Some(object), InstanceKind::Iterator),
        slice: boot.class("slice", Some(object), InstanceKind::Slice),
    };

    let mut exc_classes: Vec<HeapId> = Vec::with_capacity(ExcType::COUNT);
    for exc_type in ExcType::iter() {
        // bases precede their subclasses in declaration order
        let base = exc_type.base().map_or(object, |base| exc_classes[base as usize]);
        let name: &'static str = exc_type.into();
        exc_classes.push(boot.class(name, Some(base), InstanceKind::Exception));
    }

    let module_class = classes.module;
    let builtins = boot.heap.allocate_permanent(HeapData::Instance(Instance::new(module_class, InstanceKind::Plain)));
    let module_name = boot.heap.intern_permanent("builtins");
    boot.set(builtins, "__name__", Value::Ref(module_name));

    for builtin in Builtin::iter() {
        for &home in builtin.home() {
            let (owner, is_property) = match home {
                Home::Module => (builtins, false),
                Home::Member(slot) => (class_in_slot(&classes, &exc_classes, slot), false),
                Home::Property(slot) => (class_in_slot(&classes, &exc_classes, slot), true),
            };
            let native = boot.native(builtin, is_property);
            boot.set(owner, builtin.member_name(), native);
        }
    }

    let exported = [
        classes.object,
        classes.type_class,
        classes.bool,
        classes.int,
        classes.float,
        classes.str,
        classes.bytes,
        classes.tuple,
        classes.list,
        classes.dict,
        classes.set,
        classes.slice,
    ];
    for class in exported.into_iter().chain(exc_classes.iter().copied()) {
        let name = boot.heap.class(class).name;
        boot.set_key(builtins, Value::Ref(name), Value::Ref(class));
    }

    for class in classes.iter().chain(exc_classes.iter().copied()) {
        install_specials(boot.heap, &special_names, class);
    }

    Bootstrap {
        builtins,
        classes,
        exc_classes,
        special_names,
    }
}

fn class_in_slot(classes: &BuiltinClasses, exc_classes: &[HeapId], slot: ClassSlot) -> HeapId {
    match slot {
        ClassSlot::Type => classes.type_class,
        ClassSlot::Str => classes.str,
        ClassSlot::Int => classes.int,
        ClassSlot::Float => classes.float,
        ClassSlot::Bool => classes.bool,
        ClassSlot::Tuple => classes.tuple,
        ClassSlot::List => classes.list,
        ClassSlot::Dict => classes.dict,
        ClassSlot::Set => classes.set,
        ClassSlot::BaseException => exc_classes[ExcType::BaseException as usize],
        ClassSlot::Generator => classes.generator,
        ClassSlot::Iterator => classes.iterator,
    }
}

/// Allocation helpers over the bare heap, used before the VM exists.
struct Booter<'h, T: ResourceTracker> {
    heap: &'h mut Heap<T>,
}

impl<T: ResourceTracker> Booter<'_, T> {
    fn class(&mut self, name: &str, base: Option<HeapId>, kind: InstanceKind) -> HeapId {
        let name = self.heap.intern_permanent(name);
        let id = self
            .heap
            .allocate_permanent(HeapData::Class(Box::new(Class::new(name, base, kind))));
        if let Some(base) = base {
            self.heap.class_mut(base).subclasses.push(id);
        }
        id
    }

    fn native(&mut self, builtin: Builtin, is_property: bool) -> Value {
        let name: &'static str = builtin.into();
        let id = self.heap.allocate_permanent(HeapData::Native(NativeFunction {
            name: name.into(),
            target: NativeTarget::Builtin(builtin),
            is_property,
        }));
        Value::Ref(id)
    }

    fn set(&mut self, owner: HeapId, name: &str, value: Value) {
        let key = self.heap.intern_permanent(name);
        self.set_key(owner, Value::Ref(key), value);
    }

    fn set_key(&mut self, owner: HeapId, key: Value, value: Value) {
        // string keys compare by identity, which cannot fail
        let _ = self
            .heap
            .with_table(owner, TableSlot::Fields, |table, keys| table.set(keys, key, value));
    }
}
