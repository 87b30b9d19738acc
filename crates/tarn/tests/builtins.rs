//! Tests for the builtins module, called from the host.

use pretty_assertions::assert_eq;
use tarn::{ExcType, NoLimitTracker, Object, Value, Vm};

type TestVm = Vm<NoLimitTracker>;

fn builtin(vm: &TestVm, name: &str) -> Value {
    vm.get_global(vm.builtins(), name)
        .unwrap_or_else(|| panic!("no builtin {name}"))
}

/// Calls builtin `name` with `args`, each converted from an `Object`.
fn call(vm: &mut TestVm, name: &str, args: &[Object]) -> Result<Object, tarn::Exception> {
    let callee = builtin(vm, name);
    let base = vm.stack_len();
    for arg in args {
        let value = vm.from_object(arg).unwrap();
        vm.push(value);
    }
    let values: Vec<Value> = (0..args.len()).map(|i| vm.peek(args.len() - 1 - i)).collect();
    let result = vm.call(callee, &values);
    while vm.stack_len() > base {
        vm.pop();
    }
    result
}

/// Calls method `name` of `receiver` with `args`.
fn call_method(vm: &mut TestVm, receiver: Value, name: &str, args: &[Value]) -> Result<Object, tarn::Exception> {
    vm.push(receiver);
    let method = vm.get_attr(receiver, name).unwrap();
    let result = vm.call(method, args);
    vm.pop();
    result
}

fn s(text: &str) -> Object {
    Object::String(text.to_owned())
}

fn list(items: &[i64]) -> Object {
    Object::List(items.iter().copied().map(Object::Int).collect())
}

// =============================================================================
// 1. Functions
// =============================================================================

#[test]
fn len_of_builtin_containers() {
    let mut vm = Vm::new(NoLimitTracker);
    assert_eq!(call(&mut vm, "len", &[s("tarn")]).unwrap(), Object::Int(4));
    assert_eq!(call(&mut vm, "len", &[list(&[1, 2, 3])]).unwrap(), Object::Int(3));
    assert_eq!(
        call(&mut vm, "len", &[Object::dict(vec![(s("k"), Object::None)])]).unwrap(),
        Object::Int(1)
    );
    let err = call(&mut vm, "len", &[Object::Int(1)]).unwrap_err();
    assert_eq!(err.summary(), "TypeError: object of type 'int' has no len()");
}

#[test]
fn len_checks_its_argument_count() {
    let mut vm = Vm::new(NoLimitTracker);
    let err = call(&mut vm, "len", &[]).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
}

#[test]
fn repr_quotes_strings() {
    let mut vm = Vm::new(NoLimitTracker);
    assert_eq!(call(&mut vm, "repr", &[s("a")]).unwrap(), s("'a'"));
    assert_eq!(
        call(&mut vm, "repr", &[Object::Tuple(vec![Object::Int(1)])]).unwrap(),
        s("(1,)")
    );
}

#[test]
fn isinstance_accepts_a_tuple_of_classes() {
    let mut vm = Vm::new(NoLimitTracker);
    let one = Value::Int(1);
    let (str_class, int_class) = (Value::Ref(vm.classes().str), Value::Ref(vm.classes().int));
    let classes = vm.new_tuple(vec![str_class, int_class]).unwrap();
    vm.push(classes);
    let isinstance = builtin(&vm, "isinstance");
    assert_eq!(vm.call(isinstance, &[one, classes]).unwrap(), Object::Bool(true));
    assert_eq!(
        vm.call(isinstance, &[Value::Bool(true), int_class]).unwrap(),
        Object::Bool(true)
    );
    let err = vm.call(isinstance, &[one, Value::Int(5)]).unwrap_err();
    assert_eq!(
        err.summary(),
        "TypeError: isinstance() arg 2 must be a type or tuple of types"
    );
}

#[test]
fn issubclass_follows_the_exception_hierarchy() {
    let mut vm = Vm::new(NoLimitTracker);
    let issubclass = builtin(&vm, "issubclass");
    let key_error = Value::Ref(vm.exception_class(ExcType::KeyError));
    let lookup_error = Value::Ref(vm.exception_class(ExcType::LookupError));
    assert_eq!(vm.call(issubclass, &[key_error, lookup_error]).unwrap(), Object::Bool(true));
    assert_eq!(vm.call(issubclass, &[lookup_error, key_error]).unwrap(), Object::Bool(false));
    assert!(vm.call(issubclass, &[Value::Int(1), key_error]).is_err());
}

#[test]
fn equal_numbers_hash_alike() {
    let mut vm = Vm::new(NoLimitTracker);
    let int_hash = call(&mut vm, "hash", &[Object::Int(3)]).unwrap();
    let float_hash = call(&mut vm, "hash", &[Object::Float(3.0)]).unwrap();
    assert_eq!(int_hash, float_hash);
    let err = call(&mut vm, "hash", &[list(&[])]).unwrap_err();
    assert_eq!(err.summary(), "TypeError: unhashable type: 'list'");
}

#[test]
fn attribute_functions_on_an_instance() {
    let mut vm = Vm::new(NoLimitTracker);
    let class = vm.new_class("Bag", None).unwrap();
    vm.push(Value::Ref(class));
    let bag = Value::Ref(vm.new_instance(class).unwrap());
    vm.push(bag);
    let name = vm.new_str("size").unwrap();
    vm.push(name);

    let setattr = builtin(&vm, "setattr");
    let getattr = builtin(&vm, "getattr");
    let hasattr = builtin(&vm, "hasattr");
    assert_eq!(vm.call(hasattr, &[bag, name]).unwrap(), Object::Bool(false));
    assert_eq!(vm.call(getattr, &[bag, name, Value::Int(-1)]).unwrap(), Object::Int(-1));
    vm.call(setattr, &[bag, name, Value::Int(3)]).unwrap();
    assert_eq!(vm.call(hasattr, &[bag, name]).unwrap(), Object::Bool(true));
    assert_eq!(vm.call(getattr, &[bag, name]).unwrap(), Object::Int(3));

    let missing = vm.new_str("missing").unwrap();
    let err = vm.call(getattr, &[bag, missing]).unwrap_err();
    assert_eq!(err.summary(), "AttributeError: 'Bag' object has no attribute 'missing'");
}

#[test]
fn callable_recognises_functions_and_classes() {
    let mut vm = Vm::new(NoLimitTracker);
    let callable = builtin(&vm, "callable");
    let len = builtin(&vm, "len");
    let int_class = Value::Ref(vm.classes().int);
    assert_eq!(vm.call(callable, &[len]).unwrap(), Object::Bool(true));
    assert_eq!(vm.call(callable, &[int_class]).unwrap(), Object::Bool(true));
    assert_eq!(vm.call(callable, &[Value::Int(1)]).unwrap(), Object::Bool(false));
}

#[test]
fn iter_of_a_list_yields_its_items() {
    let mut vm = Vm::new(NoLimitTracker);
    let items = vm.from_object(&list(&[4, 5])).unwrap();
    vm.push(items);
    let iterator = vm.get_iter(items).unwrap();
    vm.push(iterator);
    assert_eq!(vm.iterator_next(iterator).unwrap(), Some(Value::Int(4)));
    assert_eq!(vm.iterator_next(iterator).unwrap(), Some(Value::Int(5)));
    assert_eq!(vm.iterator_next(iterator).unwrap(), None);
}

// =============================================================================
// 2. Constructors
// =============================================================================

#[test]
fn type_of_a_value_is_its_class() {
    let mut vm = Vm::new(NoLimitTracker);
    let type_class = Value::Ref(vm.classes().type_class);
    let class = vm.call_direct(type_class, &[Value::Float(1.5)]).unwrap();
    assert_eq!(class, Value::Ref(vm.classes().float));
}

#[test]
fn three_argument_type_creates_a_class() {
    let mut vm = Vm::new(NoLimitTracker);
    let name = vm.new_str("Point").unwrap();
    vm.push(name);
    let bases = vm.new_tuple(vec![]).unwrap();
    vm.push(bases);
    let namespace = vm
        .from_object(&Object::dict(vec![(s("dims"), Object::Int(2))]))
        .unwrap();
    vm.push(namespace);
    let type_class = Value::Ref(vm.classes().type_class);
    let class = vm.call_direct(type_class, &[name, bases, namespace]).unwrap();
    vm.push(class);

    let dims = vm.get_attr(class, "dims").unwrap();
    assert_eq!(dims, Value::Int(2));
    assert_eq!(vm.repr(class).unwrap(), "<class 'Point'>");
    let instance = vm.call_direct(class, &[]).unwrap();
    assert!(vm.is_instance(instance, class.as_heap_id().unwrap()));
}

#[test]
fn numeric_constructors_parse_strings() {
    let mut vm = Vm::new(NoLimitTracker);
    assert_eq!(call(&mut vm, "int", &[s(" 1_000 ")]).unwrap(), Object::Int(1000));
    assert_eq!(call(&mut vm, "int", &[Object::Float(-2.7)]).unwrap(), Object::Int(-2));
    assert_eq!(call(&mut vm, "float", &[s("2.5")]).unwrap(), Object::Float(2.5));
    assert_eq!(call(&mut vm, "int", &[]).unwrap(), Object::Int(0));

    let err = call(&mut vm, "int", &[s("x")]).unwrap_err();
    assert_eq!(err.summary(), "ValueError: invalid literal for int() with base 10: 'x'");
    let err = call(&mut vm, "float", &[list(&[])]).unwrap_err();
    assert_eq!(
        err.summary(),
        "TypeError: float() argument must be a string or a number, not 'list'"
    );
}

#[test]
fn str_and_bool_convert_any_value() {
    let mut vm = Vm::new(NoLimitTracker);
    assert_eq!(call(&mut vm, "str", &[Object::Float(1.0)]).unwrap(), s("1.0"));
    assert_eq!(call(&mut vm, "str", &[list(&[1])]).unwrap(), s("[1]"));
    assert_eq!(call(&mut vm, "bool", &[list(&[])]).unwrap(), Object::Bool(false));
    assert_eq!(call(&mut vm, "bool", &[s("x")]).unwrap(), Object::Bool(true));
}

#[test]
fn container_constructors_consume_iterables() {
    let mut vm = Vm::new(NoLimitTracker);
    assert_eq!(
        call(&mut vm, "tuple", &[list(&[1, 2])]).unwrap(),
        Object::Tuple(vec![Object::Int(1), Object::Int(2)])
    );
    assert_eq!(
        call(&mut vm, "list", &[Object::Tuple(vec![Object::Int(3)])]).unwrap(),
        list(&[3])
    );
    assert_eq!(
        call(&mut vm, "set", &[list(&[1, 1, 2])]).unwrap(),
        Object::Set(vec![Object::Int(1), Object::Int(2)])
    );
    let pairs = Object::List(vec![Object::Tuple(vec![s("a"), Object::Int(1)])]);
    assert_eq!(
        call(&mut vm, "dict", &[pairs]).unwrap(),
        Object::dict(vec![(s("a"), Object::Int(1))])
    );
    let err = call(&mut vm, "dict", &[list(&[1])]).unwrap_err();
    assert_eq!(
        err.summary(),
        "TypeError: cannot convert dictionary update sequence element #0 to a sequence"
    );
}

#[test]
fn exception_classes_take_their_message() {
    let mut vm = Vm::new(NoLimitTracker);
    assert_eq!(
        call(&mut vm, "KeyError", &[s("k")]).unwrap(),
        Object::Exception {
            exc_type: ExcType::KeyError,
            arg: Some("k".to_owned())
        }
    );
}

// =============================================================================
// 3. Methods
// =============================================================================

#[test]
fn list_methods() {
    let mut vm = Vm::new(NoLimitTracker);
    let items = vm.from_object(&list(&[1, 2])).unwrap();
    vm.push(items);
    let extra = vm.from_object(&list(&[3, 4])).unwrap();
    vm.push(extra);

    call_method(&mut vm, items, "append", &[Value::Int(5)]).unwrap();
    call_method(&mut vm, items, "extend", &[extra]).unwrap();
    assert_eq!(vm.to_object(items), list(&[1, 2, 5, 3, 4]));
    assert_eq!(call_method(&mut vm, items, "pop", &[]).unwrap(), Object::Int(4));
    assert_eq!(call_method(&mut vm, items, "pop", &[Value::Int(0)]).unwrap(), Object::Int(1));
    assert_eq!(call_method(&mut vm, items, "pop", &[Value::Int(-1)]).unwrap(), Object::Int(3));
    assert_eq!(vm.to_object(items), list(&[2, 5]));

    let err = call_method(&mut vm, items, "pop", &[Value::Int(9)]).unwrap_err();
    assert_eq!(err.summary(), "IndexError: pop index out of range");
}

#[test]
fn pop_from_an_empty_list() {
    let mut vm = Vm::new(NoLimitTracker);
    let items = vm.new_list(vec![]).unwrap();
    vm.push(items);
    let err = call_method(&mut vm, items, "pop", &[]).unwrap_err();
    assert_eq!(err.summary(), "IndexError: pop from empty list");
}

#[test]
fn dict_methods() {
    let mut vm = Vm::new(NoLimitTracker);
    let dict = vm
        .from_object(&Object::dict(vec![(s("a"), Object::Int(1)), (s("b"), Object::Int(2))]))
        .unwrap();
    vm.push(dict);
    let a = vm.new_str("a").unwrap();
    let z = vm.new_str("z").unwrap();

    assert_eq!(call_method(&mut vm, dict, "get", &[a]).unwrap(), Object::Int(1));
    assert_eq!(call_method(&mut vm, dict, "get", &[z]).unwrap(), Object::None);
    assert_eq!(call_method(&mut vm, dict, "get", &[z, Value::Int(0)]).unwrap(), Object::Int(0));
    assert_eq!(
        call_method(&mut vm, dict, "keys", &[]).unwrap(),
        Object::List(vec![s("a"), s("b")])
    );
    assert_eq!(call_method(&mut vm, dict, "values", &[]).unwrap(), list(&[1, 2]));
    assert_eq!(
        call_method(&mut vm, dict, "items", &[]).unwrap(),
        Object::List(vec![
            Object::Tuple(vec![s("a"), Object::Int(1)]),
            Object::Tuple(vec![s("b"), Object::Int(2)]),
        ])
    );
}

#[test]
fn set_methods() {
    let mut vm = Vm::new(NoLimitTracker);
    let set = vm.new_set().unwrap();
    vm.push(set);
    call_method(&mut vm, set, "add", &[Value::Int(1)]).unwrap();
    call_method(&mut vm, set, "add", &[Value::Float(1.0)]).unwrap();
    call_method(&mut vm, set, "add", &[Value::Int(2)]).unwrap();
    assert_eq!(vm.len_of(set).unwrap(), 2);

    call_method(&mut vm, set, "remove", &[Value::Int(1)]).unwrap();
    let err = call_method(&mut vm, set, "remove", &[Value::Int(1)]).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::KeyError);
    assert_eq!(vm.to_object(set), Object::Set(vec![Object::Int(2)]));
}

#[test]
fn str_join_concatenates_strings() {
    let mut vm = Vm::new(NoLimitTracker);
    let separator = vm.new_str(", ").unwrap();
    vm.push(separator);
    let parts = vm.from_object(&Object::List(vec![s("a"), s("b"), s("c")])).unwrap();
    vm.push(parts);
    assert_eq!(call_method(&mut vm, separator, "join", &[parts]).unwrap(), s("a, b, c"));

    let mixed = vm.from_object(&Object::List(vec![s("a"), Object::Int(1)])).unwrap();
    vm.push(mixed);
    let err = call_method(&mut vm, separator, "join", &[mixed]).unwrap_err();
    assert_eq!(
        err.summary(),
        "TypeError: sequence item 1: expected str instance, int found"
    );
}

// =============================================================================
// 4. Host helpers
// =============================================================================

#[test]
fn host_deletes_attributes_by_name() {
    let mut vm = Vm::new(NoLimitTracker);
    let class = vm.new_class("Bag", None).unwrap();
    vm.push(Value::Ref(class));
    let bag = Value::Ref(vm.new_instance(class).unwrap());
    vm.push(bag);
    vm.set_attr(bag, "size", Value::Int(1)).unwrap();
    vm.delete_attr(bag, "size").unwrap();
    let err = vm.delete_attr(bag, "size").unwrap_err();
    assert!(matches!(err, tarn::RunError::Exc(_)), "deleting twice fails: {err:?}");
    assert!(vm.get_attr(bag, "size").is_err());
}

#[test]
fn bytes_are_never_interned() {
    let mut vm = Vm::new(NoLimitTracker);
    let a = vm.new_bytes(b"raw").unwrap();
    vm.push(a);
    let b = vm.new_bytes(b"raw").unwrap();
    vm.push(b);
    assert!(a != b, "two allocations stay distinct");
    assert!(vm.values_equal(a, b).unwrap());
    assert_eq!(vm.to_object(a), Object::Bytes(b"raw".to_vec()));
}
