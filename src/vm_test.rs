use super::*;
use crate::compiler::compile_method;
use crate::image;
use crate::interpreter::{ExecResult, Interpreter, Process};
use crate::object::ObjectTable;
use crate::platform::NullPrimitiveHost;

fn make_vm() -> Vm<NullPrimitiveHost> {
    Vm::new(ObjectTable::new(64), NIL, NullPrimitiveHost)
}

#[test]
fn small_integers_resolve_through_the_small_integer_global() {
    let mut vm = make_vm();
    let small_integer_class = vm.objects.alloc_object(NIL, class_layout::INSTANCE_SLOT_COUNT).unwrap();
    vm.bind_global("SmallInteger", small_integer_class);
    assert_eq!(vm.class_of(Oop::int(7)).unwrap(), small_integer_class);
}

#[test]
fn global_lookup_is_by_name_not_hardcoded_index() {
    let mut vm = make_vm();
    let object_class = vm.objects.alloc_object(NIL, class_layout::INSTANCE_SLOT_COUNT).unwrap();
    vm.bind_global("Object", object_class);
    assert_eq!(vm.global("Object"), Some(object_class));
    assert_eq!(vm.global("Nonexistent"), None);
}

#[test]
fn method_lookup_climbs_the_superclass_chain() {
    let mut vm = make_vm();
    let selector = vm.symbols.intern(&mut vm.objects, "answer").unwrap();
    let method = vm.objects.alloc_object(NIL, method_layout::INSTANCE_SLOT_COUNT).unwrap();

    let super_class = vm.objects.alloc_object(NIL, class_layout::INSTANCE_SLOT_COUNT).unwrap();
    let methods = vm.objects.alloc_object(NIL, 2).unwrap();
    vm.objects.basic_at_put(methods, 1, selector).unwrap();
    vm.objects.basic_at_put(methods, 2, method).unwrap();
    vm.objects
        .basic_at_put(super_class, class_layout::METHODS, methods)
        .unwrap();

    let sub_class = vm.objects.alloc_object(NIL, class_layout::INSTANCE_SLOT_COUNT).unwrap();
    vm.objects
        .basic_at_put(sub_class, class_layout::SUPERCLASS, super_class)
        .unwrap();

    let found = vm.lookup_method(sub_class, selector).unwrap();
    assert_eq!(found, Some((method, super_class)));
}

#[test]
fn method_lookup_returns_none_when_selector_is_unbound() {
    let mut vm = make_vm();
    let selector = vm.symbols.intern(&mut vm.objects, "missing").unwrap();
    let class = vm.objects.alloc_object(NIL, class_layout::INSTANCE_SLOT_COUNT).unwrap();
    assert_eq!(vm.lookup_method(class, selector).unwrap(), None);
}

/// Round-trips a `symbols` root through `image::encode_monolithic` and
/// back so `bootstrap` has to recover the one binding from bytes, not
/// from the still-live `ObjectTable` it was built in.
#[test]
fn bootstrap_recovers_global_bindings_from_a_loaded_image() {
    let mut vm = make_vm();
    let object_class = vm.objects.alloc_object(NIL, class_layout::INSTANCE_SLOT_COUNT).unwrap();
    vm.objects.incr(object_class);

    let name_symbol = vm.symbols.intern(&mut vm.objects, "Object").unwrap();
    let symbols_root = vm.objects.alloc_object(NIL, 2).unwrap();
    vm.objects.incr(symbols_root);
    vm.objects.basic_at_put(symbols_root, 1, name_symbol).unwrap();
    vm.objects.basic_at_put(symbols_root, 2, object_class).unwrap();

    let bytes = image::encode_monolithic(&vm.objects, symbols_root, &[]).unwrap();
    let (objects, root) = image::decode_monolithic(&bytes, 64).unwrap();

    let booted = Vm::bootstrap(objects, root, NullPrimitiveHost).unwrap();
    let resolved = booted.global("Object").unwrap();
    assert_eq!(booted.objects.class_of(resolved).unwrap(), NIL);
    assert!(booted.global("Nonexistent").is_none());
}

#[test]
fn install_method_appends_to_an_empty_method_dictionary() {
    let mut vm = make_vm();
    let class = vm.objects.alloc_object(NIL, class_layout::INSTANCE_SLOT_COUNT).unwrap();
    vm.objects.basic_at_put(class, class_layout::METHODS, NIL).unwrap();
    let selector = vm.symbols.intern(&mut vm.objects, "answer").unwrap();
    let method = vm.objects.alloc_object(NIL, method_layout::INSTANCE_SLOT_COUNT).unwrap();
    vm.objects.incr(method);

    vm.install_method(class, selector, method).unwrap();

    assert_eq!(vm.lookup_method(class, selector).unwrap(), Some((method, class)));
}

#[test]
fn install_method_preserves_existing_bindings() {
    let mut vm = make_vm();
    let class = vm.objects.alloc_object(NIL, class_layout::INSTANCE_SLOT_COUNT).unwrap();
    vm.objects.basic_at_put(class, class_layout::METHODS, NIL).unwrap();
    let first_selector = vm.symbols.intern(&mut vm.objects, "first").unwrap();
    let first_method = vm.objects.alloc_object(NIL, method_layout::INSTANCE_SLOT_COUNT).unwrap();
    vm.objects.incr(first_method);
    vm.install_method(class, first_selector, first_method).unwrap();

    let second_selector = vm.symbols.intern(&mut vm.objects, "second").unwrap();
    let second_method = vm.objects.alloc_object(NIL, method_layout::INSTANCE_SLOT_COUNT).unwrap();
    vm.objects.incr(second_method);
    vm.install_method(class, second_selector, second_method).unwrap();

    assert_eq!(vm.lookup_method(class, first_selector).unwrap(), Some((first_method, class)));
    assert_eq!(vm.lookup_method(class, second_selector).unwrap(), Some((second_method, class)));
}

/// End-to-end image round trip: compile a class's method, install it,
/// write the image, reload it into a fresh `Vm` via `bootstrap`, and
/// send the message - the full pipeline `compile`/`run` drive in the
/// CLI binary.
#[test]
fn a_compiled_method_survives_an_image_round_trip() {
    let mut vm = make_vm();
    let object_class = vm.objects.alloc_object(NIL, class_layout::INSTANCE_SLOT_COUNT).unwrap();
    vm.objects.incr(object_class);
    vm.objects.basic_at_put(object_class, class_layout::SUPERCLASS, NIL).unwrap();
    vm.objects.basic_at_put(object_class, class_layout::VARIABLES, NIL).unwrap();

    let method = compile_method(&mut vm, object_class, "answer ^ 42").unwrap();
    let selector = vm.objects.basic_at(method, method_layout::SELECTOR).unwrap();
    vm.install_method(object_class, selector, method).unwrap();

    let name_symbol = vm.symbols.intern(&mut vm.objects, "Object").unwrap();
    let symbols_root = vm.objects.alloc_object(NIL, 2).unwrap();
    vm.objects.incr(symbols_root);
    vm.objects.basic_at_put(symbols_root, 1, name_symbol).unwrap();
    vm.objects.basic_at_put(symbols_root, 2, object_class).unwrap();

    let bytes = image::encode_monolithic(&vm.objects, symbols_root, &[]).unwrap();
    let (objects, root) = image::decode_monolithic(&bytes, 64).unwrap();
    let mut booted = Vm::bootstrap(objects, root, NullPrimitiveHost).unwrap();

    let loaded_class = booted.global("Object").unwrap();
    let methods = booted.objects.basic_at(loaded_class, class_layout::METHODS).unwrap();
    let loaded_selector = booted.objects.basic_at(methods, 1).unwrap();

    let receiver = booted.objects.alloc_object(loaded_class, 0).unwrap();
    booted.objects.incr(receiver);

    let (loaded_method, _) = booted.lookup_method(loaded_class, loaded_selector).unwrap().unwrap();
    let mut process = Process::new();
    process.activate(&mut booted, loaded_method, receiver, Vec::new()).unwrap();
    let mut interpreter = Interpreter::new(&mut booted);
    match interpreter.execute(&mut process, 1_000).unwrap() {
        ExecResult::Finished(value) => assert_eq!(value, Oop::int(42)),
        ExecResult::Runnable => panic!("process did not finish within the step budget"),
    }
}
