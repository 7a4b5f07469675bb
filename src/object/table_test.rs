use super::*;

fn some_class(table: &mut ObjectTable) -> Oop {
    table.alloc_object(NIL, 0).expect("alloc class stub")
}

#[test]
fn alloc_object_zeroes_slots_with_nil() {
    let mut table = ObjectTable::new(16);
    let class = some_class(&mut table);
    let obj = table.alloc_object(class, 3).unwrap();
    for i in 1..=3 {
        assert_eq!(table.basic_at(obj, i).unwrap(), NIL);
    }
}

#[test]
fn basic_at_put_rebinds_with_incr_decr() {
    let mut table = ObjectTable::new(16);
    let class = some_class(&mut table);
    let obj = table.alloc_object(class, 1).unwrap();
    let child = table.alloc_object(class, 0).unwrap();
    table.incr(obj);
    table.incr(child);

    table.basic_at_put(obj, 1, child).unwrap();
    assert_eq!(table.ref_count(child), Some(2)); // incr above + basic_at_put's incr

    // Replacing with nil must decr the old occupant.
    table.basic_at_put(obj, 1, NIL).unwrap();
    assert_eq!(table.ref_count(child), Some(1));
}

#[test]
fn decr_to_zero_recurses_into_children_and_frees() {
    let mut table = ObjectTable::new(16);
    let class = some_class(&mut table);
    let child = table.alloc_object(class, 0).unwrap();
    table.incr(child);
    let parent = table.alloc_object(class, 1).unwrap();
    table.incr(parent);
    table.basic_at_put(parent, 1, child).unwrap();
    assert_eq!(table.ref_count(child), Some(2));

    table.decr(parent).unwrap();
    assert_eq!(table.ref_count(child), Some(1));
    table.decr(child).unwrap();
    assert_eq!(table.ref_count(child), Some(0));
}

#[test]
fn freed_entries_are_reused_by_exact_size_class() {
    let mut table = ObjectTable::new(8);
    let class = some_class(&mut table);
    let a = table.alloc_object(class, 2).unwrap();
    table.incr(a);
    let a_idx = a.as_index().unwrap();
    table.decr(a).unwrap();

    let b = table.alloc_object(class, 2).unwrap();
    assert_eq!(
        b.as_index().unwrap(),
        a_idx,
        "exact-size free list entry should be reused first"
    );
}

#[test]
fn byte_objects_have_negative_size_and_only_byte_accessors() {
    let mut table = ObjectTable::new(8);
    let class = some_class(&mut table);
    let s = table.alloc_str(class, "hi").unwrap();
    assert_eq!(table.size_of(s).unwrap(), -2);
    assert_eq!(table.byte_at(s, 1).unwrap(), b'h');
    assert_eq!(table.byte_at(s, 2).unwrap(), b'i');
    assert!(table.basic_at(s, 1).is_err());
}

#[test]
fn oversized_byte_object_fails_fast() {
    let mut table = ObjectTable::new(8);
    let class = some_class(&mut table);
    let big = "x".repeat(MAX_BYTE_OBJECT_SIZE + 1);
    assert_eq!(
        table.alloc_str(class, &big),
        Err(ObjectMemoryError::ObjectTooLarge)
    );
}

#[test]
fn table_full_fails_fast() {
    let mut table = ObjectTable::new(2); // capacity 2: nil + one more
    let class = some_class(&mut table); // consumes the one slot
    assert_eq!(table.class_of(class), Ok(NIL));
    assert_eq!(
        table.alloc_object(class, 1),
        Err(ObjectMemoryError::TableFull)
    );
}

#[test]
fn a_larger_free_entry_is_shrunk_to_fit_before_the_table_grows() {
    let mut table = ObjectTable::new(4); // nil + class + 2 more slots
    let class = some_class(&mut table);
    let filler = table.alloc_object(class, 0).unwrap();
    table.incr(filler);
    let big = table.alloc_object(class, 3).unwrap(); // fills the table to capacity
    table.incr(big);
    table.decr(big).unwrap(); // frees it onto the size-3 free list

    // A size-1 request: no exact match, and the table is already at
    // capacity so a fresh entry is impossible - it must shrink the
    // size-3 free entry (ladder step 3).
    let reused = table.alloc_object(class, 1).unwrap();
    assert_eq!(reused, big);
    assert_eq!(table.size_of(reused), Ok(1));
}

#[test]
fn a_smaller_free_entry_is_repurposed_when_nothing_larger_is_free() {
    let mut table = ObjectTable::new(4); // nil + class + 2 more slots
    let class = some_class(&mut table);
    let filler = table.alloc_object(class, 5).unwrap(); // stays live throughout
    table.incr(filler);
    let small = table.alloc_object(class, 0).unwrap(); // fills the table to capacity
    table.incr(small);
    table.decr(small).unwrap(); // frees it onto the size-0 free list

    // A size-3 request: no exact match, table already full, and no
    // free entry at size 3 or above (`filler` is still live) - ladder
    // step 4 repurposes the smaller size-0 entry instead of failing.
    let reused = table.alloc_object(class, 3).unwrap();
    assert_eq!(reused, small);
    assert_eq!(table.size_of(reused), Ok(3));
}

#[test]
fn shallow_copy_duplicates_slots_and_incrs_children() {
    let mut table = ObjectTable::new(16);
    let class = some_class(&mut table);
    let child = table.alloc_object(class, 0).unwrap();
    table.incr(child);
    let original = table.alloc_object(class, 1).unwrap();
    table.incr(original);
    table.basic_at_put(original, 1, child).unwrap();

    let copy = table.shallow_copy(original).unwrap();
    assert_ne!(copy, original);
    assert_eq!(table.basic_at(copy, 1).unwrap(), child);
    assert_eq!(table.ref_count(child), Some(3)); // orig slot + copy slot + explicit incr
}

#[test]
fn root_mark_pass_restores_reachable_counts_and_frees_the_rest() {
    let mut table = ObjectTable::new(16);
    let class = some_class(&mut table);
    let reachable = table.alloc_object(class, 0).unwrap();
    let unreachable = table.alloc_object(class, 0).unwrap();
    let root = table.alloc_object(class, 1).unwrap();
    table.basic_at_put(root, 1, reachable).unwrap();
    // Simulate a just-loaded image: everything at refcount 0 except
    // what the root-mark pass will discover.
    table.reset_all_refcounts();

    table.mark_from_root(root).unwrap();
    table.rebuild_free_lists();

    assert!(table.ref_count(root).unwrap() >= 1);
    assert!(table.ref_count(reachable).unwrap() >= 1);
    assert_eq!(table.ref_count(unreachable), Some(0));
}

#[test]
fn pinned_entries_ignore_incr_and_decr() {
    let mut table = ObjectTable::new(16);
    let class = some_class(&mut table);
    let obj = table.alloc_object(class, 0).unwrap();
    table.entries[obj.as_index().unwrap()].ref_count = PINNED;

    table.incr(obj);
    assert_eq!(table.ref_count(obj), Some(PINNED));
    table.decr(obj).unwrap();
    assert_eq!(table.ref_count(obj), Some(PINNED));
    assert!(table.is_pinned(obj));
}

#[test]
fn install_at_places_an_entry_at_an_exact_index_and_grows_the_table() {
    let mut table = ObjectTable::new(16);
    let class = some_class(&mut table);
    table
        .install_at(10, class, 2, 1, Payload::Slots(vec![NIL; 2]))
        .unwrap();
    let oop = Oop::from_index(10);
    assert_eq!(table.class_of(oop).unwrap(), class);
    assert_eq!(table.ref_count(oop), Some(1));
}

#[test]
fn install_at_beyond_capacity_fails_fast() {
    let mut table = ObjectTable::new(4);
    let class = some_class(&mut table);
    assert_eq!(
        table.install_at(4, class, 0, 1, Payload::Slots(Vec::new())),
        Err(ObjectMemoryError::IndexOutOfRange)
    );
}

#[test]
fn iter_entries_exposes_both_live_and_free_slots() {
    let mut table = ObjectTable::new(8);
    let class = some_class(&mut table);
    let live = table.alloc_object(class, 0).unwrap();
    table.incr(live);
    let count = table.iter_entries().count();
    assert_eq!(count, table.len());
    let live_count = table.iter_entries().filter(|(_, e)| !e.is_free()).count();
    assert_eq!(live_count, 2); // the class stub + the incremented object
}

#[test]
fn integer_tagged_references_are_never_counted() {
    let mut table = ObjectTable::new(4);
    let n = Oop::int(41);
    table.incr(n);
    assert_eq!(table.ref_count(n), None);
    table.decr(n).unwrap(); // must not error
}
