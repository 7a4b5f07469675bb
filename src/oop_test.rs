use super::*;
use proptest::prelude::*;

proptest! {
    /// §8: "`isInteger(newInteger(n))` holds for all representable `n`;
    /// `intValue(newInteger(n)) == n`." Bounded to a quarter of `isize`'s
    /// range so the left shift in `Oop::int` can't overflow.
    #[test]
    fn small_integers_round_trip_through_tag_and_untag(n in (isize::MIN / 4)..=(isize::MAX / 4)) {
        let oop = Oop::int(n);
        prop_assert!(oop.is_integer());
        prop_assert_eq!(oop.as_int(), Some(n));
        prop_assert_eq!(oop.decode(), OopValue::SmallInt(n));
    }

    #[test]
    fn object_indices_round_trip_through_tag_and_untag(index in 0usize..(usize::MAX / 4)) {
        let oop = Oop::from_index(index);
        prop_assert!(!oop.is_integer());
        prop_assert_eq!(oop.as_index(), Some(index));
        prop_assert_eq!(oop.decode(), OopValue::Object(index));
    }
}

#[test]
fn nil_is_index_zero() {
    assert!(NIL.is_nil());
    assert_eq!(NIL.decode(), OopValue::Object(0));
}

#[test]
fn small_int_round_trips() {
    for n in [-100_isize, -1, 0, 1, 2, 41, i16::MAX as isize] {
        let oop = Oop::int(n);
        assert!(oop.is_integer());
        assert_eq!(oop.as_int(), Some(n));
    }
}

#[test]
fn negative_is_literal_tag() {
    let oop = Oop::int(-7);
    assert_eq!(oop.as_raw(), -7);
    assert_eq!(oop.decode(), OopValue::SmallInt(-7));
}

#[test]
fn positive_is_shifted_and_tagged() {
    let oop = Oop::int(7);
    assert_eq!(oop.as_raw(), (7 << 1) | 1);
    assert_eq!(oop.decode(), OopValue::SmallInt(7));
}

#[test]
fn object_index_is_even_and_untagged() {
    let oop = Oop::from_index(5);
    assert!(!oop.is_integer());
    assert_eq!(oop.as_index(), Some(5));
    assert_eq!(oop.as_raw(), 10);
}

#[test]
fn debug_and_display_distinguish_shapes() {
    assert_eq!(format!("{:?}", Oop::int(3)), "Oop::Int(3)");
    assert_eq!(format!("{:?}", Oop::from_index(2)), "Oop::Object(2)");
    assert_eq!(format!("{}", Oop::int(3)), "3");
    assert_eq!(format!("{}", Oop::from_index(2)), "@2");
}

#[test]
fn default_is_nil() {
    assert_eq!(Oop::default(), NIL);
}
