use super::*;

#[test]
fn mock_space_round_trips_words() {
    let mut space = MockSpace::new(64);
    space.write_word(8, -42);
    assert_eq!(space.read_word(8), -42);
}

#[test]
fn mock_space_slice_is_byte_addressable() {
    let mut space = MockSpace::new(16);
    space.slice_mut(0, 4).copy_from_slice(b"abcd");
    assert_eq!(space.slice(0, 4), b"abcd");
}

#[test]
fn mock_console_captures_output_and_replays_input() {
    let mut console = MockConsole::with_input(&["hello", "world"]);
    console.print_line("ready");
    assert_eq!(console.output_as_str(), "ready\n");
    assert_eq!(console.read_line().as_deref(), Some("hello"));
    assert_eq!(console.read_line().as_deref(), Some("world"));
    assert_eq!(console.read_line(), None);
}
