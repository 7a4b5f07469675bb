use super::*;
use crate::platform::mock::MockConsole;

#[test]
fn report_writes_two_part_diagnostic() {
    let err = FatalError::new("object memory", "out of objects");
    let mut console = MockConsole::default();
    err.report(&mut console);
    assert_eq!(console.output_as_str(), "fatal: object memory: out of objects\n");
}

#[test]
fn display_matches_report_format() {
    let err = FatalError::new("image", "bad root reference");
    assert_eq!(format!("{err}"), "fatal: image: bad root reference");
}
