//! The fatal-error surface shared across modules (§7).
//!
//! Fatal VM errors - object-table overflow, negative refcount, index
//! out of range, image corruption - are bugs, not recoverable
//! conditions. They carry the spec's "two string fragments" shape and
//! are reported through `Platform::print_line` before the host
//! aborts the process; the core itself never calls `std::process::exit`.

use alloc::string::String;
use core::fmt;

use crate::platform::Platform;

/// A fatal, unrecoverable VM condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    /// What kind of failure this is (e.g. "object memory").
    pub context: String,
    /// The specific detail (e.g. "out of objects").
    pub detail: String,
}

impl FatalError {
    #[must_use]
    pub fn new(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// Report this error on `platform`'s console as a two-part
    /// diagnostic, per §6/§7.
    pub fn report(&self, platform: &mut dyn Platform) {
        platform.write(b"fatal: ");
        platform.write(self.context.as_bytes());
        platform.write(b": ");
        platform.print_line(&self.detail);
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal: {}: {}", self.context, self.detail)
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod error_test;
