// SPDX-License-Identifier: GPL-3.0-or-later

//! # smalltalk-rt
//!
//! A small Smalltalk virtual machine: a reference-counted object
//! memory with tagged small integers, an image reader/writer, a
//! source-to-bytecode compiler, a context/process bytecode
//! interpreter, a numeric primitive dispatcher, and a cooperative
//! block/process scheduler.
//!
//! ## `no_std` support
//!
//! The core is `no_std` by default; the `std` feature (enabled during
//! testing and by the `smalltalk-rt` binary) pulls in `alloc`'s
//! std-backed allocator and lets the host shell use real files and
//! stdio. The core itself never names `std` directly - every
//! environment-dependent operation goes through `platform::Platform`
//! or `platform::MemorySpace`.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod image;
pub mod interpreter;
pub mod object;
pub mod oop;
pub mod platform;
pub mod primitive;
pub mod reader;
pub mod scheduler;
pub mod symbol;
pub mod vm;

pub use error::FatalError;
pub use object::{ObjectMemoryError, ObjectTable};
pub use oop::{Oop, OopValue};
pub use vm::Vm;

/// Crate version for runtime queries (e.g. a `platformInfo` primitive).
pub const VERSION: &str = match option_env!("CARGO_PKG_VERSION") {
    Some(v) => v,
    None => "unknown",
};
