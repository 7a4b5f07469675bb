//! Platform abstraction for the Smalltalk VM.
//!
//! This module provides the trait seam that keeps the core crate
//! `no_std`-compatible and host-agnostic, so it can run on a desktop,
//! on a microcontroller, or purely in-process under test.

mod traits;

// Mock requires alloc, only available with std or test.
#[cfg(any(test, feature = "std"))]
pub mod mock;

pub use traits::{MemorySpace, NullPrimitiveHost, Platform, PrimitiveHost};
