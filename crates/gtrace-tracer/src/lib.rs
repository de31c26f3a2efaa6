//! This crate implements the tracing engine of `gtrace`.
//!
//! The [`Controller`] drives a stopped-and-resumed cycle over the target:
//! every trap is classified as a function call, a function return or an
//! unrelated stop, per-routine call stacks are tracked, and calls within the
//! configured depth of the *tracing point* are printed with their decoded
//! arguments.
//!
//! Tracing starts lazily: only the tracing-point function carries a
//! breakpoint until the first routine enters it; the rest of the eligible
//! functions are instrumented at that moment, so code running before the
//! user-designated entry is never traced.

mod controller;
mod error;
mod state;

pub use self::controller::Controller;
pub use self::error::{Error, Result};
