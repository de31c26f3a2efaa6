//! This crate provides the debug transport used by the `gtrace` tracer.
//!
//! The transport is a thin, synchronous ptrace client for Linux `x86_64`.
//! It knows nothing about breakpoints, routines or type metadata: it only
//! launches (or attaches to) a target process and exposes the primitives the
//! upper layers drive it with:
//!
//! - exact memory reads/writes in the target's address space,
//! - register access per stopped thread,
//! - thread-local storage reads,
//! - `continue_and_wait` / `step_and_wait`, which are the only blocking
//!   operations of the whole tracer.
//!
//! A `continue_and_wait` call may report *several* threads stopped on a trap
//! at once; the caller is expected to walk each of them out of its trap
//! before resuming. A single-step that completes on a *different* thread than
//! the requested one is surfaced as [`Error::UnspecifiedThread`], listing the
//! threads that trapped in the meantime so the caller can clear them and
//! retry.

mod client;
mod error;
mod event;
mod registers;

pub use self::client::Client;
pub use self::error::{Error, Result};
pub use self::event::Event;
pub use self::registers::Registers;

/// Memory-read access to a traced process.
///
/// Implemented by [`Client`]; test code substitutes map-backed fakes.
pub trait MemoryReader {
    /// Reads `buf.len()` bytes at `addr` of the target's address space.
    ///
    /// The read either fills the whole buffer or fails.
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Reads a little-endian `u64` at `addr`.
    fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_memory(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}
