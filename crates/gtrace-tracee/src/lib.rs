//! This crate implements the observation layer of the `gtrace` tracer.
//!
//! [`Process`] owns the debug transport, the parsed binary and the breakpoint
//! registry, and exposes the primitives the tracing controller drives the
//! target with: `continue_and_wait`, `single_step`, conditional breakpoints,
//! stack-frame reconstruction and per-routine runtime state
//! ([`RoutineInfo`]).
//!
//! Around it sit the pieces that give those primitives meaning:
//!
//! - [`Breakpoints`]: the registry arbitrating logical (per-routine) against
//!   physical (trap byte) breakpoint state,
//! - [`ModuleData`]: lazy views over the runtime's module-data records, used
//!   to resolve functions the debugging information does not cover,
//! - [`Value`] and its decoder: typed reconstruction of argument and result
//!   values from raw stack bytes,
//! - [`GoVersion`]: the runtime version probe selecting version-dependent
//!   offsets.

mod breakpoint;
mod error;
mod moduledata;
mod process;
mod value;
mod version;

pub use self::breakpoint::{Breakpoints, TRAP_INSTRUCTION};
pub use self::error::{Error, Result};
pub use self::moduledata::{ModuleData, ModuleDataLayout};
pub use self::process::{
    Argument, Instruction, PanicHandler, Process, RoutineInfo, StackFrame, ThreadInfo,
};
pub use self::value::{RuntimeTypeResolver, Value, ValueDecoder};
pub use self::version::GoVersion;

use gtrace_debugger::MemoryReader;

/// Memory read/write access to a traced process.
///
/// The write side is what the breakpoint registry patches trap bytes
/// through.
pub trait MemoryAccess: MemoryReader {
    /// Writes `data` at `addr` of the target's address space.
    fn write_memory(&self, addr: u64, data: &[u8]) -> gtrace_debugger::Result<()>;
}

impl MemoryAccess for gtrace_debugger::Client {
    fn write_memory(&self, addr: u64, data: &[u8]) -> gtrace_debugger::Result<()> {
        gtrace_debugger::Client::write_memory(self, addr, data)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use gtrace_debugger::MemoryReader;

    use crate::MemoryAccess;

    /// Byte-addressed fake of the target's address space.
    #[derive(Default)]
    pub struct FakeMemory {
        bytes: RefCell<HashMap<u64, u8>>,
    }

    impl FakeMemory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn load(&self, addr: u64, data: &[u8]) {
            let mut bytes = self.bytes.borrow_mut();
            for (i, &b) in data.iter().enumerate() {
                bytes.insert(addr + i as u64, b);
            }
        }

        pub fn load_u64(&self, addr: u64, value: u64) {
            self.load(addr, &value.to_le_bytes());
        }

        pub fn byte_at(&self, addr: u64) -> Option<u8> {
            self.bytes.borrow().get(&addr).copied()
        }
    }

    impl MemoryReader for FakeMemory {
        fn read_memory(&self, addr: u64, buf: &mut [u8]) -> gtrace_debugger::Result<()> {
            let bytes = self.bytes.borrow();
            for (i, out) in buf.iter_mut().enumerate() {
                match bytes.get(&(addr + i as u64)) {
                    Some(&b) => *out = b,
                    None => return Err(gtrace_debugger::Error::PartialMemOp(i, buf.len())),
                }
            }
            Ok(())
        }
    }

    impl MemoryAccess for FakeMemory {
        fn write_memory(&self, addr: u64, data: &[u8]) -> gtrace_debugger::Result<()> {
            self.load(addr, data);
            Ok(())
        }
    }
}
