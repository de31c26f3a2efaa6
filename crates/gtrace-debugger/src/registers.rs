use nix::libc::user_regs_struct;

/// Register state of one stopped thread (x86_64).
///
/// Wraps the raw kernel register block; only the registers the tracer
/// consumes get dedicated accessors.
#[derive(Debug, Clone, Copy)]
pub struct Registers(pub(crate) user_regs_struct);

impl Registers {
    /// Instruction pointer.
    pub fn rip(&self) -> u64 {
        self.0.rip
    }

    /// Stack pointer.
    pub fn rsp(&self) -> u64 {
        self.0.rsp
    }

    /// RCX general-purpose register.
    pub fn rcx(&self) -> u64 {
        self.0.rcx
    }

    /// Base address of the thread-local storage block (FS segment).
    pub fn fs_base(&self) -> u64 {
        self.0.fs_base
    }

    /// Rewrites the instruction pointer.
    ///
    /// The change only reaches the target once the state is written back
    /// with [`Client::write_registers`](crate::Client::write_registers).
    pub fn set_rip(&mut self, rip: u64) {
        self.0.rip = rip;
    }
}
