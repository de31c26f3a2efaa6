/// Event reported by the transport when the target stops or terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// One or more threads stopped on a trap instruction (or a completed
    /// single-step).
    Trapped,

    /// The target exited normally with the given exit code.
    Exited(i32),

    /// The target was terminated by the given signal.
    Terminated(i32),

    /// The target was terminated and the kernel produced a core dump.
    CoreDump,
}

impl Event {
    /// Returns true if the event indicates the target is gone for any reason.
    pub fn is_exit(self) -> bool {
        matches!(self, Self::Exited(_) | Self::Terminated(_) | Self::CoreDump)
    }
}
