/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("os error: {0}")]
    Os(#[from] nix::Error),

    /// The initial stop of the target was not the expected trap.
    #[error("bad child wait status: {0:?}")]
    BadChildWait(nix::sys::wait::WaitStatus),

    /// A memory operation moved fewer bytes than requested.
    #[error("memory access moved {0} bytes instead of {1}")]
    PartialMemOp(usize, usize),

    /// The awaited thread did not stop, but the listed ones did.
    ///
    /// The caller has to single-step the listed threads past their traps
    /// before retrying the original operation.
    #[error("threads {0:?} stopped instead of the awaited one")]
    UnspecifiedThread(Vec<u64>),

    /// The target exited while an operation was in flight.
    #[error("target process is gone")]
    TargetGone,
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
