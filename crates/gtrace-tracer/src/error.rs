/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Tracee(#[from] gtrace_tracee::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The main loop was shut down through the interrupt flag. The target
    /// was detached cleanly and keeps running.
    #[error("interrupted")]
    Interrupted,

    /// The target terminated with a core dump.
    #[error("the process exited due to core dump")]
    CoreDump,

    /// The target was terminated by a signal.
    #[error("the process exited due to signal {0}")]
    Terminated(i32),

    /// The tracing point can be set only once.
    #[error("tracing point is set already")]
    TracingPointAlreadySet,

    /// The requested tracing-point function does not exist in the target.
    #[error("failed to find function {0}")]
    FunctionNotFound(String),

    /// The requested tracing-point function is filtered out as untraceable.
    #[error("can't set the tracing point for {0}")]
    NotTraceable(String),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
